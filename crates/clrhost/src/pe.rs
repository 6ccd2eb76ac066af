//! PE header inspection for managed assemblies.
//!
//! Classifies a file before it is handed to a native host, so a missing file
//! or a non-managed image is reported as such instead of as an opaque host
//! failure.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use clrhost_shared::AssemblyLoadFailure;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;
const IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR: usize = 14;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;

const COFF_HEADER_SIZE: usize = 20;
const MAX_E_LFANEW: u32 = 0x1000;

/// Header facts about a managed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedImage {
    pub machine: u16,
    pub is_pe32_plus: bool,
    /// RVA of the CLI header (COM descriptor directory).
    pub cli_header_rva: u32,
}

impl ManagedImage {
    /// AnyCPU IL assemblies are PE32 with an i386 machine field.
    pub fn is_any_cpu_candidate(&self) -> bool {
        !self.is_pe32_plus && self.machine == IMAGE_FILE_MACHINE_I386
    }

    pub fn machine_name(&self) -> &'static str {
        machine_name(self.machine)
    }

    /// PE32+ images are bound to one architecture; it has to be ours.
    pub fn check_architecture(&self) -> Result<(), AssemblyLoadFailure> {
        if !self.is_pe32_plus || self.machine == HOST_MACHINE {
            return Ok(());
        }
        Err(AssemblyLoadFailure::Incompatible(format!(
            "image is built for {}, this process is {}",
            self.machine_name(),
            machine_name(HOST_MACHINE)
        )))
    }
}

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = IMAGE_FILE_MACHINE_AMD64;
#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = IMAGE_FILE_MACHINE_ARM64;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const HOST_MACHINE: u16 = IMAGE_FILE_MACHINE_I386;

fn machine_name(machine: u16) -> &'static str {
    match machine {
        IMAGE_FILE_MACHINE_I386 => "x86",
        IMAGE_FILE_MACHINE_AMD64 => "x64",
        IMAGE_FILE_MACHINE_ARM64 => "arm64",
        _ => "an unknown machine",
    }
}

/// Inspect `path` and return its managed image headers.
pub fn inspect(path: &Path) -> Result<ManagedImage, AssemblyLoadFailure> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AssemblyLoadFailure::NotFound);
        }
        Err(e) => return Err(AssemblyLoadFailure::Rejected(e.to_string())),
    };
    if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
        return Err(AssemblyLoadFailure::BadImage("path is a directory".into()));
    }
    let image = read_headers(&mut file)?;
    image.check_architecture()?;
    Ok(image)
}

/// Parse managed image headers from any seekable reader.
pub fn read_headers<R: Read + Seek>(reader: &mut R) -> Result<ManagedImage, AssemblyLoadFailure> {
    let bad = |msg: &str| AssemblyLoadFailure::BadImage(msg.to_string());

    let mut dos_header = [0u8; 64];
    read_exact_or(reader, &mut dos_header, || bad("file too small for a DOS header"))?;

    if u16::from_le_bytes([dos_header[0], dos_header[1]]) != IMAGE_DOS_SIGNATURE {
        return Err(bad("missing MZ signature"));
    }

    let e_lfanew = u32::from_le_bytes([
        dos_header[0x3C],
        dos_header[0x3D],
        dos_header[0x3E],
        dos_header[0x3F],
    ]);
    if !(64..=MAX_E_LFANEW).contains(&e_lfanew) {
        return Err(bad("PE header offset out of range"));
    }

    reader
        .seek(SeekFrom::Start(e_lfanew as u64))
        .map_err(|e| AssemblyLoadFailure::Rejected(e.to_string()))?;

    let mut nt = [0u8; 4 + COFF_HEADER_SIZE];
    read_exact_or(reader, &mut nt, || bad("truncated PE header"))?;

    if u32::from_le_bytes([nt[0], nt[1], nt[2], nt[3]]) != IMAGE_NT_SIGNATURE {
        return Err(bad("missing PE signature"));
    }

    let machine = u16::from_le_bytes([nt[4], nt[5]]);
    let size_of_optional_header = u16::from_le_bytes([nt[20], nt[21]]) as usize;

    let mut optional = vec![0u8; size_of_optional_header];
    read_exact_or(reader, &mut optional, || bad("truncated optional header"))?;
    if optional.len() < 2 {
        return Err(bad("no optional header"));
    }

    let magic = u16::from_le_bytes([optional[0], optional[1]]);
    let (count_offset, dirs_offset, is_pe32_plus) = match magic {
        IMAGE_NT_OPTIONAL_HDR32_MAGIC => (92, 96, false),
        IMAGE_NT_OPTIONAL_HDR64_MAGIC => (108, 112, true),
        _ => return Err(bad("unknown optional header magic")),
    };

    let number_of_rva_and_sizes = read_u32(&optional, count_offset)
        .ok_or_else(|| bad("truncated optional header"))? as usize;
    if number_of_rva_and_sizes <= IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR {
        return Err(bad("no CLI header: not a managed assembly"));
    }

    let entry = dirs_offset + IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR * 8;
    let rva = read_u32(&optional, entry).ok_or_else(|| bad("truncated data directories"))?;
    let size = read_u32(&optional, entry + 4).ok_or_else(|| bad("truncated data directories"))?;
    if rva == 0 || size == 0 {
        return Err(bad("no CLI header: not a managed assembly"));
    }

    Ok(ManagedImage {
        machine,
        is_pe32_plus,
        cli_header_rva: rva,
    })
}

fn read_exact_or<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    on_eof: impl FnOnce() -> AssemblyLoadFailure,
) -> Result<(), AssemblyLoadFailure> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(on_eof()),
        Err(e) => Err(AssemblyLoadFailure::Rejected(e.to_string())),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Smallest header set `read_headers` accepts.
    pub(crate) fn fake_pe(pe32_plus: bool, with_cli_header: bool) -> Vec<u8> {
        let e_lfanew = 0x80usize;
        let optional_size = if pe32_plus { 240 } else { 224 };
        let mut bytes = vec![0u8; e_lfanew + 4 + COFF_HEADER_SIZE + optional_size];

        bytes[0..2].copy_from_slice(&IMAGE_DOS_SIGNATURE.to_le_bytes());
        bytes[0x3C..0x40].copy_from_slice(&(e_lfanew as u32).to_le_bytes());

        let nt = e_lfanew;
        bytes[nt..nt + 4].copy_from_slice(&IMAGE_NT_SIGNATURE.to_le_bytes());
        let machine = if pe32_plus {
            IMAGE_FILE_MACHINE_AMD64
        } else {
            IMAGE_FILE_MACHINE_I386
        };
        bytes[nt + 4..nt + 6].copy_from_slice(&machine.to_le_bytes());
        bytes[nt + 20..nt + 22].copy_from_slice(&(optional_size as u16).to_le_bytes());

        let opt = nt + 4 + COFF_HEADER_SIZE;
        let (magic, count_offset, dirs_offset) = if pe32_plus {
            (IMAGE_NT_OPTIONAL_HDR64_MAGIC, 108, 112)
        } else {
            (IMAGE_NT_OPTIONAL_HDR32_MAGIC, 92, 96)
        };
        bytes[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
        bytes[opt + count_offset..opt + count_offset + 4].copy_from_slice(&16u32.to_le_bytes());
        if with_cli_header {
            let entry = opt + dirs_offset + IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR * 8;
            bytes[entry..entry + 4].copy_from_slice(&0x2008u32.to_le_bytes());
            bytes[entry + 4..entry + 8].copy_from_slice(&0x48u32.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn accepts_any_cpu_assembly() {
        let image = read_headers(&mut Cursor::new(fake_pe(false, true))).unwrap();
        assert!(image.is_any_cpu_candidate());
        assert_eq!(image.cli_header_rva, 0x2008);
    }

    #[test]
    fn accepts_pe32_plus_assembly() {
        let image = read_headers(&mut Cursor::new(fake_pe(true, true))).unwrap();
        assert!(image.is_pe32_plus);
        assert_eq!(image.machine, IMAGE_FILE_MACHINE_AMD64);
    }

    #[test]
    fn foreign_pe32_plus_is_incompatible() {
        let mut image = read_headers(&mut Cursor::new(fake_pe(true, true))).unwrap();
        image.machine = HOST_MACHINE;
        assert!(image.check_architecture().is_ok());

        image.machine = if HOST_MACHINE == IMAGE_FILE_MACHINE_ARM64 {
            IMAGE_FILE_MACHINE_AMD64
        } else {
            IMAGE_FILE_MACHINE_ARM64
        };
        let err = image.check_architecture().unwrap_err();
        assert!(matches!(err, AssemblyLoadFailure::Incompatible(ref m) if m.contains("built for")));

        // AnyCPU images run anywhere.
        let any_cpu = read_headers(&mut Cursor::new(fake_pe(false, true))).unwrap();
        assert!(any_cpu.check_architecture().is_ok());
    }

    #[test]
    fn native_dll_is_bad_image() {
        let err = read_headers(&mut Cursor::new(fake_pe(true, false))).unwrap_err();
        assert!(matches!(err, AssemblyLoadFailure::BadImage(ref m) if m.contains("CLI header")));
    }

    #[test]
    fn text_file_is_bad_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.dll");
        std::fs::write(&path, "this is not an assembly, just some text padding it out").unwrap();
        let err = inspect(&path).unwrap_err();
        assert!(matches!(err, AssemblyLoadFailure::BadImage(_)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect(&dir.path().join("nope.dll")).unwrap_err();
        assert_eq!(err, AssemblyLoadFailure::NotFound);
    }

    #[test]
    fn empty_file_is_bad_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.dll");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(inspect(&path), Err(AssemblyLoadFailure::BadImage(_))));
    }
}
