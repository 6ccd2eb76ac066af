//! Locating runtime installations on disk.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use clrhost_shared::{Error, Result, RuntimeKind};
use tracing::debug;

/// Environment variable overriding the Mono library path.
pub const LIBMONO_ENV: &str = "CLRHOST_LIBMONO";

/// Environment variable naming the dotnet installation root.
pub const DOTNET_ROOT_ENV: &str = "DOTNET_ROOT";

/// Shared framework that CoreCLR descriptors are synthesized for.
pub const NETCORE_APP: &str = "Microsoft.NETCore.App";

#[cfg(windows)]
const HOSTFXR_NAME: &str = "hostfxr.dll";
#[cfg(target_os = "macos")]
const HOSTFXR_NAME: &str = "libhostfxr.dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const HOSTFXR_NAME: &str = "libhostfxr.so";

#[cfg(windows)]
const DOTNET_EXE: &str = "dotnet.exe";
#[cfg(not(windows))]
const DOTNET_EXE: &str = "dotnet";

/// A dotted version such as `8.0.11` or `9.0.0-rc.2.24473.5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    parts: Vec<u64>,
    pre: Option<String>,
    text: String,
}

impl Version {
    pub fn parse(text: &str) -> Option<Self> {
        let (core, pre) = match text.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (text, None),
        };
        let parts = core
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(Self {
            parts,
            pre,
            text: text.to_string(),
        })
    }

    pub fn major(&self) -> u64 {
        self.parts[0]
    }

    pub fn minor(&self) -> u64 {
        self.parts.get(1).copied().unwrap_or(0)
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// An installed shared framework, e.g. `Microsoft.NETCore.App 8.0.11`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotnetRuntimeSpec {
    pub name: String,
    pub version: Version,
    /// Directory containing the framework's assemblies.
    pub path: PathBuf,
}

impl DotnetRuntimeSpec {
    /// Target framework moniker matching this runtime, e.g. `net8.0`.
    pub fn tfm(&self) -> String {
        format!("net{}.{}", self.version.major(), self.version.minor())
    }
}

impl fmt::Display for DotnetRuntimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.name, self.version, self.path.display())
    }
}

// =============================================================================
// Mono
// =============================================================================

/// Candidate locations for the Mono embedding library, most specific first.
pub fn libmono_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }

    let mut candidates = Vec::new();
    if let Some(path) = std::env::var_os(LIBMONO_ENV).filter(|v| !v.is_empty()) {
        candidates.push(PathBuf::from(path));
    }

    #[cfg(windows)]
    {
        for base in program_files_dirs() {
            candidates.push(base.join("Mono").join("bin").join("mono-2.0-sgen.dll"));
        }
        candidates.push(PathBuf::from("mono-2.0-sgen.dll"));
    }

    #[cfg(target_os = "macos")]
    {
        candidates.push(PathBuf::from(
            "/Library/Frameworks/Mono.framework/Versions/Current/lib/libmonosgen-2.0.dylib",
        ));
        candidates.push(PathBuf::from("/opt/homebrew/lib/libmonosgen-2.0.dylib"));
        candidates.push(PathBuf::from("/usr/local/lib/libmonosgen-2.0.dylib"));
        candidates.push(PathBuf::from("libmonosgen-2.0.dylib"));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        // Bare names go through the dynamic loader's search path.
        candidates.push(PathBuf::from("libmonosgen-2.0.so.1"));
        candidates.push(PathBuf::from("libmono-2.0.so.1"));
        candidates.push(PathBuf::from("libmonosgen-2.0.so"));
        candidates.push(PathBuf::from("libmono-2.0.so"));
    }

    candidates
}

// =============================================================================
// dotnet / hostfxr
// =============================================================================

/// Find the dotnet installation root.
///
/// Order: explicit path, `DOTNET_ROOT`, the directory of `dotnet` on `PATH`,
/// then the platform's default install locations.
pub fn find_dotnet_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(root) = explicit {
        return Ok(root.to_path_buf());
    }

    if let Some(root) = std::env::var_os(DOTNET_ROOT_ENV).filter(|v| !v.is_empty()) {
        debug!(root = ?root, "using {}", DOTNET_ROOT_ENV);
        return Ok(PathBuf::from(root));
    }

    if let Ok(exe) = which::which(DOTNET_EXE) {
        // The PATH entry is often a symlink into the real install.
        let exe = exe.canonicalize().unwrap_or(exe);
        if let Some(root) = exe.parent() {
            if root.join("host").join("fxr").is_dir() {
                debug!(root = %root.display(), "found dotnet on PATH");
                return Ok(root.to_path_buf());
            }
        }
    }

    for root in default_dotnet_roots() {
        if root.join("host").join("fxr").is_dir() {
            debug!(root = %root.display(), "found dotnet in default location");
            return Ok(root);
        }
    }

    Err(Error::NativeLibraryNotFound {
        library: HOSTFXR_NAME.to_string(),
        detail: format!(
            "no dotnet installation found; set {} or put dotnet on PATH",
            DOTNET_ROOT_ENV
        ),
    })
}

#[cfg(windows)]
fn default_dotnet_roots() -> Vec<PathBuf> {
    program_files_dirs()
        .into_iter()
        .map(|base| base.join("dotnet"))
        .collect()
}

#[cfg(target_os = "macos")]
fn default_dotnet_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/local/share/dotnet")]
}

#[cfg(all(unix, not(target_os = "macos")))]
fn default_dotnet_roots() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/share/dotnet"),
        PathBuf::from("/usr/lib/dotnet"),
        PathBuf::from("/usr/lib64/dotnet"),
        PathBuf::from("/usr/local/share/dotnet"),
        PathBuf::from("/opt/dotnet"),
    ]
}

#[cfg(windows)]
fn program_files_dirs() -> Vec<PathBuf> {
    ["ProgramW6432", "ProgramFiles", "ProgramFiles(x86)"]
        .iter()
        .filter_map(std::env::var_os)
        .map(PathBuf::from)
        .collect()
}

/// Path of the newest hostfxr under `<root>/host/fxr/<version>/`.
pub fn find_hostfxr(dotnet_root: &Path) -> Result<PathBuf> {
    let fxr_dir = dotnet_root.join("host").join("fxr");
    let newest = versioned_subdirs(&fxr_dir)
        .into_iter()
        .filter(|(_, dir)| dir.join(HOSTFXR_NAME).is_file())
        .max_by(|(a, _), (b, _)| a.cmp(b));

    match newest {
        Some((version, dir)) => {
            debug!(%version, "selected hostfxr");
            Ok(dir.join(HOSTFXR_NAME))
        }
        None => Err(Error::NativeLibraryNotFound {
            library: HOSTFXR_NAME.to_string(),
            detail: format!("nothing usable under {}", fxr_dir.display()),
        }),
    }
}

/// All shared frameworks installed under `<root>/shared/`.
pub fn find_runtimes(dotnet_root: &Path) -> Vec<DotnetRuntimeSpec> {
    let shared = dotnet_root.join("shared");
    let Ok(entries) = std::fs::read_dir(&shared) else {
        return Vec::new();
    };

    let mut runtimes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        for (version, path) in versioned_subdirs(&entry.path()) {
            runtimes.push(DotnetRuntimeSpec {
                name: name.clone(),
                version,
                path,
            });
        }
    }
    runtimes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    runtimes
}

/// Newest release of `name`, falling back to the newest prerelease.
pub fn newest_runtime(dotnet_root: &Path, name: &str) -> Option<DotnetRuntimeSpec> {
    let (releases, previews): (Vec<_>, Vec<_>) = find_runtimes(dotnet_root)
        .into_iter()
        .filter(|rt| rt.name == name)
        .partition(|rt| !rt.version.is_prerelease());

    releases
        .into_iter()
        .max_by(|a, b| a.version.cmp(&b.version))
        .or_else(|| previews.into_iter().max_by(|a, b| a.version.cmp(&b.version)))
}

fn versioned_subdirs(dir: &Path) -> Vec<(Version, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let version = Version::parse(&e.file_name().to_string_lossy())?;
            Some((version, e.path()))
        })
        .collect()
}

/// What can be found for each runtime kind, for diagnostics.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub libmono_candidates: Vec<PathBuf>,
    pub dotnet_root: Option<PathBuf>,
    pub hostfxr: Option<PathBuf>,
    pub runtimes: Vec<DotnetRuntimeSpec>,
    pub netfx_supported: bool,
    pub problems: Vec<String>,
}

impl DiscoveryReport {
    pub fn collect(mono: Option<&Path>, dotnet_root: Option<&Path>) -> Self {
        let mut report = DiscoveryReport {
            libmono_candidates: libmono_candidates(mono),
            netfx_supported: RuntimeKind::NetFx.is_supported_on_this_platform(),
            ..Default::default()
        };

        match find_dotnet_root(dotnet_root) {
            Ok(root) => {
                match find_hostfxr(&root) {
                    Ok(path) => report.hostfxr = Some(path),
                    Err(e) => report.problems.push(e.to_string()),
                }
                report.runtimes = find_runtimes(&root);
                report.dotnet_root = Some(root);
            }
            Err(e) => report.problems.push(e.to_string()),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_install() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for v in ["6.0.0", "8.0.11", "8.0.2", "10.0.0-preview.1"] {
            let dir = root.path().join("host").join("fxr").join(v);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(HOSTFXR_NAME), b"").unwrap();
        }
        // A version directory without the library must be skipped.
        fs::create_dir_all(root.path().join("host").join("fxr").join("11.0.0")).unwrap();

        for (name, v) in [
            (NETCORE_APP, "6.0.36"),
            (NETCORE_APP, "8.0.11"),
            (NETCORE_APP, "9.0.0-rc.2"),
            ("Microsoft.AspNetCore.App", "9.0.1"),
        ] {
            fs::create_dir_all(root.path().join("shared").join(name).join(v)).unwrap();
        }
        fs::create_dir_all(root.path().join("shared").join(NETCORE_APP).join("not-a-version"))
            .unwrap();
        root
    }

    #[test]
    fn version_ordering_is_numeric() {
        let v = |s| Version::parse(s).unwrap();
        assert!(v("8.0.11") > v("8.0.2"));
        assert!(v("10.0.0") > v("9.0.9"));
        assert!(v("9.0.0-rc.2") < v("9.0.0"));
        assert_eq!(v("8.0").cmp(&v("8.0.0")), Ordering::Equal);
        assert!(Version::parse("latest").is_none());
    }

    #[test]
    fn picks_highest_hostfxr_that_exists() {
        let root = fake_install();
        let path = find_hostfxr(root.path()).unwrap();
        assert!(path.ends_with(Path::new("10.0.0-preview.1").join(HOSTFXR_NAME)));
    }

    #[test]
    fn missing_fxr_directory_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let err = find_hostfxr(root.path()).unwrap_err();
        assert!(matches!(err, Error::NativeLibraryNotFound { .. }));
    }

    #[test]
    fn newest_runtime_prefers_releases() {
        let root = fake_install();
        let spec = newest_runtime(root.path(), NETCORE_APP).unwrap();
        assert_eq!(spec.version.as_str(), "8.0.11");
        assert_eq!(spec.tfm(), "net8.0");
        assert!(newest_runtime(root.path(), "Microsoft.WindowsDesktop.App").is_none());
    }

    #[test]
    fn lists_all_frameworks_sorted() {
        let root = fake_install();
        let names: Vec<_> = find_runtimes(root.path())
            .into_iter()
            .map(|rt| format!("{} {}", rt.name, rt.version))
            .collect();
        assert_eq!(
            names,
            vec![
                "Microsoft.AspNetCore.App 9.0.1",
                "Microsoft.NETCore.App 6.0.36",
                "Microsoft.NETCore.App 8.0.11",
                "Microsoft.NETCore.App 9.0.0-rc.2",
            ]
        );
    }

    #[test]
    fn explicit_paths_win() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(find_dotnet_root(Some(root.path())).unwrap(), root.path());
        assert_eq!(
            libmono_candidates(Some(Path::new("/opt/mono/lib/libmonosgen-2.0.so"))),
            vec![PathBuf::from("/opt/mono/lib/libmonosgen-2.0.so")]
        );
    }
}
