//! Raw bindings to the native hosting entry points.
//!
//! Libraries are opened with `libloading` and every entry point is resolved
//! up front, so a host either has its full function table or fails at
//! construction.

pub mod hostfxr;
pub mod mono;
#[cfg(windows)]
pub mod netfx;

use std::ffi::{CString, OsStr};
use std::path::Path;

use clrhost_shared::{Error, Result, RuntimeKind};
use libloading::Library;
use tracing::debug;

/// Open a native library by path or bare name.
pub(crate) fn open_library(path: &Path) -> Result<Library> {
    debug!(library = %path.display(), "loading native library");
    // SAFETY: loading runs the library's initializers; the hosting libraries
    // we open have no unsound constructors.
    unsafe { Library::new(path) }.map_err(|e| Error::NativeLibraryNotFound {
        library: path.display().to_string(),
        detail: e.to_string(),
    })
}

/// Copy the entry point `name` out of `library`.
///
/// # Safety
/// `T` must be the exact function pointer type of the exported symbol, and
/// the copy must not outlive `library`.
pub(crate) unsafe fn symbol<T: Copy>(library: &Library, path: &Path, name: &str) -> Result<T> {
    // SAFETY: forwarded to the caller.
    let sym = unsafe { library.get::<T>(name.as_bytes()) }.map_err(|_| Error::NativeSymbolMissing {
        library: path.display().to_string(),
        symbol: name.to_string(),
    })?;
    Ok(*sym)
}

/// Read a NUL-terminated UTF-8 string, replacing invalid sequences.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn c_str_lossy(ptr: *const std::ffi::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller.
    let text = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Some(text.to_string_lossy().into_owned())
}

/// UTF-8 C string for a path or name handed to a narrow-char native API.
pub(crate) fn c_string(kind: RuntimeKind, value: &OsStr) -> Result<CString> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        value.as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = value
        .to_str()
        .ok_or_else(|| Error::config(kind, format!("{:?} is not valid UTF-8", value)))?
        .as_bytes()
        .to_vec();
    CString::new(bytes)
        .map_err(|_| Error::config(kind, format!("{:?} contains a NUL character", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrhost_shared::ErrorKind;

    #[test]
    fn missing_library_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_library(&dir.path().join("libnothing-here.so")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NativeLibraryNotFound);
        assert!(err.to_string().contains("libnothing-here"));
    }

    #[test]
    fn c_string_rejects_interior_nul() {
        let err = c_string(RuntimeKind::Mono, OsStr::new("--debug\0")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        let ok = c_string(RuntimeKind::Mono, OsStr::new("/usr/lib/mono")).unwrap();
        assert_eq!(ok.as_bytes(), b"/usr/lib/mono");
    }

    #[test]
    fn null_c_string_is_none() {
        assert!(unsafe { c_str_lossy(std::ptr::null()) }.is_none());
        let owned = std::ffi::CString::new("Example.TestClass").unwrap();
        assert_eq!(
            unsafe { c_str_lossy(owned.as_ptr()) }.as_deref(),
            Some("Example.TestClass")
        );
    }
}
