//! `hostfxr` exports and the CoreCLR delegate types.
//!
//! Strings crossing this ABI are `char_t`: UTF-16 on Windows, narrow
//! (UTF-8) elsewhere.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use clrhost_shared::{Error, Result, RuntimeKind};
use libloading::Library;

use super::{open_library, symbol};

#[cfg(windows)]
pub type CharT = u16;
#[cfg(not(windows))]
pub type CharT = std::ffi::c_char;

pub type HostfxrHandle = *mut c_void;

#[repr(C)]
pub struct HostfxrInitializeParameters {
    pub size: usize,
    pub host_path: *const CharT,
    pub dotnet_root: *const CharT,
}

/// `hdt_load_assembly_and_get_function_pointer`.
pub const HDT_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER: i32 = 5;

pub type InitializeForRuntimeConfigFn = unsafe extern "C" fn(
    runtime_config_path: *const CharT,
    parameters: *const HostfxrInitializeParameters,
    host_context_handle: *mut HostfxrHandle,
) -> i32;
pub type GetRuntimeDelegateFn =
    unsafe extern "C" fn(handle: HostfxrHandle, kind: i32, delegate: *mut *mut c_void) -> i32;
pub type GetRuntimePropertyValueFn =
    unsafe extern "C" fn(handle: HostfxrHandle, name: *const CharT, value: *mut *const CharT) -> i32;
pub type SetRuntimePropertyValueFn =
    unsafe extern "C" fn(handle: HostfxrHandle, name: *const CharT, value: *const CharT) -> i32;
pub type GetRuntimePropertiesFn = unsafe extern "C" fn(
    handle: HostfxrHandle,
    count: *mut usize,
    keys: *mut *const CharT,
    values: *mut *const CharT,
) -> i32;
pub type CloseFn = unsafe extern "C" fn(handle: HostfxrHandle) -> i32;

/// `load_assembly_and_get_function_pointer_fn`.
pub type LoadAssemblyAndGetFunctionPointerFn = unsafe extern "system" fn(
    assembly_path: *const CharT,
    type_name: *const CharT,
    method_name: *const CharT,
    delegate_type_name: *const CharT,
    reserved: *mut c_void,
    delegate: *mut *mut c_void,
) -> i32;

/// Default managed entry point shape: `int (IntPtr args, int sizeBytes)`.
pub type ComponentEntryPointFn = unsafe extern "system" fn(args: *const u8, size: i32) -> i32;

/// hostfxr and hostpolicy status codes.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const SUCCESS_HOST_ALREADY_INITIALIZED: i32 = 1;
    pub const SUCCESS_DIFFERENT_RUNTIME_PROPERTIES: i32 = 2;

    pub const INVALID_ARG_FAILURE: i32 = 0x8000_8081_u32 as i32;
    pub const CORE_HOST_LIB_LOAD_FAILURE: i32 = 0x8000_8082_u32 as i32;
    pub const CORE_HOST_LIB_MISSING_FAILURE: i32 = 0x8000_8083_u32 as i32;
    pub const CORE_HOST_ENTRY_POINT_FAILURE: i32 = 0x8000_8084_u32 as i32;
    pub const CORE_HOST_CUR_HOST_FIND_FAILURE: i32 = 0x8000_8085_u32 as i32;
    pub const CORE_CLR_RESOLVE_FAILURE: i32 = 0x8000_8087_u32 as i32;
    pub const CORE_CLR_BIND_FAILURE: i32 = 0x8000_8088_u32 as i32;
    pub const CORE_CLR_INIT_FAILURE: i32 = 0x8000_8089_u32 as i32;
    pub const CORE_CLR_EXE_FAILURE: i32 = 0x8000_808a_u32 as i32;
    pub const RESOLVER_INIT_FAILURE: i32 = 0x8000_808b_u32 as i32;
    pub const RESOLVER_RESOLVE_FAILURE: i32 = 0x8000_808c_u32 as i32;
    pub const LIB_HOST_INIT_FAILURE: i32 = 0x8000_808e_u32 as i32;
    pub const INVALID_CONFIG_FILE: i32 = 0x8000_8093_u32 as i32;
    pub const APP_ARG_NOT_RUNNABLE: i32 = 0x8000_8094_u32 as i32;
    pub const APP_HOST_EXE_NOT_BOUND_FAILURE: i32 = 0x8000_8095_u32 as i32;
    pub const FRAMEWORK_MISSING_FAILURE: i32 = 0x8000_8096_u32 as i32;
    pub const HOST_API_FAILED: i32 = 0x8000_8097_u32 as i32;
    pub const HOST_API_BUFFER_TOO_SMALL: i32 = 0x8000_8098_u32 as i32;
    pub const LIB_HOST_UNKNOWN_COMMAND: i32 = 0x8000_8099_u32 as i32;
    pub const LIB_HOST_APP_ROOT_FIND_FAILURE: i32 = 0x8000_809a_u32 as i32;
    pub const SDK_RESOLVER_RESOLVE_FAILURE: i32 = 0x8000_809b_u32 as i32;
    pub const FRAMEWORK_COMPAT_FAILURE: i32 = 0x8000_809c_u32 as i32;
    pub const FRAMEWORK_COMPAT_RETRY: i32 = 0x8000_809d_u32 as i32;
    pub const BUNDLE_EXTRACTION_FAILURE: i32 = 0x8000_809f_u32 as i32;
    pub const BUNDLE_EXTRACTION_IO_ERROR: i32 = 0x8000_80a0_u32 as i32;
    pub const LIB_HOST_DUPLICATE_PROPERTY: i32 = 0x8000_80a1_u32 as i32;
    pub const HOST_API_UNSUPPORTED_VERSION: i32 = 0x8000_80a2_u32 as i32;
    pub const HOST_INVALID_STATE: i32 = 0x8000_80a3_u32 as i32;
    pub const HOST_PROPERTY_NOT_FOUND: i32 = 0x8000_80a4_u32 as i32;
    pub const CORE_HOST_INCOMPATIBLE_CONFIG: i32 = 0x8000_80a5_u32 as i32;
    pub const HOST_API_UNSUPPORTED_SCENARIO: i32 = 0x8000_80a6_u32 as i32;
    pub const HOST_FEATURE_DISABLED: i32 = 0x8000_80a7_u32 as i32;

    /// Symbolic name of a status code.
    pub fn describe(code: i32) -> &'static str {
        match code {
            SUCCESS => "Success",
            SUCCESS_HOST_ALREADY_INITIALIZED => "Success_HostAlreadyInitialized",
            SUCCESS_DIFFERENT_RUNTIME_PROPERTIES => "Success_DifferentRuntimeProperties",
            INVALID_ARG_FAILURE => "InvalidArgFailure",
            CORE_HOST_LIB_LOAD_FAILURE => "CoreHostLibLoadFailure",
            CORE_HOST_LIB_MISSING_FAILURE => "CoreHostLibMissingFailure",
            CORE_HOST_ENTRY_POINT_FAILURE => "CoreHostEntryPointFailure",
            CORE_HOST_CUR_HOST_FIND_FAILURE => "CoreHostCurHostFindFailure",
            CORE_CLR_RESOLVE_FAILURE => "CoreClrResolveFailure",
            CORE_CLR_BIND_FAILURE => "CoreClrBindFailure",
            CORE_CLR_INIT_FAILURE => "CoreClrInitFailure",
            CORE_CLR_EXE_FAILURE => "CoreClrExeFailure",
            RESOLVER_INIT_FAILURE => "ResolverInitFailure",
            RESOLVER_RESOLVE_FAILURE => "ResolverResolveFailure",
            LIB_HOST_INIT_FAILURE => "LibHostInitFailure",
            INVALID_CONFIG_FILE => "InvalidConfigFile",
            APP_ARG_NOT_RUNNABLE => "AppArgNotRunnable",
            APP_HOST_EXE_NOT_BOUND_FAILURE => "AppHostExeNotBoundFailure",
            FRAMEWORK_MISSING_FAILURE => "FrameworkMissingFailure",
            HOST_API_FAILED => "HostApiFailed",
            HOST_API_BUFFER_TOO_SMALL => "HostApiBufferTooSmall",
            LIB_HOST_UNKNOWN_COMMAND => "LibHostUnknownCommand",
            LIB_HOST_APP_ROOT_FIND_FAILURE => "LibHostAppRootFindFailure",
            SDK_RESOLVER_RESOLVE_FAILURE => "SdkResolverResolveFailure",
            FRAMEWORK_COMPAT_FAILURE => "FrameworkCompatFailure",
            FRAMEWORK_COMPAT_RETRY => "FrameworkCompatRetry",
            BUNDLE_EXTRACTION_FAILURE => "BundleExtractionFailure",
            BUNDLE_EXTRACTION_IO_ERROR => "BundleExtractionIOError",
            LIB_HOST_DUPLICATE_PROPERTY => "LibHostDuplicateProperty",
            HOST_API_UNSUPPORTED_VERSION => "HostApiUnsupportedVersion",
            HOST_INVALID_STATE => "HostInvalidState",
            HOST_PROPERTY_NOT_FOUND => "HostPropertyNotFound",
            CORE_HOST_INCOMPATIBLE_CONFIG => "CoreHostIncompatibleConfig",
            HOST_API_UNSUPPORTED_SCENARIO => "HostApiUnsupportedScenario",
            HOST_FEATURE_DISABLED => "HostFeatureDisabled",
            _ => "unknown status",
        }
    }

    /// `0x80008096 (FrameworkMissingFailure)`.
    pub fn display(code: i32) -> String {
        format!("0x{:08X} ({})", code as u32, describe(code))
    }

    /// Non-negative codes are successes.
    pub fn is_success(code: i32) -> bool {
        code >= 0
    }
}

/// HRESULTs returned by the runtime delegates.
pub mod hresult {
    pub const E_FILENOTFOUND: i32 = 0x8007_0002_u32 as i32;
    pub const E_DIRNOTFOUND: i32 = 0x8007_0003_u32 as i32;
    pub const E_BADIMAGEFORMAT: i32 = 0x8007_000B_u32 as i32;
    pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
    pub const COR_E_FILELOAD: i32 = 0x8013_1621_u32 as i32;
    pub const COR_E_NEWER_RUNTIME: i32 = 0x8013_101B_u32 as i32;
    pub const COR_E_TYPELOAD: i32 = 0x8013_1522_u32 as i32;
    pub const COR_E_MISSINGMETHOD: i32 = 0x8013_1513_u32 as i32;
    pub const COR_E_MISSINGMEMBER: i32 = 0x8013_1512_u32 as i32;
    pub const COR_E_ARGUMENT: i32 = E_INVALIDARG;
}

/// A NUL-terminated `char_t` string.
#[derive(Debug)]
pub struct PlatformString(Vec<CharT>);

impl PlatformString {
    pub fn new(kind: RuntimeKind, text: &str) -> Result<Self> {
        Self::from_os(kind, std::ffi::OsStr::new(text))
    }

    pub fn from_path(kind: RuntimeKind, path: &Path) -> Result<Self> {
        Self::from_os(kind, path.as_os_str())
    }

    #[cfg(windows)]
    fn from_os(kind: RuntimeKind, text: &std::ffi::OsStr) -> Result<Self> {
        use std::os::windows::ffi::OsStrExt;
        let wide: Vec<u16> = text.encode_wide().collect();
        if wide.contains(&0) {
            return Err(Error::config(kind, format!("{:?} contains a NUL character", text)));
        }
        Ok(Self(wide.into_iter().chain(std::iter::once(0)).collect()))
    }

    #[cfg(not(windows))]
    fn from_os(kind: RuntimeKind, text: &std::ffi::OsStr) -> Result<Self> {
        use std::os::unix::ffi::OsStrExt;
        let bytes = text.as_bytes();
        if bytes.contains(&0) {
            return Err(Error::config(kind, format!("{:?} contains a NUL character", text)));
        }
        Ok(Self(
            bytes
                .iter()
                .map(|&b| b as CharT)
                .chain(std::iter::once(0))
                .collect(),
        ))
    }

    pub fn as_ptr(&self) -> *const CharT {
        self.0.as_ptr()
    }

    /// Read a NUL-terminated `char_t` string.
    ///
    /// # Safety
    /// `ptr` must be null or point to a NUL-terminated `char_t` string.
    #[cfg(windows)]
    pub unsafe fn read(ptr: *const CharT) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let mut len = 0usize;
        // SAFETY: terminated per the caller.
        unsafe {
            while *ptr.add(len) != 0 {
                len += 1;
            }
            Some(String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len)))
        }
    }

    /// Read a NUL-terminated `char_t` string.
    ///
    /// # Safety
    /// `ptr` must be null or point to a NUL-terminated `char_t` string.
    #[cfg(not(windows))]
    pub unsafe fn read(ptr: *const CharT) -> Option<String> {
        // SAFETY: terminated per the caller.
        unsafe { super::c_str_lossy(ptr) }
    }
}

/// Function table of a loaded `hostfxr`.
pub struct HostfxrApi {
    path: PathBuf,
    pub initialize_for_runtime_config: InitializeForRuntimeConfigFn,
    pub get_runtime_delegate: GetRuntimeDelegateFn,
    pub get_runtime_property_value: GetRuntimePropertyValueFn,
    pub set_runtime_property_value: SetRuntimePropertyValueFn,
    pub get_runtime_properties: GetRuntimePropertiesFn,
    pub close: CloseFn,
    _library: Library,
}

impl HostfxrApi {
    pub fn load(path: &Path) -> Result<Self> {
        let library = open_library(path)?;
        // SAFETY: the types above mirror hostfxr.h; the pointers are stored
        // together with the library that owns them.
        unsafe {
            Ok(Self {
                path: path.to_path_buf(),
                initialize_for_runtime_config: symbol(
                    &library,
                    path,
                    "hostfxr_initialize_for_runtime_config",
                )?,
                get_runtime_delegate: symbol(&library, path, "hostfxr_get_runtime_delegate")?,
                get_runtime_property_value: symbol(
                    &library,
                    path,
                    "hostfxr_get_runtime_property_value",
                )?,
                set_runtime_property_value: symbol(
                    &library,
                    path,
                    "hostfxr_set_runtime_property_value",
                )?,
                get_runtime_properties: symbol(&library, path, "hostfxr_get_runtime_properties")?,
                close: symbol(&library, path, "hostfxr_close")?,
                _library: library,
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for HostfxrApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostfxrApi").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_have_names() {
        assert_eq!(status::describe(status::SUCCESS), "Success");
        assert_eq!(
            status::display(status::FRAMEWORK_MISSING_FAILURE),
            "0x80008096 (FrameworkMissingFailure)"
        );
        assert_eq!(status::describe(0x1234), "unknown status");
        assert!(status::is_success(status::SUCCESS_DIFFERENT_RUNTIME_PROPERTIES));
        assert!(!status::is_success(status::CORE_HOST_INCOMPATIBLE_CONFIG));
    }

    #[test]
    fn platform_string_round_trips() {
        let s = PlatformString::new(RuntimeKind::CoreClr, "Example.TestClass, example").unwrap();
        let back = unsafe { PlatformString::read(s.as_ptr()) };
        assert_eq!(back.as_deref(), Some("Example.TestClass, example"));
    }

    #[test]
    fn platform_string_rejects_interior_nul() {
        let err = PlatformString::new(RuntimeKind::CoreClr, "a\0b").unwrap_err();
        assert_eq!(err.kind(), clrhost_shared::ErrorKind::ConfigurationInvalid);
    }
}
