//! .NET Framework hosting: the `mscoree` metahost and runtime host
//! interfaces, `_AppDomain`, and the bridge library export.
//!
//! These interfaces are not included in the windows crate, so the vtables
//! are declared here. Only the slots up to the last one called are listed.

use std::ffi::{c_char, c_void};
use std::path::{Path, PathBuf};

use clrhost_shared::Result;
use libloading::Library;
use windows::Win32::System::Variant::VARIANT;
use windows::core::{BSTR, GUID, HRESULT, PCWSTR};

use super::{open_library, symbol};

pub const CLSID_CLR_META_HOST: GUID = GUID::from_u128(0x9280188d_0e8e_4867_b30c_7fa83884e8de);
pub const IID_ICLR_META_HOST: GUID = GUID::from_u128(0xD332DB9E_B9B3_4125_8207_A14884F53216);
pub const IID_ICLR_RUNTIME_INFO: GUID = GUID::from_u128(0xBD39D1D2_BA2F_486a_89B0_B4B0CB466891);
pub const CLSID_COR_RUNTIME_HOST: GUID = GUID::from_u128(0xcb2f6723_ab3a_11d2_9c40_00c04fa30a3e);
pub const IID_ICOR_RUNTIME_HOST: GUID = GUID::from_u128(0xcb2f6722_ab3a_11d2_9c40_00c04fa30a3e);
pub const IID_APP_DOMAIN: GUID = GUID::from_u128(0x05F696DC_2B29_3663_AD8B_C4389CF2A713);

/// `ICorRuntimeHost::Start` on a runtime that is already running.
pub const HOST_E_INVALIDOPERATION: HRESULT = HRESULT(0x80131022u32 as i32);

/// `mscoree!CLRCreateInstance`.
pub type CLRCreateInstanceFn = unsafe extern "system" fn(
    clsid: *const GUID,
    riid: *const GUID,
    ppinterface: *mut *mut c_void,
) -> HRESULT;

#[repr(C)]
pub struct ICLRMetaHostVtbl {
    // IUnknown
    pub query_interface:
        unsafe extern "system" fn(*mut ICLRMetaHost, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut ICLRMetaHost) -> u32,
    pub release: unsafe extern "system" fn(*mut ICLRMetaHost) -> u32,
    // ICLRMetaHost
    pub get_runtime: unsafe extern "system" fn(
        *mut ICLRMetaHost,
        PCWSTR,
        *const GUID,
        *mut *mut c_void,
    ) -> HRESULT,
    pub get_version_from_file:
        unsafe extern "system" fn(*mut ICLRMetaHost, PCWSTR, *mut u16, *mut u32) -> HRESULT,
    pub enumerate_installed_runtimes:
        unsafe extern "system" fn(*mut ICLRMetaHost, *mut *mut c_void) -> HRESULT,
    pub enumerate_loaded_runtimes:
        unsafe extern "system" fn(*mut ICLRMetaHost, *mut c_void, *mut *mut c_void) -> HRESULT,
    pub request_runtime_loaded_notification:
        unsafe extern "system" fn(*mut ICLRMetaHost, *mut c_void) -> HRESULT,
    pub query_legacy_v2_runtime_binding:
        unsafe extern "system" fn(*mut ICLRMetaHost, *const GUID, *mut *mut c_void) -> HRESULT,
    pub exit_process: unsafe extern "system" fn(*mut ICLRMetaHost, i32) -> HRESULT,
}

#[repr(C)]
pub struct ICLRMetaHost {
    pub vtbl: *const ICLRMetaHostVtbl,
}

#[repr(C)]
pub struct ICLRRuntimeInfoVtbl {
    // IUnknown
    pub query_interface:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut ICLRRuntimeInfo) -> u32,
    pub release: unsafe extern "system" fn(*mut ICLRRuntimeInfo) -> u32,
    // ICLRRuntimeInfo
    pub get_version_string:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, *mut u16, *mut u32) -> HRESULT,
    pub get_runtime_directory:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, *mut u16, *mut u32) -> HRESULT,
    pub is_loaded:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, *mut c_void, *mut i32) -> HRESULT,
    pub load_error_string:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, u32, *mut u16, *mut u32, i32) -> HRESULT,
    pub load_library:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, PCWSTR, *mut *mut c_void) -> HRESULT,
    pub get_proc_address:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, *const i8, *mut *mut c_void) -> HRESULT,
    pub get_interface: unsafe extern "system" fn(
        *mut ICLRRuntimeInfo,
        *const GUID,
        *const GUID,
        *mut *mut c_void,
    ) -> HRESULT,
    pub is_loadable: unsafe extern "system" fn(*mut ICLRRuntimeInfo, *mut i32) -> HRESULT,
    pub set_default_startup_flags:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, u32, PCWSTR) -> HRESULT,
    pub get_default_startup_flags:
        unsafe extern "system" fn(*mut ICLRRuntimeInfo, *mut u32, *mut u16, *mut u32) -> HRESULT,
    pub bind_as_legacy_v2_runtime: unsafe extern "system" fn(*mut ICLRRuntimeInfo) -> HRESULT,
    pub is_started: unsafe extern "system" fn(*mut ICLRRuntimeInfo, *mut i32, *mut u32) -> HRESULT,
}

#[repr(C)]
pub struct ICLRRuntimeInfo {
    pub vtbl: *const ICLRRuntimeInfoVtbl,
}

/// Any COM object, for the `IUnknown` slots.
#[repr(C)]
pub struct IUnknownVtbl {
    pub query_interface:
        unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut c_void) -> u32,
    pub release: unsafe extern "system" fn(*mut c_void) -> u32,
}

#[repr(C)]
pub struct ICorRuntimeHostVtbl {
    // IUnknown
    pub query_interface:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut ICorRuntimeHost) -> u32,
    pub release: unsafe extern "system" fn(*mut ICorRuntimeHost) -> u32,
    // ICorRuntimeHost
    pub create_logic_thread_state: unsafe extern "system" fn(*mut ICorRuntimeHost) -> HRESULT,
    pub delete_logic_thread_state: unsafe extern "system" fn(*mut ICorRuntimeHost) -> HRESULT,
    pub switch_in_logic_thread_state:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut u32) -> HRESULT,
    pub switch_out_logic_thread_state:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut *mut u32) -> HRESULT,
    pub locked_in_os_thread: unsafe extern "system" fn(*mut ICorRuntimeHost) -> HRESULT,
    pub get_configuration:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut *mut c_void) -> HRESULT,
    pub start: unsafe extern "system" fn(*mut ICorRuntimeHost) -> HRESULT,
    pub stop: unsafe extern "system" fn(*mut ICorRuntimeHost) -> HRESULT,
    /// `CreateDomain(friendly_name, identity_array, out app_domain)`.
    pub create_domain: unsafe extern "system" fn(
        *mut ICorRuntimeHost,
        PCWSTR,
        *mut c_void,
        *mut *mut c_void,
    ) -> HRESULT,
    pub get_default_domain:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut *mut c_void) -> HRESULT,
    pub enum_domains: unsafe extern "system" fn(*mut ICorRuntimeHost, *mut *mut c_void) -> HRESULT,
    pub next_domain:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut c_void, *mut *mut c_void) -> HRESULT,
    pub close_enum: unsafe extern "system" fn(*mut ICorRuntimeHost, *mut c_void) -> HRESULT,
    pub create_domain_ex: unsafe extern "system" fn(
        *mut ICorRuntimeHost,
        PCWSTR,
        *mut c_void,
        *mut c_void,
        *mut *mut c_void,
    ) -> HRESULT,
    pub create_domain_setup:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut *mut c_void) -> HRESULT,
    pub create_evidence:
        unsafe extern "system" fn(*mut ICorRuntimeHost, *mut *mut c_void) -> HRESULT,
    pub unload_domain: unsafe extern "system" fn(*mut ICorRuntimeHost, *mut c_void) -> HRESULT,
}

#[repr(C)]
pub struct ICorRuntimeHost {
    pub vtbl: *const ICorRuntimeHostVtbl,
}

/// `mscorlib!_AppDomain`, up to `SetData`.
#[repr(C)]
pub struct AppDomainVtbl {
    // IUnknown
    pub query_interface:
        unsafe extern "system" fn(*mut AppDomain, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut AppDomain) -> u32,
    pub release: unsafe extern "system" fn(*mut AppDomain) -> u32,
    // IDispatch
    pub get_type_info_count: unsafe extern "system" fn(*mut AppDomain, *mut u32) -> HRESULT,
    pub get_type_info:
        unsafe extern "system" fn(*mut AppDomain, u32, u32, *mut *mut c_void) -> HRESULT,
    pub get_ids_of_names: unsafe extern "system" fn(
        *mut AppDomain,
        *const GUID,
        *mut *mut u16,
        u32,
        u32,
        *mut i32,
    ) -> HRESULT,
    pub invoke: unsafe extern "system" fn(
        *mut AppDomain,
        i32,
        *const GUID,
        u32,
        u16,
        *mut c_void,
        *mut VARIANT,
        *mut c_void,
        *mut u32,
    ) -> HRESULT,
    // _AppDomain
    pub get_to_string: unsafe extern "system" fn(*mut AppDomain, *mut BSTR) -> HRESULT,
    pub equals: unsafe extern "system" fn(*mut AppDomain, VARIANT, *mut i16) -> HRESULT,
    pub get_hash_code: unsafe extern "system" fn(*mut AppDomain, *mut i32) -> HRESULT,
    pub get_type: unsafe extern "system" fn(*mut AppDomain, *mut *mut c_void) -> HRESULT,
    pub init_domain: unsafe extern "system" fn(*mut AppDomain) -> HRESULT,
    pub get_domain_manager: unsafe extern "system" fn(*mut AppDomain, *mut *mut c_void) -> HRESULT,
    pub get_evidence: unsafe extern "system" fn(*mut AppDomain, *mut *mut c_void) -> HRESULT,
    pub get_friendly_name: unsafe extern "system" fn(*mut AppDomain, *mut BSTR) -> HRESULT,
    pub get_base_directory: unsafe extern "system" fn(*mut AppDomain, *mut BSTR) -> HRESULT,
    pub get_relative_search_path: unsafe extern "system" fn(*mut AppDomain, *mut BSTR) -> HRESULT,
    pub get_shadow_copy_files: unsafe extern "system" fn(*mut AppDomain, *mut i16) -> HRESULT,
    pub get_assemblies: unsafe extern "system" fn(*mut AppDomain, *mut *mut c_void) -> HRESULT,
    pub append_private_path: unsafe extern "system" fn(*mut AppDomain, BSTR) -> HRESULT,
    pub clear_private_path: unsafe extern "system" fn(*mut AppDomain) -> HRESULT,
    pub set_shadow_copy_path: unsafe extern "system" fn(*mut AppDomain, BSTR) -> HRESULT,
    pub clear_shadow_copy_path: unsafe extern "system" fn(*mut AppDomain) -> HRESULT,
    pub set_cache_path: unsafe extern "system" fn(*mut AppDomain, BSTR) -> HRESULT,
    pub set_data: unsafe extern "system" fn(*mut AppDomain, BSTR, VARIANT) -> HRESULT,
}

#[repr(C)]
pub struct AppDomain {
    pub vtbl: *const AppDomainVtbl,
}

/// `AppDomain` data key the configuration system reads the config file from.
pub const APP_CONFIG_FILE: &str = "APP_CONFIG_FILE";

/// `clrhost_get_function(app_domain, assembly_path, type_name, method_name, failure)`.
///
/// `app_domain` is the domain's `_AppDomain` pointer. Returns an unmanaged
/// `int (IntPtr, int)` entry point, or null with `*failure` set to one of
/// the bridge failure codes.
pub type GetFunctionFn = unsafe extern "system" fn(
    app_domain: *mut c_void,
    assembly_path: *const c_char,
    type_name: *const c_char,
    method_name: *const c_char,
    failure: *mut i32,
) -> *mut c_void;

/// Default bridge library name, looked up next to the executable.
pub const BRIDGE_LIBRARY: &str = "clrhost_bridge.dll";

/// Export of the .NET Framework bridge library.
pub struct BridgeApi {
    path: PathBuf,
    pub get_function: GetFunctionFn,
    _library: Library,
}

impl BridgeApi {
    pub fn load(path: &Path) -> Result<Self> {
        let library = open_library(path)?;
        // SAFETY: the signature matches the bridge export; the pointer is
        // kept with its library.
        unsafe {
            Ok(Self {
                path: path.to_path_buf(),
                get_function: symbol(&library, path, "clrhost_get_function")?,
                _library: library,
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `mscoree.dll` with its `CLRCreateInstance` export.
pub struct Mscoree {
    pub create_instance: CLRCreateInstanceFn,
    _library: Library,
}

impl Mscoree {
    pub fn load() -> Result<Self> {
        let path = Path::new("mscoree.dll");
        let library = open_library(path)?;
        // SAFETY: documented export signature; kept alive with the library.
        let create_instance = unsafe { symbol(&library, path, "CLRCreateInstance")? };
        Ok(Self {
            create_instance,
            _library: library,
        })
    }
}
