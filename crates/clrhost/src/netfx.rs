//! .NET Framework backend.
//!
//! The v4 runtime is started through `ICLRMetaHost` and `ICorRuntimeHost`,
//! and every [`NetFxRuntime`] owns an application domain of its own, so
//! unlike Mono and CoreCLR this is not a process singleton. Binding a method
//! to a native entry point needs managed code; that part is done by the
//! bridge library built from `demos/bridge`, loaded on first use.
//! Elsewhere than Windows construction fails with `PlatformUnsupported`.

use std::path::{Path, PathBuf};

use clrhost_shared::{AssemblyLoadFailure, Error, ResolutionFailure, Result, RuntimeInfo, RuntimeKind};

use crate::config::NetFxConfig;
use crate::function::NativeEntryPoint;

const KIND: RuntimeKind = RuntimeKind::NetFx;

/// Why the bridge's `clrhost_get_function` returned no entry point.
mod bridge_failure {
    pub const ASSEMBLY_LOAD: i32 = 1;
    pub const TYPE_NOT_FOUND: i32 = 2;
    pub const METHOD_NOT_FOUND: i32 = 3;
    pub const SIGNATURE_MISMATCH: i32 = 4;
}

#[cfg_attr(not(windows), allow(dead_code))]
fn bridge_error(code: i32, assembly: &Path, type_name: &str, method_name: &str) -> Error {
    match code {
        bridge_failure::ASSEMBLY_LOAD => Error::load(
            assembly,
            AssemblyLoadFailure::Rejected("the application domain could not load the assembly".into()),
        ),
        bridge_failure::TYPE_NOT_FOUND => {
            Error::resolve(type_name, method_name, ResolutionFailure::TypeNotFound)
        }
        bridge_failure::METHOD_NOT_FOUND => {
            Error::resolve(type_name, method_name, ResolutionFailure::MethodNotFound)
        }
        bridge_failure::SIGNATURE_MISMATCH => Error::resolve(
            type_name,
            method_name,
            ResolutionFailure::SignatureMismatch("expected static int (IntPtr, int)".into()),
        ),
        other => Error::resolve(
            type_name,
            method_name,
            ResolutionFailure::Rejected(format!("bridge failure code {}", other)),
        ),
    }
}

#[cfg(windows)]
pub use imp::NetFxRuntime;

#[cfg(not(windows))]
pub use unsupported::NetFxRuntime;

#[cfg(windows)]
mod imp {
    use std::ffi::{CString, c_void};
    use std::ptr::{self, NonNull};

    use parking_lot::Mutex;
    use tracing::{debug, info, warn};
    use windows::Win32::System::Variant::VARIANT;
    use windows::core::{BSTR, PCWSTR, w};

    use super::*;
    use crate::native::c_string;
    use crate::native::netfx::{
        APP_CONFIG_FILE, AppDomain, BRIDGE_LIBRARY, BridgeApi, CLSID_CLR_META_HOST,
        CLSID_COR_RUNTIME_HOST, GetFunctionFn, HOST_E_INVALIDOPERATION, ICLRMetaHost,
        ICLRRuntimeInfo, ICorRuntimeHost, IID_APP_DOMAIN, IID_ICLR_META_HOST,
        IID_ICLR_RUNTIME_INFO, IID_ICOR_RUNTIME_HOST, IUnknownVtbl, Mscoree,
    };
    use crate::pe;

    const DEFAULT_DOMAIN: &str = "clrhost";

    /// An application domain in the .NET Framework v4 runtime.
    pub struct NetFxRuntime {
        host: NonNull<ICorRuntimeHost>,
        domain: Option<NonNull<AppDomain>>,
        domain_name: String,
        version: Option<String>,
        bridge_path: PathBuf,
        bridge: Mutex<Option<BridgeApi>>,
    }

    // SAFETY: the runtime host and `_AppDomain` are free-threaded COM
    // objects; the bridge slot is behind a mutex.
    unsafe impl Send for NetFxRuntime {}
    unsafe impl Sync for NetFxRuntime {}

    impl NetFxRuntime {
        pub fn new(config: NetFxConfig) -> Result<Self> {
            config.validate()?;
            let (version, host) = start_v4_runtime()?;
            info!(version = version.as_deref().unwrap_or("unknown"), ".NET Framework runtime started");

            let bridge_path = match &config.bridge_library {
                Some(path) => path.clone(),
                None => std::env::current_exe()?
                    .parent()
                    .map(|dir| dir.join(BRIDGE_LIBRARY))
                    .unwrap_or_else(|| PathBuf::from(BRIDGE_LIBRARY)),
            };

            let mut runtime = Self {
                host,
                domain: None,
                domain_name: config.domain.clone().unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
                version,
                bridge_path,
                bridge: Mutex::new(None),
            };
            runtime.domain = Some(runtime.create_domain(config.config_file.as_deref())?);
            info!(domain = %runtime.domain_name, "application domain created");
            Ok(runtime)
        }

        pub fn version(&self) -> Option<&str> {
            self.version.as_deref()
        }

        pub fn info(&self) -> RuntimeInfo {
            let mut info = RuntimeInfo::new(KIND, self.version.clone());
            info.initialized = self.domain.is_some();
            info.shutdown = self.domain.is_none();
            info.properties.insert("domain".into(), self.domain_name.clone());
            info.properties
                .insert("bridge".into(), self.bridge_path.display().to_string());
            info.properties
                .insert("bridge_loaded".into(), self.bridge.lock().is_some().to_string());
            info
        }

        pub fn same_host(&self, other: &NetFxRuntime) -> bool {
            self.domain == other.domain
        }

        pub(crate) fn prepare_assembly(&self, path: &Path) -> Result<PathBuf> {
            pe::inspect(path).map_err(|reason| Error::load(path, reason))?;
            std::path::absolute(path)
                .map_err(|e| Error::load(path, AssemblyLoadFailure::Rejected(e.to_string())))
        }

        pub(crate) fn resolve(
            &self,
            assembly: &Path,
            type_name: &str,
            method_name: &str,
        ) -> Result<NativeEntryPoint> {
            let domain = self.domain.ok_or_else(|| {
                Error::resolve(
                    type_name,
                    method_name,
                    ResolutionFailure::Rejected("application domain is closed".into()),
                )
            })?;
            let get_function = self.bridge_function().map_err(|e| {
                warn!(error = %e, "bridge library unavailable");
                Error::resolve(
                    type_name,
                    method_name,
                    ResolutionFailure::Rejected(format!(
                        "bridge library {} could not be loaded",
                        self.bridge_path.display()
                    )),
                )
            })?;

            let path = c_string(KIND, assembly.as_os_str())?;
            let type_arg = CString::new(type_name)
                .map_err(|_| Error::resolve(type_name, method_name, ResolutionFailure::TypeNotFound))?;
            let method_arg = CString::new(method_name).map_err(|_| {
                Error::resolve(type_name, method_name, ResolutionFailure::MethodNotFound)
            })?;

            debug!(assembly = %assembly.display(), type_name, method_name, "clrhost_get_function");
            let mut failure = 0i32;
            // SAFETY: live domain and NUL-terminated arguments.
            let entry = unsafe {
                get_function(
                    domain.as_ptr().cast(),
                    path.as_ptr(),
                    type_arg.as_ptr(),
                    method_arg.as_ptr(),
                    &mut failure,
                )
            };
            if entry.is_null() {
                return Err(bridge_error(failure, assembly, type_name, method_name));
            }
            // SAFETY: the bridge returns a reverse P/Invoke thunk for
            // `int (IntPtr, int)`.
            Ok(unsafe { std::mem::transmute::<*mut c_void, NativeEntryPoint>(entry) })
        }

        /// Unload the application domain. The runtime stays loaded.
        pub fn shutdown(mut self) -> Result<()> {
            self.close();
            Ok(())
        }

        fn bridge_function(&self) -> Result<GetFunctionFn> {
            let mut slot = self.bridge.lock();
            let get_function = match slot.as_ref() {
                Some(bridge) => bridge.get_function,
                None => {
                    let bridge = BridgeApi::load(&self.bridge_path)?;
                    info!(bridge = %bridge.path().display(), "bridge library loaded");
                    let get_function = bridge.get_function;
                    *slot = Some(bridge);
                    get_function
                }
            };
            Ok(get_function)
        }

        fn create_domain(&self, config_file: Option<&Path>) -> Result<NonNull<AppDomain>> {
            let failed = |detail: String| Error::HostInitializationFailed { kind: KIND, detail };
            let name: Vec<u16> = self.domain_name.encode_utf16().chain(std::iter::once(0)).collect();
            let host = self.host.as_ptr();

            // SAFETY: live runtime host; `name` is NUL-terminated and outlives
            // the call; every interface obtained here is released once.
            unsafe {
                let mut unknown: *mut c_void = ptr::null_mut();
                let hr = ((*(*host).vtbl).create_domain)(
                    host,
                    PCWSTR(name.as_ptr()),
                    ptr::null_mut(),
                    &mut unknown,
                );
                if hr.is_err() || unknown.is_null() {
                    return Err(failed(format!(
                        "ICorRuntimeHost::CreateDomain({:?}) failed: 0x{:08X}",
                        self.domain_name, hr.0
                    )));
                }

                let unknown_vtbl = *(unknown as *mut *const IUnknownVtbl);
                let mut app_domain: *mut AppDomain = ptr::null_mut();
                let hr = ((*unknown_vtbl).query_interface)(
                    unknown,
                    &IID_APP_DOMAIN,
                    &mut app_domain as *mut _ as *mut *mut c_void,
                );
                let Some(app_domain) = NonNull::new(app_domain).filter(|_| hr.is_ok()) else {
                    ((*(*host).vtbl).unload_domain)(host, unknown);
                    ((*unknown_vtbl).release)(unknown);
                    return Err(failed(format!(
                        "QueryInterface for _AppDomain failed: 0x{:08X}",
                        hr.0
                    )));
                };
                ((*unknown_vtbl).release)(unknown);

                if let Some(file) = config_file {
                    let value = VARIANT::from(BSTR::from(file.to_string_lossy().as_ref()));
                    let hr = ((*(*app_domain.as_ptr()).vtbl).set_data)(
                        app_domain.as_ptr(),
                        BSTR::from(APP_CONFIG_FILE),
                        value,
                    );
                    if hr.is_err() {
                        self.unload(app_domain);
                        return Err(Error::config(
                            KIND,
                            format!(
                                "cannot set {} to {}: 0x{:08X}",
                                APP_CONFIG_FILE,
                                file.display(),
                                hr.0
                            ),
                        ));
                    }
                    debug!(config_file = %file.display(), "application configuration set");
                }
                Ok(app_domain)
            }
        }

        fn close(&mut self) {
            if let Some(domain) = self.domain.take() {
                info!(domain = %self.domain_name, "unloading application domain");
                self.unload(domain);
            }
        }

        fn unload(&self, domain: NonNull<AppDomain>) {
            let host = self.host.as_ptr();
            // SAFETY: the domain was created by this host and is unloaded and
            // released once.
            unsafe {
                let hr = ((*(*host).vtbl).unload_domain)(host, domain.as_ptr().cast());
                if hr.is_err() {
                    warn!(domain = %self.domain_name, "ICorRuntimeHost::UnloadDomain failed: 0x{:08X}", hr.0);
                }
                ((*(*domain.as_ptr()).vtbl).release)(domain.as_ptr());
            }
        }
    }

    impl Drop for NetFxRuntime {
        fn drop(&mut self) {
            self.close();
            let host = self.host.as_ptr();
            // SAFETY: this runtime holds one reference to the host.
            unsafe { ((*(*host).vtbl).release)(host) };
        }
    }

    /// Start the v4 runtime and return its version string and runtime host.
    fn start_v4_runtime() -> Result<(Option<String>, NonNull<ICorRuntimeHost>)> {
        let mscoree = Mscoree::load()?;
        let unavailable = |detail: String| Error::HostInitializationFailed { kind: KIND, detail };

        unsafe {
            let mut meta_host: *mut ICLRMetaHost = ptr::null_mut();
            let hr = (mscoree.create_instance)(
                &CLSID_CLR_META_HOST,
                &IID_ICLR_META_HOST,
                &mut meta_host as *mut _ as *mut *mut c_void,
            );
            if hr.is_err() || meta_host.is_null() {
                return Err(unavailable(format!(
                    "CLRCreateInstance(ICLRMetaHost) failed: 0x{:08X}",
                    hr.0
                )));
            }

            let mut runtime_info: *mut ICLRRuntimeInfo = ptr::null_mut();
            let hr = ((*(*meta_host).vtbl).get_runtime)(
                meta_host,
                w!("v4.0.30319"),
                &IID_ICLR_RUNTIME_INFO,
                &mut runtime_info as *mut _ as *mut *mut c_void,
            );
            ((*(*meta_host).vtbl).release)(meta_host);
            if hr.is_err() || runtime_info.is_null() {
                return Err(unavailable(format!(
                    "ICLRMetaHost::GetRuntime(v4.0.30319) failed: 0x{:08X}",
                    hr.0
                )));
            }

            let mut buffer = [0u16; 64];
            let mut len = buffer.len() as u32;
            let hr = ((*(*runtime_info).vtbl).get_version_string)(
                runtime_info,
                buffer.as_mut_ptr(),
                &mut len,
            );
            let version = if hr.is_ok() && len > 0 {
                // `len` includes the terminator.
                Some(String::from_utf16_lossy(&buffer[..len as usize - 1]))
            } else {
                warn!("ICLRRuntimeInfo::GetVersionString failed: 0x{:08X}", hr.0);
                None
            };

            let mut loadable = 0i32;
            let hr = ((*(*runtime_info).vtbl).is_loadable)(runtime_info, &mut loadable);
            if hr.is_err() || loadable == 0 {
                ((*(*runtime_info).vtbl).release)(runtime_info);
                return Err(unavailable(format!(
                    "the v4 runtime cannot be loaded into this process (0x{:08X})",
                    hr.0
                )));
            }

            let mut runtime_host: *mut ICorRuntimeHost = ptr::null_mut();
            let hr = ((*(*runtime_info).vtbl).get_interface)(
                runtime_info,
                &CLSID_COR_RUNTIME_HOST,
                &IID_ICOR_RUNTIME_HOST,
                &mut runtime_host as *mut _ as *mut *mut c_void,
            );
            ((*(*runtime_info).vtbl).release)(runtime_info);
            let Some(runtime_host) = NonNull::new(runtime_host).filter(|_| hr.is_ok()) else {
                return Err(unavailable(format!(
                    "ICLRRuntimeInfo::GetInterface(ICorRuntimeHost) failed: 0x{:08X}",
                    hr.0
                )));
            };

            let host = runtime_host.as_ptr();
            let hr = ((*(*host).vtbl).start)(host);
            if hr.is_err() && hr != HOST_E_INVALIDOPERATION {
                ((*(*host).vtbl).release)(host);
                return Err(unavailable(format!("ICorRuntimeHost::Start failed: 0x{:08X}", hr.0)));
            }

            Ok((version, runtime_host))
        }
    }
}

#[cfg(not(windows))]
mod unsupported {
    use std::convert::Infallible;

    use super::*;

    /// Uninhabited here: the .NET Framework only exists on Windows.
    pub struct NetFxRuntime {
        never: Infallible,
    }

    impl NetFxRuntime {
        pub fn new(_config: NetFxConfig) -> Result<Self> {
            Err(Error::PlatformUnsupported { kind: KIND })
        }

        pub fn version(&self) -> Option<&str> {
            match self.never {}
        }

        pub fn info(&self) -> RuntimeInfo {
            match self.never {}
        }

        pub fn same_host(&self, _other: &NetFxRuntime) -> bool {
            match self.never {}
        }

        pub(crate) fn prepare_assembly(&self, _path: &Path) -> Result<PathBuf> {
            match self.never {}
        }

        pub(crate) fn resolve(
            &self,
            _assembly: &Path,
            _type_name: &str,
            _method_name: &str,
        ) -> Result<NativeEntryPoint> {
            match self.never {}
        }

        pub fn shutdown(self) -> Result<()> {
            match self.never {}
        }
    }
}

impl std::fmt::Debug for NetFxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetFxRuntime")
            .field("version", &self.version())
            .finish()
    }
}
