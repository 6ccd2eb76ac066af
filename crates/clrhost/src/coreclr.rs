//! CoreCLR backend, hosted through `hostfxr`.
//!
//! hostfxr loads one runtime per process. The first configuration wins;
//! later ones are checked against it with a secondary
//! `hostfxr_initialize_for_runtime_config`, which reports whether the
//! requested frameworks are satisfied by the running runtime.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use clrhost_shared::{
    AssemblyLoadFailure, Error, ResolutionFailure, Result, RuntimeInfo, RuntimeKind,
};
use tracing::{debug, info, warn};

use crate::config::CoreClrConfig;
use crate::discovery::{self, NETCORE_APP};
use crate::native::hostfxr::{
    ComponentEntryPointFn, HDT_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER, HostfxrApi, HostfxrHandle,
    HostfxrInitializeParameters, LoadAssemblyAndGetFunctionPointerFn, PlatformString, hresult,
    status,
};
use crate::pe;
use crate::registry::HostRegistry;
use crate::runtime_config::{RuntimeConfigDescriptor, SynthesizedConfig};

const KIND: RuntimeKind = RuntimeKind::CoreClr;

static CORECLR: HostRegistry<CoreClrHost, CoreClrConfig> = HostRegistry::new(RuntimeKind::CoreClr);

/// Runtime property naming the framework's deps file; its directory is the
/// resolved framework version.
const FX_DEPS_FILE: &str = "FX_DEPS_FILE";

/// The descriptor a host context is initialized from.
struct DescriptorSource {
    descriptor: RuntimeConfigDescriptor,
    path: PathBuf,
    /// Keeps a synthesized file alive until initialization has read it.
    _synthesized: Option<SynthesizedConfig>,
}

impl DescriptorSource {
    /// The descriptor named by `config`, if any. Read before anything else
    /// so an unreadable descriptor fails as a configuration error.
    fn explicit(config: &CoreClrConfig) -> Result<Option<Self>> {
        let Some(path) = &config.runtime_config else {
            return Ok(None);
        };
        let descriptor = RuntimeConfigDescriptor::read(path)?;
        Ok(Some(Self {
            descriptor,
            path: std::path::absolute(path)?,
            _synthesized: None,
        }))
    }

    /// A minimal descriptor for the newest `Microsoft.NETCore.App` under `dotnet_root`.
    fn synthesize(dotnet_root: &Path) -> Result<Self> {
        let spec = discovery::newest_runtime(dotnet_root, NETCORE_APP).ok_or_else(|| {
            Error::HostInitializationFailed {
                kind: KIND,
                detail: format!(
                    "no runtime descriptor given and no {} runtime under {}",
                    NETCORE_APP,
                    dotnet_root.display()
                ),
            }
        })?;
        let descriptor = RuntimeConfigDescriptor::for_runtime(&spec);
        let synthesized = descriptor.write_temp()?;
        info!(runtime = %spec, descriptor = %synthesized.path().display(), "synthesized runtime descriptor");
        Ok(Self {
            descriptor,
            path: synthesized.path().to_path_buf(),
            _synthesized: Some(synthesized),
        })
    }
}

struct CoreClrHost {
    api: HostfxrApi,
    handle: NonNull<c_void>,
    load_assembly: LoadAssemblyAndGetFunctionPointerFn,
    dotnet_root: PathBuf,
    descriptor: RuntimeConfigDescriptor,
    version: Option<String>,
}

// SAFETY: hostfxr host contexts and the runtime delegates may be used from
// any thread once initialization has completed.
unsafe impl Send for CoreClrHost {}
unsafe impl Sync for CoreClrHost {}

impl CoreClrHost {
    fn initialize(config: &CoreClrConfig) -> Result<Self> {
        let explicit = DescriptorSource::explicit(config)?;
        let dotnet_root = discovery::find_dotnet_root(config.dotnet_root.as_deref())?;
        let hostfxr = discovery::find_hostfxr(&dotnet_root)?;
        let api = HostfxrApi::load(&hostfxr)?;
        info!(hostfxr = %hostfxr.display(), "initializing CoreCLR");

        let source = match explicit {
            Some(source) => source,
            None => DescriptorSource::synthesize(&dotnet_root)?,
        };
        let (code, handle) = initialize_context(&api, &source.path, &dotnet_root)?;
        match code {
            status::SUCCESS => {}
            status::SUCCESS_HOST_ALREADY_INITIALIZED => {
                info!("a CoreCLR runtime was already running in this process; attaching to it")
            }
            _ => {
                close_context(&api, handle);
                return Err(Error::HostInitializationConflict {
                    kind: KIND,
                    detail: format!(
                        "hostfxr_initialize_for_runtime_config returned {}",
                        status::display(code)
                    ),
                });
            }
        }

        if let Err(e) = set_properties(&api, handle, &config.properties) {
            close_context(&api, handle);
            return Err(e);
        }

        let mut delegate: *mut c_void = ptr::null_mut();
        // SAFETY: live context handle and a valid out-pointer.
        let code = unsafe {
            (api.get_runtime_delegate)(
                handle.as_ptr(),
                HDT_LOAD_ASSEMBLY_AND_GET_FUNCTION_POINTER,
                &mut delegate,
            )
        };
        if !status::is_success(code) || delegate.is_null() {
            close_context(&api, handle);
            return Err(Error::HostInitializationFailed {
                kind: KIND,
                detail: format!("hostfxr_get_runtime_delegate returned {}", status::display(code)),
            });
        }
        // SAFETY: for this delegate type hostfxr returns a
        // `load_assembly_and_get_function_pointer_fn`.
        let load_assembly: LoadAssemblyAndGetFunctionPointerFn =
            unsafe { std::mem::transmute::<*mut c_void, LoadAssemblyAndGetFunctionPointerFn>(delegate) };

        let version = read_property(&api, handle, FX_DEPS_FILE)
            .and_then(|deps| framework_version_from_deps_file(Path::new(&deps)))
            .or_else(|| Some(source.descriptor.framework.version.clone()));
        info!(version = version.as_deref().unwrap_or("unknown"), "CoreCLR initialized");

        Ok(Self {
            api,
            handle,
            load_assembly,
            dotnet_root,
            descriptor: source.descriptor,
            version,
        })
    }

    /// Decide whether `requested` can share this host.
    fn reconcile(&self, existing: &CoreClrConfig, requested: &CoreClrConfig) -> Result<()> {
        let conflict = |detail: String| Error::HostInitializationConflict { kind: KIND, detail };

        if requested.properties != existing.properties {
            return Err(conflict(
                "runtime properties differ from the running host's".into(),
            ));
        }
        let requested_root = discovery::find_dotnet_root(requested.dotnet_root.as_deref())?;
        if requested_root != self.dotnet_root {
            return Err(conflict(format!(
                "host runs from {}, requested {}",
                self.dotnet_root.display(),
                requested_root.display()
            )));
        }

        let source = match DescriptorSource::explicit(requested)? {
            Some(source) => source,
            None => DescriptorSource::synthesize(&self.dotnet_root)?,
        };
        let (code, handle) = initialize_context(&self.api, &source.path, &self.dotnet_root)?;
        close_context(&self.api, handle);
        debug!(status = %status::display(code), "secondary host context");
        match code {
            status::SUCCESS_HOST_ALREADY_INITIALIZED => Ok(()),
            _ => Err(conflict(format!(
                "{} {} is not satisfied by the running runtime ({})",
                source.descriptor.framework.name,
                source.descriptor.framework.version,
                status::display(code)
            ))),
        }
    }

    fn resolve(&self, assembly: &Path, type_name: &str, method_name: &str) -> Result<ComponentEntryPointFn> {
        let assembly_name = assembly
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::load(assembly, AssemblyLoadFailure::BadImage("unusable file name".into()))
            })?;
        let qualified = format!("{}, {}", type_name, assembly_name);

        let path = PlatformString::from_path(KIND, assembly)?;
        let type_arg = PlatformString::new(KIND, &qualified)
            .map_err(|_| Error::resolve(type_name, method_name, ResolutionFailure::TypeNotFound))?;
        let method_arg = PlatformString::new(KIND, method_name)
            .map_err(|_| Error::resolve(type_name, method_name, ResolutionFailure::MethodNotFound))?;

        debug!(assembly = %assembly.display(), %qualified, method_name, "load_assembly_and_get_function_pointer");
        let mut entry: *mut c_void = ptr::null_mut();
        // SAFETY: all strings are NUL-terminated and outlive the call; a null
        // delegate type selects the default `ComponentEntryPoint` shape.
        let code = unsafe {
            (self.load_assembly)(
                path.as_ptr(),
                type_arg.as_ptr(),
                method_arg.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
                &mut entry,
            )
        };
        if code != 0 {
            return Err(classify_delegate_error(code, assembly, type_name, method_name));
        }
        if entry.is_null() {
            return Err(Error::resolve(
                type_name,
                method_name,
                ResolutionFailure::Rejected("runtime returned a null entry point".into()),
            ));
        }
        // SAFETY: with the default delegate type the runtime hands back an
        // unmanaged `int (IntPtr, int)` entry point.
        Ok(unsafe { std::mem::transmute::<*mut c_void, ComponentEntryPointFn>(entry) })
    }

    fn properties(&self) -> BTreeMap<String, String> {
        let mut count = 0usize;
        // SAFETY: a zero count with null buffers asks for the required size.
        let code = unsafe {
            (self.api.get_runtime_properties)(
                self.handle.as_ptr(),
                &mut count,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if code != status::HOST_API_BUFFER_TOO_SMALL && !status::is_success(code) {
            warn!(status = %status::display(code), "could not read runtime properties");
            return BTreeMap::new();
        }

        let mut keys = vec![ptr::null(); count];
        let mut values = vec![ptr::null(); count];
        // SAFETY: both buffers hold `count` entries.
        let code = unsafe {
            (self.api.get_runtime_properties)(
                self.handle.as_ptr(),
                &mut count,
                keys.as_mut_ptr(),
                values.as_mut_ptr(),
            )
        };
        if !status::is_success(code) {
            warn!(status = %status::display(code), "could not read runtime properties");
            return BTreeMap::new();
        }

        keys.iter()
            .zip(&values)
            .take(count)
            .filter_map(|(&k, &v)| {
                // SAFETY: hostfxr returns NUL-terminated strings that stay
                // valid while the context is open.
                unsafe { Some((PlatformString::read(k)?, PlatformString::read(v).unwrap_or_default())) }
            })
            .collect()
    }
}

fn initialize_context(
    api: &HostfxrApi,
    runtime_config: &Path,
    dotnet_root: &Path,
) -> Result<(i32, NonNull<c_void>)> {
    let config_arg = PlatformString::from_path(KIND, runtime_config)?;
    let host_path = PlatformString::from_path(KIND, &std::env::current_exe()?)?;
    let root_arg = PlatformString::from_path(KIND, dotnet_root)?;
    let params = HostfxrInitializeParameters {
        size: std::mem::size_of::<HostfxrInitializeParameters>(),
        host_path: host_path.as_ptr(),
        dotnet_root: root_arg.as_ptr(),
    };

    let mut handle: HostfxrHandle = ptr::null_mut();
    debug!(runtime_config = %runtime_config.display(), "hostfxr_initialize_for_runtime_config");
    // SAFETY: all strings and `params` outlive the call.
    let code = unsafe { (api.initialize_for_runtime_config)(config_arg.as_ptr(), &params, &mut handle) };
    let handle = NonNull::new(handle);

    match (status::is_success(code), handle) {
        (true, Some(handle)) => Ok((code, handle)),
        (_, handle) => {
            if let Some(handle) = handle {
                close_context(api, handle);
            }
            Err(initialization_error(code))
        }
    }
}

fn initialization_error(code: i32) -> Error {
    let detail = format!(
        "hostfxr_initialize_for_runtime_config returned {}",
        status::display(code)
    );
    match code {
        status::CORE_HOST_INCOMPATIBLE_CONFIG
        | status::HOST_INVALID_STATE
        | status::SUCCESS_DIFFERENT_RUNTIME_PROPERTIES => {
            Error::HostInitializationConflict { kind: KIND, detail }
        }
        status::INVALID_CONFIG_FILE => Error::config(KIND, detail),
        _ => Error::HostInitializationFailed { kind: KIND, detail },
    }
}

fn close_context(api: &HostfxrApi, handle: NonNull<c_void>) {
    // SAFETY: each context handle is closed once, by its owner.
    let code = unsafe { (api.close)(handle.as_ptr()) };
    if !status::is_success(code) {
        warn!(status = %status::display(code), "hostfxr_close failed");
    }
}

fn set_properties(
    api: &HostfxrApi,
    handle: NonNull<c_void>,
    properties: &BTreeMap<String, String>,
) -> Result<()> {
    for (key, value) in properties {
        let key_arg = PlatformString::new(KIND, key)?;
        let value_arg = PlatformString::new(KIND, value)?;
        debug!(%key, %value, "hostfxr_set_runtime_property_value");
        // SAFETY: live context and NUL-terminated strings.
        let code = unsafe {
            (api.set_runtime_property_value)(handle.as_ptr(), key_arg.as_ptr(), value_arg.as_ptr())
        };
        if !status::is_success(code) {
            return Err(Error::config(
                KIND,
                format!("cannot set runtime property {}: {}", key, status::display(code)),
            ));
        }
    }
    Ok(())
}

fn read_property(api: &HostfxrApi, handle: NonNull<c_void>, name: &str) -> Option<String> {
    let name_arg = PlatformString::new(KIND, name).ok()?;
    let mut value = ptr::null();
    // SAFETY: live context; the returned string is owned by the context.
    unsafe {
        let code = (api.get_runtime_property_value)(handle.as_ptr(), name_arg.as_ptr(), &mut value);
        if code != status::SUCCESS {
            return None;
        }
        PlatformString::read(value)
    }
}

/// `.../shared/Microsoft.NETCore.App/8.0.11/Microsoft.NETCore.App.deps.json` -> `8.0.11`.
fn framework_version_from_deps_file(deps: &Path) -> Option<String> {
    let dir = deps.parent()?.file_name()?.to_str()?;
    discovery::Version::parse(dir).map(|v| v.to_string())
}

/// Map a `load_assembly_and_get_function_pointer` HRESULT to the stage it
/// belongs to.
fn classify_delegate_error(code: i32, assembly: &Path, type_name: &str, method_name: &str) -> Error {
    let hex = format!("HRESULT 0x{:08X}", code as u32);
    match code {
        hresult::E_FILENOTFOUND | hresult::E_DIRNOTFOUND => {
            Error::load(assembly, AssemblyLoadFailure::NotFound)
        }
        hresult::E_BADIMAGEFORMAT => Error::load(assembly, AssemblyLoadFailure::BadImage(hex)),
        hresult::COR_E_NEWER_RUNTIME => {
            Error::load(assembly, AssemblyLoadFailure::Incompatible(hex))
        }
        hresult::COR_E_FILELOAD => Error::load(assembly, AssemblyLoadFailure::Rejected(hex)),
        hresult::COR_E_TYPELOAD => {
            Error::resolve(type_name, method_name, ResolutionFailure::TypeNotFound)
        }
        hresult::COR_E_MISSINGMETHOD | hresult::COR_E_MISSINGMEMBER => {
            Error::resolve(type_name, method_name, ResolutionFailure::MethodNotFound)
        }
        hresult::COR_E_ARGUMENT => Error::resolve(
            type_name,
            method_name,
            ResolutionFailure::SignatureMismatch(format!(
                "method does not match int (IntPtr, int) ({})",
                hex
            )),
        ),
        _ => Error::resolve(type_name, method_name, ResolutionFailure::Rejected(hex)),
    }
}

/// A handle to the process-wide CoreCLR host.
#[derive(Clone)]
pub struct CoreClrRuntime {
    host: Arc<CoreClrHost>,
}

impl CoreClrRuntime {
    /// Initialize CoreCLR, or attach to the running host when the requested
    /// configuration is compatible with it.
    pub fn new(config: CoreClrConfig) -> Result<Self> {
        config.validate()?;
        let host = CORECLR.get_or_init(
            &config,
            || CoreClrHost::initialize(&config),
            |host, existing| host.reconcile(existing, &config),
        )?;
        Ok(Self { host })
    }

    pub fn version(&self) -> Option<&str> {
        self.host.version.as_deref()
    }

    pub fn dotnet_root(&self) -> &Path {
        &self.host.dotnet_root
    }

    /// The descriptor the host was initialized from.
    pub fn descriptor(&self) -> &RuntimeConfigDescriptor {
        &self.host.descriptor
    }

    pub fn info(&self) -> RuntimeInfo {
        let mut info = RuntimeInfo::new(KIND, self.host.version.clone());
        info.initialized = true;
        info.properties = self.host.properties();
        info.properties
            .insert("hostfxr".into(), self.host.api.path().display().to_string());
        info
    }

    pub fn same_host(&self, other: &CoreClrRuntime) -> bool {
        Arc::ptr_eq(&self.host, &other.host)
    }

    /// Check the image and return the absolute path the runtime will load.
    ///
    /// The runtime itself loads the assembly on the first function lookup.
    pub(crate) fn prepare_assembly(&self, path: &Path) -> Result<PathBuf> {
        let image = pe::inspect(path).map_err(|reason| Error::load(path, reason))?;
        debug!(path = %path.display(), machine = image.machine_name(), "managed image");
        std::path::absolute(path)
            .map_err(|e| Error::load(path, AssemblyLoadFailure::Rejected(e.to_string())))
    }

    pub(crate) fn resolve(
        &self,
        assembly: &Path,
        type_name: &str,
        method_name: &str,
    ) -> Result<ComponentEntryPointFn> {
        self.host.resolve(assembly, type_name, method_name)
    }

    /// Close the host context. The runtime itself stays loaded until the
    /// process exits and cannot be initialized again.
    pub fn shutdown(self) -> Result<()> {
        if !CORECLR.retire_if_last(&self.host) {
            return Ok(());
        }
        info!("closing CoreCLR host context");
        close_context(&self.host.api, self.host.handle);
        Ok(())
    }
}

impl std::fmt::Debug for CoreClrRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreClrRuntime")
            .field("dotnet_root", &self.host.dotnet_root)
            .field("version", &self.host.version)
            .finish()
    }
}
