//! Mono backend.
//!
//! Mono can be initialized once per process. The host lives in a
//! process-wide registry; every [`MonoRuntime`] is a handle to it.

use std::collections::HashMap;
use std::ffi::{CString, OsStr, c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use clrhost_shared::{
    AssemblyLoadFailure, Error, ResolutionFailure, Result, RuntimeInfo, RuntimeKind,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::MonoConfig;
use crate::discovery;
use crate::native::c_string;
use crate::native::mono::{self as ffi, MonoApi, MonoDomain, MonoImage, MonoMethod, MonoObject};
use crate::pe;
use crate::registry::HostRegistry;

static MONO: HostRegistry<MonoHost, MonoConfig> = HostRegistry::new(RuntimeKind::Mono);

/// Image of a loaded assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageHandle(NonNull<MonoImage>);

/// A method whose signature has been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MethodHandle(NonNull<MonoMethod>);

// SAFETY: images and methods are runtime metadata that stay valid and
// immutable until `mono_jit_cleanup`; every thread attaches before using them.
unsafe impl Send for ImageHandle {}
unsafe impl Sync for ImageHandle {}
unsafe impl Send for MethodHandle {}
unsafe impl Sync for MethodHandle {}

struct MonoHost {
    api: MonoApi,
    domain: NonNull<MonoDomain>,
    version: Option<String>,
    config: MonoConfig,
    /// Loaded images keyed by canonical path.
    images: Mutex<HashMap<PathBuf, ImageHandle>>,
}

// SAFETY: the Mono embedding API is thread-safe once initialized, provided
// each thread is attached first (`MonoHost::attach`).
unsafe impl Send for MonoHost {}
unsafe impl Sync for MonoHost {}

impl MonoHost {
    fn initialize(config: &MonoConfig) -> Result<Self> {
        let api = load_api(config.libmono.as_deref())?;
        info!(library = %api.path().display(), "initializing Mono");

        let kind = RuntimeKind::Mono;
        // SAFETY: all pointers handed to Mono below are NUL-terminated
        // strings that outlive the call; the call order follows the
        // embedding contract (dirs and options before mono_jit_init).
        unsafe {
            if let (Some(assembly_dir), Some(config_dir)) = (&config.assembly_dir, &config.config_dir) {
                let assembly_dir = c_string(kind, assembly_dir.as_os_str())?;
                let config_dir = c_string(kind, config_dir.as_os_str())?;
                debug!(?assembly_dir, ?config_dir, "mono_set_dirs");
                (api.mono_set_dirs)(assembly_dir.as_ptr(), config_dir.as_ptr());
            }

            let global = config
                .global_config_file
                .as_deref()
                .map(|p| c_string(kind, p.as_os_str()))
                .transpose()?;
            (api.mono_config_parse)(global.as_ref().map_or(ptr::null(), |c| c.as_ptr()));

            if !config.jit_options.is_empty() {
                let options = config
                    .jit_options
                    .iter()
                    .map(|o| c_string(kind, OsStr::new(o)))
                    .collect::<Result<Vec<CString>>>()?;
                let mut argv: Vec<*mut c_char> =
                    options.iter().map(|o| o.as_ptr() as *mut c_char).collect();
                debug!(options = ?config.jit_options, "mono_jit_parse_options");
                (api.mono_jit_parse_options)(argv.len() as i32, argv.as_mut_ptr());
            }

            if config.debug {
                debug!("mono_debug_init");
                (api.mono_debug_init)(ffi::MONO_DEBUG_FORMAT_MONO);
            }

            if config.set_signal_chaining {
                debug!("mono_set_signal_chaining");
                (api.mono_set_signal_chaining)(1);
            }

            let name = c_string(kind, OsStr::new("clrhost"))?;
            let domain = NonNull::new((api.mono_jit_init)(name.as_ptr())).ok_or_else(|| {
                Error::HostInitializationFailed {
                    kind,
                    detail: "mono_jit_init returned no domain".into(),
                }
            })?;

            // Mono leaves the root domain without an AppDomainSetup until a
            // configuration is set, so this runs even without a config file.
            let (base_dir, file) = domain_config_args(config.config_file.as_deref());
            let base_dir = c_string(kind, base_dir.as_os_str())?;
            let file = c_string(kind, file.as_os_str())?;
            debug!(?base_dir, ?file, "mono_domain_set_config");
            (api.mono_domain_set_config)(domain.as_ptr(), base_dir.as_ptr(), file.as_ptr());

            let version = api.take_string((api.mono_get_runtime_build_info)());
            info!(version = version.as_deref().unwrap_or("unknown"), "Mono initialized");

            Ok(Self {
                api,
                domain,
                version,
                config: config.clone(),
                images: Mutex::new(HashMap::new()),
            })
        }
    }

    /// Attach the calling thread to the root domain. Idempotent.
    fn attach(&self) {
        // SAFETY: the domain is live until cleanup.
        unsafe { (self.api.mono_thread_attach)(self.domain.as_ptr()) };
    }

    fn load_image(&self, path: &Path) -> Result<ImageHandle> {
        pe::inspect(path).map_err(|reason| Error::load(path, reason))?;
        let canonical = path
            .canonicalize()
            .map_err(|e| Error::load(path, AssemblyLoadFailure::Rejected(e.to_string())))?;

        let mut images = self.images.lock();
        if let Some(image) = images.get(&canonical) {
            debug!(path = %canonical.display(), "assembly already loaded");
            return Ok(*image);
        }

        let c_path = c_string(RuntimeKind::Mono, canonical.as_os_str())
            .map_err(|e| Error::load(path, AssemblyLoadFailure::Rejected(e.to_string())))?;
        self.attach();
        // SAFETY: attached thread, live domain, NUL-terminated path.
        let assembly =
            unsafe { (self.api.mono_domain_assembly_open)(self.domain.as_ptr(), c_path.as_ptr()) };
        if assembly.is_null() {
            return Err(Error::load(
                path,
                AssemblyLoadFailure::Rejected("mono_domain_assembly_open failed".into()),
            ));
        }
        // SAFETY: `assembly` was just returned by the runtime.
        let image = unsafe { (self.api.mono_assembly_get_image)(assembly) };
        let image = NonNull::new(image).map(ImageHandle).ok_or_else(|| {
            Error::load(path, AssemblyLoadFailure::BadImage("assembly has no image".into()))
        })?;

        debug!(path = %canonical.display(), "assembly loaded");
        images.insert(canonical, image);
        Ok(image)
    }

    fn resolve(&self, image: ImageHandle, type_name: &str, method_name: &str) -> Result<MethodHandle> {
        let fail = |reason| Error::resolve(type_name, method_name, reason);
        let (namespace, name) = split_type_name(type_name);
        let namespace = CString::new(namespace).map_err(|_| fail(ResolutionFailure::TypeNotFound))?;
        let name = CString::new(name).map_err(|_| fail(ResolutionFailure::TypeNotFound))?;
        let method = CString::new(method_name).map_err(|_| fail(ResolutionFailure::MethodNotFound))?;

        self.attach();
        // SAFETY: attached thread; the image belongs to this host; all names
        // are NUL-terminated.
        unsafe {
            let class =
                (self.api.mono_class_from_name)(image.0.as_ptr(), namespace.as_ptr(), name.as_ptr());
            if class.is_null() {
                return Err(fail(ResolutionFailure::TypeNotFound));
            }

            let method = (self.api.mono_class_get_method_from_name)(class, method.as_ptr(), -1);
            let method = NonNull::new(method).ok_or_else(|| fail(ResolutionFailure::MethodNotFound))?;

            self.check_signature(method).map_err(|found| {
                fail(ResolutionFailure::SignatureMismatch(format!(
                    "expected int (IntPtr, int), found {}",
                    found
                )))
            })?;
            Ok(MethodHandle(method))
        }
    }

    /// `Err` carries the actual signature for the diagnostic.
    unsafe fn check_signature(&self, method: NonNull<MonoMethod>) -> std::result::Result<(), String> {
        // SAFETY: `method` is live metadata and the thread is attached.
        unsafe {
            let sig = (self.api.mono_method_signature)(method.as_ptr());
            if sig.is_null() {
                return Err("no signature".into());
            }

            let ret = (self.api.mono_type_get_type)((self.api.mono_signature_get_return_type)(sig));
            let mut params = Vec::new();
            let mut iter: *mut c_void = ptr::null_mut();
            loop {
                let param = (self.api.mono_signature_get_params)(sig, &mut iter);
                if param.is_null() {
                    break;
                }
                params.push((self.api.mono_type_get_type)(param));
            }

            let shape_ok = ret == ffi::MONO_TYPE_I4
                && params.len() == 2
                && matches!(params[0], ffi::MONO_TYPE_I | ffi::MONO_TYPE_U | ffi::MONO_TYPE_PTR)
                && params[1] == ffi::MONO_TYPE_I4;
            if shape_ok {
                return Ok(());
            }

            let names: Vec<&str> = params.iter().map(|&p| ffi::type_name(p)).collect();
            Err(format!("{} ({})", ffi::type_name(ret), names.join(", ")))
        }
    }

    fn invoke(&self, method: MethodHandle, type_name: &str, method_name: &str, data: &[u8]) -> Result<i32> {
        let mut len = crate::function::payload_len(data.len())?;
        let mut ptr_arg: *const u8 = data.as_ptr();
        let mut args: [*mut c_void; 2] = [
            (&mut ptr_arg as *mut *const u8).cast(),
            (&mut len as *mut i32).cast(),
        ];
        let mut exception: *mut MonoObject = ptr::null_mut();

        self.attach();
        // SAFETY: the method was checked to take (IntPtr, int); `args` points
        // at locals that outlive the call; static method, so no `this`.
        let result = unsafe {
            (self.api.mono_runtime_invoke)(
                method.0.as_ptr(),
                ptr::null_mut(),
                args.as_mut_ptr(),
                &mut exception,
            )
        };

        if !exception.is_null() {
            // SAFETY: `exception` is a live managed object.
            let (exception_type, message) = unsafe { self.describe_exception(exception) };
            return Err(Error::ManagedException {
                type_name: type_name.to_string(),
                method_name: method_name.to_string(),
                exception_type,
                message,
            });
        }
        if result.is_null() {
            return Err(Error::ManagedException {
                type_name: type_name.to_string(),
                method_name: method_name.to_string(),
                exception_type: "<none>".into(),
                message: "mono_runtime_invoke returned no value".into(),
            });
        }

        // SAFETY: the return type was checked to be a boxed int32.
        Ok(unsafe { *((self.api.mono_object_unbox)(result) as *const i32) })
    }

    unsafe fn describe_exception(&self, exception: *mut MonoObject) -> (String, String) {
        // SAFETY: forwarded to the caller.
        unsafe {
            let exception_type = self.api.class_name_of(exception);
            let mut nested: *mut MonoObject = ptr::null_mut();
            let text = (self.api.mono_object_to_string)(exception, &mut nested);
            let message = if text.is_null() || !nested.is_null() {
                "<ToString() failed>".to_string()
            } else {
                self.api
                    .take_string((self.api.mono_string_to_utf8)(text))
                    .unwrap_or_default()
            };
            (exception_type, message)
        }
    }
}

fn load_api(explicit: Option<&Path>) -> Result<MonoApi> {
    let mut last = None;
    for candidate in discovery::libmono_candidates(explicit) {
        match MonoApi::load(&candidate) {
            Ok(api) => return Ok(api),
            Err(e @ Error::NativeLibraryNotFound { .. }) => {
                debug!(candidate = %candidate.display(), error = %e, "libmono candidate rejected");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| Error::NativeLibraryNotFound {
        library: "libmonosgen-2.0".into(),
        detail: "no candidate locations".into(),
    }))
}

/// Base directory and file for `mono_domain_set_config`: `"."` and `""`
/// without a configuration file.
fn domain_config_args(config_file: Option<&Path>) -> (PathBuf, PathBuf) {
    match config_file {
        Some(file) => {
            let base_dir = file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (base_dir, file.to_path_buf())
        }
        None => (PathBuf::from("."), PathBuf::new()),
    }
}

/// Split `Namespace.Type` at the last dot.
fn split_type_name(type_name: &str) -> (&str, &str) {
    match type_name.rfind('.') {
        Some(i) => (&type_name[..i], &type_name[i + 1..]),
        None => ("", type_name),
    }
}

/// A handle to the process-wide Mono host.
#[derive(Clone)]
pub struct MonoRuntime {
    host: Arc<MonoHost>,
}

impl MonoRuntime {
    /// Initialize Mono, or attach to the host already initialized with an
    /// equal configuration.
    pub fn new(config: MonoConfig) -> Result<Self> {
        config.validate()?;
        let host = MONO.get_or_init(
            &config,
            || MonoHost::initialize(&config),
            |_, existing| {
                Err(Error::HostInitializationConflict {
                    kind: RuntimeKind::Mono,
                    detail: format!(
                        "initialized with a different configuration (differs in {})",
                        existing.differences(&config).join(", ")
                    ),
                })
            },
        )?;
        Ok(Self { host })
    }

    pub fn config(&self) -> &MonoConfig {
        &self.host.config
    }

    pub fn version(&self) -> Option<&str> {
        self.host.version.as_deref()
    }

    pub fn info(&self) -> RuntimeInfo {
        let mut info = RuntimeInfo::new(RuntimeKind::Mono, self.host.version.clone());
        info.initialized = true;
        info.properties
            .insert("library".into(), self.host.api.path().display().to_string());
        info.properties
            .insert("debug".into(), self.host.config.debug.to_string());
        if !self.host.config.jit_options.is_empty() {
            info.properties
                .insert("jit_options".into(), self.host.config.jit_options.join(" "));
        }
        info
    }

    pub fn same_host(&self, other: &MonoRuntime) -> bool {
        Arc::ptr_eq(&self.host, &other.host)
    }

    pub(crate) fn load_image(&self, path: &Path) -> Result<ImageHandle> {
        self.host.load_image(path)
    }

    pub(crate) fn resolve(&self, image: ImageHandle, type_name: &str, method_name: &str) -> Result<MethodHandle> {
        self.host.resolve(image, type_name, method_name)
    }

    pub(crate) fn invoke(
        &self,
        method: MethodHandle,
        type_name: &str,
        method_name: &str,
        data: &[u8],
    ) -> Result<i32> {
        self.host.invoke(method, type_name, method_name, data)
    }

    /// Shut Mono down with `mono_jit_cleanup`.
    ///
    /// Only the last handle cleans up; with other handles alive this just
    /// releases this one. Mono cannot be initialized again afterwards.
    pub fn shutdown(self) -> Result<()> {
        if !MONO.retire_if_last(&self.host) {
            return Ok(());
        }
        info!("shutting down Mono");
        // SAFETY: the registry no longer hands out this host and this is the
        // last handle, so nothing else can use the domain.
        unsafe { (self.host.api.mono_jit_cleanup)(self.host.domain.as_ptr()) };
        Ok(())
    }
}

impl std::fmt::Debug for MonoRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonoRuntime")
            .field("library", &self.host.api.path())
            .field("version", &self.host.version)
            .finish()
    }
}
