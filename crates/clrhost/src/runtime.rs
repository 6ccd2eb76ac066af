//! The uniform runtime handle.

use std::path::Path;

use clrhost_shared::{Error, Result, RuntimeInfo, RuntimeKind};
use tracing::{debug, info};

use crate::assembly::{Assembly, Target};
use crate::config::RuntimeConfig;
use crate::coreclr::CoreClrRuntime;
use crate::mono::MonoRuntime;
use crate::netfx::NetFxRuntime;

/// A managed runtime hosted in this process.
///
/// Mono and CoreCLR can only be initialized once per process: constructing
/// either again with an equal configuration returns a handle to the same
/// host, a different configuration fails with
/// [`Error::HostInitializationConflict`].
#[derive(Debug)]
pub enum Runtime {
    Mono(MonoRuntime),
    CoreClr(CoreClrRuntime),
    NetFx(NetFxRuntime),
}

impl Runtime {
    /// Construct the runtime `config` describes.
    ///
    /// The backend validates `config` before touching any native library.
    pub fn new(config: impl Into<RuntimeConfig>) -> Result<Self> {
        let config = config.into();
        let kind = config.kind();
        if !kind.is_supported_on_this_platform() {
            return Err(Error::PlatformUnsupported { kind });
        }
        debug!(%kind, "constructing runtime");

        let runtime = match config {
            RuntimeConfig::Mono(c) => Runtime::Mono(MonoRuntime::new(c)?),
            RuntimeConfig::CoreClr(c) => Runtime::CoreClr(CoreClrRuntime::new(c)?),
            RuntimeConfig::NetFx(c) => Runtime::NetFx(NetFxRuntime::new(c)?),
        };
        info!(%kind, version = runtime.version().unwrap_or("unknown"), "runtime ready");
        Ok(runtime)
    }

    /// Like [`Runtime::new`], but `config` must be for `kind`.
    pub fn construct(kind: RuntimeKind, config: impl Into<RuntimeConfig>) -> Result<Self> {
        let config = config.into();
        if config.kind() != kind {
            return Err(Error::config(
                kind,
                format!("configuration is for {}, not {}", config.kind(), kind),
            ));
        }
        Self::new(config)
    }

    /// Construct `kind` with its default configuration.
    pub fn with_defaults(kind: RuntimeKind) -> Result<Self> {
        Self::new(RuntimeConfig::default_for(kind))
    }

    pub fn kind(&self) -> RuntimeKind {
        match self {
            Runtime::Mono(_) => RuntimeKind::Mono,
            Runtime::CoreClr(_) => RuntimeKind::CoreClr,
            Runtime::NetFx(_) => RuntimeKind::NetFx,
        }
    }

    /// Version reported by the native host, when it exposes one.
    pub fn version(&self) -> Option<&str> {
        match self {
            Runtime::Mono(r) => r.version(),
            Runtime::CoreClr(r) => r.version(),
            Runtime::NetFx(r) => r.version(),
        }
    }

    pub fn info(&self) -> RuntimeInfo {
        match self {
            Runtime::Mono(r) => r.info(),
            Runtime::CoreClr(r) => r.info(),
            Runtime::NetFx(r) => r.info(),
        }
    }

    /// Whether both handles refer to the same native host.
    pub fn same_host(&self, other: &Runtime) -> bool {
        match (self, other) {
            (Runtime::Mono(a), Runtime::Mono(b)) => a.same_host(b),
            (Runtime::CoreClr(a), Runtime::CoreClr(b)) => a.same_host(b),
            (Runtime::NetFx(a), Runtime::NetFx(b)) => a.same_host(b),
            _ => false,
        }
    }

    /// Load the assembly at `path`.
    ///
    /// Loading the same file twice yields two handles to one loaded image.
    pub fn load_assembly(&self, path: impl AsRef<Path>) -> Result<Assembly<'_>> {
        let path = path.as_ref();
        debug!(kind = %self.kind(), path = %path.display(), "loading assembly");
        let target = match self {
            Runtime::Mono(runtime) => Target::Mono {
                runtime,
                image: runtime.load_image(path)?,
            },
            Runtime::CoreClr(runtime) => Target::CoreClr {
                runtime,
                path: runtime.prepare_assembly(path)?,
            },
            Runtime::NetFx(runtime) => Target::NetFx {
                runtime,
                path: runtime.prepare_assembly(path)?,
            },
        };
        Ok(Assembly::new(self, path, target))
    }

    /// Release this handle and, if it is the last one, the native host.
    ///
    /// Mono and CoreCLR cannot be started again in the same process.
    pub fn shutdown(self) -> Result<()> {
        match self {
            Runtime::Mono(r) => r.shutdown(),
            Runtime::CoreClr(r) => r.shutdown(),
            Runtime::NetFx(r) => r.shutdown(),
        }
    }
}

impl From<MonoRuntime> for Runtime {
    fn from(runtime: MonoRuntime) -> Self {
        Runtime::Mono(runtime)
    }
}

impl From<CoreClrRuntime> for Runtime {
    fn from(runtime: CoreClrRuntime) -> Self {
        Runtime::CoreClr(runtime)
    }
}

impl From<NetFxRuntime> for Runtime {
    fn from(runtime: NetFxRuntime) -> Self {
        Runtime::NetFx(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreClrConfig, MonoConfig, NetFxConfig};
    use clrhost_shared::{ErrorKind, Stage};

    #[test]
    fn kind_mismatch_is_invalid_configuration() {
        let err = Runtime::construct(RuntimeKind::CoreClr, MonoConfig::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(err.stage(), Stage::Construct);
        assert!(err.to_string().contains("Mono"));
    }

    #[test]
    fn invalid_configuration_is_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreClrConfig::new().with_runtime_config(dir.path().join("missing.json"));
        let err = Runtime::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);
    }

    #[cfg(not(windows))]
    #[test]
    fn netfx_is_unsupported_here() {
        let err = Runtime::new(NetFxConfig::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
        let err = Runtime::with_defaults(RuntimeKind::NetFx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
    }

    #[cfg(not(windows))]
    #[test]
    fn platform_check_comes_before_validation() {
        // Would be invalid on Windows too, but the platform wins.
        let config = NetFxConfig::new().with_domain("");
        let err = Runtime::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
    }
}
