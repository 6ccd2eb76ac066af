//! Per-runtime configuration.
//!
//! Each runtime kind has its own struct, so options of one kind cannot be
//! handed to another. The same holds for serialized configuration: unknown
//! fields are rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clrhost_shared::{Error, Result, RuntimeKind};
use serde::{Deserialize, Serialize};

/// Options for the Mono embedding API.
///
/// All of these are applied before `mono_jit_init` and are process-global
/// for the lifetime of the Mono host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonoConfig {
    /// Explicit path to libmonosgen-2.0; searched for when absent.
    pub libmono: Option<PathBuf>,
    /// Base class library directory (`mono_set_dirs`). Requires `config_dir`.
    pub assembly_dir: Option<PathBuf>,
    /// Machine configuration directory (`mono_set_dirs`). Requires `assembly_dir`.
    pub config_dir: Option<PathBuf>,
    /// Application domain configuration file.
    pub config_file: Option<PathBuf>,
    /// Global configuration file, `/etc/mono/config` style. Mono's default when absent.
    pub global_config_file: Option<PathBuf>,
    /// Enable debug info (`mono_debug_init`).
    pub debug: bool,
    /// Options handed verbatim to `mono_jit_parse_options`.
    pub jit_options: Vec<String>,
    /// Chain Mono's signal handlers behind existing ones instead of replacing them.
    pub set_signal_chaining: bool,
}

impl MonoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_libmono(mut self, path: impl Into<PathBuf>) -> Self {
        self.libmono = Some(path.into());
        self
    }

    pub fn with_dirs(mut self, assembly_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        self.assembly_dir = Some(assembly_dir.into());
        self.config_dir = Some(config_dir.into());
        self
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_global_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_file = Some(path.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_jit_option(mut self, option: impl Into<String>) -> Self {
        self.jit_options.push(option.into());
        self
    }

    /// Attach the soft debugger agent, e.g.
    /// `address=0.0.0.0:5831,transport=dt_socket,server=y`.
    ///
    /// The string is passed through to the JIT untouched. Enables `debug`.
    pub fn with_debugger_agent(mut self, agent: &str) -> Self {
        self.jit_options.push(format!("--debugger-agent={}", agent));
        self.debug = true;
        self
    }

    pub fn with_signal_chaining(mut self, enabled: bool) -> Self {
        self.set_signal_chaining = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.assembly_dir, &self.config_dir) {
            (Some(_), None) => Err(Error::config(
                RuntimeKind::Mono,
                "assembly_dir requires config_dir",
            )),
            (None, Some(_)) => Err(Error::config(
                RuntimeKind::Mono,
                "config_dir requires assembly_dir",
            )),
            _ => Ok(()),
        }?;

        if let Some(bad) = self.jit_options.iter().find(|o| o.contains('\0')) {
            return Err(Error::config(
                RuntimeKind::Mono,
                format!("JIT option contains a NUL byte: {:?}", bad),
            ));
        }
        Ok(())
    }

    /// Names of the fields that differ from `other`.
    pub fn differences(&self, other: &MonoConfig) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.libmono != other.libmono {
            fields.push("libmono");
        }
        if self.assembly_dir != other.assembly_dir {
            fields.push("assembly_dir");
        }
        if self.config_dir != other.config_dir {
            fields.push("config_dir");
        }
        if self.config_file != other.config_file {
            fields.push("config_file");
        }
        if self.global_config_file != other.global_config_file {
            fields.push("global_config_file");
        }
        if self.debug != other.debug {
            fields.push("debug");
        }
        if self.jit_options != other.jit_options {
            fields.push("jit_options");
        }
        if self.set_signal_chaining != other.set_signal_chaining {
            fields.push("set_signal_chaining");
        }
        fields
    }
}

/// Options for CoreCLR hosted through hostfxr.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreClrConfig {
    /// Path to a `*.runtimeconfig.json`. When absent one is synthesized for
    /// the newest installed `Microsoft.NETCore.App`.
    pub runtime_config: Option<PathBuf>,
    /// dotnet installation root; searched for when absent.
    pub dotnet_root: Option<PathBuf>,
    /// Runtime properties set after initialization.
    pub properties: BTreeMap<String, String>,
}

impl CoreClrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runtime_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_config = Some(path.into());
        self
    }

    pub fn with_dotnet_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.dotnet_root = Some(path.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(key) = self.properties.keys().find(|k| k.is_empty()) {
            return Err(Error::config(
                RuntimeKind::CoreClr,
                format!("empty runtime property name {:?}", key),
            ));
        }
        Ok(())
    }
}

/// Options for the .NET Framework bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetFxConfig {
    /// Friendly name of the application domain to create.
    pub domain: Option<String>,
    /// Application configuration file for the domain.
    pub config_file: Option<PathBuf>,
    /// Bridge library exporting `clrhost_get_function`, loaded on first resolve.
    /// Defaults to `clrhost_bridge.dll` next to the current executable.
    pub bridge_library: Option<PathBuf>,
}

impl NetFxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, name: impl Into<String>) -> Self {
        self.domain = Some(name.into());
        self
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_bridge_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.bridge_library = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if matches!(self.domain.as_deref(), Some("")) {
            return Err(Error::config(RuntimeKind::NetFx, "empty domain name"));
        }
        Ok(())
    }
}

/// Configuration for one runtime kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeConfig {
    Mono(MonoConfig),
    CoreClr(CoreClrConfig),
    NetFx(NetFxConfig),
}

impl RuntimeConfig {
    /// Default configuration for `kind`.
    pub fn default_for(kind: RuntimeKind) -> Self {
        match kind {
            RuntimeKind::Mono => RuntimeConfig::Mono(MonoConfig::default()),
            RuntimeKind::CoreClr => RuntimeConfig::CoreClr(CoreClrConfig::default()),
            RuntimeKind::NetFx => RuntimeConfig::NetFx(NetFxConfig::default()),
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        match self {
            RuntimeConfig::Mono(_) => RuntimeKind::Mono,
            RuntimeConfig::CoreClr(_) => RuntimeKind::CoreClr,
            RuntimeConfig::NetFx(_) => RuntimeKind::NetFx,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RuntimeConfig::Mono(c) => c.validate(),
            RuntimeConfig::CoreClr(c) => c.validate(),
            RuntimeConfig::NetFx(c) => c.validate(),
        }
    }

    /// Read a JSON configuration file such as `{"coreclr": {"runtime_config": "..."}}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ConfigurationInvalid {
            kind: guess_kind(text),
            reason: e.to_string(),
        })
    }
}

impl From<MonoConfig> for RuntimeConfig {
    fn from(config: MonoConfig) -> Self {
        RuntimeConfig::Mono(config)
    }
}

impl From<CoreClrConfig> for RuntimeConfig {
    fn from(config: CoreClrConfig) -> Self {
        RuntimeConfig::CoreClr(config)
    }
}

impl From<NetFxConfig> for RuntimeConfig {
    fn from(config: NetFxConfig) -> Self {
        RuntimeConfig::NetFx(config)
    }
}

// Best effort, only used to label a parse error.
fn guess_kind(text: &str) -> RuntimeKind {
    let lower = text.to_ascii_lowercase();
    if lower.contains("\"mono\"") {
        RuntimeKind::Mono
    } else if lower.contains("\"netfx\"") {
        RuntimeKind::NetFx
    } else {
        RuntimeKind::CoreClr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrhost_shared::ErrorKind;

    #[test]
    fn mono_dirs_must_come_in_pairs() {
        let mut config = MonoConfig::new();
        config.assembly_dir = Some("/usr/lib".into());
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationInvalid);

        let config = MonoConfig::new().with_dirs("/usr/lib", "/etc");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debugger_agent_is_passed_verbatim() {
        let config =
            MonoConfig::new().with_debugger_agent("address=0.0.0.0:5831,transport=dt_socket,server=y");
        assert!(config.debug);
        assert_eq!(
            config.jit_options,
            vec!["--debugger-agent=address=0.0.0.0:5831,transport=dt_socket,server=y".to_string()]
        );
    }

    #[test]
    fn differences_lists_changed_fields() {
        let a = MonoConfig::new();
        let b = MonoConfig::new().with_signal_chaining(true).with_debug(true);
        assert_eq!(a.differences(&b), vec!["debug", "set_signal_chaining"]);
        assert!(a.differences(&a.clone()).is_empty());
    }

    #[test]
    fn json_selects_kind_by_key() {
        let config = RuntimeConfig::from_json(
            r#"{"coreclr": {"runtime_config": "/app/example.runtimeconfig.json"}}"#,
        )
        .unwrap();
        assert_eq!(config.kind(), RuntimeKind::CoreClr);

        let config = RuntimeConfig::from_json(r#"{"mono": {"debug": true}}"#).unwrap();
        assert_eq!(config, RuntimeConfig::Mono(MonoConfig::new().with_debug(true)));
    }

    #[test]
    fn json_rejects_options_of_another_kind() {
        let err = RuntimeConfig::from_json(r#"{"mono": {"runtime_config": "x.json"}}"#).unwrap_err();
        match err {
            Error::ConfigurationInvalid { kind, reason } => {
                assert_eq!(kind, RuntimeKind::Mono);
                assert!(reason.contains("runtime_config"), "{}", reason);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_property_name_is_invalid() {
        let config = CoreClrConfig::new().with_property("", "1");
        assert!(config.validate().is_err());
    }
}
