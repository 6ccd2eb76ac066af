//! CoreCLR runtime configuration descriptors (`*.runtimeconfig.json`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clrhost_shared::{Error, Result, RuntimeKind};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::discovery::DotnetRuntimeSpec;

/// File name used for synthesized descriptors.
pub const SYNTHESIZED_FILE_NAME: &str = "clrhost.runtimeconfig.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkReference {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tfm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    framework: Option<FrameworkReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    frameworks: Vec<FrameworkReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    additional_probing_paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    config_properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeConfigFile {
    #[serde(default)]
    runtime_options: RuntimeOptions,
}

/// The fields of a runtime configuration descriptor the loader relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfigDescriptor {
    /// Target framework moniker, e.g. `net8.0`.
    pub tfm: Option<String>,
    /// The target framework. With several `frameworks`, the first one.
    pub framework: FrameworkReference,
    /// Additional managed library probing paths, in order.
    pub additional_probing_paths: Vec<PathBuf>,
    pub config_properties: BTreeMap<String, serde_json::Value>,
}

impl RuntimeConfigDescriptor {
    /// Minimal descriptor targeting an installed shared framework.
    pub fn for_runtime(spec: &DotnetRuntimeSpec) -> Self {
        Self {
            tfm: Some(spec.tfm()),
            framework: FrameworkReference {
                name: spec.name.clone(),
                version: spec.version.to_string(),
            },
            additional_probing_paths: Vec::new(),
            config_properties: BTreeMap::new(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                RuntimeKind::CoreClr,
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        Self::parse(&text).map_err(|reason| {
            Error::config(RuntimeKind::CoreClr, format!("{}: {}", path.display(), reason))
        })
    }

    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let file: RuntimeConfigFile = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let options = file.runtime_options;

        let framework = options
            .framework
            .or_else(|| options.frameworks.into_iter().next())
            .ok_or_else(|| "runtimeOptions names no framework".to_string())?;
        if framework.name.trim().is_empty() {
            return Err("framework name is empty".into());
        }
        if framework.version.trim().is_empty() {
            return Err(format!("framework {} has no version", framework.name));
        }

        Ok(Self {
            tfm: options.tfm,
            framework,
            additional_probing_paths: options.additional_probing_paths,
            config_properties: options.config_properties,
        })
    }

    pub fn to_json(&self) -> String {
        let file = RuntimeConfigFile {
            runtime_options: RuntimeOptions {
                tfm: self.tfm.clone(),
                framework: Some(self.framework.clone()),
                frameworks: Vec::new(),
                additional_probing_paths: self.additional_probing_paths.clone(),
                config_properties: self.config_properties.clone(),
            },
        };
        // Serializing plain strings and maps cannot fail.
        serde_json::to_string_pretty(&file).unwrap_or_default()
    }

    /// Write the descriptor into a fresh temporary directory.
    ///
    /// The file is removed when the returned [`SynthesizedConfig`] drops, so
    /// keep it alive until the host has read it.
    pub fn write_temp(&self) -> Result<SynthesizedConfig> {
        let dir = tempfile::Builder::new().prefix("clrhost-").tempdir()?;
        let path = dir.path().join(SYNTHESIZED_FILE_NAME);
        std::fs::write(&path, self.to_json())?;
        Ok(SynthesizedConfig { _dir: dir, path })
    }
}

/// A descriptor written to a temporary directory.
#[derive(Debug)]
pub struct SynthesizedConfig {
    _dir: TempDir,
    path: PathBuf,
}

impl SynthesizedConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Version;

    #[test]
    fn reads_sdk_generated_descriptor() {
        let text = r#"{
          "runtimeOptions": {
            "tfm": "net6.0",
            "framework": { "name": "Microsoft.NETCore.App", "version": "6.0.0" },
            "additionalProbingPaths": ["/home/u/.nuget/packages"],
            "configProperties": { "System.GC.Server": false }
          }
        }"#;
        let desc = RuntimeConfigDescriptor::parse(text).unwrap();
        assert_eq!(desc.tfm.as_deref(), Some("net6.0"));
        assert_eq!(desc.framework.name, "Microsoft.NETCore.App");
        assert_eq!(desc.framework.version, "6.0.0");
        assert_eq!(
            desc.additional_probing_paths,
            vec![PathBuf::from("/home/u/.nuget/packages")]
        );
    }

    #[test]
    fn accepts_frameworks_array() {
        let text = r#"{"runtimeOptions": {"frameworks": [
            {"name": "Microsoft.NETCore.App", "version": "8.0.0"},
            {"name": "Microsoft.AspNetCore.App", "version": "8.0.0"}
        ]}}"#;
        let desc = RuntimeConfigDescriptor::parse(text).unwrap();
        assert_eq!(desc.framework.name, "Microsoft.NETCore.App");
        assert!(desc.tfm.is_none());
    }

    #[test]
    fn missing_framework_is_invalid_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.runtimeconfig.json");
        std::fs::write(&path, r#"{"runtimeOptions": {"tfm": "net8.0"}}"#).unwrap();

        let err = RuntimeConfigDescriptor::read(&path).unwrap_err();
        match err {
            Error::ConfigurationInvalid { kind, reason } => {
                assert_eq!(kind, RuntimeKind::CoreClr);
                assert!(reason.contains("no framework"), "{}", reason);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_version_is_invalid() {
        let text = r#"{"runtimeOptions": {"framework": {"name": "Microsoft.NETCore.App", "version": ""}}}"#;
        assert!(RuntimeConfigDescriptor::parse(text).is_err());
    }

    #[test]
    fn synthesized_descriptor_reads_back() {
        let spec = DotnetRuntimeSpec {
            name: "Microsoft.NETCore.App".into(),
            version: Version::parse("8.0.11").unwrap(),
            path: PathBuf::from("/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.11"),
        };
        let desc = RuntimeConfigDescriptor::for_runtime(&spec);
        let written = desc.write_temp().unwrap();
        let path = written.path().to_path_buf();

        let read = RuntimeConfigDescriptor::read(&path).unwrap();
        assert_eq!(read, desc);
        assert_eq!(read.tfm.as_deref(), Some("net8.0"));

        drop(written);
        assert!(!path.exists());
    }
}
