//! Runtime kinds and host descriptions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The managed runtime a host embeds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Mono embedding API (libmonosgen-2.0)
    Mono = 1,
    /// .NET Core / .NET 5+ through hostfxr
    CoreClr = 2,
    /// .NET Framework 4.x through mscoree (Windows only)
    NetFx = 3,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [RuntimeKind::Mono, RuntimeKind::CoreClr, RuntimeKind::NetFx];

    /// Whether the hosting ABI allows only one host per process.
    pub fn is_process_singleton(&self) -> bool {
        matches!(self, RuntimeKind::Mono | RuntimeKind::CoreClr)
    }

    /// Whether this kind can be constructed on the current target at all.
    pub fn is_supported_on_this_platform(&self) -> bool {
        match self {
            RuntimeKind::Mono | RuntimeKind::CoreClr => true,
            RuntimeKind::NetFx => cfg!(windows),
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RuntimeKind::Mono),
            2 => Some(RuntimeKind::CoreClr),
            3 => Some(RuntimeKind::NetFx),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeKind::Mono => "Mono",
            RuntimeKind::CoreClr => "CoreCLR",
            RuntimeKind::NetFx => ".NET Framework",
        };
        f.write_str(name)
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mono" => Ok(RuntimeKind::Mono),
            "coreclr" | "core" | "netcore" => Ok(RuntimeKind::CoreClr),
            "netfx" | "framework" | "netframework" => Ok(RuntimeKind::NetFx),
            other => Err(format!("unknown runtime kind '{}'", other)),
        }
    }
}

/// Snapshot of a constructed host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub kind: RuntimeKind,
    /// Version reported by the native host, when it exposes one.
    pub version: Option<String>,
    pub initialized: bool,
    pub shutdown: bool,
    /// Runtime properties (CoreCLR only; empty for the others).
    pub properties: BTreeMap<String, String>,
}

impl RuntimeInfo {
    pub fn new(kind: RuntimeKind, version: Option<String>) -> Self {
        Self {
            kind,
            version,
            initialized: true,
            shutdown: false,
            properties: BTreeMap::new(),
        }
    }
}

impl fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Runtime: {}", self.kind)?;
        writeln!(
            f,
            "Version: {}",
            self.version.as_deref().unwrap_or("<unknown>")
        )?;
        writeln!(f, "Initialized: {}", self.initialized)?;
        write!(f, "Shut down: {}", self.shutdown)?;
        if !self.properties.is_empty() {
            write!(f, "\nProperties:")?;
            for (key, value) in &self.properties {
                write!(f, "\n  {} = {}", key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("CoreCLR".parse::<RuntimeKind>(), Ok(RuntimeKind::CoreClr));
        assert_eq!("framework".parse::<RuntimeKind>(), Ok(RuntimeKind::NetFx));
        assert!("jvm".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn only_mono_and_coreclr_are_singletons() {
        assert!(RuntimeKind::Mono.is_process_singleton());
        assert!(RuntimeKind::CoreClr.is_process_singleton());
        assert!(!RuntimeKind::NetFx.is_process_singleton());
    }

    #[test]
    fn netfx_support_tracks_target() {
        assert_eq!(RuntimeKind::NetFx.is_supported_on_this_platform(), cfg!(windows));
    }
}
