//! Error types for clrhost.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::RuntimeKind;

/// Why an assembly could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyLoadFailure {
    /// The file does not exist.
    NotFound,
    /// The file is not a managed image (not PE, or PE without a CLI header).
    BadImage(String),
    /// The image targets a runtime or architecture the host cannot execute.
    Incompatible(String),
    /// The native host refused the image for another reason.
    Rejected(String),
}

impl fmt::Display for AssemblyLoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyLoadFailure::NotFound => write!(f, "file not found"),
            AssemblyLoadFailure::BadImage(msg) => write!(f, "bad image: {}", msg),
            AssemblyLoadFailure::Incompatible(msg) => write!(f, "incompatible image: {}", msg),
            AssemblyLoadFailure::Rejected(msg) => write!(f, "rejected by host: {}", msg),
        }
    }
}

/// Why a `(type, method)` pair could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    TypeNotFound,
    MethodNotFound,
    /// The method exists but is not `int (IntPtr, int)`.
    SignatureMismatch(String),
    Rejected(String),
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionFailure::TypeNotFound => write!(f, "type not found"),
            ResolutionFailure::MethodNotFound => write!(f, "method not found"),
            ResolutionFailure::SignatureMismatch(msg) => write!(f, "signature mismatch: {}", msg),
            ResolutionFailure::Rejected(msg) => write!(f, "rejected by host: {}", msg),
        }
    }
}

/// The step of the construct / load / resolve / invoke pipeline an error belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Construct = 0,
    Load = 1,
    Resolve = 2,
    Invoke = 3,
}

impl From<u8> for Stage {
    fn from(v: u8) -> Self {
        match v {
            1 => Stage::Load,
            2 => Stage::Resolve,
            3 => Stage::Invoke,
            _ => Stage::Construct,
        }
    }
}

impl Stage {
    /// The stage that runs after this one. `Invoke` is the last.
    pub fn next(self) -> Stage {
        match self {
            Stage::Construct => Stage::Load,
            Stage::Load => Stage::Resolve,
            Stage::Resolve | Stage::Invoke => Stage::Invoke,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Construct => "construct",
            Stage::Load => "load",
            Stage::Resolve => "resolve",
            Stage::Invoke => "invoke",
        };
        f.write_str(name)
    }
}

/// Flat error classification, stable across the isolation wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PlatformUnsupported = 1,
    NativeLibraryNotFound = 2,
    NativeSymbolMissing = 3,
    ConfigurationInvalid = 4,
    HostInitializationConflict = 5,
    HostInitializationFailed = 6,
    AssemblyLoadFailed = 7,
    FunctionResolutionFailed = 8,
    ManagedException = 9,
    PayloadTooLarge = 10,
    IsolatedProcessFailed = 11,
    Io = 12,
    Other = 255,
}

impl From<u8> for ErrorKind {
    fn from(v: u8) -> Self {
        match v {
            1 => ErrorKind::PlatformUnsupported,
            2 => ErrorKind::NativeLibraryNotFound,
            3 => ErrorKind::NativeSymbolMissing,
            4 => ErrorKind::ConfigurationInvalid,
            5 => ErrorKind::HostInitializationConflict,
            6 => ErrorKind::HostInitializationFailed,
            7 => ErrorKind::AssemblyLoadFailed,
            8 => ErrorKind::FunctionResolutionFailed,
            9 => ErrorKind::ManagedException,
            10 => ErrorKind::PayloadTooLarge,
            11 => ErrorKind::IsolatedProcessFailed,
            12 => ErrorKind::Io,
            _ => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("construct: {kind} is not available on this platform")]
    PlatformUnsupported { kind: RuntimeKind },

    #[error("construct: native library {library} not found ({detail})")]
    NativeLibraryNotFound { library: String, detail: String },

    #[error("construct: entry point `{symbol}` missing from {library}")]
    NativeSymbolMissing { library: String, symbol: String },

    #[error("construct: invalid {kind} configuration: {reason}")]
    ConfigurationInvalid { kind: RuntimeKind, reason: String },

    #[error("construct: {kind} host already initialized in this process: {detail}")]
    HostInitializationConflict { kind: RuntimeKind, detail: String },

    #[error("construct: failed to initialize {kind} host: {detail}")]
    HostInitializationFailed { kind: RuntimeKind, detail: String },

    #[error("load: failed to load assembly {}: {reason}", path.display())]
    AssemblyLoadFailed {
        path: PathBuf,
        reason: AssemblyLoadFailure,
    },

    #[error("resolve: cannot bind {type_name}::{method_name}: {reason}")]
    FunctionResolutionFailed {
        type_name: String,
        method_name: String,
        reason: ResolutionFailure,
    },

    #[error("invoke: {type_name}::{method_name} raised {exception_type}: {message}")]
    ManagedException {
        type_name: String,
        method_name: String,
        exception_type: String,
        message: String,
    },

    #[error("invoke: payload of {len} bytes exceeds the 32-bit length limit")]
    PayloadTooLarge { len: usize },

    #[error("{stage} (isolated process): {message}")]
    Isolated {
        kind: ErrorKind,
        stage: Stage,
        message: String,
    },

    #[error("{stage} (isolated process): exited without a result ({status}){}", last_line(.stderr))]
    IsolatedProcessFailed {
        /// The stage the child was in when it stopped reporting.
        stage: Stage,
        status: String,
        /// What the child wrote to stderr.
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

impl Error {
    /// Flat classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PlatformUnsupported { .. } => ErrorKind::PlatformUnsupported,
            Error::NativeLibraryNotFound { .. } => ErrorKind::NativeLibraryNotFound,
            Error::NativeSymbolMissing { .. } => ErrorKind::NativeSymbolMissing,
            Error::ConfigurationInvalid { .. } => ErrorKind::ConfigurationInvalid,
            Error::HostInitializationConflict { .. } => ErrorKind::HostInitializationConflict,
            Error::HostInitializationFailed { .. } => ErrorKind::HostInitializationFailed,
            Error::AssemblyLoadFailed { .. } => ErrorKind::AssemblyLoadFailed,
            Error::FunctionResolutionFailed { .. } => ErrorKind::FunctionResolutionFailed,
            Error::ManagedException { .. } => ErrorKind::ManagedException,
            Error::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Error::Isolated { kind, .. } => *kind,
            Error::IsolatedProcessFailed { .. } => ErrorKind::IsolatedProcessFailed,
            Error::Io(_) => ErrorKind::Io,
            #[cfg(windows)]
            Error::Windows(_) => ErrorKind::Other,
        }
    }

    /// The pipeline stage that failed.
    pub fn stage(&self) -> Stage {
        match self {
            Error::AssemblyLoadFailed { .. } => Stage::Load,
            Error::FunctionResolutionFailed { .. } => Stage::Resolve,
            Error::ManagedException { .. } | Error::PayloadTooLarge { .. } => Stage::Invoke,
            Error::Isolated { stage, .. } | Error::IsolatedProcessFailed { stage, .. } => *stage,
            _ => Stage::Construct,
        }
    }

    /// Shorthand for [`Error::AssemblyLoadFailed`].
    pub fn load(path: impl Into<PathBuf>, reason: AssemblyLoadFailure) -> Self {
        Error::AssemblyLoadFailed {
            path: path.into(),
            reason,
        }
    }

    /// Shorthand for [`Error::FunctionResolutionFailed`].
    pub fn resolve(type_name: &str, method_name: &str, reason: ResolutionFailure) -> Self {
        Error::FunctionResolutionFailed {
            type_name: type_name.to_string(),
            method_name: method_name.to_string(),
            reason,
        }
    }

    /// Shorthand for [`Error::ConfigurationInvalid`].
    pub fn config(kind: RuntimeKind, reason: impl Into<String>) -> Self {
        Error::ConfigurationInvalid {
            kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| format!(": {}", line))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_stage_and_identifier() {
        let err = Error::load("/tmp/missing.dll", AssemblyLoadFailure::NotFound);
        let text = err.to_string();
        assert!(text.starts_with("load:"), "{}", text);
        assert!(text.contains("/tmp/missing.dll"), "{}", text);

        let err = Error::resolve("Example.Nope", "Test", ResolutionFailure::TypeNotFound);
        let text = err.to_string();
        assert!(text.starts_with("resolve:"), "{}", text);
        assert!(text.contains("Example.Nope::Test"), "{}", text);
    }

    #[test]
    fn stage_follows_variant() {
        assert_eq!(
            Error::PlatformUnsupported {
                kind: RuntimeKind::NetFx
            }
            .stage(),
            Stage::Construct
        );
        assert_eq!(
            Error::load("a.dll", AssemblyLoadFailure::NotFound).stage(),
            Stage::Load
        );
        assert_eq!(Error::PayloadTooLarge { len: 1 }.stage(), Stage::Invoke);
    }

    #[test]
    fn isolated_errors_keep_original_kind() {
        let err = Error::Isolated {
            kind: ErrorKind::FunctionResolutionFailed,
            stage: Stage::Resolve,
            message: "type not found".into(),
        };
        assert_eq!(err.kind(), ErrorKind::FunctionResolutionFailed);
        assert_eq!(err.stage(), Stage::Resolve);
    }

    #[test]
    fn process_failure_names_its_stage_and_last_words() {
        let err = Error::IsolatedProcessFailed {
            stage: Stage::Load,
            status: "exit status: 134".into(),
            stderr: "starting\nfatal: image is corrupt\n\n".into(),
        };
        assert_eq!(err.stage(), Stage::Load);
        assert_eq!(err.kind(), ErrorKind::IsolatedProcessFailed);
        assert_eq!(
            err.to_string(),
            "load (isolated process): exited without a result (exit status: 134): fatal: image is corrupt"
        );

        let quiet = Error::IsolatedProcessFailed {
            stage: Stage::Construct,
            status: "exit status: 1".into(),
            stderr: String::new(),
        };
        assert!(quiet.to_string().ends_with("(exit status: 1)"), "{}", quiet);
    }

    #[test]
    fn stages_advance_in_pipeline_order() {
        assert_eq!(Stage::Construct.next(), Stage::Load);
        assert_eq!(Stage::Load.next(), Stage::Resolve);
        assert_eq!(Stage::Resolve.next(), Stage::Invoke);
        assert_eq!(Stage::Invoke.next(), Stage::Invoke);
    }

    #[test]
    fn kind_codes_survive_wire_conversion() {
        let kind = ErrorKind::HostInitializationConflict;
        assert_eq!(ErrorKind::from(kind as u8), kind);
        assert_eq!(ErrorKind::from(200), ErrorKind::Other);
    }
}
