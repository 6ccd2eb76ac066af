//! Shared types and the isolation protocol for clrhost
//!
//! The loader core and the command-line front end both depend on this crate.
//!
//! # Architecture
//!
//! - [`Error`] - Every failure the loader reports, tagged with its [`Stage`]
//! - [`RuntimeKind`] / [`RuntimeInfo`] - Which managed runtime a host embeds
//! - [`Packet`] - Framed messages a child process writes to its stdout when a
//!   caller needs a clean process for irreversible runtime configuration

pub mod error;
pub mod messages;
pub mod runtime;

pub use error::{AssemblyLoadFailure, Error, ErrorKind, ResolutionFailure, Result, Stage};
pub use messages::*;
pub use runtime::{RuntimeInfo, RuntimeKind};

/// Magic value to identify valid packets ("CLRH")
pub const MAGIC: u32 = 0x434C5248;
