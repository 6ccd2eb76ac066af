//! Embed a managed runtime in-process and call into an assembly.
//!
//! Three runtimes are supported: Mono through its embedding API, CoreCLR
//! through `hostfxr`, and the .NET Framework (Windows only) through
//! `mscoree` and a small bridge library. Every backend exposes the same
//! pipeline:
//!
//! ```no_run
//! use clrhost::{CoreClrConfig, Runtime};
//!
//! # fn main() -> clrhost::Result<()> {
//! let runtime = Runtime::new(
//!     CoreClrConfig::new().with_runtime_config("example.runtimeconfig.json"),
//! )?;
//! let assembly = runtime.load_assembly("example.dll")?;
//! let test = assembly.get_function("Example.TestClass", "Test")?;
//! assert_eq!(test.invoke(b"testy mctestface")?, 16);
//! # Ok(())
//! # }
//! ```
//!
//! Managed methods must have the signature `int Method(IntPtr data, int length)`.
//!
//! # Architecture
//!
//! - [`Runtime`] - The host handle; Mono and CoreCLR are process singletons
//! - [`Assembly`] - A loaded assembly, borrowing its runtime
//! - [`BoundFunction`] - A resolved entry point, borrowing its assembly
//! - [`IsolatedInvocation`] - The same pipeline in a child process
//! - [`discovery`] - Locating libmono, dotnet roots and installed frameworks

mod assembly;
pub mod config;
mod coreclr;
pub mod discovery;
mod function;
pub mod isolation;
mod mono;
pub mod native;
mod netfx;
pub mod pe;
mod registry;
mod runtime;
pub mod runtime_config;

pub use assembly::Assembly;
pub use clrhost_shared::{
    AssemblyLoadFailure, Error, ErrorKind, ResolutionFailure, Result, RuntimeInfo, RuntimeKind,
    Stage,
};
pub use config::{CoreClrConfig, MonoConfig, NetFxConfig, RuntimeConfig};
pub use coreclr::CoreClrRuntime;
pub use function::BoundFunction;
pub use isolation::{IsolatedInvocation, IsolatedOutcome};
pub use mono::MonoRuntime;
pub use netfx::NetFxRuntime;
pub use runtime::Runtime;
