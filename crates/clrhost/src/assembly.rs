//! Loaded assemblies and function resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clrhost_shared::{Error, ResolutionFailure, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::coreclr::CoreClrRuntime;
use crate::function::{BoundFunction, Call, NativeEntryPoint};
use crate::mono::{ImageHandle, MethodHandle, MonoRuntime};
use crate::netfx::NetFxRuntime;
use crate::runtime::Runtime;

/// Where the assembly lives inside its runtime.
pub(crate) enum Target<'rt> {
    Mono {
        runtime: &'rt MonoRuntime,
        image: ImageHandle,
    },
    /// Loaded by the runtime on first lookup, by absolute path.
    CoreClr {
        runtime: &'rt CoreClrRuntime,
        path: PathBuf,
    },
    NetFx {
        runtime: &'rt NetFxRuntime,
        path: PathBuf,
    },
}

#[derive(Clone, Copy)]
enum Resolved {
    Mono(MethodHandle),
    Native(NativeEntryPoint),
}

/// A managed assembly loaded into a [`Runtime`].
///
/// Assemblies cannot be unloaded; the handle only borrows its runtime.
pub struct Assembly<'rt> {
    runtime: &'rt Runtime,
    path: PathBuf,
    target: Target<'rt>,
    resolved: Mutex<HashMap<(String, String), Resolved>>,
}

impl<'rt> Assembly<'rt> {
    pub(crate) fn new(runtime: &'rt Runtime, path: &Path, target: Target<'rt>) -> Self {
        Self {
            runtime,
            path: path.to_path_buf(),
            target,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    /// The path this assembly was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind `type_name::method_name`, which must have the signature
    /// `int Method(IntPtr data, int length)`.
    ///
    /// `type_name` is namespace-qualified, e.g. `Example.TestClass`.
    /// Successful lookups are cached per `(type, method)`.
    pub fn get_function(&self, type_name: &str, method_name: &str) -> Result<BoundFunction<'_>> {
        let key = (type_name.to_string(), method_name.to_string());
        let cached = self.resolved.lock().get(&key).copied();
        let resolved = match cached {
            Some(resolved) => resolved,
            None => {
                let resolved = self.resolve(type_name, method_name)?;
                debug!(path = %self.path.display(), type_name, method_name, "function bound");
                self.resolved.lock().insert(key, resolved);
                resolved
            }
        };

        let call = match (resolved, &self.target) {
            (Resolved::Mono(method), Target::Mono { runtime, .. }) => Call::Mono {
                runtime: *runtime,
                method,
            },
            (Resolved::Native(entry), _) => Call::Native(entry),
            (Resolved::Mono(_), _) => {
                // A Mono method is only ever resolved against a Mono target.
                return Err(Error::resolve(
                    type_name,
                    method_name,
                    ResolutionFailure::Rejected("runtime mismatch".into()),
                ));
            }
        };
        Ok(BoundFunction::new(&self.path, type_name, method_name, call))
    }

    fn resolve(&self, type_name: &str, method_name: &str) -> Result<Resolved> {
        match &self.target {
            Target::Mono { runtime, image } => runtime
                .resolve(*image, type_name, method_name)
                .map(Resolved::Mono),
            Target::CoreClr { runtime, path } => runtime
                .resolve(path, type_name, method_name)
                .map(Resolved::Native),
            Target::NetFx { runtime, path } => runtime
                .resolve(path, type_name, method_name)
                .map(Resolved::Native),
        }
    }
}

impl std::fmt::Debug for Assembly<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembly")
            .field("kind", &self.runtime.kind())
            .field("path", &self.path)
            .finish()
    }
}
