//! Resolved entry points and invocation.

use std::path::Path;

use clrhost_shared::{Error, Result};
use tracing::debug;

use crate::mono::{MethodHandle, MonoRuntime};

/// Unmanaged entry point with the `int (IntPtr data, int length)` shape.
///
/// CoreCLR and the .NET Framework bridge hand these out. An exception that
/// escapes one is handled by the runtime's unhandled-exception policy, which
/// ends the process; run such calls through
/// [`IsolatedInvocation`](crate::isolation::IsolatedInvocation) when that matters.
pub(crate) type NativeEntryPoint = unsafe extern "system" fn(data: *const u8, length: i32) -> i32;

/// How a bound function is called.
#[derive(Clone, Copy)]
pub(crate) enum Call<'a> {
    /// `mono_runtime_invoke`, which reports managed exceptions.
    Mono {
        runtime: &'a MonoRuntime,
        method: MethodHandle,
    },
    Native(NativeEntryPoint),
}

/// A managed method with the signature `int Method(IntPtr data, int length)`.
///
/// Borrows the [`Assembly`](crate::Assembly) it was resolved from.
pub struct BoundFunction<'a> {
    assembly: &'a Path,
    type_name: String,
    method_name: String,
    call: Call<'a>,
}

impl<'a> BoundFunction<'a> {
    pub(crate) fn new(assembly: &'a Path, type_name: &str, method_name: &str, call: Call<'a>) -> Self {
        Self {
            assembly,
            type_name: type_name.to_string(),
            method_name: method_name.to_string(),
            call,
        }
    }

    pub fn assembly_path(&self) -> &Path {
        self.assembly
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Call the method with `data` as pointer and length.
    ///
    /// The bytes are passed as is and the managed `int` comes back unchanged.
    /// Blocks until the method returns.
    pub fn invoke(&self, data: &[u8]) -> Result<i32> {
        let len = payload_len(data.len())?;
        debug!(type_name = %self.type_name, method = %self.method_name, len, "invoking");

        let value = match self.call {
            Call::Mono { runtime, method } => {
                runtime.invoke(method, &self.type_name, &self.method_name, data)?
            }
            // SAFETY: the entry point was bound for exactly this signature and
            // `data` stays borrowed for the duration of the call.
            Call::Native(entry) => unsafe { entry(data.as_ptr(), len) },
        };

        debug!(type_name = %self.type_name, method = %self.method_name, value, "returned");
        Ok(value)
    }
}

impl std::fmt::Debug for BoundFunction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundFunction")
            .field("assembly", &self.assembly)
            .field("type_name", &self.type_name)
            .field("method_name", &self.method_name)
            .finish()
    }
}

/// Lengths cross the boundary as a 32-bit `int`.
pub(crate) fn payload_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::PayloadTooLarge { len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrhost_shared::{ErrorKind, Stage};

    unsafe extern "system" fn count_bytes(data: *const u8, length: i32) -> i32 {
        let bytes = unsafe { std::slice::from_raw_parts(data, length as usize) };
        bytes.len() as i32
    }

    unsafe extern "system" fn sum_bytes(data: *const u8, length: i32) -> i32 {
        let bytes = unsafe { std::slice::from_raw_parts(data, length as usize) };
        bytes.iter().map(|&b| b as i32).sum()
    }

    unsafe extern "system" fn negative(_data: *const u8, _length: i32) -> i32 {
        -7
    }

    fn bound(entry: NativeEntryPoint) -> BoundFunction<'static> {
        BoundFunction::new(Path::new("example.dll"), "Example.TestClass", "Test", Call::Native(entry))
    }

    #[test]
    fn native_call_returns_length() {
        let f = bound(count_bytes);
        assert_eq!(f.invoke(b"testy mctestface").unwrap(), 16);
        assert_eq!(f.invoke(b"").unwrap(), 0);
    }

    #[test]
    fn bytes_pass_through_untouched() {
        let f = bound(sum_bytes);
        assert_eq!(f.invoke(&[0xFF, 0x00, 0x01]).unwrap(), 256);
    }

    #[test]
    fn sign_is_preserved() {
        assert_eq!(bound(negative).invoke(b"x").unwrap(), -7);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(payload_len(i32::MAX as usize).unwrap(), i32::MAX);
        let err = payload_len(i32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert_eq!(err.stage(), Stage::Invoke);
    }
}
