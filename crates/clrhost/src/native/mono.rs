//! Mono embedding API.

use std::ffi::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};

use clrhost_shared::Result;
use libloading::Library;

use super::{open_library, symbol};

macro_rules! opaque {
    ($($name:ident),* $(,)?) => {
        $(
            #[repr(C)]
            pub struct $name {
                _private: [u8; 0],
            }
        )*
    };
}

opaque!(
    MonoDomain,
    MonoAssembly,
    MonoImage,
    MonoClass,
    MonoMethod,
    MonoMethodSignature,
    MonoType,
    MonoObject,
    MonoString,
    MonoThread,
);

pub type MonoBool = c_int;

/// `MONO_DEBUG_FORMAT_MONO` for `mono_debug_init`.
pub const MONO_DEBUG_FORMAT_MONO: c_int = 1;

// MonoTypeEnum values used by the signature check.
pub const MONO_TYPE_I4: c_int = 0x08;
pub const MONO_TYPE_PTR: c_int = 0x0f;
pub const MONO_TYPE_I: c_int = 0x18;
pub const MONO_TYPE_U: c_int = 0x19;

/// Name of a `MonoTypeEnum` value, for diagnostics.
pub fn type_name(code: c_int) -> &'static str {
    match code {
        0x01 => "void",
        0x02 => "bool",
        0x03 => "char",
        0x04 => "sbyte",
        0x05 => "byte",
        0x06 => "short",
        0x07 => "ushort",
        MONO_TYPE_I4 => "int",
        0x09 => "uint",
        0x0a => "long",
        0x0b => "ulong",
        0x0c => "float",
        0x0d => "double",
        0x0e => "string",
        MONO_TYPE_PTR => "pointer",
        0x10 => "byref",
        0x11 => "valuetype",
        0x12 => "class",
        0x1d => "array",
        MONO_TYPE_I => "IntPtr",
        MONO_TYPE_U => "UIntPtr",
        0x1c => "object",
        _ => "other",
    }
}

macro_rules! mono_api {
    ($($name:ident: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        /// Function table of a loaded Mono embedding library.
        pub struct MonoApi {
            path: PathBuf,
            $(pub $name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
            _library: Library,
        }

        impl MonoApi {
            /// Load the library at `path` and resolve every entry point.
            pub fn load(path: &Path) -> Result<Self> {
                let library = open_library(path)?;
                // SAFETY: each field type matches the documented Mono
                // embedding signature, and the pointers live as long as
                // `_library`, which is stored alongside them.
                unsafe {
                    Ok(Self {
                        path: path.to_path_buf(),
                        $($name: symbol(&library, path, stringify!($name))?,)*
                        _library: library,
                    })
                }
            }
        }
    };
}

mono_api! {
    mono_set_dirs: fn(*const c_char, *const c_char);
    mono_config_parse: fn(*const c_char);
    mono_jit_parse_options: fn(c_int, *mut *mut c_char);
    mono_debug_init: fn(c_int);
    mono_set_signal_chaining: fn(MonoBool);
    mono_jit_init: fn(*const c_char) -> *mut MonoDomain;
    mono_jit_cleanup: fn(*mut MonoDomain);
    mono_domain_set_config: fn(*mut MonoDomain, *const c_char, *const c_char);
    mono_get_runtime_build_info: fn() -> *mut c_char;
    mono_free: fn(*mut c_void);
    mono_thread_attach: fn(*mut MonoDomain) -> *mut MonoThread;
    mono_domain_assembly_open: fn(*mut MonoDomain, *const c_char) -> *mut MonoAssembly;
    mono_assembly_get_image: fn(*mut MonoAssembly) -> *mut MonoImage;
    mono_class_from_name: fn(*mut MonoImage, *const c_char, *const c_char) -> *mut MonoClass;
    mono_class_get_method_from_name: fn(*mut MonoClass, *const c_char, c_int) -> *mut MonoMethod;
    mono_method_signature: fn(*mut MonoMethod) -> *mut MonoMethodSignature;
    mono_signature_get_param_count: fn(*mut MonoMethodSignature) -> u32;
    mono_signature_get_params: fn(*mut MonoMethodSignature, *mut *mut c_void) -> *mut MonoType;
    mono_signature_get_return_type: fn(*mut MonoMethodSignature) -> *mut MonoType;
    mono_type_get_type: fn(*mut MonoType) -> c_int;
    mono_runtime_invoke: fn(*mut MonoMethod, *mut c_void, *mut *mut c_void, *mut *mut MonoObject) -> *mut MonoObject;
    mono_object_unbox: fn(*mut MonoObject) -> *mut c_void;
    mono_object_get_class: fn(*mut MonoObject) -> *mut MonoClass;
    mono_class_get_name: fn(*mut MonoClass) -> *const c_char;
    mono_class_get_namespace: fn(*mut MonoClass) -> *const c_char;
    mono_object_to_string: fn(*mut MonoObject, *mut *mut MonoObject) -> *mut MonoString;
    mono_string_to_utf8: fn(*mut MonoString) -> *mut c_char;
}

impl MonoApi {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy a Mono-allocated string and release it with `mono_free`.
    ///
    /// # Safety
    /// `ptr` must be null or a NUL-terminated string owned by Mono's allocator.
    pub unsafe fn take_string(&self, ptr: *mut c_char) -> Option<String> {
        // SAFETY: forwarded to the caller.
        let text = unsafe { super::c_str_lossy(ptr) };
        if !ptr.is_null() {
            // SAFETY: the caller guarantees Mono owns the allocation.
            unsafe { (self.mono_free)(ptr.cast()) };
        }
        text
    }

    /// `Namespace.Name` of an object's class.
    ///
    /// # Safety
    /// `object` must be a live managed object and the calling thread attached.
    pub unsafe fn class_name_of(&self, object: *mut MonoObject) -> String {
        // SAFETY: forwarded to the caller; class name pointers are owned by
        // the runtime's metadata and are not freed.
        unsafe {
            let class = (self.mono_object_get_class)(object);
            if class.is_null() {
                return "<unknown>".into();
            }
            let name = super::c_str_lossy((self.mono_class_get_name)(class)).unwrap_or_default();
            match super::c_str_lossy((self.mono_class_get_namespace)(class)) {
                Some(ns) if !ns.is_empty() => format!("{}.{}", ns, name),
                _ => name,
            }
        }
    }
}

impl std::fmt::Debug for MonoApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonoApi").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_type_names() {
        assert_eq!(type_name(MONO_TYPE_I), "IntPtr");
        assert_eq!(type_name(MONO_TYPE_I4), "int");
        assert_eq!(type_name(0x0e), "string");
        assert_eq!(type_name(0x7f), "other");
    }

    #[test]
    fn loading_a_non_library_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libmonosgen-2.0.so");
        std::fs::write(&path, b"not an ELF").unwrap();
        let err = MonoApi::load(&path).unwrap_err();
        assert_eq!(err.kind(), clrhost_shared::ErrorKind::NativeLibraryNotFound);
    }
}
