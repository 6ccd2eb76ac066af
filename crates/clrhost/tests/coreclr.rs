//! CoreCLR against a built `example.dll` (net6.0 or later).
//!
//! Build it from `demos/example` with
//! `dotnet build demos/example -f net8.0 -o <dir>` and set
//! `CLRHOST_EXAMPLE_NETCORE` to `<dir>`. Every test
//! in this binary shares one host, since hostfxr initializes once per process.

use std::path::PathBuf;
use std::sync::OnceLock;

use clrhost::{
    AssemblyLoadFailure, CoreClrConfig, Error, ErrorKind, ResolutionFailure, Runtime, RuntimeKind,
};

const TEST_DATA: &[u8] = b"testy mctestface";

fn example_dir() -> Option<PathBuf> {
    match std::env::var_os("CLRHOST_EXAMPLE_NETCORE") {
        Some(dir) => Some(PathBuf::from(dir)),
        None => {
            eprintln!("CLRHOST_EXAMPLE_NETCORE not set, skipping");
            None
        }
    }
}

fn config(dir: &std::path::Path) -> CoreClrConfig {
    CoreClrConfig::new().with_runtime_config(dir.join("example.runtimeconfig.json"))
}

fn runtime(dir: &std::path::Path) -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new(config(dir)).expect("CoreCLR should initialize"))
}

#[test]
fn invokes_example_method() {
    let Some(dir) = example_dir() else { return };
    let runtime = runtime(&dir);
    assert_eq!(runtime.kind(), RuntimeKind::CoreClr);

    let assembly = runtime.load_assembly(dir.join("example.dll")).unwrap();
    let test = assembly.get_function("Example.TestClass", "Test").unwrap();
    assert_eq!(test.invoke(TEST_DATA).unwrap(), TEST_DATA.len() as i32);
    assert_eq!(test.invoke(b"").unwrap(), 0);
    // Repeated lookups hit the cache and behave the same.
    let again = assembly.get_function("Example.TestClass", "Test").unwrap();
    assert_eq!(again.invoke(TEST_DATA).unwrap(), 16);
}

#[test]
fn info_reports_version() {
    let Some(dir) = example_dir() else { return };
    let info = runtime(&dir).info();
    assert_eq!(info.kind, RuntimeKind::CoreClr);
    assert!(info.initialized);
    assert!(info.version.is_some());
}

#[test]
fn equal_config_shares_the_host() {
    let Some(dir) = example_dir() else { return };
    let first = runtime(&dir);
    let second = Runtime::new(config(&dir)).unwrap();
    assert!(first.same_host(&second));
}

#[test]
fn different_properties_conflict() {
    let Some(dir) = example_dir() else { return };
    runtime(&dir);
    let err = Runtime::new(config(&dir).with_property("CLRHOST_TEST_PROPERTY", "1")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HostInitializationConflict);
}

#[test]
fn unknown_type_fails_to_resolve() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime(&dir).load_assembly(dir.join("example.dll")).unwrap();
    let err = assembly.get_function("Example.NoSuchClass", "Test").unwrap_err();
    assert!(matches!(
        err,
        Error::FunctionResolutionFailed {
            reason: ResolutionFailure::TypeNotFound,
            ..
        }
    ));
    let err = assembly.get_function("Example.TestClass", "NoSuchMethod").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FunctionResolutionFailed);
}

#[test]
fn wrong_signature_is_rejected() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime(&dir).load_assembly(dir.join("example.dll")).unwrap();
    let err = assembly.get_function("Example.TestClass", "WrongSignature").unwrap_err();
    assert!(matches!(
        err,
        Error::FunctionResolutionFailed {
            reason: ResolutionFailure::SignatureMismatch(_),
            ..
        }
    ), "{}", err);
}

#[test]
fn non_assembly_file_fails_to_load() {
    let Some(dir) = example_dir() else { return };
    let scratch = tempfile::tempdir().unwrap();
    let text = scratch.path().join("notes.dll");
    std::fs::write(&text, "plain text, not a PE image").unwrap();

    let err = runtime(&dir).load_assembly(&text).unwrap_err();
    assert!(matches!(
        err,
        Error::AssemblyLoadFailed {
            reason: AssemblyLoadFailure::BadImage(_),
            ..
        }
    ));

    let err = runtime(&dir)
        .load_assembly(scratch.path().join("missing.dll"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::AssemblyLoadFailed {
            reason: AssemblyLoadFailure::NotFound,
            ..
        }
    ));
}
