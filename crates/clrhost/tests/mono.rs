//! Mono against a built `example.dll` (netstandard2.0).
//!
//! Build it from `demos/example` with
//! `dotnet build demos/example -f netstandard2.0 -o <dir>` and set
//! `CLRHOST_EXAMPLE_NETSTANDARD` to `<dir>`; libmono
//! is found the usual way (`CLRHOST_LIBMONO` or the standard locations).
//! Configurations other than the default need a fresh process and are
//! covered by the CLI's isolation tests.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clrhost::{Error, ErrorKind, MonoConfig, ResolutionFailure, Runtime, Stage};

const TEST_DATA: &[u8] = b"testy mctestface";

fn example_dir() -> Option<PathBuf> {
    match std::env::var_os("CLRHOST_EXAMPLE_NETSTANDARD") {
        Some(dir) => Some(PathBuf::from(dir)),
        None => {
            eprintln!("CLRHOST_EXAMPLE_NETSTANDARD not set, skipping");
            None
        }
    }
}

fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new(MonoConfig::new()).expect("Mono should initialize"))
}

fn example(dir: &Path) -> PathBuf {
    dir.join("example.dll")
}

#[test]
fn invokes_example_method() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime().load_assembly(example(&dir)).unwrap();
    let test = assembly.get_function("Example.TestClass", "Test").unwrap();
    assert_eq!(test.invoke(TEST_DATA).unwrap(), 16);
    assert_eq!(test.invoke(&[]).unwrap(), 0);
}

#[test]
fn calls_from_other_threads() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime().load_assembly(example(&dir)).unwrap();
    let test = assembly.get_function("Example.TestClass", "Test").unwrap();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let test = &test;
                s.spawn(move || test.invoke(&vec![0u8; i * 10]).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![0, 10, 20, 30]);
    });
}

#[test]
fn loading_twice_is_allowed() {
    let Some(dir) = example_dir() else { return };
    let a = runtime().load_assembly(example(&dir)).unwrap();
    let b = runtime().load_assembly(example(&dir)).unwrap();
    let fa = a.get_function("Example.TestClass", "Test").unwrap();
    let fb = b.get_function("Example.TestClass", "Test").unwrap();
    assert_eq!(fa.invoke(TEST_DATA).unwrap(), fb.invoke(TEST_DATA).unwrap());
}

#[test]
fn different_config_conflicts() {
    let Some(_dir) = example_dir() else { return };
    runtime();
    let err = Runtime::new(MonoConfig::new().with_debug(true)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HostInitializationConflict);
    assert_eq!(err.stage(), Stage::Construct);
    assert!(err.to_string().contains("debug"), "{}", err);

    let same = Runtime::new(MonoConfig::new()).unwrap();
    assert!(same.same_host(runtime()));
}

#[test]
fn resolution_failures_are_classified() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime().load_assembly(example(&dir)).unwrap();

    let err = assembly.get_function("Example.NoSuchClass", "Test").unwrap_err();
    assert!(matches!(
        err,
        Error::FunctionResolutionFailed {
            reason: ResolutionFailure::TypeNotFound,
            ..
        }
    ));

    let err = assembly.get_function("Example.TestClass", "NoSuchMethod").unwrap_err();
    assert!(matches!(
        err,
        Error::FunctionResolutionFailed {
            reason: ResolutionFailure::MethodNotFound,
            ..
        }
    ));
}

#[test]
fn managed_exceptions_are_captured() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime().load_assembly(example(&dir)).unwrap();
    let throw = assembly.get_function("Example.TestClass", "Throw").unwrap();

    let err = throw.invoke(TEST_DATA).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManagedException);
    assert_eq!(err.stage(), Stage::Invoke);
    match err {
        Error::ManagedException {
            type_name,
            method_name,
            exception_type,
            message,
        } => {
            assert_eq!(type_name, "Example.TestClass");
            assert_eq!(method_name, "Throw");
            assert_eq!(exception_type, "System.InvalidOperationException");
            assert!(message.contains("no test data"), "{}", message);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The runtime survives the exception.
    let test = assembly.get_function("Example.TestClass", "Test").unwrap();
    assert_eq!(test.invoke(TEST_DATA).unwrap(), 16);
}

#[test]
fn wrong_signature_is_rejected() {
    let Some(dir) = example_dir() else { return };
    let assembly = runtime().load_assembly(example(&dir)).unwrap();
    match assembly.get_function("Example.TestClass", "WrongSignature").unwrap_err() {
        Error::FunctionResolutionFailed {
            reason: ResolutionFailure::SignatureMismatch(found),
            ..
        } => assert!(found.contains("string"), "{}", found),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn non_assembly_file_fails_to_load() {
    let Some(_dir) = example_dir() else { return };
    let scratch = tempfile::tempdir().unwrap();
    let text = scratch.path().join("notes.dll");
    std::fs::write(&text, "plain text, not a PE image").unwrap();
    let err = runtime().load_assembly(&text).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssemblyLoadFailed);
    assert_eq!(err.stage(), Stage::Load);
}
