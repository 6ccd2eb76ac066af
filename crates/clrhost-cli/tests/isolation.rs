//! Scenarios that need a clean process, run through `clrhost probe`.
//!
//! Each test spawns its own child, so Mono and CoreCLR can be initialized
//! with a different configuration every time. The example assembly is built
//! from `demos/example`; see the library's integration tests.

use std::path::PathBuf;
use std::process::Command;

use clrhost::{
    CoreClrConfig, Error, ErrorKind, IsolatedInvocation, MonoConfig, NetFxConfig, RuntimeConfig,
    RuntimeKind, Stage,
};

const TEST_DATA: &[u8] = b"testy mctestface";

fn program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_clrhost"))
}

fn example(var: &str) -> Option<PathBuf> {
    match std::env::var_os(var) {
        Some(dir) => Some(PathBuf::from(dir).join("example.dll")),
        None => {
            eprintln!("{} not set, skipping", var);
            None
        }
    }
}

fn run(config: impl Into<RuntimeConfig>, assembly: PathBuf) -> clrhost::Result<i32> {
    IsolatedInvocation::new(config, assembly, "Example.TestClass", "Test")
        .with_payload(TEST_DATA)
        .run(program())
        .map(|outcome| outcome.value)
}

#[test]
fn mono_default() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETSTANDARD") else { return };
    assert_eq!(run(MonoConfig::new(), dll).unwrap(), 16);
}

#[test]
fn mono_debug_with_agent() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETSTANDARD") else { return };
    let config = MonoConfig::new()
        .with_debugger_agent("address=127.0.0.1:5831,transport=dt_socket,server=y,suspend=n");
    assert_eq!(run(config, dll).unwrap(), 16);
}

#[test]
fn mono_signal_chaining() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETSTANDARD") else { return };
    assert_eq!(run(MonoConfig::new().with_signal_chaining(true), dll).unwrap(), 16);
}

#[test]
fn mono_set_dirs() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETSTANDARD") else { return };
    assert_eq!(run(MonoConfig::new().with_dirs("/usr/lib", "/etc"), dll).unwrap(), 16);
}

#[test]
fn coreclr_with_synthesized_descriptor() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETSTANDARD") else { return };
    let outcome = IsolatedInvocation::new(CoreClrConfig::new(), dll, "Example.TestClass", "Test")
        .with_payload(TEST_DATA)
        .run(program())
        .unwrap();
    assert_eq!(outcome.value, 16);
    assert_eq!(outcome.runtime_kind, Some(RuntimeKind::CoreClr));
    assert!(outcome.pid.is_some_and(|pid| pid != std::process::id()));
}

#[test]
fn coreclr_missing_type_surfaces_from_child() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETCORE") else { return };
    let descriptor = dll.with_file_name("example.runtimeconfig.json");
    let err = IsolatedInvocation::new(
        CoreClrConfig::new().with_runtime_config(descriptor),
        dll,
        "Example.NoSuchClass",
        "Test",
    )
    .run(program())
    .unwrap_err();
    match err {
        Error::Isolated { kind, stage, message } => {
            assert_eq!(kind, ErrorKind::FunctionResolutionFailed);
            assert_eq!(stage, Stage::Resolve);
            assert!(message.contains("Example.NoSuchClass"), "{}", message);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn coreclr_exception_kills_child_but_reaches_caller() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETCORE") else { return };
    let descriptor = dll.with_file_name("example.runtimeconfig.json");
    let err = IsolatedInvocation::new(
        CoreClrConfig::new().with_runtime_config(descriptor),
        dll,
        "Example.TestClass",
        "Throw",
    )
    .with_payload(TEST_DATA)
    .run(program())
    .unwrap_err();
    match err {
        Error::ManagedException {
            method_name,
            exception_type,
            message,
            ..
        } => {
            assert_eq!(method_name, "Throw");
            assert_eq!(exception_type, "System.InvalidOperationException");
            assert_eq!(message, "no test data");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mono_exception_is_reported_by_child() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETSTANDARD") else { return };
    let err = IsolatedInvocation::new(MonoConfig::new(), dll, "Example.TestClass", "Throw")
        .run(program())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ManagedException);
    assert_eq!(err.stage(), Stage::Invoke);
}

#[cfg(not(windows))]
#[test]
fn construct_failure_surfaces_from_child() {
    let err = IsolatedInvocation::new(NetFxConfig::new(), "example.dll", "Example.TestClass", "Test")
        .run(program())
        .unwrap_err();
    assert!(matches!(err, Error::Isolated { .. }), "{}", err);
    assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
    assert_eq!(err.stage(), Stage::Construct);
}

#[test]
fn invoke_command_prints_result() {
    let Some(dll) = example("CLRHOST_EXAMPLE_NETCORE") else { return };
    let output = Command::new(program())
        .args(["invoke", "--runtime", "coreclr", "--runtime-config"])
        .arg(dll.with_file_name("example.runtimeconfig.json"))
        .arg(&dll)
        .args(["Example.TestClass", "Test", "--data", "testy mctestface"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "16");
}

#[test]
fn runtimes_command_runs_without_installs() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(program())
        .args(["runtimes", "--dotnet-root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("=== CoreCLR ==="));
}

#[test]
fn child_rejects_garbage_requests() {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Command::new(program())
        .arg("probe")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"{not json").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
