//! Run one invocation in a child process.
//!
//! Mono and CoreCLR can be initialized once per process, and a managed
//! exception escaping a CoreCLR or .NET Framework entry point takes the
//! process down. [`IsolatedInvocation`] runs the whole construct / load /
//! resolve / invoke sequence in a fresh `clrhost probe` process instead. The
//! request goes to the child's stdin as JSON; the child answers with framed
//! [`Packet`]s on its stdout. Its stderr is collected, so an unhandled
//! managed exception that kills the child still reaches the caller.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use clrhost_shared::{Error, LogLevel, Packet, PacketId, Result, RuntimeKind, Stage};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::runtime::Runtime;

/// Environment variable naming the `clrhost` binary to spawn.
pub const PROGRAM_ENV: &str = "CLRHOST_BIN";

/// Subcommand the child is started with.
pub const PROBE_COMMAND: &str = "probe";

/// Lines of child stderr kept for error reports.
const STDERR_LINES: usize = 200;

/// How the runtimes report an exception that escaped to the top of a thread.
const UNHANDLED_EXCEPTION_MARKERS: [&str; 2] = ["Unhandled exception. ", "Unhandled Exception: "];

/// One full invocation, serialized to the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedInvocation {
    pub config: RuntimeConfig,
    pub assembly: PathBuf,
    pub type_name: String,
    pub method_name: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// What the child reported for a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedOutcome {
    /// The managed method's return value.
    pub value: i32,
    pub pid: Option<u32>,
    pub runtime_kind: Option<RuntimeKind>,
    pub runtime_version: Option<String>,
}

impl IsolatedInvocation {
    pub fn new(
        config: impl Into<RuntimeConfig>,
        assembly: impl Into<PathBuf>,
        type_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            config: config.into(),
            assembly: assembly.into(),
            type_name: type_name.into(),
            method_name: method_name.into(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Spawn `program probe`, hand it this request and wait for its answer.
    ///
    /// A failure inside the child comes back as [`Error::Isolated`] with the
    /// child's error kind and stage. A child killed by an unhandled managed
    /// exception during the call yields [`Error::ManagedException`]. Any
    /// other child that exits without reporting a result yields
    /// [`Error::IsolatedProcessFailed`] naming the stage it was in.
    pub fn run(&self, program: impl AsRef<Path>) -> Result<IsolatedOutcome> {
        let program = program.as_ref();
        self.config.validate()?;
        let request = serde_json::to_vec(self).map_err(|e| Error::config(self.config.kind(), e.to_string()))?;

        debug!(program = %program.display(), assembly = %self.assembly.display(), "spawning isolated invocation");
        let mut child = Command::new(program)
            .arg(PROBE_COMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = child
            .stderr
            .take()
            .map(|pipe| std::thread::spawn(move || collect_stderr(pipe)));

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&request) {
                Ok(()) => {}
                // The child exited before reading; its status says why.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    warn!("isolated process closed its stdin early")
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut completed = None;
        let outcome = match child.stdout.take() {
            Some(mut stdout) => {
                let outcome = read_outcome(&mut stdout, &mut completed);
                // Keep the pipe drained so the child never blocks on a full buffer.
                io::copy(&mut stdout, &mut io::sink())?;
                outcome
            }
            None => Ok(None),
        };
        let status = child.wait()?;
        let stderr = stderr.and_then(|reader| reader.join().ok()).unwrap_or_default();
        let stage = completed.map_or(Stage::Construct, Stage::next);
        debug!(%status, %stage, "isolated process exited");

        match outcome {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Err(self.process_failure(stage, status.to_string(), stderr)),
            Err(Error::Io(e)) => Err(self.process_failure(
                stage,
                format!("{}; malformed output: {}", status, e),
                stderr,
            )),
            Err(e) => Err(e),
        }
    }

    /// Classify a child that stopped without reporting a result.
    fn process_failure(&self, stage: Stage, status: String, stderr: String) -> Error {
        if stage == Stage::Invoke {
            if let Some((exception_type, message)) = unhandled_exception(&stderr) {
                return Error::ManagedException {
                    type_name: self.type_name.clone(),
                    method_name: self.method_name.clone(),
                    exception_type,
                    message,
                };
            }
        }
        Error::IsolatedProcessFailed { stage, status, stderr }
    }

    /// [`run`](Self::run) with [`default_program`].
    pub fn run_default(&self) -> Result<IsolatedOutcome> {
        self.run(default_program()?)
    }
}

/// The `clrhost` binary to spawn: `$CLRHOST_BIN`, else the one next to the
/// current executable.
pub fn default_program() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(PROGRAM_ENV) {
        return Ok(PathBuf::from(path));
    }
    let name = format!("clrhost{}", std::env::consts::EXE_SUFFIX);
    let exe = std::env::current_exe()?;
    let mut dir = exe.parent();
    while let Some(d) = dir {
        let candidate = d.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        // Test binaries live one level down, in `deps/`.
        if d.file_name().is_some_and(|n| n == "deps") {
            dir = d.parent();
        } else {
            break;
        }
    }
    Err(Error::NativeLibraryNotFound {
        library: name,
        detail: format!("not found next to {}; set {}", exe.display(), PROGRAM_ENV),
    })
}

/// Read the child's packets until it reports a result or an error.
///
/// `Ok(None)` means the stream ended without either. `completed` tracks the
/// last stage the child finished.
fn read_outcome<R: Read>(reader: &mut R, completed: &mut Option<Stage>) -> Result<Option<IsolatedOutcome>> {
    let mut pid = None;
    let mut runtime = None;

    while let Some(packet) = Packet::read_from(reader)? {
        match packet.id() {
            PacketId::Ready => {
                pid = packet.ready_pid();
                debug!(pid, "isolated process ready");
            }
            PacketId::Log => forward_log(&packet, pid),
            PacketId::Stage => {
                if let Some(stage) = packet.stage_value() {
                    debug!(pid, %stage, "isolated stage complete");
                    *completed = Some(stage);
                }
            }
            PacketId::RuntimeInfo => runtime = packet.runtime_info_data(),
            PacketId::Result => {
                let Some(value) = packet.result_value() else {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "short result packet").into());
                };
                let (runtime_kind, runtime_version) = match runtime {
                    Some((kind, version)) => (Some(kind), version),
                    None => (None, None),
                };
                return Ok(Some(IsolatedOutcome {
                    value,
                    pid,
                    runtime_kind,
                    runtime_version,
                }));
            }
            PacketId::Fatal => {
                let (kind, stage) = packet.fatal_data().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "short fatal packet")
                })?;
                return Err(Error::Isolated {
                    kind,
                    stage,
                    message: packet.message().to_string(),
                });
            }
            PacketId::None => warn!(id = packet.header.id, "ignoring unknown packet"),
        }
    }
    Ok(None)
}

/// Drain the child's stderr, relaying each line and keeping the tail.
fn collect_stderr<R: Read>(pipe: R) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_LINES);
    for line in BufReader::new(pipe).lines() {
        let Ok(line) = line else { break };
        debug!("[child stderr] {}", line);
        if tail.len() == STDERR_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// `(exception type, message)` from the runtime's unhandled exception report.
fn unhandled_exception(stderr: &str) -> Option<(String, String)> {
    stderr.lines().find_map(|line| {
        let line = line.trim_start();
        let report = UNHANDLED_EXCEPTION_MARKERS
            .iter()
            .find_map(|marker| line.strip_prefix(marker))?;
        let (exception_type, message) = report.split_once(": ").unwrap_or((report, ""));
        Some((exception_type.trim().to_string(), message.trim().to_string()))
    })
}

fn forward_log(packet: &Packet, pid: Option<u32>) {
    let message = packet.message();
    match packet.log_level().unwrap_or(LogLevel::Info) {
        LogLevel::Debug => debug!(pid, "[child] {}", message),
        LogLevel::Info => info!(pid, "[child] {}", message),
        LogLevel::Warning => warn!(pid, "[child] {}", message),
        LogLevel::Error => error!(pid, "[child] {}", message),
    }
}

/// Child side: run `request` and report on `out`.
///
/// Returns whether the invocation produced a result; write failures on `out`
/// are the only errors.
pub fn serve<W: Write>(request: &IsolatedInvocation, out: &mut W) -> io::Result<bool> {
    Packet::ready(std::process::id()).write_to(out)?;
    match execute(request, out) {
        Ok(value) => {
            Packet::result(value).write_to(out)?;
            Ok(true)
        }
        Err(e) => {
            Packet::fatal(e.kind(), e.stage(), &e.to_string()).write_to(out)?;
            Ok(false)
        }
    }
}

fn execute<W: Write>(request: &IsolatedInvocation, out: &mut W) -> Result<i32> {
    let runtime = Runtime::new(request.config.clone())?;
    Packet::runtime_info(runtime.kind(), runtime.version()).write_to(out)?;
    progress(
        out,
        Stage::Construct,
        &format!("{} {}", runtime.kind(), runtime.version().unwrap_or("(unknown version)")),
    )?;

    let assembly = runtime.load_assembly(&request.assembly)?;
    progress(out, Stage::Load, &format!("loaded {}", request.assembly.display()))?;

    let function = assembly.get_function(&request.type_name, &request.method_name)?;
    progress(
        out,
        Stage::Resolve,
        &format!("bound {}::{}", request.type_name, request.method_name),
    )?;

    let value = function.invoke(&request.payload)?;
    progress(out, Stage::Invoke, &format!("returned {}", value))?;
    Ok(value)
}

fn progress<W: Write>(out: &mut W, stage: Stage, message: &str) -> io::Result<()> {
    Packet::log(LogLevel::Debug, &format!("{}: {}", stage, message)).write_to(out)?;
    Packet::stage(stage).write_to(out)
}
