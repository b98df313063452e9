//! Build-engine collaborator interface.
//!
//! The server node and the in-process fallback both hand a [`BuildContext`]
//! to a [`BuildEngine`]. The context carries everything that would otherwise
//! be ambient process state (cwd, environment, locale) plus the console the
//! build writes to and the token that cancels it.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const RELAY_CHUNK: usize = 8 * 1024;

/// Console stream selector, encoded on the wire as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsoleStream {
    Stdout = 1,
    Stderr = 2,
}

impl ConsoleStream {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Destination for build console output.
pub trait ConsoleSink: Send + Sync {
    fn write(&self, stream: ConsoleStream, text: &str);
    fn flush(&self) {}
}

/// Writes straight to this process's stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl ConsoleSink for StdConsole {
    fn write(&self, stream: ConsoleStream, text: &str) {
        // A closed console is not a build failure.
        let _ = match stream {
            ConsoleStream::Stdout => io::stdout().lock().write_all(text.as_bytes()),
            ConsoleStream::Stderr => io::stderr().lock().write_all(text.as_bytes()),
        };
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }
}

/// Overall outcome category of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    Success,
    SwitchError,
    InitializationError,
    BuildError,
    LoggerAbort,
    LoggerFailure,
    Unexpected,
}

impl ExitType {
    pub fn label(self) -> &'static str {
        match self {
            ExitType::Success => "Success",
            ExitType::SwitchError => "SwitchError",
            ExitType::InitializationError => "InitializationError",
            ExitType::BuildError => "BuildError",
            ExitType::LoggerAbort => "LoggerAbort",
            ExitType::LoggerFailure => "LoggerFailure",
            ExitType::Unexpected => "Unexpected",
        }
    }

    /// Unknown labels are treated as [`ExitType::Unexpected`].
    pub fn from_label(label: &str) -> Self {
        match label {
            "Success" => ExitType::Success,
            "SwitchError" => ExitType::SwitchError,
            "InitializationError" => ExitType::InitializationError,
            "BuildError" => ExitType::BuildError,
            "LoggerAbort" => ExitType::LoggerAbort,
            "LoggerFailure" => ExitType::LoggerFailure,
            _ => ExitType::Unexpected,
        }
    }

    pub fn process_exit_code(self) -> i32 {
        match self {
            ExitType::Success => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub exit_code: i32,
    pub exit_type: ExitType,
}

impl BuildOutcome {
    pub fn new(exit_code: i32, exit_type: ExitType) -> Self {
        Self {
            exit_code,
            exit_type,
        }
    }

    pub fn success() -> Self {
        Self::new(0, ExitType::Success)
    }

    pub fn unexpected() -> Self {
        Self::new(-1, ExitType::Unexpected)
    }
}

/// Explicit, per-build replacement for ambient process state.
#[derive(Clone)]
pub struct BuildContext {
    pub command_line: String,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub culture: String,
    pub ui_culture: String,
    pub console: Arc<dyn ConsoleSink>,
    pub cancellation: CancellationToken,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("command_line", &self.command_line)
            .field("working_directory", &self.working_directory)
            .field("environment_entries", &self.environment.len())
            .field("culture", &self.culture)
            .field("ui_culture", &self.ui_culture)
            .finish()
    }
}

/// Opaque "run a build for this command line" collaborator.
///
/// Called on a blocking worker; implementations may block for the whole build
/// but should poll `ctx.cancellation` and return promptly once it fires.
pub trait BuildEngine: Send + Sync {
    fn build(&self, ctx: &BuildContext) -> BuildOutcome;
}

/// Runs the command line through the platform shell.
#[derive(Debug, Default, Clone)]
pub struct CommandBuildEngine;

impl CommandBuildEngine {
    pub fn new() -> Self {
        Self
    }

    fn command(ctx: &BuildContext) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(&ctx.command_line);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&ctx.command_line);
            cmd
        };

        if !ctx.working_directory.as_os_str().is_empty() {
            cmd.current_dir(&ctx.working_directory);
        }
        if !ctx.environment.is_empty() {
            cmd.env_clear().envs(&ctx.environment);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so cancellation reaches the shell's children too.
            cmd.process_group(0);
        }
        cmd
    }
}

impl BuildEngine for CommandBuildEngine {
    fn build(&self, ctx: &BuildContext) -> BuildOutcome {
        let mut child = match Self::command(ctx).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command = %ctx.command_line, "failed to start build command: {}", err);
                ctx.console.write(
                    ConsoleStream::Stderr,
                    &format!("failed to start build command: {}\n", err),
                );
                return BuildOutcome::new(-1, ExitType::InitializationError);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let console = ctx.console.as_ref();

        let waited = thread::scope(|scope| {
            if let Some(out) = stdout {
                scope.spawn(move || relay(out, ConsoleStream::Stdout, console));
            }
            if let Some(err) = stderr {
                scope.spawn(move || relay(err, ConsoleStream::Stderr, console));
            }
            wait_or_cancel(&mut child, &ctx.cancellation)
        });
        console.flush();

        match waited {
            Ok(Some(status)) => outcome_from_status(status),
            Ok(None) => {
                debug!(command = %ctx.command_line, "build command cancelled");
                BuildOutcome::new(-1, ExitType::BuildError)
            }
            Err(err) => {
                warn!(command = %ctx.command_line, "failed to wait for build command: {}", err);
                BuildOutcome::unexpected()
            }
        }
    }
}

fn outcome_from_status(status: ExitStatus) -> BuildOutcome {
    match status.code() {
        Some(0) => BuildOutcome::success(),
        Some(code) => BuildOutcome::new(code, ExitType::BuildError),
        None => BuildOutcome::new(-1, ExitType::BuildError),
    }
}

/// `Ok(None)` when the child was killed because of cancellation.
fn wait_or_cancel(child: &mut Child, cancel: &CancellationToken) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if cancel.is_cancelled() {
            kill_tree(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        debug!(pid = child.id(), "killpg failed, killing leader only: {}", err);
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Copy a child pipe into the console, never splitting a UTF-8 sequence.
fn relay<R: Read>(mut reader: R, stream: ConsoleStream, console: &dyn ConsoleSink) {
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        pending.extend_from_slice(&buf[..n]);
        let valid = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            // Invalid bytes mid-stream: emit lossily rather than stall.
            Err(_) => pending.len(),
        };
        if valid > 0 {
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            console.write(stream, &text);
            pending.drain(..valid);
        }
    }
    if !pending.is_empty() {
        console.write(stream, &String::from_utf8_lossy(&pending));
    }
}
