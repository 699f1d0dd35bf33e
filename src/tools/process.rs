//! Process Spawning Primitive
//!
//! [`ProcessSpawner`] is the single place OS processes are created. The
//! executor and the login manager both go through it, which keeps spawning
//! observable in tests (a spy spawner can count calls) and keeps the raw
//! `tokio::process::Child` out of the higher layers.

use super::error::ExecutionError;
use super::validator::ValidatedCommand;
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command as TokioCommand};
use tracing::debug;

/// Boxed readable stream of a child process
pub type ProcessReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writable stream of a child process
pub type ProcessWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Final status of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` if the process was ended by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signaled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Control half of a spawned process
///
/// Streams are handed out separately through [`ProcessHandle`], so the
/// control half can be shared with whoever may need to stop the process.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, `None` once the process has been reaped
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Force-kill the process and reap it
    async fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;
}

/// How a process should be spawned
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Command to run; `argv[0]` is resolved by the spawner
    pub command: ValidatedCommand,

    /// Keep a writable stdin pipe (null otherwise)
    pub pipe_stdin: bool,

    /// Extra environment variables for the child
    pub env: Vec<(String, String)>,

    /// Kill the process if its handle is dropped while still running
    pub kill_on_drop: bool,
}

impl SpawnRequest {
    pub fn new(command: ValidatedCommand) -> Self {
        Self {
            command,
            pipe_stdin: false,
            env: Vec::new(),
            kill_on_drop: true,
        }
    }

    pub fn with_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Let the process outlive a dropped handle
    pub fn detachable(mut self) -> Self {
        self.kill_on_drop = false;
        self
    }
}

/// Exclusively owned handle to one spawned process
pub struct ProcessHandle {
    pub child: Box<dyn ChildProcess>,
    pub stdin: Option<ProcessWriter>,
    pub stdout: Option<ProcessReader>,
    pub stderr: Option<ProcessReader>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.child.id())
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// The spawning primitive
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle, ExecutionError>;
}

/// Spawner backed by `tokio::process`
///
/// `argv[0]` (`az`) is replaced by the configured binary, so deployments can
/// point at a specific install and tests can point at a fake script.
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    program: String,
}

impl Default for TokioSpawner {
    fn default() -> Self {
        Self::new(default_az_program())
    }
}

impl TokioSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<ProcessHandle, ExecutionError> {
        let argv = request.command.argv();
        debug!(program = %self.program, args = argv.len() - 1, "Spawning process");

        let mut command = TokioCommand::new(&self.program);
        command
            .args(&argv[1..])
            .stdin(if request.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(request.kill_on_drop);

        for (key, value) in &request.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        let stdin = child.stdin.take().map(|s| Box::new(s) as ProcessWriter);
        let stdout = child.stdout.take().map(|s| Box::new(s) as ProcessReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as ProcessReader);

        Ok(ProcessHandle {
            child: Box::new(TokioChild(child)),
            stdin,
            stdout,
            stderr,
        })
    }
}

/// `az` on Windows is a batch wrapper
fn default_az_program() -> String {
    if cfg!(windows) {
        "az.cmd".to_string()
    } else {
        "az".to_string()
    }
}

struct TokioChild(Child);

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.0.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(io::Error::from),
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        // No graceful signal available; the grace period simply elapses sooner
        self.0.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.0.kill().await
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.0.wait().await?;
        Ok(ProcessExit { code: status.code() })
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self
            .0
            .try_wait()?
            .map(|status| ProcessExit { code: status.code() }))
    }
}
