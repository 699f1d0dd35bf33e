//! Command Executor
//!
//! This module runs one-shot commands: spawn, capture both streams, enforce
//! a deadline, and return combined output or a typed failure.

use super::error::ExecutionError;
use super::process::{ProcessReader, ProcessSpawner, SpawnRequest};
use super::timeout::{ExecutionTimeout, DEFAULT_COMMAND_TIMEOUT_SECS};
use super::validator::ValidatedCommand;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Maximum output size per stream in bytes (10 MiB)
pub const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Captured result of a process that ran to completion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Standard output (truncated if too large)
    pub stdout: String,

    /// Standard error (truncated if too large)
    pub stderr: String,

    /// Exit code (None if the process was ended by a signal)
    pub exit_code: Option<i32>,

    /// Execution duration in milliseconds
    pub duration_ms: f64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout, with stderr appended after a newline when non-empty
    ///
    /// Azure CLI prints warnings on stderr even when it succeeds.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
        }
    }

    /// Convert into the caller-facing result
    pub fn into_output(self) -> Result<String, ExecutionError> {
        if self.success() {
            Ok(self.combined_output())
        } else {
            Err(ExecutionError::non_zero_exit(self.exit_code, &self.stderr))
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} (exit code: {:?}, {:.0}ms, {} bytes output)",
            if self.success() { "Success" } else { "Failed" },
            self.exit_code,
            self.duration_ms,
            self.stdout.len() + self.stderr.len()
        )
    }
}

/// Configuration for command execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline for one command (default: 300 seconds)
    pub timeout: Duration,

    /// Maximum bytes kept per stream (default: 10 MiB)
    pub max_output_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_output_size: MAX_OUTPUT_SIZE,
        }
    }
}

impl ExecutorConfig {
    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            ..Default::default()
        }
    }

    pub fn with_max_output_size(size: usize) -> Self {
        Self {
            max_output_size: size,
            ..Default::default()
        }
    }
}

/// Executor for one-shot commands
///
/// Stateless across calls: each call owns its process from spawn to reap, so
/// concurrent calls never see each other's output.
///
/// # Example
///
/// ```no_run
/// use azcli_mcp::tools::{CommandExecutor, CommandValidator};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let executor = CommandExecutor::new();
///     let command = CommandValidator::new().validate("az --version")?;
///     let output = executor.run(&command).await?;
///     println!("{}", output);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CommandExecutor {
    spawner: Arc<dyn ProcessSpawner>,
    config: ExecutorConfig,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Executor running the system `az` with default configuration
    pub fn new() -> Self {
        Self::with_spawner(Arc::new(super::process::TokioSpawner::default()))
    }

    pub fn with_spawner(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self::with_config(spawner, ExecutorConfig::default())
    }

    pub fn with_config(spawner: Arc<dyn ProcessSpawner>, config: ExecutorConfig) -> Self {
        Self { spawner, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run with the configured timeout
    pub async fn run(&self, command: &ValidatedCommand) -> Result<String, ExecutionError> {
        self.run_with_timeout(command, self.config.timeout).await
    }

    /// Run and return combined output, or the failure
    pub async fn run_with_timeout(
        &self,
        command: &ValidatedCommand,
        timeout: Duration,
    ) -> Result<String, ExecutionError> {
        let result = self.execute(command, timeout).await?;
        if result.success() {
            info!("Command succeeded: {}", result.summary());
        } else {
            warn!(
                exit_code = ?result.exit_code,
                "Azure CLI command failed: {}",
                result.summary()
            );
        }
        result.into_output()
    }

    /// Run and return the captured streams regardless of exit code
    ///
    /// # Errors
    ///
    /// - [`ExecutionError::SpawnFailed`] if the process cannot be created
    /// - [`ExecutionError::Timeout`] if the deadline passes; the process is
    ///   killed and reaped before returning
    /// - [`ExecutionError::Io`] if reading a stream or waiting fails
    pub async fn execute(
        &self,
        command: &ValidatedCommand,
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        info!(command = %command, "Running Azure CLI command");

        let mut handle = self.spawner.spawn(SpawnRequest::new(command.clone()))?;
        let stdout = handle.stdout.take();
        let stderr = handle.stderr.take();
        let mut child = handle.child;
        let limit = self.config.max_output_size;

        let collect = async {
            let (stdout, stderr) =
                tokio::try_join!(read_stream(stdout, limit), read_stream(stderr, limit))?;
            let exit = child.wait().await?;
            Ok::<_, ExecutionError>((stdout, stderr, exit))
        };
        let outcome = ExecutionTimeout::new(timeout).run(collect).await;

        match outcome {
            Ok((stdout, stderr, exit)) => Ok(ExecutionResult {
                stdout,
                stderr,
                exit_code: exit.code,
                duration_ms: start.elapsed().as_millis() as f64,
            }),
            Err(e) => {
                if matches!(e, ExecutionError::Timeout(_)) {
                    warn!("Command timed out after {:?}, killing process", timeout);
                }
                if let Err(kill_err) = child.kill().await {
                    debug!("Kill after failure returned: {}", kill_err);
                }
                Err(e)
            }
        }
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes
///
/// The remainder is still drained so the child never blocks on a full pipe.
async fn read_stream(stream: Option<ProcessReader>, limit: usize) -> Result<String, ExecutionError> {
    let Some(mut stream) = stream else {
        return Ok(String::new());
    };

    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = (limit + 1).saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }

    let text = String::from_utf8_lossy(&kept).into_owned();
    Ok(if truncated || kept.len() > limit {
        truncate_string(text, limit)
    } else {
        text
    })
}

/// Truncate a string to a maximum length, adding ellipsis if truncated
fn truncate_string(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len.saturating_sub(3);
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}
