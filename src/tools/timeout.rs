//! Execution Timeout Management
//!
//! This module provides the timeout wrapper shared by the executor (overall
//! command deadline) and the login manager (per-line reads, termination grace
//! period). Elapsed deadlines are values, never panics.

use super::error::ExecutionError;
use std::future::Future;
use std::time::Duration;
use tokio::time;

/// Default command timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

/// Execution timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeout {
    duration: Duration,
}

impl Default for ExecutionTimeout {
    fn default() -> Self {
        Self::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS)
    }
}

impl ExecutionTimeout {
    /// Create a new execution timeout
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use azcli_mcp::tools::ExecutionTimeout;
    ///
    /// let timeout = ExecutionTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout.duration(), Duration::from_secs(30));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Get the timeout duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run a fallible future, mapping an elapsed deadline to
    /// [`ExecutionError::Timeout`]
    ///
    /// # Example
    ///
    /// ```no_run
    /// use azcli_mcp::tools::{ExecutionError, ExecutionTimeout};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), ExecutionError> {
    ///     let timeout = ExecutionTimeout::from_secs(10);
    ///     let value = timeout.run(async { Ok::<_, ExecutionError>(42) }).await?;
    ///     assert_eq!(value, 42);
    ///     Ok(())
    /// }
    /// ```
    pub async fn run<F, T>(&self, future: F) -> Result<T, ExecutionError>
    where
        F: Future<Output = Result<T, ExecutionError>>,
    {
        match time::timeout(self.duration, future).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(self.duration)),
        }
    }

    /// Race a future against the deadline
    ///
    /// Returns `None` when the deadline wins. Used where running out of time
    /// is ordinary control flow (a slow line, a grace period).
    pub async fn race<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        time::timeout(self.duration, future).await.ok()
    }
}
