//! Command Execution Subsystem
//!
//! This module turns untrusted command text into Azure CLI processes.
//! It enforces strict security measures to prevent shell injection attacks.
//!
//! # Security Features
//!
//! - **Fixed Tool**: only commands starting with `az ` are accepted
//! - **Metacharacter Ban**: shell metacharacters reject the command
//! - **List Invocation**: commands are tokenized and spawned as argv, never through a shell
//! - **Timeout Enforcement**: every process has a deadline and is killed past it
//!
//! # Architecture
//!
//! The module is organized into:
//! - `validator.rs`: validation, sanitization and tokenization
//! - `process.rs`: the spawning primitive (`ProcessSpawner`)
//! - `executor.rs`: one-shot execution with timeout
//! - `login.rs`: the device-code login session
//! - `timeout.rs`: deadline helpers
//!
//! # Example
//!
//! ```no_run
//! use azcli_mcp::tools::{CommandExecutor, CommandValidator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let command = CommandValidator::new().validate("az account list --output table")?;
//!     let output = CommandExecutor::new().run(&command).await?;
//!     println!("{}", output);
//!     Ok(())
//! }
//! ```

mod error;
mod executor;
mod login;
mod process;
mod timeout;
mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ExecutionError, GENERIC_FAILURE};
pub use executor::{CommandExecutor, ExecutionResult, ExecutorConfig, MAX_OUTPUT_SIZE};
pub use login::{
    is_device_code_line, normalize_login_command, LoginConfig, LoginOutcome, LoginPhase,
    LoginSessionManager, ServicePrincipal, LOGIN_STARTED_MESSAGE, SUPERSEDED_MESSAGE,
};
pub use process::{
    ChildProcess, ProcessExit, ProcessHandle, ProcessReader, ProcessSpawner, ProcessWriter,
    SpawnRequest, TokioSpawner,
};
pub use timeout::{ExecutionTimeout, DEFAULT_COMMAND_TIMEOUT_SECS};
pub use validator::{
    sanitize_command, tokenize, CommandValidator, ValidatedCommand, ValidationError, AZ_PREFIX,
};
