// Azure CLI command service
//
// Validates caller input, routes `az login` to the login session manager and
// everything else to the one-shot executor, and renders every failure as an
// "Error: ..." text. Nothing in here surfaces as a fault to the caller.

use crate::config::{AzureConfig, Config};
use crate::metrics;
use crate::tools::{
    CommandExecutor, CommandValidator, ExecutionError, LoginSessionManager, ProcessSpawner,
    TokioSpawner, ValidatedCommand, ValidationError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Text returned for every rejected command, whatever the reason
pub const INVALID_COMMAND_MESSAGE: &str = "Error: Invalid command. Command must start with 'az'.";

/// Failure of a single command
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid command: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl ServiceError {
    /// Caller-facing text, always starting with `Error: `
    pub fn to_response_text(&self) -> String {
        match self {
            Self::Validation(_) => INVALID_COMMAND_MESSAGE.to_string(),
            Self::Execution(ExecutionError::NonZeroExit { message, .. }) => {
                format!("Error: {}", message)
            }
            Self::Execution(ExecutionError::Timeout(_)) => "Error: Command timed out".to_string(),
            Self::Execution(ExecutionError::SpawnFailed(detail))
            | Self::Execution(ExecutionError::Internal(detail)) => {
                format!("Error: Command execution failed - {}", detail)
            }
            Self::Execution(ExecutionError::Io(e)) => {
                format!("Error: Command execution failed - {}", e)
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "rejected",
            Self::Execution(e) => e.kind(),
        }
    }
}

/// Whether a response text reports a failure
pub fn is_error_text(text: &str) -> bool {
    text.starts_with("Error: ")
}

/// Result of probing the Azure CLI
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthStatus {
    pub status: &'static str,
    pub azure_cli_available: bool,
    pub azure_cli_version: Option<String>,
    pub active_login_drains: usize,
    pub uptime_secs: u64,
    pub checked_at: DateTime<Utc>,
}

/// The single entry point for running Azure CLI commands
pub struct AzureCliService {
    validator: CommandValidator,
    executor: CommandExecutor,
    login: LoginSessionManager,
    permits: Semaphore,
    max_concurrent: usize,
    command_timeout: Duration,
    started_at: Instant,
}

impl AzureCliService {
    /// Service spawning the configured `az` binary
    pub fn new(config: &Config) -> Self {
        let spawner = match &config.execution.az_binary {
            Some(binary) => TokioSpawner::new(binary.clone()),
            None => TokioSpawner::default(),
        };
        Self::with_spawner(Arc::new(spawner), config)
    }

    pub fn with_spawner(spawner: Arc<dyn ProcessSpawner>, config: &Config) -> Self {
        let max_concurrent = config.execution.max_concurrent_commands;
        Self {
            validator: CommandValidator::new(),
            executor: CommandExecutor::with_config(spawner.clone(), config.executor_config()),
            login: LoginSessionManager::new(spawner, config.login_config()),
            permits: Semaphore::new(max_concurrent),
            max_concurrent,
            command_timeout: config.command_timeout(),
            started_at: Instant::now(),
        }
    }

    pub fn login_manager(&self) -> &LoginSessionManager {
        &self.login
    }

    pub fn max_concurrent_commands(&self) -> usize {
        self.max_concurrent
    }

    /// Run one command and return its output or an `Error: ` text
    pub async fn execute(&self, command: &str) -> String {
        let start = Instant::now();
        let command = match self.validator.validate(command) {
            Ok(command) => command,
            Err(e) => {
                warn!(reason = %e, "Rejected command");
                metrics::VALIDATION_REJECTIONS_TOTAL
                    .with_label_values(&[rejection_label(&e)])
                    .inc();
                return ServiceError::from(e).to_response_text();
            }
        };

        let kind = if command.is_login() { "login" } else { "generic" };
        let text = match self.run_validated(&command).await {
            Ok(text) => text,
            Err(e) => {
                warn!(command = %command, error = %e, "Command failed");
                metrics::COMMANDS_TOTAL
                    .with_label_values(&[kind, e.label()])
                    .inc();
                return e.to_response_text();
            }
        };

        let status = if is_error_text(&text) { "error" } else { "success" };
        metrics::COMMANDS_TOTAL.with_label_values(&[kind, status]).inc();
        metrics::COMMAND_DURATION_SECONDS
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());
        text
    }

    async fn run_validated(&self, command: &ValidatedCommand) -> Result<String, ServiceError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ExecutionError::Internal(e.to_string()))?;

        if command.is_login() {
            debug!(command = %command, "Routing to login session manager");
            Ok(self.login.login(command).await.text)
        } else {
            Ok(self.executor.run_with_timeout(command, self.command_timeout).await?)
        }
    }

    /// Log in with service-principal credentials, if all are configured
    ///
    /// Returns `None` when credentials are incomplete. Selects
    /// `subscription_id` afterwards when one is set.
    pub async fn login_with_credentials(&self, azure: &AzureConfig) -> Option<String> {
        let principal = azure.service_principal()?;
        info!(tenant = %principal.tenant_id, "Authenticating with service principal");

        let output = match self
            .login
            .login_service_principal(&principal, self.command_timeout)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let text = ServiceError::from(e).to_response_text();
                warn!("Service principal login failed: {}", text);
                return Some(text);
            }
        };

        if let Some(subscription) = azure.subscription_id.as_deref().filter(|s| !s.is_empty()) {
            let text = match self.run_validated(&subscription_command(subscription)).await {
                Ok(text) => text,
                Err(e) => e.to_response_text(),
            };
            if is_error_text(&text) {
                warn!(subscription, "Failed to select subscription: {}", text);
                return Some(text);
            }
            info!(subscription, "Selected subscription");
        }

        Some(output)
    }

    /// Probe `az --version`
    pub async fn health(&self) -> HealthStatus {
        let output = self.execute("az --version").await;
        let available = !is_error_text(&output);
        let version = available
            .then(|| output.lines().next().map(|l| l.trim().to_string()))
            .flatten()
            .filter(|l| !l.is_empty());

        HealthStatus {
            status: if available { "healthy" } else { "degraded" },
            azure_cli_available: available,
            azure_cli_version: version,
            active_login_drains: self.login.active_drains(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            checked_at: Utc::now(),
        }
    }
}

/// `az account set` for a configured subscription
///
/// Built as argv: subscription names may contain spaces or parentheses.
fn subscription_command(subscription: &str) -> ValidatedCommand {
    let argv = ["az", "account", "set", "--subscription", subscription]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let display = format!(
        "az account set --subscription {}",
        shlex::try_quote(subscription).unwrap_or(Cow::Borrowed(subscription))
    );
    ValidatedCommand::trusted(argv, display)
}

fn rejection_label(error: &ValidationError) -> &'static str {
    match error {
        ValidationError::Empty => "empty",
        ValidationError::MissingPrefix => "missing_prefix",
        ValidationError::ForbiddenCharacter(_) => "forbidden_character",
        ValidationError::Malformed => "malformed",
    }
}
