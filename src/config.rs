// Configuration File Support
//
// This module provides configuration file parsing for the Azure CLI MCP server.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from XDG config directory: ~/.config/azcli-mcp/config.toml

use crate::tools::{ExecutorConfig, LoginConfig, ServicePrincipal, MAX_OUTPUT_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Command execution limits
    pub execution: ExecutionConfig,

    /// Device-code login tuning
    pub login: LoginSettings,

    /// Service-principal credentials
    pub azure: AzureConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,

    /// Also write logs to this file
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            log_file: None,
        }
    }
}

/// Command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Program invoked in place of `az`
    pub az_binary: Option<String>,

    /// Deadline for one-shot commands
    pub command_timeout_secs: u64,

    /// Commands allowed to run at once
    pub max_concurrent_commands: usize,

    /// Bytes kept per output stream
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            az_binary: None,
            command_timeout_secs: 300,
            max_concurrent_commands: 5,
            max_output_bytes: MAX_OUTPUT_SIZE,
        }
    }
}

/// Login configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoginSettings {
    /// Seconds a superseded login gets between SIGTERM and kill
    pub grace_period_secs: u64,

    /// Per-line read timeout while scanning login output
    pub line_timeout_ms: u64,

    /// Read attempts before the scan gives up
    pub max_scan_lines: usize,

    /// Log in with the service principal at startup when credentials exist
    pub auto_login: bool,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            line_timeout_ms: 1000,
            max_scan_lines: 30,
            auto_login: true,
        }
    }
}

/// Azure service-principal credentials
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AzureConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub subscription_id: Option<String>,
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

impl AzureConfig {
    pub fn has_credentials(&self) -> bool {
        self.service_principal().is_some()
    }

    /// Tenant, client and secret, when all three are set
    pub fn service_principal(&self) -> Option<ServicePrincipal> {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        Some(ServicePrincipal {
            tenant_id: non_empty(&self.tenant_id)?,
            client_id: non_empty(&self.client_id)?,
            client_secret: non_empty(&self.client_secret)?,
        })
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve /metrics, /health and /api/info
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, defaults plus environment apply.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/azcli-mcp/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "azcli-mcp", "azcli-mcp") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("azcli-mcp")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - LOG_LEVEL, LOG_FORMAT, LOG_FILE
    /// - AZCLI_MCP_AZ_BINARY
    /// - COMMAND_TIMEOUT (1..=3600)
    /// - MAX_CONCURRENT_COMMANDS (1..=50)
    /// - AZURE_TENANT_ID, AZURE_CLIENT_ID, AZURE_CLIENT_SECRET, AZURE_SUBSCRIPTION_ID
    /// - METRICS_ENABLED, METRICS_PORT
    ///
    /// Values that do not parse or are out of range are ignored.
    fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(file) = std::env::var("LOG_FILE") {
            if !file.is_empty() {
                self.logging.log_file = Some(file);
            }
        }

        // Execution overrides
        if let Ok(binary) = std::env::var("AZCLI_MCP_AZ_BINARY") {
            if !binary.is_empty() {
                self.execution.az_binary = Some(binary);
            }
        }
        if let Ok(timeout) = std::env::var("COMMAND_TIMEOUT") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if (1..=3600).contains(&timeout) {
                    self.execution.command_timeout_secs = timeout;
                }
            }
        }
        if let Ok(max) = std::env::var("MAX_CONCURRENT_COMMANDS") {
            if let Ok(max) = max.parse::<usize>() {
                if (1..=50).contains(&max) {
                    self.execution.max_concurrent_commands = max;
                }
            }
        }

        // Credential overrides
        for (var, slot) in [
            ("AZURE_TENANT_ID", &mut self.azure.tenant_id),
            ("AZURE_CLIENT_ID", &mut self.azure.client_id),
            ("AZURE_CLIENT_SECRET", &mut self.azure.client_secret),
            ("AZURE_SUBSCRIPTION_ID", &mut self.azure.subscription_id),
        ] {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *slot = Some(value);
                }
            }
        }

        // Metrics overrides
        if let Ok(enabled) = std::env::var("METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        // Validate execution limits
        if !(1..=3600).contains(&self.execution.command_timeout_secs) {
            anyhow::bail!("Command timeout must be between 1 and 3600 seconds");
        }
        if !(1..=50).contains(&self.execution.max_concurrent_commands) {
            anyhow::bail!("Max concurrent commands must be between 1 and 50");
        }
        if self.execution.max_output_bytes < 1024 {
            anyhow::bail!("Max output bytes must be at least 1024");
        }
        if let Some(binary) = &self.execution.az_binary {
            if binary.trim().is_empty() {
                anyhow::bail!("az_binary must not be empty");
            }
        }

        // Validate login tuning
        if self.login.max_scan_lines == 0 {
            anyhow::bail!("Login max_scan_lines must be > 0");
        }
        if self.login.line_timeout_ms == 0 {
            anyhow::bail!("Login line_timeout_ms must be > 0");
        }

        // Validate metrics configuration
        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: self.command_timeout(),
            max_output_size: self.execution.max_output_bytes,
        }
    }

    pub fn login_config(&self) -> LoginConfig {
        LoginConfig {
            grace_period: Duration::from_secs(self.login.grace_period_secs),
            line_timeout: Duration::from_millis(self.login.line_timeout_ms),
            max_scan_lines: self.login.max_scan_lines,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.command_timeout_secs)
    }

    /// Copy safe to print: the client secret is masked
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.azure.client_secret.is_some() {
            config.azure.client_secret = Some("***".to_string());
        }
        config
    }
}
