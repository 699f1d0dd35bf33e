// Structured logging setup
//
// Logs always go to stderr: stdout carries the MCP protocol. An optional log
// file gets a second, ANSI-free copy through a non-blocking writer.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown log format: {}", other),
        }
    }
}

/// Filter with `level` as default directive; `RUST_LOG` refines it
pub fn build_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    match format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat) -> Result<(BoxedLayer, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {:?}", path))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {:?}", dir))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    let layer = match format {
        LogFormat::Json => layer.json().boxed(),
        _ => layer.boxed(),
    };
    Ok((layer, guard))
}

/// Install the global subscriber
///
/// `verbose` forces debug level. The returned guard flushes the log file
/// and must live until shutdown.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))?
    };
    let format: LogFormat = config.format.parse()?;

    let mut layers = vec![stderr_layer(format)];
    let guard = match &config.log_file {
        Some(path) => {
            let (layer, guard) = file_layer(Path::new(path), format)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(level))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
