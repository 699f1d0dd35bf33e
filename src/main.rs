// Azure CLI MCP Server - Main Entry Point
//
// This binary provides:
// - the MCP stdio server (default)
// - one-shot command execution through the same pipeline
// - configuration inspection

use anyhow::{Context, Result};
use azcli_mcp::config::Config;
use azcli_mcp::mcp::McpServer;
use azcli_mcp::service::{is_error_text, AzureCliService};
use azcli_mcp::{logging, metrics, metrics_server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Azure CLI MCP Server: run Azure CLI commands for MCP clients
#[derive(Parser, Debug)]
#[command(name = "azcli-mcp")]
#[command(version)]
#[command(about = "MCP server exposing the Azure CLI as a single tool", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/azcli-mcp/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MCP server on stdin/stdout (default)
    Serve,
    /// Run one command and print its output
    Exec {
        /// The command, e.g. `az account list`
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Print the effective configuration (secrets masked)
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;

    let _log_guard = logging::init(&config.logging, args.verbose)?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exec { command } => exec(&config, &command.join(" ")).await,
        Commands::CheckConfig => {
            let rendered = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("# {}", config_path.display());
            println!("{}", rendered);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Azure CLI MCP Server v{} starting", env!("CARGO_PKG_VERSION"));
    let service = Arc::new(AzureCliService::new(&config));

    if config.metrics.enabled {
        metrics::init().context("Failed to initialize metrics")?;
        let port = config.metrics.port;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(port, service).await {
                error!("Metrics server stopped: {:#}", e);
            }
        });
    }

    if config.login.auto_login && config.azure.has_credentials() {
        let service = service.clone();
        let azure = config.azure.clone();
        tokio::spawn(async move {
            if let Some(result) = service.login_with_credentials(&azure).await {
                if is_error_text(&result) {
                    warn!("Startup login failed: {}", result);
                } else {
                    info!("Startup login completed");
                }
            }
        });
    }

    let server = Arc::new(McpServer::new(service));
    tokio::select! {
        result = server.serve_stdio() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    info!("Azure CLI MCP Server stopped");
    Ok(())
}

async fn exec(config: &Config, command: &str) -> Result<ExitCode> {
    let service = AzureCliService::new(config);
    let output = service.execute(command).await;
    println!("{}", output);

    Ok(if is_error_text(&output) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
