// HTTP server for Prometheus metrics and health
//
// Listens on 0.0.0.0:<metrics.port> (default 9090):
// - GET /metrics   Prometheus text format
// - GET /health    Azure CLI availability (runs `az --version`)
// - GET /api/info  Server name, version, tools and endpoints

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::mcp::TOOL_NAME;
use crate::metrics;
use crate::service::AzureCliService;

/// Build the router; separate from [`start_metrics_server`] for tests
pub fn router(service: Arc<AzureCliService>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/api/info", get(info_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Start the metrics HTTP server
///
/// Runs until the listener fails; spawn it next to the MCP server.
pub async fn start_metrics_server(port: u16, service: Arc<AzureCliService>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind metrics server")?;

    axum::serve(listener, router(service))
        .await
        .context("Metrics server error")?;

    Ok(())
}

/// Metrics endpoint handler
async fn metrics_handler(State(service): State<Arc<AzureCliService>>) -> Response {
    metrics::ACTIVE_DRAINS.set(service.login_manager().active_drains() as i64);

    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
///
/// Answers 200 even when the CLI is missing; `status` says `degraded`.
async fn health_handler(State(service): State<Arc<AzureCliService>>) -> impl IntoResponse {
    let health = service.health().await;
    metrics::SERVER_UPTIME_SECONDS.set(health.uptime_secs as f64);
    Json(health)
}

async fn info_handler(State(service): State<Arc<AzureCliService>>) -> impl IntoResponse {
    Json(json!({
        "name": "Azure CLI MCP Server",
        "version": env!("CARGO_PKG_VERSION"),
        "mcp_tools": [TOOL_NAME],
        "max_concurrent_commands": service.max_concurrent_commands(),
        "endpoints": [
            {"path": "/metrics", "method": "GET", "description": "Prometheus metrics"},
            {"path": "/health", "method": "GET", "description": "Health check"},
            {"path": "/api/info", "method": "GET", "description": "Server information"}
        ]
    }))
}
