// Prometheus metrics for the Azure CLI MCP server
//
// Exposes metrics on /metrics HTTP endpoint:
// - Commands executed by kind and status (counter)
// - Command durations (histogram)
// - Validation rejections (counter)
// - Login sessions by outcome, superseded logins (counter)
// - Background drains still running (gauge)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Command metrics
    pub static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("azcli_commands_total", "Total number of Azure CLI commands handled"),
        &["kind", "status"]
    ).expect("Failed to create commands total metric");

    pub static ref COMMAND_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("azcli_command_duration_seconds", "Azure CLI command duration in seconds")
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["kind"]
    ).expect("Failed to create command duration metric");

    pub static ref VALIDATION_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("azcli_validation_rejections_total", "Commands rejected before spawning"),
        &["reason"]
    ).expect("Failed to create validation rejections metric");

    // Login metrics
    pub static ref LOGIN_SESSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("azcli_login_sessions_total", "Login sessions by outcome"),
        &["outcome"]
    ).expect("Failed to create login sessions metric");

    pub static ref LOGINS_SUPERSEDED_TOTAL: IntCounter = IntCounter::new(
        "azcli_logins_superseded_total",
        "Login processes cancelled by a newer login request"
    ).expect("Failed to create superseded logins metric");

    pub static ref ACTIVE_DRAINS: IntGauge = IntGauge::new(
        "azcli_login_drains_active",
        "Login processes still being drained in the background"
    ).expect("Failed to create active drains metric");

    pub static ref SERVER_UPTIME_SECONDS: Gauge = Gauge::new(
        "azcli_server_uptime_seconds",
        "Server uptime in seconds"
    ).expect("Failed to create uptime metric");
}

/// Initialize metrics registry - must be called once at startup
pub fn init() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(VALIDATION_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOGIN_SESSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LOGINS_SUPERSEDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_DRAINS.clone()))?;
    REGISTRY.register(Box::new(SERVER_UPTIME_SECONDS.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
