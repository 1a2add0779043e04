//! Observability module for Warden.
//!
//! Provides logging and metrics.

use crate::cleanup::CleanupReport;
use crate::config::ObservabilityConfig;
use crate::error::{Result, WardenError};
use crate::shutdown::ShutdownSignal;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tokio::net::TcpListener;
use ::tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize observability (logging and metrics).
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| WardenError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| WardenError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Install the Prometheus recorder.
///
/// Must run before any component records a metric, or early values are lost.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| WardenError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();
    Ok(handle)
}

/// Run the Prometheus metrics server until `shutdown` trips.
pub async fn run_metrics_server(
    config: ObservabilityConfig,
    handle: PrometheusHandle,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move {
            handle.render()
        }))
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|e| WardenError::ConnectionFailed(e.to_string()))?;

    Ok(())
}

/// Register standard metrics.
fn register_metrics() {
    // Lock metrics
    counter!("warden_locks_ops_total").absolute(0);

    // Registry metrics
    gauge!("warden_registrations").set(0.0);
    counter!("warden_registry_ops_total").absolute(0);

    // Recovery metrics
    counter!("warden_notify_total").absolute(0);
    counter!("warden_notify_rounds_total").absolute(0);
    counter!("warden_cleanup_total").absolute(0);
    counter!("warden_cleanup_locks_released_total").absolute(0);
    counter!("warden_cleanup_failures_total").absolute(0);
    gauge!("warden_grace_active").set(0.0);
}

/// Record a lock table operation.
pub fn record_lock_op(op: &str, outcome: &str) {
    counter!(
        "warden_locks_ops_total",
        "op" => op.to_string(),
        "outcome" => outcome.to_string()
    ).increment(1);
}

/// Record a registry change.
pub fn record_registration(outcome: &str) {
    counter!("warden_registry_ops_total", "outcome" => outcome.to_string()).increment(1);
}

/// Update the registration gauge.
pub fn set_registrations(count: usize) {
    gauge!("warden_registrations").set(count as f64);
}

/// Record one notification delivery.
pub fn record_notification(outcome: &str) {
    counter!("warden_notify_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a finished notification round.
pub fn record_notify_round(elapsed: Duration) {
    counter!("warden_notify_rounds_total").increment(1);
    histogram!("warden_notify_round_seconds").record(elapsed.as_secs_f64());
}

/// Record a client cleanup.
pub fn record_cleanup(reason: &str, report: &CleanupReport) {
    if report.is_noop() {
        return;
    }
    counter!("warden_cleanup_total", "reason" => reason.to_string()).increment(1);
    counter!("warden_cleanup_locks_released_total").increment(report.locks_released as u64);
    counter!("warden_cleanup_failures_total").increment(report.failures as u64);
}

/// Update the grace period gauge.
pub fn set_grace_active(active: bool) {
    gauge!("warden_grace_active").set(if active { 1.0 } else { 0.0 });
}
