//! Metrics collection and export for devlink.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use crate::config::MetricsConfig;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "devlink_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "devlink_connections_active";
    pub const ROOMS_ACTIVE: &str = "devlink_rooms_active";
    pub const MESSAGES_RELAYED: &str = "devlink_messages_relayed_total";
    pub const BYTES_RELAYED: &str = "devlink_bytes_relayed_total";
    pub const SUB_EVICTIONS: &str = "devlink_sub_evictions_total";
    pub const REJECTIONS_TOTAL: &str = "devlink_rejections_total";
    pub const SESSIONS_ENDED: &str = "devlink_sessions_ended_total";
}

/// Initialize the metrics system.
///
/// The exporter is installed before anything is described; descriptions
/// given to the no-op recorder are lost.
pub fn init_metrics(config: &MetricsConfig) {
    if config.enabled {
        if let Err(e) = start_metrics_server(config.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    describe_metrics();
    info!("Metrics initialized");
}

/// Register help text for every devlink metric with the current recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of upgraded connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of upgraded connections"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of live rooms");
    metrics::describe_counter!(
        names::MESSAGES_RELAYED,
        "Frames delivered from main devices to sub devices"
    );
    metrics::describe_counter!(names::BYTES_RELAYED, "Payload bytes delivered to sub devices");
    metrics::describe_counter!(
        names::SUB_EVICTIONS,
        "Sub devices dropped from a room after a failed send"
    );
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Requests and joins rejected, by reason"
    );
    metrics::describe_counter!(names::SESSIONS_ENDED, "Sessions ended, by role and cause");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a fan-out of one frame.
pub fn record_relay(bytes: usize, delivered: usize) {
    counter!(names::MESSAGES_RELAYED).increment(delivered as u64);
    counter!(names::BYTES_RELAYED).increment((bytes * delivered) as u64);
}

/// Record sub devices dropped by a broadcast.
pub fn record_evictions(count: usize) {
    if count > 0 {
        counter!(names::SUB_EVICTIONS).increment(count as u64);
    }
}

/// Record a rejected request or join.
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record how a session ended.
pub fn record_session_end(role: &'static str, cause: &'static str) {
    counter!(names::SESSIONS_ENDED, "role" => role, "cause" => cause).increment(1);
}

/// Update live room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    role: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(role: &'static str) -> Self {
        counter!(names::CONNECTIONS_TOTAL, "role" => role).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "role" => role).increment(1.0);
        Self { role }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE, "role" => self.role).decrement(1.0);
    }
}
