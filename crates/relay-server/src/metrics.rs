//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::HubStats;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const UPGRADES_REJECTED: &str = "relay_upgrades_rejected_total";
    pub const HUB_CLIENTS: &str = "relay_hub_clients";
    pub const ENVELOPES_ROUTED: &str = "relay_envelopes_routed_total";
    pub const FRAMES_DELIVERED: &str = "relay_frames_delivered_total";
    pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of upgraded connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of upgraded connections"
    );
    metrics::describe_counter!(
        names::UPGRADES_REJECTED,
        "Upgrade requests refused before a client was created"
    );
    metrics::describe_gauge!(names::HUB_CLIENTS, "Clients currently registered with the hub");
    metrics::describe_counter!(names::ENVELOPES_ROUTED, "Envelopes routed by the hub");
    metrics::describe_counter!(
        names::FRAMES_DELIVERED,
        "Frames enqueued onto client outbound queues"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Clients evicted because their outbound queue was full"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
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

/// Mirror hub statistics into metrics until the hub stops.
pub async fn observe_hub(mut stats: watch::Receiver<HubStats>) {
    loop {
        record_hub_stats(&stats.borrow_and_update());
        if stats.changed().await.is_err() {
            break;
        }
    }
}

/// Record a hub statistics snapshot.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::HUB_CLIENTS).set(stats.clients as f64);
    counter!(names::ENVELOPES_ROUTED).absolute(stats.routed_total);
    counter!(names::FRAMES_DELIVERED).absolute(stats.delivered_total);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evicted_total);
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused upgrade.
pub fn record_rejected(reason: &str) {
    counter!(names::UPGRADES_REJECTED, "reason" => reason.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording must still be safe.
        let _guard = ConnectionMetricsGuard::new();
        record_hub_stats(&HubStats::default());
    }

    #[tokio::test]
    async fn test_observe_hub_stops_with_sender() {
        let (tx, rx) = watch::channel(HubStats::default());
        let task = tokio::spawn(observe_hub(rx));

        tx.send_replace(HubStats {
            clients: 3,
            ..HubStats::default()
        });
        drop(tx);

        task.await.unwrap();
    }
}
