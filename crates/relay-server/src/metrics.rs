//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::cache::CacheStats;
use relay_core::HubStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "relay_subscriptions_active";
    pub const UPSTREAM_ITEMS_TOTAL: &str = "relay_upstream_items_total";
    pub const REPLAY_ITEMS: &str = "relay_replay_items";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const DELIVERIES_BYTES: &str = "relay_deliveries_bytes";
    pub const CACHE_HITS_TOTAL: &str = "relay_profile_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "relay_profile_cache_misses_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active WebSocket connections"
    );
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of hub subscriptions"
    );
    metrics::describe_counter!(
        names::UPSTREAM_ITEMS_TOTAL,
        "Total number of items received from the upstream"
    );
    metrics::describe_gauge!(names::REPLAY_ITEMS, "Items held in the replay window");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Total number of items pushed to clients");
    metrics::describe_counter!(names::DELIVERIES_BYTES, "Total bytes pushed to clients");
    metrics::describe_counter!(names::CACHE_HITS_TOTAL, "Profile lookups served from cache");
    metrics::describe_counter!(names::CACHE_MISSES_TOTAL, "Profile lookups fetched upstream");
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

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an item pushed to a client.
pub fn record_delivery(bytes: usize, encoding: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "encoding" => encoding).increment(1);
    counter!(names::DELIVERIES_BYTES, "encoding" => encoding).increment(bytes as u64);
}

/// Publish a snapshot of hub counters.
pub fn record_hub_stats(stats: &HubStats) {
    counter!(names::UPSTREAM_ITEMS_TOTAL).absolute(stats.items_received);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.subscribers as f64);
    gauge!(names::REPLAY_ITEMS).set(stats.replay_len as f64);
}

/// Publish a snapshot of profile cache counters.
pub fn record_cache_stats(stats: &CacheStats) {
    counter!(names::CACHE_HITS_TOTAL).absolute(stats.hits);
    counter!(names::CACHE_MISSES_TOTAL).absolute(stats.misses);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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
