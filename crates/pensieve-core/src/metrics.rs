//! Prometheus metrics helpers for the Pensieve relay pool.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used by the pool components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pensieve_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("pool_connects_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`pool_`, `query_`, `monitor_`, `info_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: used sparingly; relay URLs are never used as labels

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_pool_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_pool_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds the listener before returning so address errors surface to the
/// caller, then serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded by the relay pool.
///
/// Called automatically by [`init_metrics`].
pub fn register_pool_metrics() {
    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    describe_counter!(
        "pool_connects_total",
        "Relay connect attempts (label: result=ok|error)"
    );
    describe_counter!("pool_relays_removed_total", "Relays removed from the pool");
    describe_gauge!("pool_relays_total", "Relays tracked by the pool");
    describe_gauge!("pool_relays_connected", "Relays currently connected");

    // =========================================================================
    // Fan-out Queries
    // =========================================================================

    describe_counter!("query_total", "Fan-out queries issued");
    describe_counter!(
        "query_legs_total",
        "Per-relay query legs (label: outcome=complete|timeout|error)"
    );
    describe_counter!(
        "query_events_duplicate_total",
        "Events dropped during cross-relay deduplication"
    );
    describe_histogram!(
        "query_duration_seconds",
        "Wall-clock duration of a fan-out query"
    );

    // =========================================================================
    // Publishing and Subscriptions
    // =========================================================================

    describe_counter!(
        "publish_total",
        "Per-relay publish attempts (label: result=ok|error)"
    );
    describe_counter!(
        "subscription_events_total",
        "Events delivered to push subscription callbacks"
    );

    // =========================================================================
    // Health Monitor
    // =========================================================================

    describe_counter!(
        "monitor_probes_total",
        "Health probes run (label: result=ok|error)"
    );
    describe_histogram!(
        "monitor_probe_latency_seconds",
        "Round-trip latency of successful health probes"
    );
    describe_gauge!(
        "monitor_events_per_second",
        "Events per second summed across relays"
    );

    // =========================================================================
    // Relay Information Cache
    // =========================================================================

    describe_counter!(
        "info_fetch_total",
        "NIP-11 document fetches (label: result=ok|error)"
    );
    describe_counter!("info_cache_hits_total", "NIP-11 cache hits");
    describe_gauge!("info_cache_entries", "Entries held by the NIP-11 cache");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Ensure metrics are initialized exactly once for all tests
    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_pool_metrics_does_not_panic() {
        ensure_metrics_init();
        register_pool_metrics();
        register_pool_metrics();
    }
}
