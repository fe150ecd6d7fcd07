//! Prometheus metrics for the response cache.
//!
//! Recording functions are cheap no-ops until [`init_metrics`] installs the
//! Prometheus recorder, so library users that never call it pay nothing.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_WRITES_TOTAL: &str = "cache_writes_total";
    pub const CACHE_INVALIDATED_KEYS_TOTAL: &str = "cache_invalidated_keys_total";
    pub const CACHE_STORE_AVAILABLE: &str = "cache_store_available";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized
/// or another recorder is installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders the handle itself
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a cache hit for a resource family.
pub fn record_cache_hit(prefix: &str) {
    counter!(names::CACHE_HITS_TOTAL, "prefix" => prefix.to_string()).increment(1);
}

/// Record a cache miss for a resource family.
pub fn record_cache_miss(prefix: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "prefix" => prefix.to_string()).increment(1);
}

/// Record the outcome of a detached store write ("stored", "failed", "timeout").
pub fn record_cache_write(outcome: &'static str) {
    counter!(names::CACHE_WRITES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record keys removed by an invalidation.
pub fn record_invalidated_keys(prefix: &str, count: u64) {
    counter!(names::CACHE_INVALIDATED_KEYS_TOTAL, "prefix" => prefix.to_string())
        .increment(count);
}

pub fn set_store_available(available: bool) {
    gauge!(names::CACHE_STORE_AVAILABLE).set(if available { 1.0 } else { 0.0 });
}
