//! Prometheus metrics for the FlagForge server and worker.
//!
//! Counters cover the snapshot cache (hits, misses, swallowed faults) and
//! the invalidation path (published and received broadcasts).

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "flag_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "flag_cache_misses_total";
    pub const CACHE_DEGRADED_TOTAL: &str = "flag_cache_degraded_total";
    pub const INVALIDATIONS_PUBLISHED_TOTAL: &str = "flag_invalidations_published_total";
    pub const INVALIDATIONS_RECEIVED_TOTAL: &str = "flag_invalidations_received_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at startup.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle
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

/// Record a snapshot served from the cache.
pub fn record_cache_hit(mode: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "mode" => mode).increment(1);
}

/// Record a snapshot that had to be read from the store.
pub fn record_cache_miss(mode: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "mode" => mode).increment(1);
}

/// Record a cache fault that was logged and swallowed.
pub fn record_cache_degraded(kind: &'static str) {
    counter!(names::CACHE_DEGRADED_TOTAL, "kind" => kind).increment(1);
}

/// Record an invalidation broadcast, labelled by whether the publish went through.
pub fn record_invalidation_published(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!(names::INVALIDATIONS_PUBLISHED_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an invalidation notification taken off the bus.
pub fn record_invalidation_received() {
    counter!(names::INVALIDATIONS_RECEIVED_TOTAL).increment(1);
}
