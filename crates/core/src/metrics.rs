//! Prometheus metrics for the acquisition pipeline.
//!
//! This module provides metrics for:
//! - Orchestrator (units of work by outcome, runs)
//! - Activation (polls, waits)
//! - Downloads (bytes, durations, results)
//! - Dispatch (by storage mode and result)
//! - Provider API requests

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Orchestrator
// =============================================================================

/// Units of work (quadrant x window, or pending record) by outcome.
pub static UNITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pathrow_units_total", "Total units of work processed"),
        &["outcome"], // "acquired", "skipped", "empty", "failed", "cancelled"
    )
    .unwrap()
});

/// Completed runs by termination.
pub static RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pathrow_runs_total", "Total acquisition runs"),
        &["result"], // "completed", "aborted"
    )
    .unwrap()
});

/// Run duration in seconds.
pub static RUN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("pathrow_run_duration_seconds", "Duration of acquisition runs")
            .buckets(vec![
                1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 43200.0,
            ]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Activation
// =============================================================================

/// Status polls issued while waiting for activation.
pub static ACTIVATION_POLLS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "pathrow_activation_polls_total",
        "Total asset status polls during activation",
    )
    .unwrap()
});

/// Activation outcomes.
pub static ACTIVATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pathrow_activations_total", "Total asset activations"),
        &["result"], // "active", "no_product", "timeout", "failed", "cancelled"
    )
    .unwrap()
});

/// Time from first status read to active, in seconds.
pub static ACTIVATION_WAIT: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "pathrow_activation_wait_seconds",
            "Time spent waiting for assets to become active",
        )
        .buckets(vec![0.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
    )
    .unwrap()
});

// =============================================================================
// Downloads
// =============================================================================

/// Bytes written to staging.
pub static DOWNLOAD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pathrow_download_bytes_total", "Total bytes downloaded").unwrap()
});

/// Download attempts by result.
pub static DOWNLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pathrow_download_attempts_total", "Total download attempts"),
        &["result"], // "success", "failed", "cancelled"
    )
    .unwrap()
});

/// Download duration in seconds.
pub static DOWNLOAD_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("pathrow_download_duration_seconds", "Duration of downloads")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatches by storage mode and result.
pub static DISPATCHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pathrow_dispatches_total", "Total storage dispatches"),
        &["mode", "result"], // mode: "local", "remote"
    )
    .unwrap()
});

// =============================================================================
// Provider
// =============================================================================

/// Provider API requests by endpoint and result.
pub static PROVIDER_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pathrow_provider_requests_total", "Total imagery provider requests"),
        &["endpoint", "result"], // endpoint: "search", "assets", "activate", "download"
    )
    .unwrap()
});

/// Candidates returned per search.
pub static SEARCH_CANDIDATES: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "pathrow_search_candidates",
            "Number of candidates returned per search",
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0, 250.0]),
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Orchestrator
        Box::new(UNITS_TOTAL.clone()),
        Box::new(RUNS_TOTAL.clone()),
        Box::new(RUN_DURATION.clone()),
        // Activation
        Box::new(ACTIVATION_POLLS.clone()),
        Box::new(ACTIVATIONS_TOTAL.clone()),
        Box::new(ACTIVATION_WAIT.clone()),
        // Downloads
        Box::new(DOWNLOAD_BYTES.clone()),
        Box::new(DOWNLOADS_TOTAL.clone()),
        Box::new(DOWNLOAD_DURATION.clone()),
        // Dispatch
        Box::new(DISPATCHES_TOTAL.clone()),
        // Provider
        Box::new(PROVIDER_REQUESTS.clone()),
        Box::new(SEARCH_CANDIDATES.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn test_all_metrics_register_without_conflict() {
        let registry = Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        UNITS_TOTAL.with_label_values(&["acquired"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "pathrow_units_total"));
    }
}
