//! Prometheus metrics for admission control.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `admission_rate_limit_decisions_total` - Rate limit outcomes (labels: surface, decision)
//! - `admission_rate_limit_store_errors_total` - Store failures answered with fail-open (labels: surface)
//! - `admission_rate_limit_evicted_total` - Idle buckets removed by the eviction sweep
//! - `admission_cluster_auth_total` - Cluster authentication outcomes (labels: outcome)
//!
//! ## Histograms
//! - `admission_registry_lookup_seconds` - Node registry lookup latency
//!
//! # Usage
//!
//! ```rust,ignore
//! use cluster_admission::metrics::{init_metrics, record_cluster_auth};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_cluster_auth("authenticated");
//! ```

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "admission_rate_limit_decisions_total";
    pub const RATE_LIMIT_STORE_ERRORS_TOTAL: &str = "admission_rate_limit_store_errors_total";
    pub const RATE_LIMIT_EVICTED_TOTAL: &str = "admission_rate_limit_evicted_total";
    pub const CLUSTER_AUTH_TOTAL: &str = "admission_cluster_auth_total";
    pub const REGISTRY_LOOKUP_SECONDS: &str = "admission_registry_lookup_seconds";
}

/// Rate limit decision labels.
pub mod decision {
    pub const ALLOWED: &str = "allowed";
    pub const REJECTED: &str = "rejected";
    pub const SKIPPED: &str = "skipped";
    pub const FAIL_OPEN: &str = "fail_open";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g. port in use).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiting decisions by API surface and outcome"
    );
    describe_counter!(
        names::RATE_LIMIT_STORE_ERRORS_TOTAL,
        "Rate limit store failures that let the request through"
    );
    describe_counter!(
        names::RATE_LIMIT_EVICTED_TOTAL,
        "Idle token buckets removed by the eviction sweep"
    );
    describe_counter!(
        names::CLUSTER_AUTH_TOTAL,
        "Cluster authentication attempts by outcome"
    );
    describe_histogram!(
        names::REGISTRY_LOOKUP_SECONDS,
        "Node registry lookup duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_rate_limit_decision(surface: &'static str, decision: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "surface" => surface, "decision" => decision)
        .increment(1);
}

pub fn record_rate_limit_store_error(surface: &'static str) {
    counter!(names::RATE_LIMIT_STORE_ERRORS_TOTAL, "surface" => surface).increment(1);
}

pub fn record_buckets_evicted(count: u64) {
    counter!(names::RATE_LIMIT_EVICTED_TOTAL).increment(count);
}

pub fn record_cluster_auth(outcome: &'static str) {
    counter!(names::CLUSTER_AUTH_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_registry_lookup(duration_secs: f64) {
    histogram!(names::REGISTRY_LOOKUP_SECONDS).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the recorders don't panic without an installed exporter.

    #[test]
    fn test_record_rate_limit_decision() {
        record_rate_limit_decision("s3", decision::ALLOWED);
        record_rate_limit_decision("s3", decision::REJECTED);
    }

    #[test]
    fn test_record_cluster_auth() {
        record_cluster_auth("authenticated");
        record_registry_lookup(0.002);
    }

    #[test]
    fn test_record_eviction_and_store_errors() {
        record_buckets_evicted(3);
        record_rate_limit_store_error("internal");
    }
}
