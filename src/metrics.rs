//! Prometheus metrics for the coinproxy server.
//!
//! Counters and histograms for upstream calls, cache outcomes, schema drift
//! and rate limiting.

use eyre::{Result, WrapErr};
use metrics::{counter, histogram};

use crate::dispatcher::CacheStatus;
use crate::types::QueryKind;

/// Record one upstream attempt.
pub fn record_upstream_call(query: QueryKind, outcome: &str, duration_ms: u64) {
    counter!("upstream_calls_total", "query" => query.as_str(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("upstream_call_duration_ms", "query" => query.as_str()).record(duration_ms as f64);
}

/// Record how a lookup was answered.
pub fn record_cache_lookup(query: QueryKind, status: CacheStatus) {
    counter!("cache_lookups_total", "query" => query.as_str(), "status" => status.as_str())
        .increment(1);
}

/// Record a 2xx upstream payload the normalizer rejected.
pub fn record_malformed_response(query: QueryKind) {
    counter!("malformed_upstream_responses_total", "query" => query.as_str()).increment(1);
}

/// Record a rate limit hit.
pub fn record_rate_limit_hit() {
    counter!("rate_limit_hits_total").increment(1);
}

/// Install the Prometheus metrics exporter and return the recorder handle.
pub fn install_prometheus_recorder() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install Prometheus recorder")
}
