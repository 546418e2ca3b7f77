/// Metrics and telemetry for the gateway
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - HTTP request counts and latencies
/// - Cascade strategy outcomes
/// - Result cache hit/miss rates
/// - Rate limiter decisions per backend
/// - Upstream fetch attempts and share-code decoding

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // ========== Cascade Metrics ==========

    /// Strategy attempts by strategy name and outcome (success, continue, fatal, skipped)
    pub static ref CASCADE_STRATEGY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cascade_strategy_total",
        "Total number of resolution strategy attempts",
        &["strategy", "outcome"]
    )
    .unwrap();

    /// Outbound upstream requests by outcome
    pub static ref UPSTREAM_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "upstream_requests_total",
        "Total number of upstream fetch attempts",
        &["outcome"]
    )
    .unwrap();

    /// Share-code decodes by winning inflate strategy
    pub static ref CODEC_DECODE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codec_decode_total",
        "Total number of share-code decodes",
        &["strategy"]
    )
    .unwrap();

    // ========== Cache Metrics ==========

    /// Result cache lookups by result
    pub static ref RESULT_CACHE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "result_cache_total",
        "Total number of result cache lookups",
        &["result"]
    )
    .unwrap();

    /// Live entries per result cache
    pub static ref RESULT_CACHE_ENTRIES: IntGaugeVec = register_int_gauge_vec!(
        "result_cache_entries",
        "Number of entries in the result cache",
        &["cache"]
    )
    .unwrap();

    // ========== Rate Limit Metrics ==========

    /// Rate limiter decisions by endpoint, backend and verdict
    pub static ref RATE_LIMIT_DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limit_decisions_total",
        "Total number of rate limit decisions",
        &["endpoint", "backend", "allowed"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a cascade strategy outcome
pub fn record_strategy(strategy: &str, outcome: &str) {
    CASCADE_STRATEGY_TOTAL
        .with_label_values(&[strategy, outcome])
        .inc();
}

/// Record a result cache access
pub fn record_cache_access(hit: bool) {
    RESULT_CACHE_TOTAL
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

/// Record the entry count of a named result cache
pub fn record_cache_entries(cache: &str, entries: usize) {
    RESULT_CACHE_ENTRIES
        .with_label_values(&[cache])
        .set(entries as i64);
}

/// Record a rate limit decision
pub fn record_rate_limit(endpoint: &str, backend: &str, allowed: bool) {
    RATE_LIMIT_DECISIONS_TOTAL
        .with_label_values(&[endpoint, backend, if allowed { "true" } else { "false" }])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_metrics() {
        record_strategy("official_listing", "success");
        record_cache_access(true);
        record_rate_limit("characters", "memory", true);

        let rendered = render_metrics();
        assert!(rendered.contains("cascade_strategy_total"));
        assert!(rendered.contains("result_cache_total"));
        assert!(rendered.contains("rate_limit_decisions_total"));
    }

    #[test]
    fn test_cache_entries_are_tracked_per_cache() {
        record_cache_entries("metrics_test_a", 3);
        record_cache_entries("metrics_test_b", 5);

        assert_eq!(
            RESULT_CACHE_ENTRIES
                .with_label_values(&["metrics_test_a"])
                .get(),
            3
        );
        assert_eq!(
            RESULT_CACHE_ENTRIES
                .with_label_values(&["metrics_test_b"])
                .get(),
            5
        );
    }

    #[test]
    fn test_record_http_request() {
        record_http_request("GET", "/api/characters", 200, 0.12);
        let count = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/api/characters", "200"])
            .get();
        assert!(count >= 1);
    }
}
