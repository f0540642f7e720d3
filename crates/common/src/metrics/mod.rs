//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the retrieval loop and its providers
//! with standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Quarry metrics
pub const METRICS_PREFIX: &str = "quarry";

/// Buckets for generation latency (LLM calls are slow)
pub const GENERATION_BUCKETS: &[f64] = &[
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Loop metrics
    describe_counter!(
        format!("{}_loop_runs_total", METRICS_PREFIX),
        Unit::Count,
        "Completed retrieval loops by stop reason"
    );

    describe_histogram!(
        format!("{}_loop_iterations", METRICS_PREFIX),
        Unit::Count,
        "Iterations executed per retrieval loop"
    );

    describe_counter!(
        format!("{}_loop_aborts_total", METRICS_PREFIX),
        Unit::Count,
        "Turns aborted by a fatal error"
    );

    // Search metrics
    describe_counter!(
        format!("{}_search_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Search tool invocations by outcome"
    );

    describe_histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Semantic search latency in seconds"
    );

    // Generation metrics
    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "LLM call latency in seconds"
    );

    describe_counter!(
        format!("{}_evaluator_retries_total", METRICS_PREFIX),
        Unit::Count,
        "Sufficiency evaluations that needed another attempt"
    );

    describe_counter!(
        format!("{}_synthesis_stream_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Synthesis streams that failed mid-way"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a finished loop
pub fn record_loop(stop_reason: &str, iterations: usize) {
    counter!(
        format!("{}_loop_runs_total", METRICS_PREFIX),
        "stop_reason" => stop_reason.to_string()
    )
    .increment(1);

    histogram!(format!("{}_loop_iterations", METRICS_PREFIX)).record(iterations as f64);
}

/// Record a turn aborted by a fatal error
pub fn record_loop_abort(code: &str) {
    counter!(
        format!("{}_loop_aborts_total", METRICS_PREFIX),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record an executed search; outcome is success, empty or failure
pub fn record_search(duration_secs: f64, outcome: &str) {
    counter!(
        format!("{}_search_calls_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(format!("{}_search_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Record an LLM call
pub fn record_generation(duration_secs: f64, operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// Count a search call refused by the per-extraction limit
pub fn record_search_limited() {
    counter!(
        format!("{}_search_calls_total", METRICS_PREFIX),
        "outcome" => "limited"
    )
    .increment(1);
}

pub fn record_evaluator_retry() {
    counter!(format!("{}_evaluator_retries_total", METRICS_PREFIX)).increment(1);
}

pub fn record_stream_error() {
    counter!(format!("{}_synthesis_stream_errors_total", METRICS_PREFIX)).increment(1);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in GENERATION_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls must be no-ops
        let metrics = RequestMetrics::start("POST", "/v2/sessions/:id/messages");
        metrics.finish(200);
        record_loop("sufficient", 2);
        record_search(0.12, "success");
        record_generation(1.5, "structured", true);
    }

    #[test]
    fn test_limited_search_records_no_latency() {
        let recorder = testing::CaptureRecorder::default();
        ::metrics::with_local_recorder(&recorder, record_search_limited);

        assert_eq!(recorder.counters("quarry_search_calls_total"), 1);
        assert_eq!(recorder.histograms("quarry_search_duration_seconds"), 0);
    }
}
