use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

// Metrics registry
static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("http_requests_total registers once")
});

static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]
    )
    .expect("http_request_duration_seconds registers once")
});

static AUTHENTICATION_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "authentication_attempts_total",
        "API key authentication attempts by outcome",
        &["outcome"]
    )
    .expect("authentication_attempts_total registers once")
});

static API_KEYS_ISSUED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("api_keys_issued_total", "Total number of API keys issued")
        .expect("api_keys_issued_total registers once")
});

static API_KEYS_REVOKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("api_keys_revoked_total", "Total number of API keys revoked")
        .expect("api_keys_revoked_total registers once")
});

static RATE_LIMIT_EXCEEDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rate_limit_exceeded_total",
        "Total number of rate limit denials",
        &["dimension"]
    )
    .expect("rate_limit_exceeded_total registers once")
});

static IDEMPOTENCY_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "idempotency_outcomes_total",
        "Idempotency ledger decisions",
        &["outcome"]
    )
    .expect("idempotency_outcomes_total registers once")
});

static AUDIT_EVENTS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "audit_events_written_total",
        "Audit events persisted to the audit store"
    )
    .expect("audit_events_written_total registers once")
});

static AUDIT_WRITE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "audit_write_failures_total",
        "Audit batches that failed to persist; alert when this keeps rising"
    )
    .expect("audit_write_failures_total registers once")
});

static AUDIT_EVENTS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "audit_events_dropped_total",
        "Audit events lost to a full queue or a failed batch"
    )
    .expect("audit_events_dropped_total registers once")
});

static AUDIT_BATCH_WRITE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "audit_batch_write_duration_seconds",
        "Audit batch write latency in seconds",
        &["result"],
        vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]
    )
    .expect("audit_batch_write_duration_seconds registers once")
});

pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn record_http_request(method: &str, path: &str, status: u16) {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
    }

    pub fn record_http_duration(method: &str, path: &str, duration: f64) {
        HTTP_REQUEST_DURATION
            .with_label_values(&[method, path])
            .observe(duration);
    }

    pub fn record_authentication(outcome: &str) {
        AUTHENTICATION_ATTEMPTS_TOTAL
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_key_issued() {
        API_KEYS_ISSUED_TOTAL.inc();
    }

    pub fn record_key_revoked() {
        API_KEYS_REVOKED_TOTAL.inc();
    }

    pub fn record_rate_limit_exceeded(dimension: &str) {
        RATE_LIMIT_EXCEEDED_TOTAL
            .with_label_values(&[dimension])
            .inc();
    }

    pub fn record_idempotency(outcome: &str) {
        IDEMPOTENCY_OUTCOMES_TOTAL
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_audit_written(count: usize, duration: f64) {
        AUDIT_EVENTS_WRITTEN_TOTAL.inc_by(count as u64);
        AUDIT_BATCH_WRITE_DURATION
            .with_label_values(&["ok"])
            .observe(duration);
    }

    pub fn record_audit_write_failure(dropped: usize, duration: f64) {
        AUDIT_WRITE_FAILURES_TOTAL.inc();
        AUDIT_EVENTS_DROPPED_TOTAL.inc_by(dropped as u64);
        AUDIT_BATCH_WRITE_DURATION
            .with_label_values(&["error"])
            .observe(duration);
    }

    pub fn record_audit_dropped() {
        AUDIT_EVENTS_DROPPED_TOTAL.inc();
    }

    /// Export all metrics in Prometheus format
    pub fn export() -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        encoder.encode_to_string(&metric_families)
    }
}
