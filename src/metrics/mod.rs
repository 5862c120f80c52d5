//! Metrics module
//!
//! Provides Prometheus metrics for uploads, link issuance and completion
//! watches.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Session metrics
    pub static ref SESSIONS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_media_sessions_total",
        "Upload sessions by lifecycle event",
        &["status"]  // "initiated", "completed", "aborted", "failed"
    ).unwrap();

    pub static ref SESSION_PARTS: Histogram = register_histogram!(
        "mizuchi_media_session_parts",
        "Number of parts per completed multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();

    // Transfer metrics
    pub static ref PART_TRANSFERS: CounterVec = register_counter_vec!(
        "mizuchi_media_part_transfers_total",
        "Part transfers by outcome",
        &["status"]
    ).unwrap();

    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_media_retries_total",
        "Retried operations",
        &["operation"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "mizuchi_media_upload_bytes_total",
        "Total bytes acknowledged by storage"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "mizuchi_media_upload_duration_seconds",
        "Upload duration in seconds",
        &["method"],  // "single_shot" or "multipart"
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]
    ).unwrap();

    // Link metrics
    pub static ref LINKS_ISSUED: CounterVec = register_counter_vec!(
        "mizuchi_media_links_issued_total",
        "Presigned links issued",
        &["operation"]
    ).unwrap();

    // Watch metrics
    pub static ref WATCH_OUTCOMES: CounterVec = register_counter_vec!(
        "mizuchi_media_watch_outcomes_total",
        "Completion watch terminal outcomes",
        &["outcome"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_media_errors_total",
        "Total errors",
        &["kind"]
    ).unwrap();
}

/// Record a session lifecycle event
pub fn record_session(status: &str) {
    SESSIONS_TOTAL.with_label_values(&[status]).inc();
}

/// Record a completed multipart upload
pub fn record_session_completed(parts_count: usize) {
    SESSIONS_TOTAL.with_label_values(&["completed"]).inc();
    SESSION_PARTS.observe(parts_count as f64);
}

/// Record a part transfer outcome
pub fn record_part_transfer(success: bool, bytes: u64) {
    let status = if success { "success" } else { "failure" };
    PART_TRANSFERS.with_label_values(&[status]).inc();
    if success {
        UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    }
}

/// Record a retried operation
pub fn record_retry(operation: &str) {
    RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

/// Record upload duration
pub fn record_upload_duration(method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record an issued presigned link
pub fn record_link_issued(operation: &str) {
    LINKS_ISSUED.with_label_values(&[operation]).inc();
}

/// Record a terminal watch outcome
pub fn record_watch_outcome(outcome: &str) {
    WATCH_OUTCOMES.with_label_values(&[outcome]).inc();
}

/// Record an error
pub fn record_error(kind: &str) {
    ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
