//! Prometheus metrics for reconciliation-workflow.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for HTTP requests by route and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for HTTP request duration by route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Counter for reconciliation actions by type and outcome.
pub static ACTIONS_APPLIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_actions_total",
        "Total number of reconciliation actions",
        &["action_type", "outcome"]
    )
    .expect("Failed to register ACTIONS_APPLIED")
});

/// Counter for accept/reject decisions on proposals.
pub static PROPOSAL_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_proposal_decisions_total",
        "Total number of proposal decisions",
        &["decision", "outcome"]
    )
    .expect("Failed to register PROPOSAL_DECISIONS")
});

/// Counter for proposals recorded from the suggestion engine.
pub static PROPOSALS_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_proposals_created_total",
        "Total number of match proposals created",
        &["source"]
    )
    .expect("Failed to register PROPOSALS_CREATED")
});

/// Counter for statement imports.
pub static STATEMENT_IMPORTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_statement_imports_total",
        "Total number of statement imports",
        &["status"]
    )
    .expect("Failed to register STATEMENT_IMPORTS")
});

/// Counter for imported statement lines by result.
pub static IMPORTED_ROWS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_imported_rows_total",
        "Total number of statement lines processed",
        &["result"]
    )
    .expect("Failed to register IMPORTED_ROWS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&ACTIONS_APPLIED);
    Lazy::force(&PROPOSAL_DECISIONS);
    Lazy::force(&PROPOSALS_CREATED);
    Lazy::force(&STATEMENT_IMPORTS);
    Lazy::force(&IMPORTED_ROWS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub fn record_http_request(method: &str, route: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS
        .with_label_values(&[method, route, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method, route])
        .observe(duration_secs);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record an applied (or refused) action. `outcome` is `applied`,
/// `replayed`, or an error kind.
pub fn record_action(action_type: &str, outcome: &str) {
    ACTIONS_APPLIED
        .with_label_values(&[action_type, outcome])
        .inc();
}

pub fn record_proposal_decision(decision: &str, outcome: &str) {
    PROPOSAL_DECISIONS
        .with_label_values(&[decision, outcome])
        .inc();
}

pub fn record_proposals_created(source: &str, count: usize) {
    PROPOSALS_CREATED
        .with_label_values(&[source])
        .inc_by(count as f64);
}

/// Record a statement import.
pub fn record_statement_import(status: &str, imported: usize, skipped: usize, failed: usize) {
    STATEMENT_IMPORTS.with_label_values(&[status]).inc();
    IMPORTED_ROWS
        .with_label_values(&["imported"])
        .inc_by(imported as f64);
    IMPORTED_ROWS
        .with_label_values(&["duplicate"])
        .inc_by(skipped as f64);
    IMPORTED_ROWS
        .with_label_values(&["error"])
        .inc_by(failed as f64);
}
