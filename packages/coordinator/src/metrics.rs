//! Prometheus metrics for the transfer coordinator
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, GaugeVec, HistogramVec,
};

use crate::types::TransferStatus;

lazy_static! {
    pub static ref TRANSFERS_REQUESTED: Counter = register_counter!(
        "transfers_requested_total",
        "Total number of accepted transfer requests"
    ).unwrap();

    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "transfer_transitions_total",
        "Persisted status transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref STEP_RETRIES: CounterVec = register_counter_vec!(
        "step_retries_total",
        "Retries of transient failures per coordinator step",
        &["step"]
    ).unwrap();

    pub static ref INTEGRITY_ALERTS: Counter = register_counter!(
        "integrity_alerts_total",
        "Protected payloads that failed integrity verification, plus reconciliation alerts"
    ).unwrap();

    pub static ref REFUNDS: Counter = register_counter!(
        "refunds_total",
        "Transfers refunded to their sender"
    ).unwrap();

    pub static ref TRANSFERS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "transfers_by_status",
        "Current number of transfer records per status",
        &["status"]
    ).unwrap();

    pub static ref TRANSFER_DURATION: HistogramVec = register_histogram_vec!(
        "transfer_duration_seconds",
        "Time from request to a terminal status",
        &["outcome"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).unwrap();
}

pub fn record_transition(from: TransferStatus, to: TransferStatus) {
    if from != to {
        TRANSITIONS
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }
}

pub fn record_terminal(status: TransferStatus, seconds: f64) {
    TRANSFER_DURATION
        .with_label_values(&[status.as_str()])
        .observe(seconds);
}

pub fn set_status_counts(counts: &[(TransferStatus, i64)]) {
    for (status, count) in counts {
        TRANSFERS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(*count as f64);
    }
}
