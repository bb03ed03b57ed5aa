//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swaps started and finished
//! - Status transitions
//! - Watchdog complaints
//! - Transient retries per phase

use crate::error::{SwapperError, SwapperResult};
use crate::state::SwapStatus;
use crate::watchdog::Complaint;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, CounterVec, Encoder, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref SWAPS_STARTED: CounterVec = register_counter_vec!(
        "atom_swapper_swaps_started_total",
        "Total swaps handed to the state machine",
        &["send_currency", "receive_currency"]
    ).unwrap();

    pub static ref SWAPS_FINISHED: CounterVec = register_counter_vec!(
        "atom_swapper_swaps_finished_total",
        "Total swaps that stopped running, by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref STATUS_TRANSITIONS: CounterVec = register_counter_vec!(
        "atom_swapper_status_transitions_total",
        "Total persisted status transitions",
        &["status"]
    ).unwrap();

    pub static ref COMPLAINTS: CounterVec = register_counter_vec!(
        "atom_swapper_complaints_total",
        "Total complaints sent to the watchdog",
        &["kind"]
    ).unwrap();

    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "atom_swapper_transient_retries_total",
        "Total retries after transient failures",
        &["phase"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SwapperResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapperError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapperError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_swap_started(send_currency: &str, receive_currency: &str) {
    SWAPS_STARTED
        .with_label_values(&[send_currency, receive_currency])
        .inc();
}

pub fn record_swap_finished(outcome: &str) {
    SWAPS_FINISHED.with_label_values(&[outcome]).inc();
}

pub fn record_transition(status: SwapStatus) {
    STATUS_TRANSITIONS
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_complaint(complaint: Complaint) {
    COMPLAINTS.with_label_values(&[complaint.as_str()]).inc();
}

pub fn record_retry(phase: &str) {
    RETRIES.with_label_values(&[phase]).inc();
}
