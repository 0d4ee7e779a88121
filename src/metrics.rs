// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the events controller manager.
//!
//! All metrics carry the namespace prefix `argo_events_controller_`.
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - Track reconcile outcomes, duration and requeues
//! - **Queue Metrics** - Track work queue depth and routed cache events
//! - **Error Metrics** - Track reconcile errors and panics
//! - **Leader Election Metrics** - Track leadership state changes
//!
//! The registry is served in text format on `/metrics` by [`router`].
//!
//! # Example
//!
//! ```rust,no_run
//! use events_controller::metrics::record_reconciliation_success;
//!
//! record_reconciliation_success("eventbus-controller", std::time::Duration::from_millis(12));
//! ```

use crate::constants::METRICS_SERVER_PATH;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Namespace prefix for all controller metrics (prometheus-safe)
const METRICS_NAMESPACE: &str = "argo_events_controller";

// ============================================================================
// Global Metrics Registry
// ============================================================================

/// Global Prometheus metrics registry
///
/// All metrics are registered in this registry and exposed via `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Total number of reconciliations by controller and status
///
/// Labels:
/// - `controller`: Controller name (e.g., `eventbus-controller`)
/// - `status`: Outcome (`success`, `error`, `requeue`)
pub static RECONCILIATION_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconciliations_total"),
        "Total number of reconciliations by controller and status",
    );
    let counter = CounterVec::new(opts, &["controller", "status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliations in seconds
///
/// Labels:
/// - `controller`: Controller name
pub static RECONCILIATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
        "Duration of reconciliations in seconds by controller",
    )
    .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);
    let histogram = HistogramVec::new(opts, &["controller"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Total number of requeue operations
///
/// Labels:
/// - `controller`: Controller name
/// - `reason`: Reason for requeue (`error`, `panic`, `requested`, `scheduled`)
pub static REQUEUE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_requeues_total"),
        "Total number of requeue operations by controller and reason",
    );
    let counter = CounterVec::new(opts, &["controller", "reason"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Queue Metrics
// ============================================================================

/// Number of keys ready in each controller's work queue
///
/// Labels:
/// - `controller`: Controller name
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_queue_depth"),
        "Number of keys waiting in the work queue by controller",
    );
    let gauge = GaugeVec::new(opts, &["controller"]).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Total number of cache events seen by each watch
///
/// Labels:
/// - `controller`: Controller name
/// - `kind`: Watched kind
/// - `outcome`: `enqueued`, `filtered` (rejected by the predicate) or `unrouted`
///   (no matching controller owner)
pub static WATCH_EVENTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_watch_events_total"),
        "Total number of watch events by controller, kind and outcome",
    );
    let counter = CounterVec::new(opts, &["controller", "kind", "outcome"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Error Metrics
// ============================================================================

/// Total number of errors by controller and error category
///
/// Labels:
/// - `controller`: Controller name
/// - `error_type`: Category of error (`reconcile_error`, `panic`)
pub static ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_errors_total"),
        "Total number of errors by controller and error category",
    );
    let counter = CounterVec::new(opts, &["controller", "error_type"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Leader Election Metrics
// ============================================================================

/// Total number of leader election events
///
/// Labels:
/// - `status`: Event type (`acquired`, `lost`, `renewed`)
pub static LEADER_ELECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_elections_total"),
        "Total number of leader election events by status",
    );
    let counter = CounterVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Current leader election status
///
/// Labels:
/// - `identity`: Lease holder identity of this replica
///
/// Value: 1 if leader, 0 if standby
pub static LEADER_STATUS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_status"),
        "Current leader election status (1 = leader, 0 = standby)",
    );
    let gauge = GaugeVec::new(opts, &["identity"]).unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record a successful reconciliation
///
/// # Arguments
/// * `controller` - Name of the controller that reconciled
/// * `duration` - Duration of the reconciliation
pub fn record_reconciliation_success(controller: &str, duration: Duration) {
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, "success"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[controller])
        .observe(duration.as_secs_f64());
}

/// Record a failed reconciliation
///
/// # Arguments
/// * `controller` - Name of the controller that reconciled
/// * `duration` - Duration of the reconciliation before failure
/// * `error_type` - `reconcile_error` or `panic`
pub fn record_reconciliation_error(controller: &str, duration: Duration, error_type: &str) {
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, "error"])
        .inc();
    RECONCILIATION_DURATION_SECONDS
        .with_label_values(&[controller])
        .observe(duration.as_secs_f64());
    ERRORS_TOTAL
        .with_label_values(&[controller, error_type])
        .inc();
}

/// Record a reconciliation requeue
///
/// # Arguments
/// * `controller` - Name of the controller that reconciled
/// * `reason` - Reason for requeue (e.g., `error`, `requested`)
pub fn record_reconciliation_requeue(controller: &str, reason: &str) {
    RECONCILIATION_TOTAL
        .with_label_values(&[controller, "requeue"])
        .inc();
    REQUEUE_TOTAL.with_label_values(&[controller, reason]).inc();
}

/// Record the number of keys ready in a work queue
#[allow(clippy::cast_precision_loss)]
pub fn record_queue_depth(controller: &str, depth: usize) {
    QUEUE_DEPTH
        .with_label_values(&[controller])
        .set(depth as f64);
}

/// Record one watch event and what became of it
///
/// # Arguments
/// * `controller` - Name of the controller owning the watch
/// * `kind` - Watched kind
/// * `outcome` - `enqueued`, `filtered` or `unrouted`
pub fn record_watch_event(controller: &str, kind: &str, outcome: &str) {
    WATCH_EVENTS_TOTAL
        .with_label_values(&[controller, kind, outcome])
        .inc();
}

/// Record leader election acquired
///
/// # Arguments
/// * `identity` - Identity of the replica that acquired leadership
pub fn record_leader_elected(identity: &str) {
    LEADER_ELECTIONS_TOTAL
        .with_label_values(&["acquired"])
        .inc();
    LEADER_STATUS.with_label_values(&[identity]).set(1.0);
}

/// Record leader election lost
///
/// # Arguments
/// * `identity` - Identity of the replica that lost leadership
pub fn record_leader_lost(identity: &str) {
    LEADER_ELECTIONS_TOTAL.with_label_values(&["lost"]).inc();
    LEADER_STATUS.with_label_values(&[identity]).set(0.0);
}

/// Record leader election renewed
pub fn record_leader_renewed() {
    LEADER_ELECTIONS_TOTAL.with_label_values(&["renewed"]).inc();
}

/// Gather and encode all metrics in Prometheus text format
///
/// # Returns
/// Prometheus-formatted metrics as a String
///
/// # Errors
/// Returns error if encoding fails
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}

async fn metrics_handler() -> (StatusCode, String) {
    match gather_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Router exposing the registry on `/metrics`.
pub fn router() -> Router {
    Router::new().route(METRICS_SERVER_PATH, get(metrics_handler))
}

/// Serve [`router`] on an already bound listener until `token` is cancelled.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(listener: TcpListener, token: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Metrics server listening");
    }
    axum::serve(listener, router())
        .with_graceful_shutdown(token.cancelled_owned())
        .await
}
