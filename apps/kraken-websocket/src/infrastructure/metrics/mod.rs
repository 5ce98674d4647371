//! Prometheus Metrics Module
//!
//! Exposes client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames by envelope kind, malformed frames, lag
//! - **Connections**: Connection state, reconnects and stabilizations
//! - **Channels**: Active subscriptions and sequence gaps
//! - **Requests**: Correlated request outcomes and order snapshots
//!
//! Recording before [`init_metrics`] is a no-op.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Errors raised while installing the exporter.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The recorder or HTTP listener could not be installed.
    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder.
///
/// With `listen`, metrics are also served over HTTP at that address.
/// Later calls are no-ops.
///
/// # Errors
///
/// Returns an error if another recorder is installed or the listener cannot
/// be started.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<(), MetricsError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new();
    let handle = match listen {
        Some(addr) => {
            let builder = builder.with_http_listener(addr);
            let (recorder, exporter) = builder
                .build()
                .map_err(|e| MetricsError::Install(e.to_string()))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| MetricsError::Install(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::warn!(error = ?e, "Metrics listener stopped");
                }
            });
            tracing::info!(%addr, "Serving Prometheus metrics");
            handle
        }
        None => builder
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?,
    };

    register_metrics();
    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "kraken_ws_frames_received_total",
        "Inbound frames by endpoint and envelope kind"
    );
    describe_counter!(
        "kraken_ws_malformed_frames_total",
        "Inbound frames that were not valid JSON"
    );
    describe_counter!(
        "kraken_ws_lagged_frames_total",
        "Bundles skipped by consumers that fell behind"
    );

    describe_gauge!(
        "kraken_ws_connected",
        "Whether the endpoint currently has a live connection"
    );
    describe_counter!(
        "kraken_ws_reconnects_total",
        "Connection failures followed by a reconnect attempt"
    );
    describe_counter!(
        "kraken_ws_stabilizations_total",
        "Connections that outlived the stability window"
    );

    describe_gauge!(
        "kraken_ws_subscriptions",
        "Active channel subscriptions by channel"
    );
    describe_counter!(
        "kraken_ws_sequence_gaps_total",
        "Sequence gaps detected on private channels"
    );

    describe_counter!(
        "kraken_ws_requests_total",
        "Correlated requests by outcome"
    );
    describe_counter!(
        "kraken_ws_order_snapshots_total",
        "Order snapshots emitted by status"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Envelope kinds for frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Exchange heartbeat.
    Heartbeat,
    /// `systemStatus` event.
    Status,
    /// Channel data or event response.
    Message,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::Message => "message",
        }
    }
}

/// How a correlated request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A response with the request's `reqid` arrived.
    Answered,
    /// No response within the timeout.
    TimedOut,
    /// The request never left.
    SendFailed,
}

impl RequestOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::TimedOut => "timed_out",
            Self::SendFailed => "send_failed",
        }
    }
}

/// Record one inbound frame.
pub fn record_frame(endpoint: &'static str, kind: FrameKind) {
    counter!(
        "kraken_ws_frames_received_total",
        "endpoint" => endpoint,
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a frame that failed to decode.
pub fn record_malformed_frame(endpoint: &'static str) {
    counter!("kraken_ws_malformed_frames_total", "endpoint" => endpoint).increment(1);
}

/// Record bundles skipped by a lagging consumer.
pub fn record_lagged(skipped: u64) {
    counter!("kraken_ws_lagged_frames_total").increment(skipped);
}

/// Update the connection state of an endpoint.
pub fn set_connected(endpoint: &'static str, connected: bool) {
    gauge!("kraken_ws_connected", "endpoint" => endpoint).set(if connected { 1.0 } else { 0.0 });
}

/// Record a connection failure that leads to a reconnect attempt.
pub fn record_reconnect(endpoint: &'static str) {
    counter!("kraken_ws_reconnects_total", "endpoint" => endpoint).increment(1);
}

/// Record a connection that outlived the stability window.
pub fn record_stabilized(endpoint: &'static str) {
    counter!("kraken_ws_stabilizations_total", "endpoint" => endpoint).increment(1);
}

/// Record a subscription going live.
pub fn subscription_opened(channel: &str) {
    gauge!("kraken_ws_subscriptions", "channel" => channel.to_owned()).increment(1.0);
}

/// Record a subscription being released.
pub fn subscription_closed(channel: &str) {
    gauge!("kraken_ws_subscriptions", "channel" => channel.to_owned()).decrement(1.0);
}

/// Record a sequence gap on a private channel.
pub fn record_sequence_gap(channel: &str) {
    counter!("kraken_ws_sequence_gaps_total", "channel" => channel.to_owned()).increment(1);
}

/// Record how a correlated request ended.
pub fn record_request(outcome: RequestOutcome) {
    counter!("kraken_ws_requests_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record an emitted order snapshot.
pub fn record_order_status(status: &'static str) {
    counter!("kraken_ws_order_snapshots_total", "status" => status).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
