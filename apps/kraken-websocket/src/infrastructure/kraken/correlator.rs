//! Request/Response Correlator
//!
//! Kraken answers requests such as `addOrder` or `cancelOrder` with an
//! object frame echoing the request's `reqid`. The correlator attaches a
//! fresh id to each outgoing request and resolves the caller with the first
//! object frame carrying that id.
//!
//! A single dispatcher task reads the bundle stream and completes pending
//! entries; the caller side owns its entry and removes it on resolution,
//! timeout or drop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::connection::{ConnectionHandle, Envelope, SendError};
use crate::application::ports::IdGenerator;
use crate::infrastructure::broadcast::BundleStream;
use crate::infrastructure::metrics::{self, RequestOutcome};

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Error Types
// =============================================================================

/// Errors returned by [`Correlator::request`] and [`response_ok`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    /// The request could not be sent.
    #[error(transparent)]
    Send(#[from] SendError),

    /// No response arrived in time.
    #[error("request {reqid} timed out after {after:?}")]
    Timeout {
        /// Id of the request.
        reqid: u64,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// The exchange answered with the failure status.
    #[error("request rejected: {message}")]
    Rejected {
        /// `errorMessage` from the response.
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The dispatcher stopped before the response arrived.
    #[error("correlator stopped before request {0} was answered")]
    Dropped(u64),

    /// Only JSON objects can carry a `reqid`.
    #[error("request payload is not a JSON object")]
    NotAnObject,
}

// =============================================================================
// Response Status
// =============================================================================

/// Success and failure values of a response's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStatuses {
    /// Status meaning success.
    pub good: &'static str,
    /// Status meaning the request was rejected.
    pub bad: &'static str,
}

impl Default for ResponseStatuses {
    fn default() -> Self {
        Self {
            good: "ok",
            bad: "error",
        }
    }
}

/// Check a response's `status` field.
///
/// # Errors
///
/// Returns [`CorrelatorError::Rejected`] with the server's `errorMessage` for
/// the failure status, and [`CorrelatorError::Protocol`] for a missing or
/// unknown status.
pub fn response_ok<'a>(
    response: &'a Value,
    statuses: &ResponseStatuses,
) -> Result<&'a Value, CorrelatorError> {
    match response.get("status").and_then(Value::as_str) {
        Some(status) if status == statuses.good => Ok(response),
        Some(status) if status == statuses.bad => Err(CorrelatorError::Rejected {
            message: response
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("no error message")
                .to_owned(),
        }),
        Some(status) => Err(CorrelatorError::Protocol(format!("unknown status {status:?}"))),
        None => Err(CorrelatorError::Protocol("response has no status".to_owned())),
    }
}

// =============================================================================
// Id Generators
// =============================================================================

/// Random ids from the low half of a UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> u64 {
        uuid::Uuid::new_v4().as_u64_pair().1
    }
}

/// Ids counting up from 1.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Start counting at `first`.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

// =============================================================================
// Correlator
// =============================================================================

/// Correlator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Time to wait for each response.
    pub timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl From<&crate::ClientConfig> for CorrelatorConfig {
    fn from(config: &crate::ClientConfig) -> Self {
        Self {
            timeout: config.request_timeout,
        }
    }
}

type Waiters = Mutex<HashMap<u64, oneshot::Sender<Arc<Value>>>>;

/// Matches responses to requests by `reqid`.
///
/// Cheap to clone; the dispatcher stops when the last clone is dropped.
#[derive(Clone)]
pub struct Correlator {
    waiters: Arc<Waiters>,
    ids: Arc<dyn IdGenerator>,
    config: CorrelatorConfig,
    _dispatcher: Arc<DropGuard>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Correlator {
    /// Start correlating responses read from `bundles`.
    ///
    /// Spawns the dispatcher, so it must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(bundles: BundleStream, ids: Arc<dyn IdGenerator>, config: CorrelatorConfig) -> Self {
        let waiters: Arc<Waiters> = Arc::default();
        let stop = CancellationToken::new();
        tokio::spawn(dispatch(bundles, Arc::clone(&waiters), stop.clone()));

        Self {
            waiters,
            ids,
            config,
            _dispatcher: Arc::new(stop.drop_guard()),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Send `payload` with a fresh `reqid` and wait for its response.
    ///
    /// Any `reqid` already in `payload` is replaced. Dropping the returned
    /// future forgets the request.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not an object, the send fails, or no
    /// response arrives within the configured timeout.
    pub async fn request(
        &self,
        handle: &ConnectionHandle,
        payload: Value,
    ) -> Result<Arc<Value>, CorrelatorError> {
        let Value::Object(mut fields) = payload else {
            return Err(CorrelatorError::NotAnObject);
        };

        let (reqid, response) = self.register();
        let _entry = PendingEntry {
            waiters: &self.waiters,
            reqid,
        };
        fields.insert("reqid".to_owned(), Value::from(reqid));

        tracing::debug!(
            connection = handle.id(),
            reqid,
            event = ?fields.get("event"),
            "Sending request"
        );
        if let Err(e) = handle.send(Value::Object(fields)).await {
            metrics::record_request(RequestOutcome::SendFailed);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.timeout, response).await {
            Ok(Ok(value)) => {
                metrics::record_request(RequestOutcome::Answered);
                Ok(value)
            }
            Ok(Err(_)) => Err(CorrelatorError::Dropped(reqid)),
            Err(_) => {
                metrics::record_request(RequestOutcome::TimedOut);
                tracing::warn!(
                    connection = handle.id(),
                    reqid,
                    timeout_ms = self.config.timeout.as_millis(),
                    "Request timed out"
                );
                Err(CorrelatorError::Timeout {
                    reqid,
                    after: self.config.timeout,
                })
            }
        }
    }

    /// Pick an id no pending request uses and register it.
    fn register(&self) -> (u64, oneshot::Receiver<Arc<Value>>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        let mut reqid = self.ids.next_id();
        while waiters.contains_key(&reqid) {
            reqid = self.ids.next_id();
        }
        waiters.insert(reqid, tx);
        (reqid, rx)
    }
}

/// Removes its entry when the request finishes, fails or is dropped.
struct PendingEntry<'a> {
    waiters: &'a Waiters,
    reqid: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.reqid);
    }
}

async fn dispatch(mut bundles: BundleStream, waiters: Arc<Waiters>, stop: CancellationToken) {
    loop {
        let bundle = tokio::select! {
            () = stop.cancelled() => break,
            next = bundles.next() => match next {
                Some(bundle) => bundle,
                None => break,
            },
        };

        let Envelope::Message(value) = &bundle.envelope else {
            continue;
        };
        // array frames have no reqid
        let Some(reqid) = value.get("reqid").and_then(Value::as_u64) else {
            continue;
        };

        let waiter = waiters.lock().remove(&reqid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Arc::clone(value));
            }
            None => tracing::trace!(reqid, "Response without a pending request"),
        }
    }

    waiters.lock().clear();
    tracing::debug!("Correlator dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::infrastructure::broadcast::BroadcastHub;
    use crate::infrastructure::kraken::connection::{Bundle, EndpointKind};

    struct FixedIds(Mutex<Vec<u64>>);

    impl IdGenerator for FixedIds {
        fn next_id(&self) -> u64 {
            self.0.lock().remove(0)
        }
    }

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(1, EndpointKind::Public, tx, None), rx)
    }

    fn respond(hub: &BroadcastHub, handle: &ConnectionHandle, value: Value) {
        let _ = hub.send_bundle(Bundle {
            handle: handle.clone(),
            envelope: Envelope::Message(Arc::new(value)),
        });
    }

    fn correlator(hub: &BroadcastHub, config: CorrelatorConfig) -> Correlator {
        Correlator::new(
            hub.bundle_stream(),
            Arc::new(SequentialIdGenerator::default()),
            config,
        )
    }

    #[test]
    fn response_ok_accepts_good_status() {
        let response = json!({"event": "addOrderStatus", "status": "ok", "txid": "X"});
        assert_eq!(response_ok(&response, &ResponseStatuses::default()), Ok(&response));
    }

    #[test]
    fn response_ok_surfaces_error_message() {
        let response = json!({
            "errorMessage": "Unsupported field: 'refid' for the given msg type: add order",
            "event": "addOrderStatus",
            "status": "error"
        });
        assert_eq!(
            response_ok(&response, &ResponseStatuses::default()),
            Err(CorrelatorError::Rejected {
                message: "Unsupported field: 'refid' for the given msg type: add order".to_owned()
            })
        );
    }

    #[test]
    fn response_ok_rejects_unknown_shapes() {
        let statuses = ResponseStatuses::default();
        assert!(matches!(
            response_ok(&json!({"status": "weird"}), &statuses),
            Err(CorrelatorError::Protocol(_))
        ));
        assert!(matches!(
            response_ok(&json!({"event": "x"}), &statuses),
            Err(CorrelatorError::Protocol(_))
        ));
    }

    #[test]
    fn response_ok_with_custom_statuses() {
        let statuses = ResponseStatuses {
            good: "subscribed",
            bad: "error",
        };
        assert!(response_ok(&json!({"status": "subscribed"}), &statuses).is_ok());
    }

    #[test]
    fn config_takes_request_timeout() {
        let client = crate::ClientConfig {
            request_timeout: Duration::from_millis(1500),
            ..crate::ClientConfig::default()
        };
        assert_eq!(CorrelatorConfig::from(&client).timeout, Duration::from_millis(1500));
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialIdGenerator::default();
        assert_eq!((ids.next_id(), ids.next_id(), ids.next_id()), (1, 2, 3));
    }

    #[tokio::test]
    async fn request_resolves_with_matching_reqid() {
        let hub = BroadcastHub::with_defaults();
        let correlator = correlator(&hub, CorrelatorConfig::default());
        let (handle, mut out) = handle();

        let request = correlator.request(&handle, json!({"event": "addOrder"}));
        let responder = async {
            let sent: Value = serde_json::from_str(&out.recv().await.unwrap()).unwrap();
            assert_eq!(sent, json!({"event": "addOrder", "reqid": 1}));
            respond(&hub, &handle, json!([1, {"reqid": 1}, "ticker", "XBT/USD"]));
            respond(&hub, &handle, json!({"event": "addOrderStatus", "reqid": 9}));
            respond(&hub, &handle, json!({"event": "addOrderStatus", "reqid": 1, "n": 1}));
            respond(&hub, &handle, json!({"event": "addOrderStatus", "reqid": 1, "n": 2}));
        };

        let (response, ()) = tokio::join!(request, responder);

        assert_eq!(response.unwrap()["n"], 1);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        let hub = BroadcastHub::with_defaults();
        let correlator = correlator(&hub, CorrelatorConfig::default());
        let (handle, mut out) = handle();

        let first = correlator.request(&handle, json!({"event": "a"}));
        let second = correlator.request(&handle, json!({"event": "b"}));
        let responder = async {
            let _ = out.recv().await;
            let _ = out.recv().await;
            respond(&hub, &handle, json!({"reqid": 2, "for": "b"}));
            respond(&hub, &handle, json!({"reqid": 1, "for": "a"}));
        };

        let (a, b, ()) = tokio::join!(first, second, responder);

        assert_eq!(a.unwrap()["for"], "a");
        assert_eq!(b.unwrap()["for"], "b");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_and_is_forgotten() {
        let hub = BroadcastHub::with_defaults();
        let config = CorrelatorConfig {
            timeout: Duration::from_millis(200),
        };
        let correlator = correlator(&hub, config);
        let (handle, _out) = handle();

        let result = correlator.request(&handle, json!({"event": "cancelOrder"})).await;

        assert_eq!(
            result,
            Err(CorrelatorError::Timeout {
                reqid: 1,
                after: Duration::from_millis(200)
            })
        );
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn dropped_request_is_forgotten() {
        let hub = BroadcastHub::with_defaults();
        let correlator = correlator(&hub, CorrelatorConfig::default());
        let (handle, _out) = handle();

        {
            let request = correlator.request(&handle, json!({"event": "a"}));
            tokio::pin!(request);
            assert!(futures::poll!(request.as_mut()).is_pending());
            assert_eq!(correlator.pending(), 1);
        }

        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn pending_ids_are_never_reused() {
        let hub = BroadcastHub::with_defaults();
        let ids = FixedIds(Mutex::new(vec![7, 7, 8]));
        let correlator = Correlator::new(hub.bundle_stream(), Arc::new(ids), CorrelatorConfig::default());
        let (handle, mut out) = handle();

        let first = correlator.request(&handle, json!({}));
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());

        let second = correlator.request(&handle, json!({}));
        tokio::pin!(second);
        assert!(futures::poll!(second.as_mut()).is_pending());

        let reqids: Vec<u64> = (0..2)
            .map(|_| {
                let sent: Value = serde_json::from_str(&out.try_recv().unwrap()).unwrap();
                sent["reqid"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(reqids, vec![7, 8]);
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let hub = BroadcastHub::with_defaults();
        let correlator = correlator(&hub, CorrelatorConfig::default());
        let (handle, out) = handle();
        drop(out);

        assert_eq!(
            correlator.request(&handle, json!({})).await,
            Err(CorrelatorError::Send(SendError::Closed(1)))
        );
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn non_object_payload_is_refused() {
        let hub = BroadcastHub::with_defaults();
        let correlator = correlator(&hub, CorrelatorConfig::default());
        let (handle, _out) = handle();

        assert_eq!(
            correlator.request(&handle, json!([1, 2])).await,
            Err(CorrelatorError::NotAnObject)
        );
    }
}
