//! Order Lifecycle Tracker
//!
//! Places orders through the correlator and follows them on the
//! `openOrders` channel until they reach a final status.
//!
//! The tracker only reads `openOrders` frames; something else must keep an
//! `openOrders` subscription alive on the same private connection (for
//! example a [`ChannelSubscriber`](super::ChannelSubscriber) on
//! [`OPEN_ORDERS`]).

use std::collections::BTreeSet;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{ConnectionEngine, ConnectionHandle, ConnectionStatus, Envelope};
use super::correlator::{Correlator, CorrelatorError, ResponseStatuses, response_ok};
use super::messages::{AddOrderRequest, AddOrderStatus, CancelOrderRequest};
use crate::domain::channel::{ChannelMessage, OPEN_ORDERS};
use crate::domain::order::{Order, OrderUpdate};
use crate::infrastructure::broadcast::{BundleStream, SharedBroadcastHub};
use crate::infrastructure::metrics;

/// Errors raised while placing or following an order.
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// The request failed, timed out or was rejected.
    #[error(transparent)]
    Request(#[from] CorrelatorError),

    /// A request or acknowledgment did not have the expected shape.
    #[error("order payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection closed before the order reached a final status.
    #[error("connection {connection} closed while tracking order {order_id}")]
    ConnectionClosed {
        /// Connection the order was placed on.
        connection: u64,
        /// Order id.
        order_id: String,
    },

    /// The bundle stream ended before the order reached a final status.
    #[error("stream ended while tracking order {0}")]
    StreamEnded(String),
}

/// Item of an [`OrderLifecycle`].
pub type OrderEvent = Result<Order, OrderError>;

// =============================================================================
// Order Lifecycle
// =============================================================================

/// Snapshots of one order, from `Submitted` to a final status.
///
/// Ends after a final snapshot or after the first error. Dropping it stops
/// tracking.
pub struct OrderLifecycle {
    events: mpsc::UnboundedReceiver<OrderEvent>,
    task: JoinHandle<()>,
}

impl Stream for OrderLifecycle {
    type Item = OrderEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<OrderEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for OrderLifecycle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for OrderLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderLifecycle")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Order Tracker
// =============================================================================

/// Places and cancels orders on a private connection.
#[derive(Debug, Clone)]
pub struct OrderTracker {
    correlator: Correlator,
    hub: SharedBroadcastHub,
    statuses: ResponseStatuses,
}

impl OrderTracker {
    /// Track orders using `correlator` for requests and `hub` for updates.
    #[must_use]
    pub fn new(correlator: Correlator, hub: SharedBroadcastHub) -> Self {
        Self {
            correlator,
            hub,
            statuses: ResponseStatuses::default(),
        }
    }

    /// Track orders placed on the connections of `engine`.
    ///
    /// Shares the engine's correlator, so it must be called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn attach(engine: &ConnectionEngine) -> Self {
        Self::new(engine.correlator(), engine.hub())
    }

    /// Place an order and follow it.
    ///
    /// Updates are buffered from this call on, so none are lost while the
    /// acknowledgment is pending. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn add_order(&self, handle: &ConnectionHandle, request: AddOrderRequest) -> OrderLifecycle {
        let bundles = self.hub.bundle_stream();
        let (events, events_rx) = mpsc::unbounded_channel();
        let follow = Follow {
            correlator: self.correlator.clone(),
            statuses: self.statuses,
            handle: handle.clone(),
            events,
        };
        let task = tokio::spawn(follow.run(request, bundles));
        OrderLifecycle {
            events: events_rx,
            task,
        }
    }

    /// Cancel one or more orders.
    ///
    /// # Errors
    ///
    /// Fails if the request fails, times out or is rejected.
    pub async fn cancel_order(
        &self,
        handle: &ConnectionHandle,
        txids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<(), OrderError> {
        let request = CancelOrderRequest::new(txids);
        let response = self.correlator.request(handle, request.to_frame()?).await?;
        response_ok(&response, &self.statuses)?;
        tracing::info!(connection = handle.id(), txid = ?request.txid, "Orders cancelled");
        Ok(())
    }
}

struct Follow {
    correlator: Correlator,
    statuses: ResponseStatuses,
    handle: ConnectionHandle,
    events: mpsc::UnboundedSender<OrderEvent>,
}

impl Follow {
    async fn run(self, request: AddOrderRequest, bundles: BundleStream) {
        if let Err(e) = self.follow(request, bundles).await {
            tracing::warn!(connection = self.handle.id(), error = %e, "Order tracking failed");
            let _ = self.events.send(Err(e));
        }
    }

    async fn follow(&self, request: AddOrderRequest, mut bundles: BundleStream) -> Result<(), OrderError> {
        let response = self.correlator.request(&self.handle, request.to_frame()?).await?;
        let ack = AddOrderStatus::deserialize(response_ok(&response, &self.statuses)?)?;

        let mut order =
            Order::submitted(ack.txid, ack.descr).with_kind(request.side, request.order_type);
        tracing::info!(
            connection = self.handle.id(),
            order_id = %order.order_id,
            description = %order.description,
            "Order submitted"
        );
        if !self.emit(&order) {
            return Ok(());
        }

        while let Some(bundle) = bundles.next().await {
            if bundle.handle != self.handle {
                continue;
            }
            let value = match &bundle.envelope {
                Envelope::Message(value) => value,
                Envelope::Status(ConnectionStatus::Closed) => {
                    return Err(OrderError::ConnectionClosed {
                        connection: self.handle.id(),
                        order_id: order.order_id,
                    });
                }
                Envelope::Status(_) | Envelope::Heartbeat => continue,
            };
            let Some(message) = ChannelMessage::from_value(value) else {
                continue;
            };
            if !message.matches(OPEN_ORDERS, None) {
                continue;
            }

            let order_id = order.order_id.clone();
            for update in updates_for(&message, &order_id) {
                order = order.apply(&update);
                if !self.emit(&order) {
                    return Ok(());
                }
                if order.is_final() {
                    tracing::info!(
                        order_id = %order.order_id,
                        status = order.status.as_str(),
                        "Order finished"
                    );
                    return Ok(());
                }
            }
        }

        Err(OrderError::StreamEnded(order.order_id))
    }

    /// Returns `false` once nobody is listening.
    fn emit(&self, order: &Order) -> bool {
        metrics::record_order_status(order.status.as_str());
        tracing::debug!(
            order_id = %order.order_id,
            status = order.status.as_str(),
            volume_executed = ?order.volume_executed,
            "Order snapshot"
        );
        self.events.send(Ok(order.clone())).is_ok()
    }
}

/// Entries for `order_id` in an `openOrders` frame.
///
/// The payload is a list of single-key objects mapping order ids to updates.
fn updates_for<'a>(
    message: &'a ChannelMessage,
    order_id: &'a str,
) -> impl Iterator<Item = OrderUpdate> + 'a {
    message
        .body
        .first()
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(move |entry| entry.get(order_id))
        .map(OrderUpdate::from_value)
}

/// Running set of order ids seen on an `openOrders` or `ownTrades` stream.
///
/// Yields the set for the first message and again whenever it grows.
pub fn order_ids<S>(messages: S) -> impl Stream<Item = BTreeSet<String>>
where
    S: Stream<Item = ChannelMessage>,
{
    messages
        .scan((BTreeSet::new(), true), |(ids, first), message| {
            let before = ids.len();
            ids.extend(entry_keys(&message).map(str::to_owned));
            let grown = ids.len() != before;
            let emit = std::mem::replace(first, false) || grown;
            futures::future::ready(Some(emit.then(|| ids.clone())))
        })
        .filter_map(futures::future::ready)
}

fn entry_keys(message: &ChannelMessage) -> impl Iterator<Item = &str> {
    message
        .body
        .first()
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .flat_map(|entry| entry.keys().map(String::as_str))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::domain::order::{OrderSide, OrderStatus};
    use crate::infrastructure::broadcast::BroadcastHub;
    use crate::infrastructure::kraken::connection::{Bundle, EndpointKind};
    use crate::infrastructure::kraken::correlator::{CorrelatorConfig, SequentialIdGenerator};

    struct Exchange {
        hub: SharedBroadcastHub,
        handle: ConnectionHandle,
        out: mpsc::UnboundedReceiver<String>,
        sequence: u64,
    }

    impl Exchange {
        fn new() -> (Self, OrderTracker) {
            let hub = Arc::new(BroadcastHub::with_defaults());
            let (tx, out) = mpsc::unbounded_channel();
            let handle = ConnectionHandle::new(1, EndpointKind::Public, tx, None);
            let correlator = Correlator::new(
                hub.bundle_stream(),
                Arc::new(SequentialIdGenerator::default()),
                CorrelatorConfig::default(),
            );
            let tracker = OrderTracker::new(correlator, Arc::clone(&hub));
            let exchange = Self {
                hub,
                handle,
                out,
                sequence: 0,
            };
            (exchange, tracker)
        }

        fn publish(&self, envelope: Envelope) {
            let _ = self.hub.send_bundle(Bundle {
                handle: self.handle.clone(),
                envelope,
            });
        }

        async fn answer(&mut self, mut response: Value) -> Value {
            let request: Value = serde_json::from_str(&self.out.recv().await.unwrap()).unwrap();
            response["reqid"] = request["reqid"].clone();
            self.publish(Envelope::Message(Arc::new(response)));
            request
        }

        fn open_orders(&mut self, entries: Value) {
            self.sequence += 1;
            self.publish(Envelope::Message(Arc::new(json!([
                entries,
                "openOrders",
                {"sequence": self.sequence}
            ]))));
        }
    }

    fn request() -> AddOrderRequest {
        AddOrderRequest::limit(
            "USDT/USD",
            OrderSide::Buy,
            Decimal::from(10),
            Decimal::from_str("0.998").unwrap(),
        )
    }

    #[tokio::test]
    async fn lifecycle_from_submitted_to_canceled() {
        let (mut exchange, tracker) = Exchange::new();
        let mut lifecycle = tracker.add_order(&exchange.handle, request());

        let sent = exchange
            .answer(json!({"event": "addOrderStatus", "status": "ok", "txid": "X", "descr": "buy 10 @ 1"}))
            .await;
        assert_eq!(sent["event"], "addOrder");
        assert_eq!(sent["ordertype"], "limit");

        exchange.open_orders(json!([{"OTHER": {"status": "open"}}]));
        exchange.open_orders(json!([{"X": {"status": "pending", "vol": "10", "userref": 0}}]));
        exchange.open_orders(json!([{"X": {"status": "open"}}]));
        exchange.open_orders(json!([{"X": {"vol_exec": "4"}}]));
        exchange.open_orders(json!([{"X": {"status": "canceled"}}]));
        exchange.open_orders(json!([{"X": {"status": "open"}}]));

        let submitted = lifecycle.next().await.unwrap().unwrap();
        assert_eq!(submitted.order_id, "X");
        assert_eq!(submitted.description, "buy 10 @ 1");
        assert_eq!(submitted.status, OrderStatus::Submitted);
        assert_eq!(submitted.side, Some(OrderSide::Buy));

        let pending = lifecycle.next().await.unwrap().unwrap();
        assert_eq!(pending.status, OrderStatus::Pending);
        assert_eq!(pending.volume, Some(Decimal::from(10)));

        let open = lifecycle.next().await.unwrap().unwrap();
        assert_eq!(open.status, OrderStatus::Open);

        let filled = lifecycle.next().await.unwrap().unwrap();
        assert_eq!(filled.status, OrderStatus::Open);
        assert_eq!(filled.volume_executed, Some(Decimal::from(4)));

        let canceled = lifecycle.next().await.unwrap().unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert_eq!(canceled.volume_executed, Some(Decimal::from(4)));

        assert!(lifecycle.next().await.is_none());
    }

    #[tokio::test]
    async fn every_update_yields_a_snapshot() {
        let (mut exchange, tracker) = Exchange::new();
        let mut lifecycle = tracker.add_order(&exchange.handle, request());

        exchange
            .answer(json!({"event": "addOrderStatus", "status": "ok", "txid": "X", "descr": "d"}))
            .await;
        for status in ["pending", "open", "open", "pending", "canceled"] {
            exchange.open_orders(json!([{"X": {"status": status}}]));
        }

        let mut statuses = Vec::new();
        while let Some(event) = lifecycle.next().await {
            statuses.push(event.unwrap().status);
        }

        assert_eq!(
            statuses,
            vec![
                OrderStatus::Submitted,
                OrderStatus::Pending,
                OrderStatus::Open,
                OrderStatus::Open,
                OrderStatus::Open,
                OrderStatus::Canceled,
            ]
        );
    }

    #[tokio::test]
    async fn rejected_order_yields_error() {
        let (mut exchange, tracker) = Exchange::new();
        let mut lifecycle = tracker.add_order(&exchange.handle, request());

        exchange
            .answer(json!({"event": "addOrderStatus", "status": "error", "errorMessage": "EOrder:Insufficient funds"}))
            .await;

        assert!(matches!(
            lifecycle.next().await,
            Some(Err(OrderError::Request(CorrelatorError::Rejected { message })))
                if message == "EOrder:Insufficient funds"
        ));
        assert!(lifecycle.next().await.is_none());
    }

    #[tokio::test]
    async fn connection_close_ends_tracking() {
        let (mut exchange, tracker) = Exchange::new();
        let mut lifecycle = tracker.add_order(&exchange.handle, request());

        exchange
            .answer(json!({"event": "addOrderStatus", "status": "ok", "txid": "X", "descr": "d"}))
            .await;
        exchange.publish(Envelope::Status(ConnectionStatus::Closed));

        assert!(lifecycle.next().await.unwrap().is_ok());
        assert!(matches!(
            lifecycle.next().await,
            Some(Err(OrderError::ConnectionClosed { connection: 1, order_id })) if order_id == "X"
        ));
    }

    #[tokio::test]
    async fn cancel_order_checks_status() {
        let (mut exchange, tracker) = Exchange::new();

        let handle = exchange.handle.clone();
        let cancel = tracker.cancel_order(&handle, ["X"]);
        let server = exchange.answer(json!({"event": "cancelOrderStatus", "status": "ok"}));
        let (result, sent) = tokio::join!(cancel, server);

        result.unwrap();
        assert_eq!(sent["event"], "cancelOrder");
        assert_eq!(sent["txid"], json!(["X"]));
    }

    #[test]
    fn updates_only_for_requested_order() {
        let message = ChannelMessage::from_value(&json!([
            [{"A": {"status": "open"}}, {"B": {"status": "closed"}}],
            "openOrders",
            {"sequence": 1}
        ]))
        .unwrap();

        let updates: Vec<_> = updates_for(&message, "B").collect();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, Some(OrderStatus::Closed));
    }

    #[tokio::test]
    async fn order_ids_grow_with_new_entries() {
        let frame = |entries: Value, sequence: u64| {
            ChannelMessage::from_value(&json!([entries, "ownTrades", {"sequence": sequence}])).unwrap()
        };
        let messages = futures::stream::iter(vec![
            frame(json!([]), 1),
            frame(json!([{"A": {}}, {"B": {}}]), 2),
            frame(json!([{"A": {"vol_exec": "1"}}]), 3),
            frame(json!([{"C": {}}]), 4),
        ]);

        let sets: Vec<Vec<String>> = order_ids(messages)
            .map(|ids| ids.into_iter().collect())
            .collect()
            .await;

        assert_eq!(
            sets,
            vec![
                vec![],
                vec!["A".to_owned(), "B".to_owned()],
                vec!["A".to_owned(), "B".to_owned(), "C".to_owned()],
            ]
        );
    }
}
