//! Channel Subscriber
//!
//! Turns a subscription intent into a stream of channel messages that
//! follows the engine across reconnects.
//!
//! # Lifecycle
//!
//! For every live [`ConnectionHandle`] a [`ScopedSubscription`] is created:
//! it sends `subscribe` on that handle through the correlator, waits for the
//! matching `subscriptionStatus`, yields the matching frames from that
//! handle only, and sends exactly one `unsubscribe` when it is dropped or
//! when its connection closes. A newer handle replaces the current scope
//! (the old scope is released first). Private channels are additionally
//! sequence-guarded and resubscribe after a gap.
//!
//! # Sharing
//!
//! [`ChannelSubscriber::attach`] goes through the engine's
//! [`ChannelRegistry`]: consumers of the same intent share one
//! [`ChannelFeed`], so each connection carries at most one subscription per
//! intent. The feed is released when its last [`ChannelStream`] is dropped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::connection::{ConnectionEngine, ConnectionHandle, ConnectionStatus, Envelope, SendError};
use super::correlator::{Correlator, CorrelatorError, ResponseStatuses, response_ok};
use super::sequence::{GapDetected, recover_on_gap};
use crate::domain::channel::{ChannelMessage, SubscriptionIntent};
use crate::infrastructure::broadcast::{BundleStream, HandleStream, SharedBroadcastHub};
use crate::infrastructure::metrics;

/// `status` values of a `subscriptionStatus` answer.
const SUBSCRIPTION_STATUSES: ResponseStatuses = ResponseStatuses {
    good: "subscribed",
    bad: "error",
};

// =============================================================================
// Error Types
// =============================================================================

/// Errors yielded by a channel stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// A private channel skipped a sequence number.
    #[error(transparent)]
    Gap(#[from] GapDetected),

    /// A sequence-guarded frame had no sequence number.
    #[error("frame on {channel} has no sequence number")]
    MissingSequence {
        /// Channel the frame arrived on.
        channel: String,
    },

    /// The subscribe frame could not be sent.
    #[error("subscribe failed: {0}")]
    Send(#[from] SendError),

    /// The exchange refused the subscription.
    #[error("subscription to {channel} rejected: {message}")]
    Rejected {
        /// Channel that was refused.
        channel: String,
        /// `errorMessage` from the `subscriptionStatus`.
        message: String,
    },

    /// No `subscriptionStatus` arrived in time.
    #[error("subscription to {channel} not confirmed within {after:?}")]
    Timeout {
        /// Channel that was requested.
        channel: String,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// Any other failure of the subscribe request.
    #[error("subscribe request failed: {0}")]
    Request(CorrelatorError),
}

impl ChannelError {
    /// Whether resubscribing can fix this.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Gap(_) | Self::Send(_) | Self::Timeout { .. })
    }

    fn from_request(channel: &str, error: CorrelatorError) -> Self {
        match error {
            CorrelatorError::Send(e) => Self::Send(e),
            CorrelatorError::Rejected { message } => Self::Rejected {
                channel: channel.to_owned(),
                message,
            },
            CorrelatorError::Timeout { after, .. } => Self::Timeout {
                channel: channel.to_owned(),
                after,
            },
            other => Self::Request(other),
        }
    }

    /// Whether the exchange may still hold the subscription after this.
    const fn may_be_subscribed(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Request(_))
    }
}

/// Item of every channel stream.
pub type ChannelItem = Result<ChannelMessage, ChannelError>;

/// Boxed channel stream bound to one connection.
pub type ChannelSource = Pin<Box<dyn Stream<Item = ChannelItem> + Send>>;

/// Extra step run after a sequence gap, before resubscribing.
pub type GapRecovery = Arc<dyn Fn(GapDetected) -> BoxFuture<'static, ()> + Send + Sync>;

// =============================================================================
// Channel Subscriber
// =============================================================================

/// Description of one channel subscription.
///
/// # Example
///
/// ```rust
/// use kraken_websocket::infrastructure::kraken::ChannelSubscriber;
///
/// let ticker = ChannelSubscriber::new("ticker").with_pair("XBT/USD");
/// let frame = ticker.intent().to_frame();
/// assert_eq!(frame["event"], "subscribe");
/// assert_eq!(frame["pair"][0], "XBT/USD");
/// ```
#[derive(Clone)]
pub struct ChannelSubscriber {
    channel: String,
    pair: Option<String>,
    params: Map<String, Value>,
    recovery: Option<GapRecovery>,
}

impl ChannelSubscriber {
    /// Subscribe to `channel` with no pair and no parameters.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pair: None,
            params: Map::new(),
            recovery: None,
        }
    }

    /// Restrict to one pair.
    #[must_use]
    pub fn with_pair(mut self, pair: impl Into<String>) -> Self {
        self.pair = Some(pair.into());
        self
    }

    /// Replace the extra subscription parameters.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Add one subscription parameter such as `depth` or `interval`.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Run `recovery` after every sequence gap, before resubscribing.
    ///
    /// Consumers sharing a feed use the recovery of the one that started it.
    #[must_use]
    pub fn with_gap_recovery<F, Fut>(mut self, recovery: F) -> Self
    where
        F: Fn(GapDetected) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.recovery = Some(Arc::new(move |gap| Box::pin(recovery(gap))));
        self
    }

    /// Channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Pair, if restricted.
    #[must_use]
    pub fn pair(&self) -> Option<&str> {
        self.pair.as_deref()
    }

    /// The subscribe intent sent on each connection.
    #[must_use]
    pub fn intent(&self) -> SubscriptionIntent {
        SubscriptionIntent::subscribe(self.channel.clone(), self.pair.clone(), self.params.clone())
    }

    /// Follow the live connections of `engine`, sharing the feed with every
    /// other consumer of the same intent.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn attach(&self, engine: &ConnectionEngine) -> ChannelStream {
        engine
            .channels()
            .join(self, || self.feed(engine.handles(), engine.hub(), engine.correlator()))
    }

    /// Follow `handles` with a feed of its own, reading from `hub`.
    #[must_use]
    pub fn feed(
        &self,
        handles: HandleStream,
        hub: SharedBroadcastHub,
        correlator: Correlator,
    ) -> ChannelFeed {
        ChannelFeed {
            subscriber: self.clone(),
            hub,
            correlator,
            handles,
            handles_done: false,
            current: None,
        }
    }

    /// Subscribe on one connection only.
    #[must_use]
    pub fn scope(
        &self,
        handle: ConnectionHandle,
        bundles: BundleStream,
        correlator: &Correlator,
    ) -> ScopedSubscription {
        ScopedSubscription::open(handle, self.intent(), bundles, correlator)
    }

    fn source(
        &self,
        handle: ConnectionHandle,
        hub: &SharedBroadcastHub,
        correlator: &Correlator,
    ) -> ChannelSource {
        if !handle.is_private() {
            return Box::pin(self.scope(handle, hub.bundle_stream(), correlator));
        }

        let subscriber = self.clone();
        let bundles = Arc::clone(hub);
        let requests = correlator.clone();
        let factory = move || subscriber.scope(handle.clone(), bundles.bundle_stream(), &requests);

        let channel = self.channel.clone();
        let custom = self.recovery.clone();
        let recovery = move |gap: GapDetected| -> BoxFuture<'static, ()> {
            tracing::warn!(
                channel = %channel,
                expected = gap.expected,
                actual = gap.actual,
                "Sequence gap, resubscribing"
            );
            metrics::record_sequence_gap(&channel);
            match &custom {
                Some(recover) => recover(gap),
                None => Box::pin(futures::future::ready(())),
            }
        };

        Box::pin(recover_on_gap(factory, recovery))
    }
}

impl fmt::Debug for ChannelSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscriber")
            .field("channel", &self.channel)
            .field("pair", &self.pair)
            .field("params", &self.params)
            .field("gap_recovery", &self.recovery.is_some())
            .finish()
    }
}

// =============================================================================
// Scoped Subscription
// =============================================================================

/// A subscription bound to a single connection.
///
/// Ends when its connection closes or the subscription is refused.
/// Dropping it sends `unsubscribe` unless that already happened.
pub struct ScopedSubscription {
    handle: ConnectionHandle,
    intent: SubscriptionIntent,
    bundles: BundleStream,
    confirm: Option<BoxFuture<'static, Result<(), ChannelError>>>,
    owed: bool,
    subscribed: bool,
    done: bool,
}

impl ScopedSubscription {
    /// Start listening on `bundles` and request the subscription on
    /// `handle`.
    ///
    /// The subscribe frame goes out on first poll, carrying a `reqid` from
    /// `correlator`. Nothing is sent when `handle` is already closed.
    #[must_use]
    pub fn open(
        handle: ConnectionHandle,
        intent: SubscriptionIntent,
        bundles: BundleStream,
        correlator: &Correlator,
    ) -> Self {
        // a close published before `bundles` attached is only visible here
        let done = handle.is_closed();
        let confirm = if done {
            tracing::debug!(
                connection = handle.id(),
                channel = %intent.channel,
                "Connection already closed, not subscribing"
            );
            None
        } else {
            let request = confirm(correlator.clone(), handle.clone(), intent.clone());
            Some(Box::pin(request) as BoxFuture<'static, _>)
        };

        Self {
            handle,
            intent,
            bundles,
            confirm,
            owed: false,
            subscribed: false,
            done,
        }
    }

    /// Connection this scope is bound to.
    #[must_use]
    pub const fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Whether the subscription was confirmed and `unsubscribe` has not been
    /// sent.
    #[must_use]
    pub const fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    fn mark_subscribed(&mut self) {
        self.subscribed = true;
        metrics::subscription_opened(&self.intent.channel);
        tracing::debug!(
            connection = self.handle.id(),
            channel = %self.intent.channel,
            pair = ?self.intent.pair,
            "Subscribed"
        );
    }

    fn finish(&mut self) {
        self.done = true;
        self.release();
    }

    fn release(&mut self) {
        if self.subscribed {
            self.subscribed = false;
            metrics::subscription_closed(&self.intent.channel);
        }
        if !self.owed {
            return;
        }
        self.owed = false;

        match self.handle.send_now(self.intent.inverse().to_frame()) {
            Ok(()) => tracing::debug!(
                connection = self.handle.id(),
                channel = %self.intent.channel,
                "Unsubscribed"
            ),
            Err(e) => tracing::debug!(
                connection = self.handle.id(),
                channel = %self.intent.channel,
                error = %e,
                "Unsubscribe not delivered"
            ),
        }
    }
}

/// Send the subscribe frame and wait for its `subscriptionStatus`.
async fn confirm(
    correlator: Correlator,
    handle: ConnectionHandle,
    intent: SubscriptionIntent,
) -> Result<(), ChannelError> {
    let response = tokio::select! {
        response = correlator.request(&handle, intent.to_frame()) => {
            response.map_err(|e| ChannelError::from_request(&intent.channel, e))?
        }
        () = handle.closed() => return Err(SendError::Closed(handle.id()).into()),
    };
    response_ok(&response, &SUBSCRIPTION_STATUSES)
        .map_err(|e| ChannelError::from_request(&intent.channel, e))?;
    Ok(())
}

impl Stream for ScopedSubscription {
    type Item = ChannelItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChannelItem>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(confirm) = this.confirm.as_mut() {
            // the frame leaves on the first poll
            this.owed = true;
            let confirmed = ready!(confirm.as_mut().poll(cx));
            this.confirm = None;
            match confirmed {
                Ok(()) => this.mark_subscribed(),
                Err(e) => {
                    this.owed = e.may_be_subscribed();
                    this.finish();
                    tracing::warn!(
                        connection = this.handle.id(),
                        channel = %this.intent.channel,
                        error = %e,
                        "Subscribe failed"
                    );
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }

        loop {
            let Some(bundle) = ready!(this.bundles.as_mut().poll_next(cx)) else {
                this.finish();
                return Poll::Ready(None);
            };
            if bundle.handle != this.handle {
                continue;
            }
            match &bundle.envelope {
                Envelope::Status(ConnectionStatus::Closed) => {
                    this.finish();
                    return Poll::Ready(None);
                }
                Envelope::Message(value) => {
                    if let Some(message) = ChannelMessage::from_value(value)
                        && message.matches(&this.intent.channel, this.intent.pair.as_deref())
                    {
                        return Poll::Ready(Some(Ok(message)));
                    }
                }
                Envelope::Status(_) | Envelope::Heartbeat => {}
            }
        }
    }
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ScopedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSubscription")
            .field("connection", &self.handle.id())
            .field("intent", &self.intent)
            .field("confirming", &self.confirm.is_some())
            .field("subscribed", &self.subscribed)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Channel Feed
// =============================================================================

/// Channel messages from whichever connection is live, for one consumer.
///
/// Ends only when the handle stream ends and the current scope is done.
pub struct ChannelFeed {
    subscriber: ChannelSubscriber,
    hub: SharedBroadcastHub,
    correlator: Correlator,
    handles: HandleStream,
    handles_done: bool,
    current: Option<ChannelSource>,
}

impl Stream for ChannelFeed {
    type Item = ChannelItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChannelItem>> {
        let this = &mut *self;
        loop {
            if !this.handles_done {
                match this.handles.as_mut().poll_next(cx) {
                    Poll::Ready(Some(handle)) => {
                        tracing::debug!(
                            channel = %this.subscriber.channel,
                            connection = handle.id(),
                            "Binding subscription to connection"
                        );
                        // old scope unsubscribes before the new one subscribes
                        this.current = None;
                        this.current =
                            Some(this.subscriber.source(handle, &this.hub, &this.correlator));
                        continue;
                    }
                    Poll::Ready(None) => this.handles_done = true,
                    Poll::Pending => {}
                }
            }

            let Some(source) = this.current.as_mut() else {
                return if this.handles_done {
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                };
            };

            match source.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => this.current = None,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl fmt::Debug for ChannelFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFeed")
            .field("subscriber", &self.subscriber)
            .field("bound", &self.current.is_some())
            .field("handles_done", &self.handles_done)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Shared Feeds
// =============================================================================

type Feeds = Mutex<HashMap<String, Weak<SharedFeed>>>;

/// Live channel feeds of one engine, keyed by subscribe intent.
#[derive(Clone)]
pub struct ChannelRegistry {
    feeds: Arc<Feeds>,
    capacity: usize,
}

impl ChannelRegistry {
    /// Registry whose feeds buffer up to `capacity` items per consumer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            feeds: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Number of feeds with at least one consumer.
    #[must_use]
    pub fn live(&self) -> usize {
        self.feeds
            .lock()
            .values()
            .filter(|feed| feed.strong_count() > 0)
            .count()
    }

    /// Join the feed for `subscriber`'s intent, starting it with `start` if
    /// none is running.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn join(
        &self,
        subscriber: &ChannelSubscriber,
        start: impl FnOnce() -> ChannelFeed,
    ) -> ChannelStream {
        let key = subscriber.intent().to_frame().to_string();

        // declared before the guard so a dead feed is dropped after unlocking
        let stale: Option<Arc<SharedFeed>>;
        let mut feeds = self.feeds.lock();
        match feeds.get(&key).and_then(Weak::upgrade) {
            Some(feed) => match feed.items.upgrade() {
                Some(items) => {
                    let rx = items.subscribe();
                    drop(feeds);
                    tracing::debug!(channel = %feed.channel, "Joining shared channel feed");
                    return ChannelStream::new(feed, rx);
                }
                None => stale = Some(feed),
            },
            None => stale = None,
        }

        let (tx, rx) = broadcast::channel(self.capacity);
        let stop = CancellationToken::new();
        let feed = Arc::new(SharedFeed {
            key: key.clone(),
            channel: subscriber.channel.clone(),
            items: tx.downgrade(),
            feeds: Arc::downgrade(&self.feeds),
            _pump: stop.clone().drop_guard(),
        });
        feeds.insert(key, Arc::downgrade(&feed));
        drop(feeds);
        drop(stale);

        tracing::debug!(channel = %subscriber.channel, "Starting shared channel feed");
        tokio::spawn(pump(start(), tx, stop));
        ChannelStream::new(feed, rx)
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(4_096)
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("live", &self.live())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// One running feed; the pump stops when the last holder drops it.
struct SharedFeed {
    key: String,
    channel: String,
    items: broadcast::WeakSender<ChannelItem>,
    feeds: Weak<Feeds>,
    _pump: DropGuard,
}

impl Drop for SharedFeed {
    fn drop(&mut self) {
        if let Some(feeds) = self.feeds.upgrade() {
            let mut feeds = feeds.lock();
            if feeds.get(&self.key).is_some_and(|feed| feed.strong_count() == 0) {
                feeds.remove(&self.key);
            }
        }
        tracing::debug!(channel = %self.channel, "Last consumer gone, releasing channel feed");
    }
}

async fn pump(
    mut feed: ChannelFeed,
    items: broadcast::Sender<ChannelItem>,
    stop: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            () = stop.cancelled() => break,
            item = feed.next() => item,
        };
        let Some(item) = item else {
            break;
        };
        let _ = items.send(item);
    }
}

/// A consumer's view of a shared channel feed.
///
/// Ends when the feed ends. Dropping the last stream of a feed releases its
/// subscription.
pub struct ChannelStream {
    items: ChannelSource,
    feed: Arc<SharedFeed>,
}

impl ChannelStream {
    fn new(feed: Arc<SharedFeed>, rx: broadcast::Receiver<ChannelItem>) -> Self {
        let items =
            tokio_stream::StreamExt::filter_map(BroadcastStream::new(rx), |item| match item {
                Ok(item) => Some(item),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Channel consumer lagged, messages dropped");
                    metrics::record_lagged(skipped);
                    None
                }
            });
        Self {
            items: Box::pin(items),
            feed,
        }
    }

    /// Number of streams sharing this feed.
    #[must_use]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.feed)
    }
}

impl Stream for ChannelStream {
    type Item = ChannelItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ChannelItem>> {
        self.items.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStream")
            .field("channel", &self.feed.channel)
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}
