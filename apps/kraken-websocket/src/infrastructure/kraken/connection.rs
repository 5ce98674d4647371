//! Connection Engine
//!
//! Owns one logical connection to a Kraken endpoint. Each physical
//! transport instance is represented by a [`ConnectionHandle`]; every
//! decoded frame is published on the broadcast hub together with the handle
//! it arrived on.
//!
//! # Reconnect State Machine
//!
//! ```text
//! Connecting(delay) ──open──► Active ──stability watch fires──► Stable
//!        ▲                      │                                 │
//!        └──── next delay ◄─────┴────── error / close ◄───────────┘
//! ```
//!
//! The first attempt starts immediately. Each failure draws the next delay
//! from the schedule; a connection that outlives the stability watch
//! restarts the schedule from its first value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, KrakenCodec};
use super::correlator::{Correlator, CorrelatorConfig, RandomIdGenerator};
use super::reconnect::{Delays, ReconnectConfig, ReconnectError};
use super::subscriber::ChannelRegistry;
use crate::application::ports::{
    IdGenerator, TokenError, TokenProvider, Transport, TransportError, TransportEvent,
};
use crate::infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, BundleStream, HandleStream, SharedBroadcastHub,
};
use crate::infrastructure::metrics::{self, FrameKind};

/// Public market data endpoint.
pub const PUBLIC_URL: &str = "wss://ws.kraken.com";

/// Authenticated endpoint.
pub const PRIVATE_URL: &str = "wss://ws-auth.kraken.com";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that end the engine's run loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A connection attempt or an open connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The reconnect schedule gave up.
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

/// Errors raised when sending on a handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The transport behind the handle is gone.
    #[error("connection {0} is closed")]
    Closed(u64),

    /// A private handle has no token provider.
    #[error("connection {0} is private but has no token provider")]
    MissingTokenProvider(u64),

    /// The token for a private handle has not been fetched yet.
    #[error("connection {0} has no token yet")]
    TokenPending(u64),

    /// Fetching the token failed.
    #[error(transparent)]
    Token(#[from] TokenError),
}

// =============================================================================
// Endpoint Kind
// =============================================================================

/// Which Kraken endpoint a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Market data, no authentication.
    Public,
    /// Account data and trading, requires a token.
    Private,
}

impl EndpointKind {
    /// Default URL for this endpoint.
    #[must_use]
    pub const fn default_url(self) -> &'static str {
        match self {
            Self::Public => PUBLIC_URL,
            Self::Private => PRIVATE_URL,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

/// One physical connection and its lazily fetched token.
///
/// Cheap to clone. Holders can send frames but cannot close the transport.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    kind: EndpointKind,
    outbound: mpsc::UnboundedSender<String>,
    token: OnceCell<String>,
    tokens: Option<Arc<dyn TokenProvider>>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle over an outbound frame sender.
    #[must_use]
    pub fn new(
        id: u64,
        kind: EndpointKind,
        outbound: mpsc::UnboundedSender<String>,
        tokens: Option<Arc<dyn TokenProvider>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                kind,
                outbound,
                token: OnceCell::new(),
                tokens,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Connection id, unique per engine.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Endpoint kind.
    #[must_use]
    pub fn kind(&self) -> EndpointKind {
        self.inner.kind
    }

    /// Whether frames on this handle carry a token.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.inner.kind == EndpointKind::Private
    }

    /// Whether the transport behind this handle has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Wait until the transport behind this handle goes away.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub(crate) fn invalidate(&self) {
        self.inner.closed.cancel();
    }

    /// Token for this connection, fetching it on first use.
    ///
    /// Concurrent callers share a single in-flight fetch.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no provider or the fetch fails.
    pub async fn token(&self) -> Result<&str, SendError> {
        let provider = self
            .inner
            .tokens
            .as_ref()
            .ok_or(SendError::MissingTokenProvider(self.inner.id))?;
        let token = self
            .inner
            .token
            .get_or_try_init(|| async {
                tracing::debug!(connection = self.inner.id, "Fetching WebSocket token");
                provider.fetch_token().await
            })
            .await?;
        Ok(token.as_str())
    }

    /// Send a JSON frame, injecting the token on private connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be obtained or the transport is
    /// gone.
    pub async fn send(&self, payload: Value) -> Result<(), SendError> {
        if self.is_private() {
            let token = self.token().await?;
            let payload = inject_token(payload, token);
            return self.push(&payload);
        }
        self.push(&payload)
    }

    /// Send without waiting.
    ///
    /// Private connections only succeed once the token is cached, which is
    /// always the case after a successful [`ConnectionHandle::send`].
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not cached yet or the transport is
    /// gone.
    pub fn send_now(&self, payload: Value) -> Result<(), SendError> {
        if self.is_private() {
            let token = self
                .inner
                .token
                .get()
                .ok_or(SendError::TokenPending(self.inner.id))?;
            return self.push(&inject_token(payload, token));
        }
        self.push(&payload)
    }

    fn push(&self, payload: &Value) -> Result<(), SendError> {
        tracing::debug!(connection = self.inner.id, frame = %redact(payload), "Queueing frame");
        self.inner
            .outbound
            .send(payload.to_string())
            .map_err(|_| SendError::Closed(self.inner.id))
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("token", &self.inner.token.get().map(|_| "[REDACTED]"))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Put the token into `subscription` when present, else at the top level.
fn inject_token(mut payload: Value, token: &str) -> Value {
    let Some(object) = payload.as_object_mut() else {
        return payload;
    };
    let token = Value::String(token.to_owned());
    if object.get("subscription").is_some_and(Value::is_object) {
        if let Some(Value::Object(subscription)) = object.get_mut("subscription") {
            subscription.insert("token".to_owned(), token);
        }
    } else {
        object.insert("token".to_owned(), token);
    }
    payload
}

fn redact(payload: &Value) -> Value {
    let mut copy = payload.clone();
    if let Some(object) = copy.as_object_mut() {
        if object.contains_key("token") {
            object.insert("token".to_owned(), Value::from("[REDACTED]"));
        }
        if let Some(Value::Object(subscription)) = object.get_mut("subscription")
            && subscription.contains_key("token")
        {
            subscription.insert("token".to_owned(), Value::from("[REDACTED]"));
        }
    }
    copy
}

// =============================================================================
// Envelopes
// =============================================================================

/// Connection-level status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The transport opened.
    Opened,
    /// The transport closed or failed.
    Closed,
    /// `systemStatus` from the exchange.
    System(String),
}

/// One decoded inbound unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Status change.
    Status(ConnectionStatus),
    /// Exchange heartbeat.
    Heartbeat,
    /// Any other frame.
    Message(Arc<Value>),
}

/// An envelope tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Source connection.
    pub handle: ConnectionHandle,
    /// Decoded content.
    pub envelope: Envelope,
}

impl Bundle {
    /// Whether this bundle reports that its connection closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.envelope == Envelope::Status(ConnectionStatus::Closed)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Configuration for a connection engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Endpoint kind.
    pub kind: EndpointKind,
    /// URL to connect to.
    pub url: String,
    /// Reconnect behavior.
    pub reconnect: ReconnectConfig,
    /// Fan-out buffer sizes.
    pub broadcast: BroadcastConfig,
    /// Request timeout of the engine's correlator.
    pub correlator: CorrelatorConfig,
}

impl EngineConfig {
    /// Public endpoint with default settings.
    #[must_use]
    pub fn public() -> Self {
        Self::for_kind(EndpointKind::Public)
    }

    /// Private endpoint with default settings.
    #[must_use]
    pub fn private() -> Self {
        Self::for_kind(EndpointKind::Private)
    }

    fn for_kind(kind: EndpointKind) -> Self {
        Self {
            kind,
            url: kind.default_url().to_owned(),
            reconnect: ReconnectConfig::default(),
            broadcast: BroadcastConfig::default(),
            correlator: CorrelatorConfig::default(),
        }
    }

    /// Override the URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Override the reconnect behavior.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Override the fan-out buffer sizes.
    #[must_use]
    pub const fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Override the correlator settings.
    #[must_use]
    pub const fn with_correlator(mut self, correlator: CorrelatorConfig) -> Self {
        self.correlator = correlator;
        self
    }
}

/// Keeps one logical connection alive and fans its frames out.
pub struct ConnectionEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    tokens: Option<Arc<dyn TokenProvider>>,
    hub: SharedBroadcastHub,
    codec: KrakenCodec,
    cancel: CancellationToken,
    next_handle_id: AtomicU64,
    ids: Arc<dyn IdGenerator>,
    correlator: OnceLock<Correlator>,
    channels: ChannelRegistry,
}

impl fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("config", &self.config)
            .field("hub", &self.hub.stats())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ConnectionEngine {
    /// Create an engine. Nothing connects until [`ConnectionEngine::run`].
    #[must_use]
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        tokens: Option<Arc<dyn TokenProvider>>,
        cancel: CancellationToken,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.broadcast));
        let channels = ChannelRegistry::new(config.broadcast.bundle_capacity);
        Self {
            config,
            transport,
            tokens,
            hub,
            codec: KrakenCodec::new(),
            cancel,
            next_handle_id: AtomicU64::new(1),
            ids: Arc::new(RandomIdGenerator),
            correlator: OnceLock::new(),
            channels,
        }
    }

    /// Use `ids` for the `reqid` of the engine's requests.
    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fan-out hub shared with subscribers and the correlator.
    #[must_use]
    pub fn hub(&self) -> SharedBroadcastHub {
        Arc::clone(&self.hub)
    }

    /// Receiver of every bundle published from now on.
    #[must_use]
    pub fn bundles(&self) -> broadcast::Receiver<Bundle> {
        self.hub.bundles_rx()
    }

    /// Stream of every bundle published from now on.
    #[must_use]
    pub fn bundle_stream(&self) -> BundleStream {
        self.hub.bundle_stream()
    }

    /// Correlator reading this engine's bundles, created on first use.
    ///
    /// Must first be called inside a Tokio runtime.
    #[must_use]
    pub fn correlator(&self) -> Correlator {
        self.correlator
            .get_or_init(|| {
                Correlator::new(
                    self.hub.bundle_stream(),
                    Arc::clone(&self.ids),
                    self.config.correlator,
                )
            })
            .clone()
    }

    /// Channel feeds shared by every subscriber of this engine.
    #[must_use]
    pub const fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Stream of live handles, starting with the current one if any.
    #[must_use]
    pub fn handles(&self) -> HandleStream {
        self.hub.handle_stream()
    }

    /// The live handle, if connected.
    #[must_use]
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        self.hub.current_handle()
    }

    /// Stop the engine and close the transport.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the reconnect loop until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only when a finite schedule runs out of delays.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        let kind = self.config.kind.as_str();
        let mut delays = self.config.reconnect.schedule.start();
        let mut failures: u32 = 0;

        tracing::info!(
            endpoint = kind,
            url = %self.config.url,
            schedule = self.config.reconnect.schedule.name(),
            "Starting connection engine"
        );

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(endpoint = kind, "Connection engine cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut delays, &mut failures).await {
                Ok(()) => {
                    tracing::info!(endpoint = kind, "Connection engine stopped");
                    return Ok(());
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(endpoint = kind, error = %e, failures, "Connection failed");
                    metrics::record_reconnect(kind);

                    let Some(delay) = delays.next() else {
                        tracing::error!(endpoint = kind, failures, "Reconnect schedule exhausted");
                        return Err(ReconnectError::ScheduleExhausted(failures).into());
                    };

                    tracing::info!(
                        endpoint = kind,
                        delay_ms = delay.as_millis(),
                        "Reconnecting"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!(endpoint = kind, "Cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Open one transport and pump it until it fails or the engine stops.
    ///
    /// Returns `Ok(())` only on cancellation.
    async fn connect_and_run(
        &self,
        delays: &mut Delays,
        failures: &mut u32,
    ) -> Result<(), EngineError> {
        let kind = self.config.kind;
        tracing::info!(endpoint = kind.as_str(), url = %self.config.url, "Connecting");

        let mut session = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            opened = self.transport.open(&self.config.url) => opened?,
        };

        let handle = ConnectionHandle::new(
            self.next_handle_id.fetch_add(1, Ordering::Relaxed),
            kind,
            session.outbound(),
            self.tokens.clone(),
        );
        tracing::info!(endpoint = kind.as_str(), connection = handle.id(), "Connected");
        metrics::set_connected(kind.as_str(), true);

        self.hub.publish_handle(Some(handle.clone()));
        self.publish(&handle, Envelope::Status(ConnectionStatus::Opened));

        let mut stability = self.config.reconnect.stability.arm();
        let mut stable = false;

        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                () = &mut stability, if !stable => {
                    stable = true;
                    *delays = self.config.reconnect.schedule.start();
                    *failures = 0;
                    metrics::record_stabilized(kind.as_str());
                    tracing::info!(
                        endpoint = kind.as_str(),
                        connection = handle.id(),
                        "Connection stable, backoff reset"
                    );
                }
                event = session.next_event() => match event {
                    Some(TransportEvent::Message(text)) => self.dispatch(&handle, &text),
                    Some(TransportEvent::Error(reason)) => {
                        break Err(TransportError::Failed(reason).into());
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        break Err(TransportError::Closed { code, reason }.into());
                    }
                    None => {
                        break Err(TransportError::Closed {
                            code: None,
                            reason: "transport dropped".to_owned(),
                        }
                        .into());
                    }
                },
            }
        };

        handle.invalidate();
        self.hub.publish_handle(None);
        self.publish(&handle, Envelope::Status(ConnectionStatus::Closed));
        metrics::set_connected(kind.as_str(), false);
        drop(session);

        result
    }

    fn dispatch(&self, handle: &ConnectionHandle, text: &str) {
        let endpoint = self.config.kind.as_str();
        match self.codec.decode(text) {
            Ok(Frame::Heartbeat) => {
                metrics::record_frame(endpoint, FrameKind::Heartbeat);
                self.publish(handle, Envelope::Heartbeat);
            }
            Ok(Frame::SystemStatus(status)) => {
                metrics::record_frame(endpoint, FrameKind::Status);
                tracing::info!(endpoint, connection = handle.id(), status = %status, "System status");
                self.publish(handle, Envelope::Status(ConnectionStatus::System(status)));
            }
            Ok(Frame::Message(value)) => {
                metrics::record_frame(endpoint, FrameKind::Message);
                self.publish(handle, Envelope::Message(Arc::new(value)));
            }
            Err(e) => {
                metrics::record_malformed_frame(endpoint);
                tracing::warn!(endpoint, connection = handle.id(), error = %e, "Dropping malformed frame");
            }
        }
    }

    fn publish(&self, handle: &ConnectionHandle, envelope: Envelope) {
        let _ = self.hub.send_bundle(Bundle {
            handle: handle.clone(),
            envelope,
        });
    }
}
