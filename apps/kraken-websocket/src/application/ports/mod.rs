//! Port Interfaces
//!
//! Defines the interfaces (ports) the connection engine is written
//! against. Adapters live in the infrastructure layer.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: opens one duplex text-frame connection to a URL
//! - `TokenProvider`: fetches the WebSocket token for private endpoints
//! - `IdGenerator`: produces request correlation ids

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Transport
// =============================================================================

/// Errors raised while opening a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The connection failed after it was established.
    #[error("transport error: {0}")]
    Failed(String),

    /// The peer closed the connection.
    #[error("connection closed (code {code:?}): {reason}")]
    Closed {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
}

/// Events surfaced by an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The transport failed.
    Error(String),
    /// The transport closed.
    Closed {
        /// Close code, if any.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
}

/// One open transport connection.
///
/// Owns the inbound event stream. Dropping the session closes the
/// connection; outbound senders cloned from it can still be used to
/// enqueue frames but can never close it.
#[derive(Debug)]
pub struct TransportSession {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
}

impl TransportSession {
    /// Assemble a session from its channels.
    ///
    /// `shutdown` is cancelled when the session is dropped; the adapter
    /// must close the underlying connection when it fires.
    #[must_use]
    pub const fn new(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            events,
            shutdown,
        }
    }

    /// Sender for outbound text frames.
    #[must_use]
    pub fn outbound(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Wait for the next transport event.
    ///
    /// Returns `None` once the adapter dropped its event sender.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Opens transport connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`.
    async fn open(&self, url: &str) -> Result<TransportSession, TransportError>;
}

// =============================================================================
// Token Provider
// =============================================================================

/// Errors raised while acquiring a WebSocket token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// No token could be obtained.
    #[error("token unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the authentication token for private endpoints.
///
/// Invoked at most once per connection, on the first private send.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a token.
    async fn fetch_token(&self) -> Result<String, TokenError>;
}

// =============================================================================
// Request Ids
// =============================================================================

/// Generates request correlation ids.
pub trait IdGenerator: Send + Sync {
    /// Produce the next candidate id.
    fn next_id(&self) -> u64;
}
