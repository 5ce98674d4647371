//! Transport Adapters
//!
//! [`WebSocketTransport`] speaks real WebSockets through
//! `tokio-tungstenite`. [`MemoryTransport`] hands every opened connection
//! to the caller as a scriptable [`MemoryPeer`], for tests and replay.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Transport, TransportError, TransportEvent, TransportSession};

// =============================================================================
// WebSocket Transport
// =============================================================================

/// `tokio-tungstenite` transport.
///
/// Each session runs one pump task that forwards outbound frames, answers
/// pings and reports inbound text, errors and closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, TransportError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(pump(ws_stream, outbound_rx, event_tx, shutdown.clone()));

        Ok(TransportSession::new(outbound_tx, event_rx, shutdown))
    }
}

async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                return;
            }
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    let _ = write.close().await;
                    return;
                };
                tracing::trace!(frame = %text, "Sending frame");
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    return;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                        tracing::info!(?code, reason = %reason, "Server sent close frame");
                        let _ = events.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_owned(),
                        });
                        return;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Memory Transport
// =============================================================================

/// In-process transport whose connections are driven by the caller.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refusals: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create a transport and the receiver of its peers.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let transport = Self {
            peers,
            refusals: Arc::new(AtomicUsize::new(0)),
        };
        (transport, peers_rx)
    }

    /// Fail the next `count` open attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, TransportError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect(format!("refused: {url}")));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let peer = MemoryPeer {
            url: url.to_owned(),
            received: outbound_rx,
            events: event_tx,
            shutdown: shutdown.clone(),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("memory transport dropped".to_owned()))?;

        Ok(TransportSession::new(outbound_tx, event_rx, shutdown))
    }
}

/// Server side of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    url: String,
    received: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

impl MemoryPeer {
    /// URL the client opened.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into()));
    }

    /// Deliver a JSON frame to the client.
    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: Option<u16>, reason: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    /// Fail the connection.
    pub fn fail(&self, error: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Error(error.into()));
    }

    /// Next frame the client sent.
    pub async fn recv(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Next frame the client sent, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Next already-sent frame, without waiting.
    pub fn try_recv_json(&mut self) -> Option<Value> {
        let text = self.received.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Whether the client dropped its session.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until the client drops its session.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn memory_session_round_trip() {
        let (transport, mut peers) = MemoryTransport::new();
        let mut session = transport.open("memory://test").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.url(), "memory://test");

        session.outbound().send(r#"{"event":"ping"}"#.to_owned()).unwrap();
        assert_eq!(peer.recv_json().await, Some(json!({"event": "ping"})));

        peer.send_text("hello");
        assert_eq!(
            session.next_event().await,
            Some(TransportEvent::Message("hello".to_owned()))
        );

        peer.close(Some(1000), "bye");
        assert_eq!(
            session.next_event().await,
            Some(TransportEvent::Closed {
                code: Some(1000),
                reason: "bye".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn dropping_session_closes_peer() {
        let (transport, mut peers) = MemoryTransport::new();
        let session = transport.open("memory://test").await.unwrap();
        let peer = peers.recv().await.unwrap();

        assert!(!peer.is_closed());
        drop(session);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn refusals_are_consumed() {
        let (transport, _peers) = MemoryTransport::new();
        transport.refuse_next(1);

        assert!(matches!(
            transport.open("memory://test").await,
            Err(TransportError::Connect(_))
        ));
        assert!(transport.open("memory://test").await.is_ok());
    }
}
