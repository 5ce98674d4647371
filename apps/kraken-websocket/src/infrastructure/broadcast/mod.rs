//! Broadcast Channel Adapters
//!
//! Fan-out of decoded frames to any number of independent consumers.
//!
//! # Architecture
//!
//! The `BroadcastHub` owns two channels:
//! - a `broadcast` channel of [`Bundle`]s, one per inbound frame or status
//!   change, each consumer buffering independently
//! - a `watch` channel holding the live [`ConnectionHandle`], so late
//!   subscribers see the current connection immediately
//!
//! A consumer that falls behind by more than the channel capacity loses
//! the oldest bundles; the loss is logged and counted, never propagated to
//! other consumers.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use super::kraken::connection::{Bundle, ConnectionHandle};
use super::metrics;
use crate::BroadcastSettings;

/// Stream of bundles; lagged gaps are skipped.
pub type BundleStream = Pin<Box<dyn Stream<Item = Bundle> + Send + 'static>>;

/// Stream of live connection handles.
pub type HandleStream = Pin<Box<dyn Stream<Item = ConnectionHandle> + Send + 'static>>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for broadcast channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Capacity of the bundle channel.
    pub bundle_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bundle_capacity: 4_096,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            bundle_capacity: settings.bundle_capacity,
        }
    }
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Snapshot of hub usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Active bundle receivers.
    pub bundle_receivers: usize,
    /// Id of the live connection, if any.
    pub live_connection: Option<u64>,
}

/// Central hub for one engine's fan-out.
///
/// # Example
///
/// ```rust
/// use kraken_websocket::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
///
/// let hub = BroadcastHub::new(BroadcastConfig::default());
/// let _rx = hub.bundles_rx();
/// assert_eq!(hub.stats().bundle_receivers, 1);
/// assert!(hub.current_handle().is_none());
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    bundles_tx: broadcast::Sender<Bundle>,
    handle_tx: watch::Sender<Option<ConnectionHandle>>,
}

impl BroadcastHub {
    /// Create a new broadcast hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            bundles_tx: broadcast::channel(config.bundle_capacity.max(1)).0,
            handle_tx: watch::channel(None).0,
        }
    }

    /// Create a new broadcast hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    // =========================================================================
    // Bundles
    // =========================================================================

    /// Send a bundle to all subscribers.
    ///
    /// Returns the number of receivers that got it, or `None` if there are
    /// no active receivers.
    #[must_use]
    pub fn send_bundle(&self, bundle: Bundle) -> Option<usize> {
        self.bundles_tx.send(bundle).ok()
    }

    /// Get a new receiver for bundles.
    #[must_use]
    pub fn bundles_rx(&self) -> broadcast::Receiver<Bundle> {
        self.bundles_tx.subscribe()
    }

    /// Get a stream of bundles published from now on.
    ///
    /// The subscription point is the moment of this call, not the first
    /// poll.
    #[must_use]
    pub fn bundle_stream(&self) -> BundleStream {
        let stream = BroadcastStream::new(self.bundles_rx()).filter_map(|item| match item {
            Ok(bundle) => Some(bundle),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Bundle consumer lagged, frames dropped");
                metrics::record_lagged(skipped);
                None
            }
        });
        Box::pin(stream)
    }

    /// Get the number of active bundle receivers.
    #[must_use]
    pub fn bundle_receiver_count(&self) -> usize {
        self.bundles_tx.receiver_count()
    }

    // =========================================================================
    // Live Handle
    // =========================================================================

    /// Replace the live handle.
    pub fn publish_handle(&self, handle: Option<ConnectionHandle>) {
        self.handle_tx.send_replace(handle);
    }

    /// The live handle, if any.
    #[must_use]
    pub fn current_handle(&self) -> Option<ConnectionHandle> {
        self.handle_tx.borrow().clone()
    }

    /// Get a receiver for live handle changes.
    #[must_use]
    pub fn handles_rx(&self) -> watch::Receiver<Option<ConnectionHandle>> {
        self.handle_tx.subscribe()
    }

    /// Get a stream of live handles, starting with the current one.
    ///
    /// Intermediate handles may be skipped if several connections open
    /// between two polls; only the latest matters.
    #[must_use]
    pub fn handle_stream(&self) -> HandleStream {
        Box::pin(WatchStream::new(self.handles_rx()).filter_map(|handle| handle))
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Get usage statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            bundle_receivers: self.bundles_tx.receiver_count(),
            live_connection: self.handle_tx.borrow().as_ref().map(ConnectionHandle::id),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Shared reference to a broadcast hub.
pub type SharedBroadcastHub = Arc<BroadcastHub>;
