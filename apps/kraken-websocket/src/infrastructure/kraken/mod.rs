//! Kraken WebSocket Client
//!
//! Connection engines for the public (`wss://ws.kraken.com`) and private
//! (`wss://ws-auth.kraken.com`) endpoints, and the consumers built on top
//! of them.
//!
//! # Components
//!
//! - [`ConnectionEngine`]: reconnect loop publishing [`Bundle`]s and live
//!   [`ConnectionHandle`]s
//! - [`ChannelSubscriber`]: channel subscriptions that follow the live handle,
//!   are shared per intent and repair private sequence gaps
//! - [`Correlator`]: `reqid`-based request/response matching
//! - [`OrderTracker`]: order lifecycles from `addOrder` and `openOrders`
//!
//! # Usage
//!
//! ```ignore
//! let engine = Arc::new(ConnectionEngine::new(
//!     EngineConfig::public(),
//!     Arc::new(WebSocketTransport::new()),
//!     None,
//!     CancellationToken::new(),
//! ));
//! tokio::spawn(Arc::clone(&engine).run());
//!
//! let mut ticker = ChannelSubscriber::new("ticker").with_pair("XBT/USD").attach(&engine);
//! while let Some(message) = ticker.next().await {
//!     println!("{:?}", message?);
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod messages;
pub mod orders;
pub mod reconnect;
pub mod sequence;
pub mod subscriber;
pub mod transport;

pub use auth::{FnTokenProvider, StaticTokenProvider};
pub use codec::{CodecError, Frame, KrakenCodec};
pub use connection::{
    Bundle, ConnectionEngine, ConnectionHandle, ConnectionStatus, EndpointKind, EngineConfig,
    EngineError, Envelope, PRIVATE_URL, PUBLIC_URL, SendError,
};
pub use correlator::{
    Correlator, CorrelatorConfig, CorrelatorError, DEFAULT_REQUEST_TIMEOUT, RandomIdGenerator,
    ResponseStatuses, SequentialIdGenerator, response_ok,
};
pub use messages::{AddOrderRequest, AddOrderStatus, CancelOrderRequest, SystemStatus};
pub use orders::{OrderError, OrderEvent, OrderLifecycle, OrderTracker, order_ids};
pub use reconnect::{
    BackoffSchedule, Delays, ExponentialBackoff, ExponentialConfig, ReconnectConfig,
    ReconnectError, StabilityWatch,
};
pub use sequence::{GapDetected, InSequence, RecoverOnGap, SequenceGuard, in_sequence, recover_on_gap};
pub use subscriber::{
    ChannelError, ChannelFeed, ChannelItem, ChannelRegistry, ChannelSource, ChannelStream,
    ChannelSubscriber, GapRecovery, ScopedSubscription,
};
pub use transport::{MemoryPeer, MemoryTransport, WebSocketTransport};
