#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Kraken WebSocket - Persistent Streaming Client
//!
//! Keeps logical subscriptions to Kraken's v1 WebSocket API alive across
//! reconnects. Consumers describe what they want once; the engine replays
//! it on every new connection and tears it down when they stop listening.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure data types
//!   - `channel`: Subscription intents and channel frames
//!   - `order`: Order snapshots and the update fold
//!
//! - **Application**: Port definitions
//!   - `ports`: Transport, token and request id interfaces
//!
//! - **Infrastructure**: Adapters and ambient concerns
//!   - `kraken`: Connection engine, subscribers, correlator, order tracker
//!   - `broadcast`: Bundle and handle fan-out
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐  bundles  ┌──────────────────┐
//! Kraken WS ────────►│  Connection  │──────────►│ ChannelSubscriber│──► consumer
//!   (text frames)    │    Engine    │  handles  ├──────────────────┤
//!          ◄─────────│ (reconnects) │──────────►│    Correlator    │──► OrderTracker
//!   subscribe / req  └──────────────┘           └──────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Channel and order types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::channel::{ChannelMessage, SubscriptionDirection, SubscriptionIntent};
pub use domain::order::{Order, OrderSide, OrderStatus, OrderType, OrderUpdate};

// Ports
pub use application::ports::{
    IdGenerator, TokenError, TokenProvider, Transport, TransportError, TransportEvent,
    TransportSession,
};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ClientConfig, ConfigError, DemoOrder, Endpoints, ReconnectSettings,
    ScheduleKind, Token,
};

// Broadcast hub
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, BroadcastStats, BundleStream, HandleStream, SharedBroadcastHub,
};

// Kraken client
pub use infrastructure::kraken::{
    AddOrderRequest, BackoffSchedule, Bundle, CancelOrderRequest, ChannelError, ChannelFeed,
    ChannelRegistry, ChannelStream, ChannelSubscriber, ConnectionEngine, ConnectionHandle,
    ConnectionStatus, Correlator, CorrelatorConfig, CorrelatorError, EndpointKind, EngineConfig,
    EngineError, Envelope, FnTokenProvider, GapDetected, MemoryPeer, MemoryTransport, OrderError,
    OrderLifecycle, OrderTracker, RandomIdGenerator, ReconnectConfig, ScopedSubscription,
    SendError, SequentialIdGenerator, StabilityWatch, StaticTokenProvider, WebSocketTransport,
    order_ids,
};

// Metrics
pub use infrastructure::metrics::{MetricsError, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
