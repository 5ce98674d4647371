//! Kraken WebSocket Demo Binary
//!
//! Streams tickers from the public endpoint and, when a token is
//! configured, open orders from the private endpoint. With a demo order
//! configured it also places that order, follows it and cancels it once it
//! is open.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kraken-websocket
//! ```
//!
//! # Environment Variables
//!
//! - `KRAKEN_WS_PAIRS`: Comma-separated ticker pairs (default: XBT/USD)
//! - `KRAKEN_WS_TOKEN`: WebSocket token; enables the private engine
//! - `KRAKEN_WS_PUBLIC_URL` / `KRAKEN_WS_PRIVATE_URL`: Endpoint overrides
//! - `KRAKEN_WS_DEMO_ORDER`: `pair,side,volume,price` limit order to place
//!   and cancel (requires a token; this is a real order)
//! - `KRAKEN_WS_REQUEST_TIMEOUT_MS`: Request and subscription timeout (default: 5000)
//! - `KRAKEN_WS_RECONNECT_SCHEDULE`: kraken | exponential (default: kraken)
//! - `KRAKEN_WS_METRICS_PORT`: Prometheus metrics port, 0 to disable (default: 9090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use kraken_websocket::domain::channel::{OPEN_ORDERS, TICKER};
use kraken_websocket::infrastructure::broadcast::BroadcastConfig;
use kraken_websocket::infrastructure::telemetry;
use kraken_websocket::{
    AddOrderRequest, ChannelStream, ChannelSubscriber, ClientConfig, ConnectionEngine,
    CorrelatorConfig, DemoOrder, EngineConfig, OrderStatus, OrderTracker, ReconnectConfig,
    StaticTokenProvider, TokenProvider, Transport, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider is already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Kraken WebSocket client");

    let config = ClientConfig::from_env()?;
    log_config(&config);

    let metrics_addr = (config.metrics_port != 0)
        .then(|| SocketAddr::from(([0, 0, 0, 0], config.metrics_port)));
    init_metrics(metrics_addr)?;

    let shutdown_token = CancellationToken::new();
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new());
    let reconnect = ReconnectConfig::from_settings(&config.reconnect);
    let broadcast = BroadcastConfig::from(config.broadcast);
    let requests = CorrelatorConfig::from(&config);

    // Public engine
    let public = Arc::new(ConnectionEngine::new(
        EngineConfig::public()
            .with_url(config.endpoints.public_url.clone())
            .with_reconnect(reconnect.clone())
            .with_broadcast(broadcast)
            .with_correlator(requests),
        Arc::clone(&transport),
        None,
        shutdown_token.child_token(),
    ));
    spawn_engine(&public, "Public");

    for pair in &config.pairs {
        let stream = ChannelSubscriber::new(TICKER)
            .with_pair(pair.clone())
            .attach(&public);
        tokio::spawn(log_channel(stream));
    }

    // Private engine
    if let Some(token) = &config.token {
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(token.expose()));
        let private = Arc::new(ConnectionEngine::new(
            EngineConfig::private()
                .with_url(config.endpoints.private_url.clone())
                .with_reconnect(reconnect)
                .with_broadcast(broadcast)
                .with_correlator(requests),
            transport,
            Some(tokens),
            shutdown_token.child_token(),
        ));
        spawn_engine(&private, "Private");

        let stream = ChannelSubscriber::new(OPEN_ORDERS).attach(&private);
        tokio::spawn(log_channel(stream));

        if let Some(order) = config.demo_order.clone() {
            tokio::spawn(run_demo_order(Arc::clone(&private), order));
        }
    } else {
        tracing::info!("No token configured, private engine disabled");
    }

    tracing::info!("Client ready");

    await_shutdown(shutdown_token).await;

    tracing::info!("Client stopped");
    Ok(())
}

/// Run an engine in the background, logging a terminal error.
fn spawn_engine(engine: &Arc<ConnectionEngine>, label: &'static str) {
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        if let Err(e) = engine.run().await {
            tracing::error!(error = %e, "{label} engine error");
        }
    });
}

/// Log every message of a channel stream until it ends.
async fn log_channel(mut stream: ChannelStream) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => tracing::info!(
                channel = %message.channel,
                pair = message.pair.as_deref().unwrap_or("-"),
                sequence = message.sequence,
                body = %serde_json::Value::Array(message.body),
                "Channel update"
            ),
            Err(e) => tracing::warn!(error = %e, "Channel error"),
        }
    }
}

/// Place the demo order on the first private connection, log its
/// lifecycle and cancel it once it is open.
async fn run_demo_order(engine: Arc<ConnectionEngine>, order: DemoOrder) {
    let Some(handle) = engine.handles().next().await else {
        return;
    };
    let tracker = OrderTracker::attach(&engine);
    let request = AddOrderRequest::limit(order.pair, order.side, order.volume, order.price);
    let mut lifecycle = tracker.add_order(&handle, request);
    let mut cancel_sent = false;

    while let Some(event) = lifecycle.next().await {
        match event {
            Ok(snapshot) => {
                tracing::info!(
                    order_id = %snapshot.order_id,
                    status = snapshot.status.as_str(),
                    volume_executed = ?snapshot.volume_executed,
                    "Demo order update"
                );
                if snapshot.status == OrderStatus::Open && !cancel_sent {
                    cancel_sent = true;
                    if let Err(e) = tracker.cancel_order(&handle, [snapshot.order_id]).await {
                        tracing::warn!(error = %e, "Demo order cancel failed");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Demo order failed"),
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        schedule = config.reconnect.schedule.as_str(),
        pairs = ?config.pairs,
        private = config.token.is_some(),
        demo_order = config.demo_order.is_some(),
        request_timeout_ms = config.request_timeout.as_millis(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        public_url = %config.endpoints.public_url,
        private_url = %config.endpoints.private_url,
        "WebSocket endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
