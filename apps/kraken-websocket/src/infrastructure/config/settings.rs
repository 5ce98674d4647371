//! Client Configuration Settings
//!
//! Configuration types for the Kraken client, loaded from environment
//! variables. Unparseable numbers fall back to their defaults.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::order::OrderSide;
use crate::infrastructure::kraken::connection::{PRIVATE_URL, PUBLIC_URL};

/// Reconnect schedule selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleKind {
    /// Kraken's recommended pattern: 0s, 0s, 1s, then 5s.
    #[default]
    Kraken,
    /// Exponential backoff with jitter.
    Exponential,
}

impl ScheduleKind {
    /// Get the schedule name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kraken => "kraken",
            Self::Exponential => "exponential",
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kraken" => Ok(Self::Kraken),
            "exponential" => Ok(Self::Exponential),
            _ => Err(ConfigError::InvalidValue {
                name: SCHEDULE_VAR.to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// WebSocket token for the private endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

/// Endpoint URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Public market data endpoint.
    pub public_url: String,
    /// Authenticated endpoint.
    pub private_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            public_url: PUBLIC_URL.to_string(),
            private_url: PRIVATE_URL.to_string(),
        }
    }
}

/// Reconnect settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Delay schedule between attempts.
    pub schedule: ScheduleKind,
    /// Initial delay (exponential only).
    pub initial_delay: Duration,
    /// Maximum delay (exponential only).
    pub max_delay: Duration,
    /// Delay multiplier (exponential only).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (exponential only).
    pub jitter_factor: f64,
    /// Maximum attempts before giving up (0 = unlimited, exponential only).
    pub max_attempts: u32,
    /// Uptime after which the schedule restarts.
    pub stability_window: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            schedule: ScheduleKind::Kraken,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0, // Unlimited
            stability_window: Duration::from_secs(5),
        }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Capacity of the bundle channel per engine.
    pub bundle_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            bundle_capacity: 4_096,
        }
    }
}

const DEMO_ORDER_VAR: &str = "KRAKEN_WS_DEMO_ORDER";

/// Limit order the demo binary places and then cancels.
///
/// Parsed from `pair,side,volume,price`, e.g. `USDT/USD,buy,10,0.98`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoOrder {
    /// Trading pair.
    pub pair: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Volume in base currency.
    pub volume: Decimal,
    /// Limit price.
    pub price: Decimal,
}

impl FromStr for DemoOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            name: DEMO_ORDER_VAR.to_string(),
            value: s.to_string(),
        };
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [pair, side, volume, price] = parts.as_slice() else {
            return Err(invalid());
        };
        let side = match side.to_lowercase().as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            _ => return Err(invalid()),
        };
        if pair.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            pair: (*pair).to_string(),
            side,
            volume: volume.parse().map_err(|_| invalid())?,
            price: price.parse().map_err(|_| invalid())?,
        })
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Endpoint URLs.
    pub endpoints: Endpoints,
    /// Static WebSocket token; the private engine only runs with one.
    pub token: Option<Token>,
    /// Reconnect settings.
    pub reconnect: ReconnectSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
    /// Time to wait for request responses.
    pub request_timeout: Duration,
    /// Prometheus metrics port (0 = no HTTP listener).
    pub metrics_port: u16,
    /// Pairs the demo binary subscribes to.
    pub pairs: Vec<String>,
    /// Order the demo binary places on the private endpoint.
    pub demo_order: Option<DemoOrder>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            token: None,
            reconnect: ReconnectSettings::default(),
            broadcast: BroadcastSettings::default(),
            request_timeout: Duration::from_secs(5),
            metrics_port: 9090,
            pairs: vec!["XBT/USD".to_string()],
            demo_order: None,
        }
    }
}

const SCHEDULE_VAR: &str = "KRAKEN_WS_RECONNECT_SCHEDULE";

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is set but empty, the schedule name is
    /// unknown or the demo order does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::from_env`].
    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let endpoints = Endpoints {
            public_url: parse_env_url(&env, "KRAKEN_WS_PUBLIC_URL", defaults.endpoints.public_url)?,
            private_url: parse_env_url(
                &env,
                "KRAKEN_WS_PRIVATE_URL",
                defaults.endpoints.private_url,
            )?,
        };

        let token = env("KRAKEN_WS_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Token::new);

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            schedule: env(SCHEDULE_VAR)
                .map(|s| s.parse::<ScheduleKind>())
                .transpose()?
                .unwrap_or_default(),
            initial_delay: parse_env_duration_millis(
                &env,
                "KRAKEN_WS_RECONNECT_INITIAL_MS",
                reconnect_defaults.initial_delay,
            ),
            max_delay: parse_env_duration_secs(
                &env,
                "KRAKEN_WS_RECONNECT_MAX_SECS",
                reconnect_defaults.max_delay,
            ),
            multiplier: parse_env(
                &env,
                "KRAKEN_WS_RECONNECT_MULTIPLIER",
                reconnect_defaults.multiplier,
            ),
            jitter_factor: parse_env(
                &env,
                "KRAKEN_WS_RECONNECT_JITTER",
                reconnect_defaults.jitter_factor,
            ),
            max_attempts: parse_env(
                &env,
                "KRAKEN_WS_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
            stability_window: parse_env_duration_secs(
                &env,
                "KRAKEN_WS_STABILITY_WINDOW_SECS",
                reconnect_defaults.stability_window,
            ),
        };

        let broadcast = BroadcastSettings {
            bundle_capacity: parse_env(
                &env,
                "KRAKEN_WS_BUNDLE_CAPACITY",
                defaults.broadcast.bundle_capacity,
            ),
        };

        let pairs = env("KRAKEN_WS_PAIRS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.pairs);

        let demo_order = env(DEMO_ORDER_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse::<DemoOrder>())
            .transpose()?;

        Ok(Self {
            endpoints,
            token,
            reconnect,
            broadcast,
            request_timeout: parse_env_duration_millis(
                &env,
                "KRAKEN_WS_REQUEST_TIMEOUT_MS",
                defaults.request_timeout,
            ),
            metrics_port: parse_env(&env, "KRAKEN_WS_METRICS_PORT", defaults.metrics_port),
            pairs,
            demo_order,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value that is not allowed.
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    env(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_env_url(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> Result<String, ConfigError> {
    match env(key) {
        Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
        Some(v) => Ok(v.trim().to_string()),
        None => Ok(default),
    }
}

fn parse_env_duration_secs(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test_case("kraken", ScheduleKind::Kraken ; "kraken")]
    #[test_case("EXPONENTIAL", ScheduleKind::Exponential ; "uppercase")]
    #[test_case(" exponential ", ScheduleKind::Exponential ; "padded")]
    fn schedule_parsing(input: &str, expected: ScheduleKind) {
        assert_eq!(input.parse::<ScheduleKind>().unwrap(), expected);
    }

    #[test]
    fn unknown_schedule_is_rejected() {
        let result = ClientConfig::from_lookup(lookup(&[(SCHEDULE_VAR, "fibonacci")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { name, value }) if name == SCHEDULE_VAR && value == "fibonacci"
        ));
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.endpoints.public_url, "wss://ws.kraken.com");
        assert_eq!(config.endpoints.private_url, "wss://ws-auth.kraken.com");
        assert!(config.token.is_none());
    }

    #[test]
    fn values_are_read() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("KRAKEN_WS_PUBLIC_URL", "ws://localhost:9000"),
            ("KRAKEN_WS_TOKEN", "abc"),
            (SCHEDULE_VAR, "exponential"),
            ("KRAKEN_WS_RECONNECT_INITIAL_MS", "250"),
            ("KRAKEN_WS_STABILITY_WINDOW_SECS", "10"),
            ("KRAKEN_WS_REQUEST_TIMEOUT_MS", "1500"),
            ("KRAKEN_WS_BUNDLE_CAPACITY", "64"),
            ("KRAKEN_WS_METRICS_PORT", "0"),
            ("KRAKEN_WS_PAIRS", "XBT/USD, ETH/USD,"),
        ]))
        .unwrap();

        assert_eq!(config.endpoints.public_url, "ws://localhost:9000");
        assert_eq!(config.token.as_ref().map(Token::expose), Some("abc"));
        assert_eq!(config.reconnect.schedule, ScheduleKind::Exponential);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.stability_window, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.broadcast.bundle_capacity, 64);
        assert_eq!(config.metrics_port, 0);
        assert_eq!(config.pairs, vec!["XBT/USD", "ETH/USD"]);
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("KRAKEN_WS_BUNDLE_CAPACITY", "lots"),
            ("KRAKEN_WS_RECONNECT_MULTIPLIER", "fast"),
        ]))
        .unwrap();
        assert_eq!(config.broadcast.bundle_capacity, 4_096);
        assert!((config.reconnect.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_url_is_rejected() {
        let result = ClientConfig::from_lookup(lookup(&[("KRAKEN_WS_PRIVATE_URL", " ")]));
        assert!(matches!(result, Err(ConfigError::EmptyValue(name)) if name == "KRAKEN_WS_PRIVATE_URL"));
    }

    #[test]
    fn demo_order_is_parsed() {
        let config =
            ClientConfig::from_lookup(lookup(&[(DEMO_ORDER_VAR, "USDT/USD, Sell, 10, 1.002")])).unwrap();
        assert_eq!(
            config.demo_order,
            Some(DemoOrder {
                pair: "USDT/USD".to_string(),
                side: OrderSide::Sell,
                volume: Decimal::from(10),
                price: Decimal::new(1002, 3),
            })
        );
    }

    #[test_case("USDT/USD,buy,10" ; "missing price")]
    #[test_case("USDT/USD,hold,10,1" ; "unknown side")]
    #[test_case("USDT/USD,buy,ten,1" ; "bad volume")]
    #[test_case(",buy,10,1" ; "empty pair")]
    fn malformed_demo_order_is_rejected(value: &str) {
        let result = ClientConfig::from_lookup(lookup(&[(DEMO_ORDER_VAR, value)]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { name, .. }) if name == DEMO_ORDER_VAR));
    }

    #[test]
    fn blank_token_means_none() {
        let config = ClientConfig::from_lookup(lookup(&[("KRAKEN_WS_TOKEN", "  ")])).unwrap();
        assert!(config.token.is_none());
    }

    #[test]
    fn token_redacted_debug() {
        let token = Token::new("secret456".to_string());
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }
}
