//! Channel Domain Types
//!
//! Subscription intents and decoded channel frames for Kraken's v1
//! WebSocket API.
//!
//! # Wire Shapes
//!
//! ```text
//! subscribe     {"event":"subscribe","pair":["XBT/USD"],"subscription":{"name":"ticker"}}
//! public frame  [340, {...}, "ticker", "XBT/USD"]
//! private frame [[{...}], "openOrders", {"sequence": 4}]
//! ```

use serde_json::{Map, Value};

// =============================================================================
// Channel Names
// =============================================================================

/// Public ticker channel.
pub const TICKER: &str = "ticker";
/// Public OHLC channel (frames are named `ohlc-<interval>`).
pub const OHLC: &str = "ohlc";
/// Public trade channel.
pub const TRADE: &str = "trade";
/// Public spread channel.
pub const SPREAD: &str = "spread";
/// Public order book channel (frames are named `book-<depth>`).
pub const BOOK: &str = "book";
/// Private own-trades channel.
pub const OWN_TRADES: &str = "ownTrades";
/// Private open-orders channel.
pub const OPEN_ORDERS: &str = "openOrders";

/// Check whether a frame's channel name belongs to a subscription name.
///
/// Book and OHLC frames carry a suffix (`book-10`, `ohlc-5`) that the
/// subscription name does not.
#[must_use]
pub fn channel_matches(frame_channel: &str, subscribed: &str) -> bool {
    frame_channel == subscribed
        || frame_channel
            .strip_prefix(subscribed)
            .is_some_and(|rest| rest.starts_with('-'))
}

// =============================================================================
// Subscription Intent
// =============================================================================

/// Direction of a subscription control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionDirection {
    /// Start receiving the channel.
    Subscribe,
    /// Stop receiving the channel.
    Unsubscribe,
}

impl SubscriptionDirection {
    /// Wire value of the `event` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Desired subscription state for one channel and pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionIntent {
    /// Channel name (`ticker`, `openOrders`, ...).
    pub channel: String,
    /// Trading pair for public channels.
    pub pair: Option<String>,
    /// Extra subscription parameters (`depth`, `interval`, ...).
    pub params: Map<String, Value>,
    /// Subscribe or unsubscribe.
    pub direction: SubscriptionDirection,
}

impl SubscriptionIntent {
    /// Create a subscribe intent.
    #[must_use]
    pub fn subscribe(
        channel: impl Into<String>,
        pair: Option<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            channel: channel.into(),
            pair,
            params,
            direction: SubscriptionDirection::Subscribe,
        }
    }

    /// The same intent with the opposite direction.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let direction = match self.direction {
            SubscriptionDirection::Subscribe => SubscriptionDirection::Unsubscribe,
            SubscriptionDirection::Unsubscribe => SubscriptionDirection::Subscribe,
        };
        Self {
            direction,
            ..self.clone()
        }
    }

    /// Render the control frame sent to the exchange.
    ///
    /// The `name` field always carries the channel, even if `params`
    /// contains a `name` key.
    #[must_use]
    pub fn to_frame(&self) -> Value {
        let mut subscription = self.params.clone();
        subscription.insert("name".to_owned(), Value::String(self.channel.clone()));

        let mut frame = Map::new();
        frame.insert(
            "event".to_owned(),
            Value::String(self.direction.as_str().to_owned()),
        );
        if let Some(pair) = &self.pair {
            frame.insert(
                "pair".to_owned(),
                Value::Array(vec![Value::String(pair.clone())]),
            );
        }
        frame.insert("subscription".to_owned(), Value::Object(subscription));
        Value::Object(frame)
    }
}

// =============================================================================
// Channel Message
// =============================================================================

/// Decoded channel data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Numeric channel id (public frames only).
    pub channel_id: Option<u64>,
    /// Channel name as sent by the exchange (`book-10`, `openOrders`, ...).
    pub channel: String,
    /// Trading pair (public frames only).
    pub pair: Option<String>,
    /// Payload elements between the header and the trailer.
    pub body: Vec<Value>,
    /// Sequence number (private frames only).
    pub sequence: Option<u64>,
    /// Whether the frame came from a private channel.
    pub private: bool,
}

impl ChannelMessage {
    /// Decode a channel frame.
    ///
    /// Returns `None` for anything that is not an array of at least three
    /// elements with a string channel name in the second-to-last slot.
    /// A trailing object marks a private frame; its `sequence` field is
    /// optional here and enforced by the sequence guard.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.len() < 3 {
            return None;
        }
        let last = items.len() - 1;
        let channel = items[last - 1].as_str()?.to_owned();

        if let Some(trailer) = items[last].as_object() {
            return Some(Self {
                channel_id: None,
                channel,
                pair: None,
                body: items[..last - 1].to_vec(),
                sequence: trailer.get("sequence").and_then(Value::as_u64),
                private: true,
            });
        }

        Some(Self {
            channel_id: items[0].as_u64(),
            channel,
            pair: items[last].as_str().map(str::to_owned),
            body: items[1..last - 1].to_vec(),
            sequence: None,
            private: false,
        })
    }

    /// Check whether this frame belongs to a channel and optional pair.
    #[must_use]
    pub fn matches(&self, channel: &str, pair: Option<&str>) -> bool {
        channel_matches(&self.channel, channel)
            && pair.is_none_or(|wanted| self.pair.as_deref() == Some(wanted))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_frame_with_pair_and_params() {
        let mut params = Map::new();
        params.insert("depth".to_owned(), json!(10));
        let intent = SubscriptionIntent::subscribe(BOOK, Some("XBT/USD".to_owned()), params);

        assert_eq!(
            intent.to_frame(),
            json!({
                "event": "subscribe",
                "pair": ["XBT/USD"],
                "subscription": {"name": "book", "depth": 10}
            })
        );
    }

    #[test]
    fn unsubscribe_mirrors_subscribe() {
        let intent = SubscriptionIntent::subscribe(OPEN_ORDERS, None, Map::new());
        let inverse = intent.inverse();

        assert_eq!(inverse.direction, SubscriptionDirection::Unsubscribe);
        assert_eq!(
            inverse.to_frame(),
            json!({"event": "unsubscribe", "subscription": {"name": "openOrders"}})
        );
        assert_eq!(inverse.inverse(), intent);
    }

    #[test]
    fn decode_public_frame() {
        let frame = json!([340, {"a": ["1.0", 1, "1.0"]}, "ticker", "USDT/USD"]);
        let message = ChannelMessage::from_value(&frame).unwrap();

        assert_eq!(message.channel_id, Some(340));
        assert_eq!(message.channel, "ticker");
        assert_eq!(message.pair.as_deref(), Some("USDT/USD"));
        assert_eq!(message.body, vec![json!({"a": ["1.0", 1, "1.0"]})]);
        assert!(!message.private);
        assert!(message.sequence.is_none());
    }

    #[test]
    fn decode_public_frame_with_two_payloads() {
        let frame = json!([1234, {"a": []}, {"b": []}, "book-10", "XBT/USD"]);
        let message = ChannelMessage::from_value(&frame).unwrap();

        assert_eq!(message.body.len(), 2);
        assert!(message.matches(BOOK, Some("XBT/USD")));
    }

    #[test]
    fn decode_private_frame() {
        let frame = json!([[{"OABC": {"status": "open"}}], "openOrders", {"sequence": 7}]);
        let message = ChannelMessage::from_value(&frame).unwrap();

        assert!(message.private);
        assert_eq!(message.sequence, Some(7));
        assert_eq!(message.channel, OPEN_ORDERS);
        assert!(message.pair.is_none());
        assert_eq!(message.body.len(), 1);
    }

    #[test]
    fn decode_rejects_non_channel_shapes() {
        assert!(ChannelMessage::from_value(&json!({"event": "heartbeat"})).is_none());
        assert!(ChannelMessage::from_value(&json!([1, "ticker"])).is_none());
        assert!(ChannelMessage::from_value(&json!([1, {}, 42, "XBT/USD"])).is_none());
    }

    #[test]
    fn channel_suffix_matching() {
        assert!(channel_matches("book-10", "book"));
        assert!(channel_matches("ohlc-5", "ohlc"));
        assert!(channel_matches("ticker", "ticker"));
        assert!(!channel_matches("bookkeeping", "book"));
        assert!(!channel_matches("trade", "ticker"));
    }

    #[test]
    fn pair_filter() {
        let frame = json!([340, {}, "ticker", "USDT/USD"]);
        let message = ChannelMessage::from_value(&frame).unwrap();

        assert!(message.matches(TICKER, None));
        assert!(message.matches(TICKER, Some("USDT/USD")));
        assert!(!message.matches(TICKER, Some("XBT/USD")));
    }
}
