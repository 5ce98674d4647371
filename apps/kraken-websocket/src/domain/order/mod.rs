//! Order Domain Types
//!
//! Immutable order snapshots rebuilt from the exchange's acknowledgment and
//! the partial updates published on the `openOrders` channel.
//!
//! An [`Order`] is never mutated in place: [`Order::apply`] folds one
//! [`OrderUpdate`] into a new snapshot. Status only moves forward and a
//! snapshot with a final status is frozen.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Enumerations
// =============================================================================

/// Order type accepted by `addOrder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Stop-loss order.
    StopLoss,
    /// Take-profit order.
    TakeProfit,
    /// Stop-loss order with a limit price.
    StopLossLimit,
    /// Take-profit order with a limit price.
    TakeProfitLimit,
    /// Settle a margin position.
    SettlePosition,
}

impl OrderType {
    /// Wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::StopLoss => "stop-loss",
            Self::TakeProfit => "take-profit",
            Self::StopLossLimit => "stop-loss-limit",
            Self::TakeProfitLimit => "take-profit-limit",
            Self::SettlePosition => "settle-position",
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl OrderSide {
    /// Wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Acknowledged by `addOrderStatus`, not yet seen on `openOrders`.
    Submitted,
    /// Accepted, pending book entry.
    Pending,
    /// Resting on the book.
    Open,
    /// Fully filled.
    Closed,
    /// Canceled.
    Canceled,
    /// Expired.
    Expired,
}

impl OrderStatus {
    /// Parse a status reported on the `openOrders` channel.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// Position in the lifecycle; final statuses share the highest rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Pending => 1,
            Self::Open => 2,
            Self::Closed | Self::Canceled | Self::Expired => 3,
        }
    }

    /// Whether no further transitions can happen.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Closed | Self::Canceled | Self::Expired)
    }
}

// =============================================================================
// Order Update
// =============================================================================

/// One entry of an `openOrders` frame for a single order id.
///
/// Every field is optional: partial-fill updates carry volumes and no
/// status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderUpdate {
    /// New status.
    pub status: Option<OrderStatus>,
    /// Client reference (`userref`).
    pub reference: Option<i64>,
    /// Open time (`opentm`).
    pub open_time: Option<DateTime<Utc>>,
    /// Primary price (`descr.price`).
    pub price: Option<Decimal>,
    /// Secondary price (`descr.price2`).
    pub price2: Option<Decimal>,
    /// Order volume (`vol`).
    pub volume: Option<Decimal>,
    /// Executed volume (`vol_exec`).
    pub volume_executed: Option<Decimal>,
    /// Total cost (`cost`).
    pub cost: Option<Decimal>,
    /// Total fee (`fee`).
    pub fee: Option<Decimal>,
    /// Average fill price (`avg_price`).
    pub average_price: Option<Decimal>,
}

impl OrderUpdate {
    /// Read an update entry. Unknown fields and unknown statuses are ignored.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let descr = value.get("descr");
        Self {
            status: value
                .get("status")
                .and_then(Value::as_str)
                .and_then(OrderStatus::from_wire),
            reference: value.get("userref").and_then(Value::as_i64),
            open_time: value.get("opentm").and_then(decimal).and_then(epoch_to_utc),
            price: descr.and_then(|d| d.get("price")).and_then(decimal),
            price2: descr.and_then(|d| d.get("price2")).and_then(decimal),
            volume: value.get("vol").and_then(decimal),
            volume_executed: value.get("vol_exec").and_then(decimal),
            cost: value.get("cost").and_then(decimal),
            fee: value.get("fee").and_then(decimal),
            average_price: value.get("avg_price").and_then(decimal),
        }
    }
}

/// Decimals arrive as strings, occasionally as JSON numbers.
fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Convert fractional epoch seconds into a UTC timestamp.
fn epoch_to_utc(seconds: Decimal) -> Option<DateTime<Utc>> {
    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * Decimal::from(1_000_000_000_u32))
        .trunc()
        .to_u32()?;
    DateTime::from_timestamp(whole.to_i64()?, nanos)
}

// =============================================================================
// Order
// =============================================================================

/// Immutable order snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange order id (`txid`).
    pub order_id: String,
    /// Current status.
    pub status: OrderStatus,
    /// Human-readable description returned with the acknowledgment.
    pub description: String,
    /// Side, when known from the originating request.
    pub side: Option<OrderSide>,
    /// Type, when known from the originating request.
    pub order_type: Option<OrderType>,
    /// Client reference.
    pub reference: Option<i64>,
    /// Open time.
    pub open_time: Option<DateTime<Utc>>,
    /// Primary price.
    pub price: Option<Decimal>,
    /// Secondary price.
    pub price2: Option<Decimal>,
    /// Order volume.
    pub volume: Option<Decimal>,
    /// Executed volume.
    pub volume_executed: Option<Decimal>,
    /// Total cost.
    pub cost: Option<Decimal>,
    /// Total fee.
    pub fee: Option<Decimal>,
    /// Average fill price.
    pub average_price: Option<Decimal>,
}

impl Order {
    /// Snapshot for a freshly acknowledged order.
    #[must_use]
    pub fn submitted(order_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: OrderStatus::Submitted,
            description: description.into(),
            side: None,
            order_type: None,
            reference: None,
            open_time: None,
            price: None,
            price2: None,
            volume: None,
            volume_executed: None,
            cost: None,
            fee: None,
            average_price: None,
        }
    }

    /// Attach the side and type known from the request.
    #[must_use]
    pub const fn with_kind(mut self, side: OrderSide, order_type: OrderType) -> Self {
        self.side = Some(side);
        self.order_type = Some(order_type);
        self
    }

    /// Fold an update into a new snapshot.
    ///
    /// A status with a lower rank than the current one is ignored while the
    /// other fields still fold. Final snapshots are returned unchanged.
    #[must_use]
    pub fn apply(&self, update: &OrderUpdate) -> Self {
        if self.status.is_final() {
            return self.clone();
        }

        let status = match update.status {
            Some(next) if next.rank() >= self.status.rank() => next,
            _ => self.status,
        };

        Self {
            order_id: self.order_id.clone(),
            status,
            description: self.description.clone(),
            side: self.side,
            order_type: self.order_type,
            reference: update.reference.or(self.reference),
            open_time: update.open_time.or(self.open_time),
            price: update.price.or(self.price),
            price2: update.price2.or(self.price2),
            volume: update.volume.or(self.volume),
            volume_executed: update.volume_executed.or(self.volume_executed),
            cost: update.cost.or(self.cost),
            fee: update.fee.or(self.fee),
            average_price: update.average_price.or(self.average_price),
        }
    }

    /// Whether the order reached a final status.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        self.status.is_final()
    }
}
