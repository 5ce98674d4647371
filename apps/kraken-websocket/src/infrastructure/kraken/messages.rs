//! Kraken Wire Messages
//!
//! Serde types for the control and trading frames exchanged over the v1
//! WebSocket API. Channel payloads are left as raw JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::order::{OrderSide, OrderType};

/// `systemStatus` event sent after connecting and on status changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SystemStatus {
    /// Connection id assigned by the exchange.
    #[serde(default, rename = "connectionID")]
    pub connection_id: Option<u64>,
    /// `online`, `maintenance`, `cancel_only`, `limit_only` or `post_only`.
    pub status: String,
    /// API version.
    #[serde(default)]
    pub version: Option<String>,
}

/// `addOrder` request body (the `event` and `reqid` fields are added when
/// the frame is built).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddOrderRequest {
    /// Trading pair, e.g. `XBT/USD`.
    pub pair: String,
    /// Buy or sell.
    #[serde(rename = "type")]
    pub side: OrderSide,
    /// Order type.
    #[serde(rename = "ordertype")]
    pub order_type: OrderType,
    /// Order volume in base currency.
    pub volume: Decimal,
    /// Limit or trigger price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Secondary price for `*-limit` order types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price2: Option<Decimal>,
    /// Comma-delimited order flags (`post`, `fcib`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oflags: Option<String>,
    /// Client reference id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userref: Option<i64>,
    /// Validate only, do not submit.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub validate: bool,
}

impl AddOrderRequest {
    /// Limit order.
    #[must_use]
    pub fn limit(pair: impl Into<String>, side: OrderSide, volume: Decimal, price: Decimal) -> Self {
        Self {
            pair: pair.into(),
            side,
            order_type: OrderType::Limit,
            volume,
            price: Some(price),
            price2: None,
            oflags: None,
            userref: None,
            validate: false,
        }
    }

    /// Market order.
    #[must_use]
    pub fn market(pair: impl Into<String>, side: OrderSide, volume: Decimal) -> Self {
        Self {
            pair: pair.into(),
            side,
            order_type: OrderType::Market,
            volume,
            price: None,
            price2: None,
            oflags: None,
            userref: None,
            validate: false,
        }
    }

    /// Set the client reference id.
    #[must_use]
    pub const fn with_userref(mut self, userref: i64) -> Self {
        self.userref = Some(userref);
        self
    }

    /// Set order flags.
    #[must_use]
    pub fn with_oflags(mut self, oflags: impl Into<String>) -> Self {
        self.oflags = Some(oflags.into());
        self
    }

    /// Build the `addOrder` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    pub fn to_frame(&self) -> Result<Value, serde_json::Error> {
        with_event(serde_json::to_value(self)?, "addOrder")
    }
}

/// `cancelOrder` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOrderRequest {
    /// Order ids to cancel.
    pub txid: Vec<String>,
}

impl CancelOrderRequest {
    /// Cancel the given orders.
    #[must_use]
    pub fn new(txid: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            txid: txid.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the `cancelOrder` frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    pub fn to_frame(&self) -> Result<Value, serde_json::Error> {
        with_event(serde_json::to_value(self)?, "cancelOrder")
    }
}

/// `addOrderStatus` acknowledgment (after the status check passed).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddOrderStatus {
    /// Assigned order id.
    pub txid: String,
    /// Order description.
    #[serde(default)]
    pub descr: String,
}

fn with_event(mut frame: Value, event: &str) -> Result<Value, serde_json::Error> {
    match frame.as_object_mut() {
        Some(object) => {
            object.insert("event".to_owned(), Value::String(event.to_owned()));
            Ok(frame)
        }
        None => Err(serde::ser::Error::custom("request must serialize to an object")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn add_order_frame() {
        let request = AddOrderRequest::limit("XBT/USD", OrderSide::Buy, Decimal::TEN, Decimal::ONE)
            .with_userref(7);

        assert_eq!(
            request.to_frame().unwrap(),
            json!({
                "event": "addOrder",
                "pair": "XBT/USD",
                "type": "buy",
                "ordertype": "limit",
                "volume": "10",
                "price": "1",
                "userref": 7
            })
        );
    }

    #[test]
    fn market_order_omits_price() {
        let frame = AddOrderRequest::market("XBT/USD", OrderSide::Sell, Decimal::ONE)
            .to_frame()
            .unwrap();
        assert!(frame.get("price").is_none());
        assert_eq!(frame["ordertype"], "market");
    }

    #[test]
    fn cancel_order_frame() {
        let frame = CancelOrderRequest::new(["OABC", "ODEF"]).to_frame().unwrap();
        assert_eq!(
            frame,
            json!({"event": "cancelOrder", "txid": ["OABC", "ODEF"]})
        );
    }

    #[test]
    fn parse_system_status() {
        let status: SystemStatus = serde_json::from_value(json!({
            "connectionID": 8_628_615_390_848_610_000_u64,
            "event": "systemStatus",
            "status": "online",
            "version": "1.0.0"
        }))
        .unwrap();
        assert_eq!(status.status, "online");
        assert_eq!(status.version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn parse_add_order_status() {
        let ack: AddOrderStatus = serde_json::from_value(json!({
            "descr": "buy 10 @ 1",
            "event": "addOrderStatus",
            "reqid": 1,
            "status": "ok",
            "txid": "OABC"
        }))
        .unwrap();
        assert_eq!(ack.txid, "OABC");
        assert_eq!(ack.descr, "buy 10 @ 1");
    }
}
