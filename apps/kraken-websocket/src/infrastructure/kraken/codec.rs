//! Frame Codec
//!
//! Classifies inbound text frames into heartbeats, system status updates
//! and everything else.

use serde::Deserialize;
use serde_json::Value;

use super::messages::SystemStatus;

/// Errors that can occur during decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not valid JSON.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `{"event":"heartbeat"}`.
    Heartbeat,
    /// `systemStatus` event carrying this status.
    SystemStatus(String),
    /// Anything else: channel data, subscription and request responses.
    Message(Value),
}

/// Decoder for Kraken v1 text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct KrakenCodec;

impl KrakenCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parse and classify one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON.
    pub fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(value))
    }

    /// Classify an already parsed frame.
    #[must_use]
    pub fn classify(value: Value) -> Frame {
        let event = value.get("event").and_then(Value::as_str);
        if event == Some("heartbeat") {
            return Frame::Heartbeat;
        }
        if event == Some("systemStatus")
            && let Ok(status) = SystemStatus::deserialize(&value)
        {
            return Frame::SystemStatus(status.status);
        }
        Frame::Message(value)
    }
}
