//! Application Layer - Port definitions.
//!
//! Traits the connection engine depends on, implemented by adapters in the
//! infrastructure layer or by callers.

/// Port interfaces for the transport, token acquisition and request ids.
pub mod ports;
