//! Configuration Module
//!
//! Environment-driven configuration for the client and the demo binary.

mod settings;

pub use settings::{
    BroadcastSettings, ClientConfig, ConfigError, DemoOrder, Endpoints, ReconnectSettings,
    ScheduleKind, Token,
};
