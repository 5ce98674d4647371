//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the ambient
//! concerns: configuration, metrics and tracing.

/// Kraken WebSocket engines, subscribers, correlator and order tracking.
pub mod kraken;

/// Broadcast channel adapters for bundle and handle fan-out.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
