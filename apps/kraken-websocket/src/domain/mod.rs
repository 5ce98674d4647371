//! Domain Layer - Channel and order types.
//!
//! Pure data types and transformations with no I/O: subscription intents,
//! decoded channel frames and immutable order snapshots.

/// Subscription intents and channel frame decoding.
pub mod channel;

/// Order snapshots and the update fold.
pub mod order;
