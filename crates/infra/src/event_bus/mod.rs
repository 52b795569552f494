//! Broker-backed event bus adapters.
//!
//! The bus contract and the in-process implementation live in `engage-events`.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
