//! Redis pub/sub bus for JSON event envelopes.
//!
//! Pub/sub is fire-and-forget: a subscriber that is offline misses messages.
//! Projections recover by rebuilding from the event store at startup.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde_json::Value as JsonValue;
use thiserror::Error;

use engage_events::{EventBus, EventEnvelope, Subscription};

pub const DEFAULT_CHANNEL: &str = "engage.events";

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self { client, channel: channel.into() })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<EventEnvelope<JsonValue>> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.client.get_connection()?;
        let receivers: i64 = conn.publish(&self.channel, payload)?;
        tracing::trace!(channel = %self.channel, receivers, "envelope published");
        Ok(())
    }

    /// Each subscription owns a dedicated connection read by a background
    /// thread. The thread exits when the receiver is dropped or the connection
    /// fails.
    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        let channel = self.channel.clone();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    tracing::error!(%err, %channel, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.subscribe(&channel) {
                tracing::error!(%err, %channel, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(%err, %channel, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let envelope: EventEnvelope<JsonValue> = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        tracing::warn!(%err, "dropping undecodable envelope");
                        continue;
                    }
                };

                if tx.send(envelope).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
