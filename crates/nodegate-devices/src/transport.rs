//! Publish/subscribe transport seam.
//!
//! The protocol engine only needs two things from a broker: publish bytes on
//! a topic, and receive messages matching a topic pattern. [`Transport`]
//! captures exactly that so the gateway runs unchanged over MQTT or the
//! in-process [`MemoryTransport`](crate::adapters::MemoryTransport).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {pattern}: {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("Transport is closed")]
    Closed,
}

/// Stream of inbound messages for one subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// A publish/subscribe broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport identifier for logs (e.g. "mqtt", "memory").
    fn name(&self) -> &str;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Receive every message whose topic matches `pattern` (`+` and `#`
    /// wildcards). The stream ends when the transport closes.
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream, TransportError>;
}

/// MQTT topic filter matching.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
