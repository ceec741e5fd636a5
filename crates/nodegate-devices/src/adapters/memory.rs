//! In-process broker.
//!
//! Every publish is recorded and fanned out to the subscriptions whose
//! pattern matches, so a gateway and simulated devices can share one
//! instance. Used by tests and by the CLI's dry-run mode.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use crate::transport::{topic_matches, InboundMessage, MessageStream, Transport, TransportError};

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

/// Loopback transport.
#[derive(Default)]
pub struct MemoryTransport {
    subscribers: RwLock<Vec<Subscriber>>,
    published: RwLock<Vec<InboundMessage>>,
    closed: AtomicBool,
    offline: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order.
    pub async fn published(&self) -> Vec<InboundMessage> {
        self.published.read().await.clone()
    }

    /// Messages published on exactly `topic`.
    pub async fn published_on(&self, topic: &str) -> Vec<InboundMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Messages whose topic matches `pattern`.
    pub async fn published_matching(&self, pattern: &str) -> Vec<InboundMessage> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| topic_matches(pattern, &m.topic))
            .cloned()
            .collect()
    }

    pub async fn clear_published(&self) {
        self.published.write().await.clear();
    }

    /// Make subsequent publishes fail until set back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// End every subscription stream and refuse further traffic.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().await.clear();
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "broker offline".to_string(),
            });
        }

        let message = InboundMessage::new(topic, payload);
        self.published.write().await.push(message.clone());

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if topic_matches(&subscriber.pattern, topic) {
                trace!("memory: {} -> {}", topic, subscriber.pattern);
                let _ = subscriber.tx.send(message.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });

        let stream = async_stream::stream! {
            while let Some(message) = rx.recv().await {
                yield message;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_fan_out_by_pattern() {
        let transport = MemoryTransport::new();
        let mut up = transport.subscribe("up/+/+").await.unwrap();
        let mut down = transport.subscribe("down/command/A1").await.unwrap();

        transport.publish("up/telemetry/A1", b"{}".to_vec()).await.unwrap();
        transport.publish("down/command/A1", b"{\"channels\":{}}".to_vec()).await.unwrap();

        assert_eq!(up.next().await.unwrap().topic, "up/telemetry/A1");
        assert_eq!(down.next().await.unwrap().topic, "down/command/A1");
        assert_eq!(transport.published().await.len(), 2);
        assert_eq!(transport.published_matching("down/#").await.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_and_close() {
        let transport = MemoryTransport::new();
        let mut stream = transport.subscribe("#").await.unwrap();

        transport.set_offline(true);
        assert!(matches!(
            transport.publish("up/telemetry/A1", vec![]).await,
            Err(TransportError::Publish { .. })
        ));
        assert!(transport.published().await.is_empty());
        transport.set_offline(false);

        transport.close().await;
        assert!(stream.next().await.is_none());
        assert!(matches!(
            transport.publish("up/telemetry/A1", vec![]).await,
            Err(TransportError::Closed)
        ));
    }
}
