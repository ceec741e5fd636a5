//! Event bus for gateway observers.
//!
//! Every component reports what happened by publishing a [`GatewayEvent`].
//! Nothing in the protocol engine waits on subscribers: publishing with no
//! subscriber attached simply discards the event.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::{EventMetadata, GatewayEvent};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

type Envelope = (GatewayEvent, EventMetadata);

/// Broadcast event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    name: String,
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

impl EventBus {
    pub fn new() -> Self {
        Self::with_name("default")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish with `gateway` as the source. Returns whether anyone was listening.
    pub fn publish(&self, event: GatewayEvent) -> bool {
        self.publish_from(event, "gateway")
    }

    /// Publish on behalf of a named component.
    pub fn publish_from(&self, event: GatewayEvent, source: impl Into<String>) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Every event from now on. A lagging receiver skips the oldest ones.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Shortcuts for common filtered subscriptions.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventBusReceiver {
    rx: broadcast::Receiver<Envelope>,
}

impl EventBusReceiver {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event receiver lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Receiver that only yields events accepted by `filter`.
pub struct FilteredReceiver<F>
where
    F: Fn(&GatewayEvent) -> bool + Send,
{
    rx: broadcast::Receiver<Envelope>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&GatewayEvent) -> bool + Send,
{
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if (self.filter)(&envelope.0) => return Some(envelope),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already queued, skipping non-matching ones.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        while let Ok(envelope) = self.rx.try_recv() {
            if (self.filter)(&envelope.0) {
                return Some(envelope);
            }
        }
        None
    }
}

pub struct FilterBuilder {
    tx: broadcast::Sender<Envelope>,
}

impl FilterBuilder {
    fn with<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&GatewayEvent) -> bool + Send,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Provisioning outcomes only.
    pub fn provisioning_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        self.with(GatewayEvent::is_provisioning_event as fn(&GatewayEvent) -> bool)
    }

    /// Rejections and dropped messages only.
    pub fn error_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        self.with(GatewayEvent::is_error_event as fn(&GatewayEvent) -> bool)
    }

    /// Events concerning one device.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&GatewayEvent) -> bool + Send + 'static> {
        let target = device_id.into();
        self.with(move |event: &GatewayEvent| event.device_id() == Some(target.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(device: &str) -> GatewayEvent {
        GatewayEvent::MessageDropped {
            topic: format!("up/telemetry/{}", device),
            device_id: Some(device.to_string()),
            reason: "test".to_string(),
            timestamp: 0,
        }
    }

    fn rejected(device: &str) -> GatewayEvent {
        GatewayEvent::ProvisionRejected {
            device_id: device.to_string(),
            reason: "no schema".to_string(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.publish_from(dropped("a"), "router"));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "MessageDropped");
        assert_eq!(meta.source, "router");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.publish(dropped("a")));
    }

    #[tokio::test]
    async fn test_device_filter() {
        let bus = EventBus::new();
        let mut rx = bus.filter().device("b");

        bus.publish(dropped("a"));
        bus.publish(dropped("b"));

        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), Some("b"));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_provisioning_filter_skips_drops() {
        let bus = EventBus::with_name("gateway");
        let mut rx = bus.filter().provisioning_events();

        bus.publish(dropped("a"));
        bus.publish(rejected("a"));

        let (event, _) = rx.try_recv().unwrap();
        assert_eq!(event.type_name(), "ProvisionRejected");
        assert!(rx.try_recv().is_none());
    }
}
