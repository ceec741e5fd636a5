//! MQTT transport over rumqttc.
//!
//! One client per transport. A background task polls the event loop,
//! forwards incoming publishes to matching subscriptions and re-issues
//! every subscription after a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodegate_core::config::MqttSettings;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::transport::{topic_matches, InboundMessage, MessageStream, Transport, TransportError};

/// Consecutive poll errors after which the connection task gives up.
const MAX_POLL_ERRORS: u32 = 5;

/// Request queue capacity between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

const MAX_PACKET_SIZE: usize = 1024 * 1024;

struct Subscription {
    pattern: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

type Subscriptions = Arc<RwLock<Vec<Subscription>>>;

/// MQTT broker connection.
pub struct MqttTransport {
    client: AsyncClient,
    client_id: String,
    subscriptions: Subscriptions,
    running: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Create the client and start the connection task.
    ///
    /// The broker connection is established asynchronously; publishes and
    /// subscriptions issued before it is up are queued by the client.
    pub fn connect(settings: &MqttSettings) -> Result<Self, TransportError> {
        if settings.host.trim().is_empty() {
            return Err(TransportError::Connection(
                "MQTT host must not be empty".to_string(),
            ));
        }

        let client_id = settings.effective_client_id();
        let mut options = MqttOptions::new(&client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let subscriptions: Subscriptions = Arc::new(RwLock::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let broker = format!("{}:{}", settings.host, settings.port);
        tokio::spawn(poll_loop(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            running.clone(),
            broker.clone(),
        ));

        info!("MQTT transport {} connecting to {}", client_id, broker);
        Ok(Self {
            client,
            client_id,
            subscriptions,
            running,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Disconnect and end every subscription stream.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        self.subscriptions.write().await.clear();
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    running: Arc<AtomicBool>,
    broker: String,
) {
    let mut error_count = 0;

    while running.load(Ordering::SeqCst) {
        match eventloop.poll().await {
            Ok(event) => {
                error_count = 0;
                handle_event(event, &client, &subscriptions, &broker).await;
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                error_count += 1;
                if error_count >= MAX_POLL_ERRORS {
                    error!(
                        "MQTT broker {} error count reached {}, stopping: {}",
                        broker, MAX_POLL_ERRORS, e
                    );
                    break;
                }
                warn!(
                    "MQTT broker {} error ({}/{}): {}",
                    broker, error_count, MAX_POLL_ERRORS, e
                );
                tokio::time::sleep(Duration::from_secs(u64::from(error_count))).await;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    subscriptions.write().await.clear();
    info!("MQTT broker {} connection closed", broker);
}

async fn handle_event(event: Event, client: &AsyncClient, subscriptions: &Subscriptions, broker: &str) {
    match event {
        Event::Incoming(Packet::Publish(publish)) => {
            debug!(
                "MQTT message on {} ({} bytes)",
                publish.topic,
                publish.payload.len()
            );
            let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
            let mut subs = subscriptions.write().await;
            subs.retain(|s| !s.tx.is_closed());
            for sub in subs.iter() {
                if topic_matches(&sub.pattern, &message.topic) {
                    let _ = sub.tx.send(message.clone());
                }
            }
        }
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("MQTT broker {} connection acknowledged", broker);
            // The event loop is this task, so queue without awaiting.
            for sub in subscriptions.read().await.iter() {
                if let Err(e) = client.try_subscribe(sub.pattern.as_str(), QoS::AtLeastOnce) {
                    warn!("Failed to resubscribe to {}: {}", sub.pattern, e);
                }
            }
        }
        _ => {}
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::Closed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, pattern: &str) -> Result<MessageStream, TransportError> {
        if !self.is_running() {
            return Err(TransportError::Closed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscriptions.write().await.push(Subscription {
            pattern: pattern.to_string(),
            tx,
        });

        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        let stream = async_stream::stream! {
            while let Some(message) = rx.recv().await {
                yield message;
            }
        };
        Ok(Box::pin(stream))
    }
}
