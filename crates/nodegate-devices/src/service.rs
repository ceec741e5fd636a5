//! Gateway service.
//!
//! Subscribes to the inbound pattern and feeds each message into a lane
//! keyed by device id. A lane is a bounded queue drained by one task, so a
//! device's messages are handled in arrival order while different devices
//! run in parallel. A lane that stays empty for the idle period is closed
//! and reopened by the next message for that device.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use nodegate_core::config::{defaults, GatewayConfig};
use nodegate_core::{EventBus, SharedEventBus};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::SchemaSource;
use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{ChannelUpdate, InboundRoute, TopicScheme};
use crate::provisioning::{DeviceTypeResolver, PayloadDeviceTypeResolver, ProvisioningMachine};
use crate::registry::{Device, DeviceRegistry};
use crate::router::{Dispatched, ProtocolRouter};
use crate::transport::{InboundMessage, Transport, TransportError};
use crate::validator::ValidatedUpdate;

type LaneItem = (InboundRoute, InboundMessage);

struct Lane {
    id: u64,
    tx: mpsc::Sender<LaneItem>,
}

type Lanes = DashMap<String, Lane>;

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    transport: Arc<dyn Transport>,
    schemas: Arc<dyn SchemaSource>,
    resolver: Option<Arc<dyn DeviceTypeResolver>>,
    registry: Option<Arc<DeviceRegistry>>,
    events: Option<SharedEventBus>,
    topics: TopicScheme,
    lane_capacity: usize,
    lane_idle: Duration,
    accept_declared: bool,
}

impl GatewayBuilder {
    pub fn new(transport: Arc<dyn Transport>, schemas: Arc<dyn SchemaSource>) -> Self {
        Self {
            transport,
            schemas,
            resolver: None,
            registry: None,
            events: None,
            topics: TopicScheme::new(),
            lane_capacity: defaults::LANE_CAPACITY,
            lane_idle: Duration::from_secs(defaults::LANE_IDLE_SECS),
            accept_declared: true,
        }
    }

    /// Apply the topic, lane and provisioning settings.
    pub fn with_config(mut self, config: &GatewayConfig) -> Self {
        self.topics = TopicScheme::from_prefix(config.topics.prefix.as_deref());
        self.lane_capacity = config.gateway.lane_capacity;
        self.lane_idle = Duration::from_secs(config.gateway.lane_idle_secs);
        self.accept_declared = config.provisioning.accept_declared_channels;
        if self.resolver.is_none() {
            self.resolver = Some(Arc::new(PayloadDeviceTypeResolver::new(
                config.provisioning.default_device_type.clone(),
            )));
        }
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DeviceTypeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_topics(mut self, topics: TopicScheme) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity.max(1);
        self
    }

    /// How long an empty lane lives before its task exits.
    pub fn with_lane_idle(mut self, idle: Duration) -> Self {
        self.lane_idle = idle;
        self
    }

    pub fn with_declared_channels(mut self, accept: bool) -> Self {
        self.accept_declared = accept;
        self
    }

    pub fn build(self) -> Gateway {
        let registry = self.registry.unwrap_or_default();
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBus::with_name("gateway")));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(PayloadDeviceTypeResolver::default()));

        let provisioning = Arc::new(
            ProvisioningMachine::new(
                registry.clone(),
                self.schemas,
                resolver,
                self.transport.clone(),
                self.topics.clone(),
                events.clone(),
            )
            .with_declared_channels(self.accept_declared),
        );
        let router = Arc::new(ProtocolRouter::new(
            self.topics.clone(),
            registry.clone(),
            provisioning,
            self.transport.clone(),
            events.clone(),
        ));

        Gateway {
            router,
            registry,
            transport: self.transport,
            events,
            topics: self.topics,
            lane_capacity: self.lane_capacity.max(1),
            lane_idle: self.lane_idle,
            lanes: Arc::new(DashMap::new()),
            next_lane: AtomicU64::new(0),
        }
    }
}

/// The running protocol engine.
pub struct Gateway {
    router: Arc<ProtocolRouter>,
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    events: SharedEventBus,
    topics: TopicScheme,
    lane_capacity: usize,
    lane_idle: Duration,
    lanes: Arc<Lanes>,
    next_lane: AtomicU64,
}

impl Gateway {
    pub fn builder(transport: Arc<dyn Transport>, schemas: Arc<dyn SchemaSource>) -> GatewayBuilder {
        GatewayBuilder::new(transport, schemas)
    }

    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Number of live device lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Subscribe and process inbound messages.
    ///
    /// Returns `Transport(Closed)` if the inbound subscription ends.
    pub async fn run(&self) -> DeviceResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// [`run`](Self::run) that also stops when `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> DeviceResult<()>
    where
        F: Future<Output = ()>,
    {
        let pattern = self.topics.subscription_pattern();
        let mut inbound = self.transport.subscribe(&pattern).await?;
        info!(
            "Gateway listening on {} via {}",
            pattern,
            self.transport.name()
        );

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Gateway shutting down");
                    break Ok(());
                }
                message = inbound.next() => match message {
                    Some(message) => self.enqueue(message),
                    None => {
                        warn!("Inbound subscription on {} ended", pattern);
                        break Err(DeviceError::Transport(TransportError::Closed));
                    }
                },
            }
        };

        // Dropping the senders lets every lane drain and exit.
        self.lanes.clear();
        result
    }

    /// Queue a message on its device's lane.
    ///
    /// A full lane drops the message rather than stalling other devices.
    pub fn enqueue(&self, message: InboundMessage) {
        let route = match self.router.route(&message.topic) {
            Ok(route) => route,
            Err(e) => {
                self.router.report_drop(&message.topic, None, &e);
                return;
            }
        };

        let mut item = (route, message);
        for _ in 0..2 {
            // Sent under the map entry's lock, so an idle lane cannot be
            // retired between the lookup and the send.
            let sent = match self.lanes.entry(item.0.device_id.clone()) {
                Entry::Occupied(lane) => lane.get().tx.try_send(item),
                Entry::Vacant(slot) => {
                    let lane = self.open_lane(slot.key());
                    let sent = lane.tx.try_send(item);
                    slot.insert(lane);
                    sent
                }
            };
            match sent {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full((route, message))) => {
                    let e = DeviceError::LaneFull(route.device_id.clone());
                    self.router
                        .report_drop(&message.topic, Some(&route.device_id), &e);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    self.lanes.remove(&returned.0.device_id);
                    item = returned;
                }
            }
        }
        warn!("Could not open a lane for {}", item.0.device_id);
    }

    fn open_lane(&self, device_id: &str) -> Lane {
        let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.lane_capacity);
        tokio::spawn(drain_lane(
            self.router.clone(),
            self.lanes.clone(),
            device_id.to_string(),
            id,
            rx,
            self.lane_idle,
        ));
        debug!("Opened lane for {}", device_id);
        Lane { id, tx }
    }

    /// Handle one message immediately, bypassing the lanes.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> Option<Dispatched> {
        self.router.dispatch(topic, payload).await
    }

    /// Validate and publish a command.
    pub async fn send_command(
        &self,
        device_id: &str,
        update: &ChannelUpdate,
    ) -> DeviceResult<ValidatedUpdate> {
        self.router.send_command(device_id, update).await
    }

    /// Snapshot of one device.
    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id).await
    }

    /// Snapshots of every device.
    pub async fn devices(&self) -> Vec<Device> {
        self.registry.list().await
    }

    /// Return a device to `Unprovisioned`.
    pub async fn reset(&self, device_id: &str) -> DeviceResult<()> {
        self.registry.reset(device_id).await
    }

    /// Forget a device and close its lane.
    pub async fn deregister(&self, device_id: &str) -> DeviceResult<Device> {
        self.lanes.remove(device_id);
        self.registry.deregister(device_id).await
    }
}

async fn drain_lane(
    router: Arc<ProtocolRouter>,
    lanes: Arc<Lanes>,
    device_id: String,
    lane_id: u64,
    mut rx: mpsc::Receiver<LaneItem>,
    idle: Duration,
) {
    loop {
        let (route, message) = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(item)) => item,
            // Every sender dropped: deregistered or shut down.
            Ok(None) => return,
            Err(_) => {
                let mut pending = None;
                let retired = lanes
                    .remove_if(&device_id, |_, lane| {
                        lane.id == lane_id && {
                            pending = rx.try_recv().ok();
                            pending.is_none()
                        }
                    })
                    .is_some();
                if retired {
                    debug!("Closed idle lane for {}", device_id);
                    return;
                }
                match pending {
                    Some(item) => item,
                    None => continue,
                }
            }
        };
        router
            .dispatch_route(&message.topic, &route, &message.payload)
            .await;
    }
}
