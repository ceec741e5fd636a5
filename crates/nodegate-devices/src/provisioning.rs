//! Gateway-side provisioning.
//!
//! ```text
//! Unprovisioned --request--> AwaitingBinding --schema found--> Provisioned
//!                                   |
//!                                   +--no schema--> ProvisionFailed --request--> ...
//! ```
//!
//! A published schema for the requested type always wins. Only when none
//! exists, and declared channels are accepted, is the schema built from the
//! channel list the device sent with its request.
//!
//! A request for a device that is already provisioned re-publishes the
//! bound schema without rebinding. A request arriving while another one for
//! the same device is still resolving does not start a second resolution;
//! it waits for the first one's outcome.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nodegate_core::{GatewayEvent, SharedEventBus};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::catalog::SchemaSource;
use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{ProvisionRequest, ProvisionResponse, TopicScheme};
use crate::registry::DeviceRegistry;
use crate::schema::{DeviceSchema, SharedSchema};
use crate::transport::Transport;

/// Decides which device type a provisioning request is for.
#[async_trait]
pub trait DeviceTypeResolver: Send + Sync {
    async fn resolve_device_type(&self, device_id: &str, request: &ProvisionRequest)
        -> Option<String>;
}

/// Reads the type named in the request, else a configured default.
#[derive(Debug, Clone, Default)]
pub struct PayloadDeviceTypeResolver {
    fallback: Option<String>,
}

impl PayloadDeviceTypeResolver {
    pub fn new(fallback: Option<String>) -> Self {
        Self {
            fallback: fallback.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl DeviceTypeResolver for PayloadDeviceTypeResolver {
    async fn resolve_device_type(
        &self,
        _device_id: &str,
        request: &ProvisionRequest,
    ) -> Option<String> {
        request.device_type.clone().or_else(|| self.fallback.clone())
    }
}

/// How a provisioning request ended.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// The device was bound to `schema`.
    Bound { schema: SharedSchema },
    /// The device was already provisioned; its schema was sent again.
    Rebroadcast { schema: SharedSchema },
    /// No schema could be resolved; the device is `ProvisionFailed`.
    Rejected { reason: String },
}

impl ProvisionOutcome {
    pub fn schema(&self) -> Option<&SharedSchema> {
        match self {
            Self::Bound { schema } | Self::Rebroadcast { schema } => Some(schema),
            Self::Rejected { .. } => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Outcome plus whether this call only observed another request's work.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub outcome: ProvisionOutcome,
    pub observed: bool,
}

type InFlight = DashMap<String, watch::Receiver<Option<ProvisionOutcome>>>;

enum Role {
    Leader(watch::Sender<Option<ProvisionOutcome>>),
    Observer(watch::Receiver<Option<ProvisionOutcome>>),
}

/// Removes the in-flight marker however the leading request ends.
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    device_id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(self.device_id);
    }
}

/// Drives the provisioning handshake for every device.
pub struct ProvisioningMachine {
    registry: Arc<DeviceRegistry>,
    schemas: Arc<dyn SchemaSource>,
    resolver: Arc<dyn DeviceTypeResolver>,
    transport: Arc<dyn Transport>,
    topics: TopicScheme,
    events: SharedEventBus,
    in_flight: InFlight,
    accept_declared: bool,
}

impl ProvisioningMachine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        schemas: Arc<dyn SchemaSource>,
        resolver: Arc<dyn DeviceTypeResolver>,
        transport: Arc<dyn Transport>,
        topics: TopicScheme,
        events: SharedEventBus,
    ) -> Self {
        Self {
            registry,
            schemas,
            resolver,
            transport,
            topics,
            events,
            in_flight: DashMap::new(),
            accept_declared: true,
        }
    }

    /// Whether channels declared in a request may stand in for a missing
    /// published schema.
    pub fn with_declared_channels(mut self, accept: bool) -> Self {
        self.accept_declared = accept;
        self
    }

    /// Number of resolutions currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Handle `up/provision/{deviceId}`.
    ///
    /// Only a malformed payload is an error; a missing schema is a
    /// [`ProvisionOutcome::Rejected`] that has already been published.
    pub async fn on_provision_request(
        &self,
        device_id: &str,
        payload: &[u8],
    ) -> DeviceResult<ProvisionReport> {
        let request = ProvisionRequest::parse(payload)?;

        loop {
            let role = match self.in_flight.entry(device_id.to_string()) {
                Entry::Occupied(entry) => Role::Observer(entry.get().clone()),
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Observer(mut rx) => {
                    debug!("Provisioning for {} already in flight, waiting", device_id);
                    let observed = rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|outcome| outcome.clone());
                    match observed {
                        Some(outcome) => {
                            return Ok(ProvisionReport {
                                outcome,
                                observed: true,
                            });
                        }
                        // The first request was abandoned; take over.
                        None => continue,
                    }
                }
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        device_id,
                    };
                    let outcome = self.provision(device_id, &request).await;
                    tx.send_replace(Some(outcome.clone()));
                    return Ok(ProvisionReport {
                        outcome,
                        observed: false,
                    });
                }
            }
        }
    }

    async fn provision(&self, device_id: &str, request: &ProvisionRequest) -> ProvisionOutcome {
        loop {
            if let Ok(schema) = self.registry.bound_schema(device_id).await {
                return self.rebroadcast(device_id, schema).await;
            }
            match self.registry.mark_awaiting(device_id).await {
                Ok(()) => break,
                // Bound between the two calls
                Err(DeviceError::AlreadyProvisioned(_)) => continue,
                Err(e) => return self.reject(device_id, e.to_string()).await,
            }
        }

        let resolved = match self.resolver.resolve_device_type(device_id, request).await {
            Some(device_type) => match self.schemas.resolve_schema(&device_type).await {
                Err(DeviceError::SchemaNotFound(_))
                    if self.accept_declared && request.declares_channels() =>
                {
                    debug!(
                        "Building '{}' schema from channels declared by {}",
                        device_type, device_id
                    );
                    request
                        .declared_schema(&device_type)
                        .map(DeviceSchema::into_shared)
                }
                other => other,
            },
            None => Err(DeviceError::SchemaNotFound(format!(
                "no device type given by {}",
                device_id
            ))),
        };

        let schema = match resolved {
            Ok(schema) => schema,
            Err(e) => {
                if let Err(mark) = self.registry.mark_failed(device_id, e.to_string()).await {
                    debug!("Could not mark {} failed: {}", device_id, mark);
                }
                return self.reject(device_id, e.to_string()).await;
            }
        };

        match self.registry.bind_schema(device_id, schema.clone()).await {
            Ok(()) => {
                self.publish_response(device_id, &ProvisionResponse::accepted(&schema))
                    .await;
                info!(
                    "Provisioned device {} as '{}'",
                    device_id,
                    schema.device_type()
                );
                self.events.publish_from(
                    GatewayEvent::DeviceProvisioned {
                        device_id: device_id.to_string(),
                        device_type: schema.device_type().to_string(),
                        repeated: false,
                        timestamp: chrono::Utc::now().timestamp(),
                    },
                    "provisioning",
                );
                ProvisionOutcome::Bound { schema }
            }
            Err(DeviceError::AlreadyProvisioned(_)) => match self.registry.bound_schema(device_id).await {
                Ok(bound) => self.rebroadcast(device_id, bound).await,
                Err(e) => self.reject(device_id, e.to_string()).await,
            },
            Err(e) => self.reject(device_id, e.to_string()).await,
        }
    }

    async fn rebroadcast(&self, device_id: &str, schema: SharedSchema) -> ProvisionOutcome {
        self.publish_response(device_id, &ProvisionResponse::accepted(&schema))
            .await;
        debug!("Re-sent schema '{}' to {}", schema.device_type(), device_id);
        self.events.publish_from(
            GatewayEvent::DeviceProvisioned {
                device_id: device_id.to_string(),
                device_type: schema.device_type().to_string(),
                repeated: true,
                timestamp: chrono::Utc::now().timestamp(),
            },
            "provisioning",
        );
        ProvisionOutcome::Rebroadcast { schema }
    }

    async fn reject(&self, device_id: &str, reason: String) -> ProvisionOutcome {
        warn!("Provisioning rejected for {}: {}", device_id, reason);
        self.publish_response(device_id, &ProvisionResponse::rejected(reason.clone()))
            .await;
        self.events.publish_from(
            GatewayEvent::ProvisionRejected {
                device_id: device_id.to_string(),
                reason: reason.clone(),
                timestamp: chrono::Utc::now().timestamp(),
            },
            "provisioning",
        );
        ProvisionOutcome::Rejected { reason }
    }

    // A lost response is recovered by the device re-requesting.
    async fn publish_response(&self, device_id: &str, response: &ProvisionResponse) {
        let topic = self.topics.provision_response(device_id);
        if let Err(e) = self.transport.publish(&topic, response.to_bytes()).await {
            warn!("Failed to publish provisioning response on {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryTransport;
    use crate::catalog::SchemaCatalog;
    use crate::registry::ProvisionState;
    use crate::schema::{ChannelDefinition, ChannelType};
    use nodegate_core::EventBus;
    use std::time::Duration;

    struct Fixture {
        machine: Arc<ProvisioningMachine>,
        registry: Arc<DeviceRegistry>,
        transport: Arc<MemoryTransport>,
    }

    fn fixture_with(schemas: Arc<dyn SchemaSource>, fallback: Option<&str>) -> Fixture {
        let registry = Arc::new(DeviceRegistry::new());
        let transport = Arc::new(MemoryTransport::new());
        let machine = Arc::new(ProvisioningMachine::new(
            registry.clone(),
            schemas,
            Arc::new(PayloadDeviceTypeResolver::new(fallback.map(str::to_string))),
            transport.clone(),
            TopicScheme::new(),
            Arc::new(EventBus::new()),
        ));
        Fixture {
            machine,
            registry,
            transport,
        }
    }

    fn ac_catalog() -> Arc<SchemaCatalog> {
        let catalog = Arc::new(SchemaCatalog::new());
        catalog.publish(
            DeviceSchema::new("AC", [ChannelDefinition::boolean("relay01")]).unwrap(),
        );
        catalog
    }

    #[tokio::test]
    async fn test_provision_binds_and_publishes() {
        let f = fixture_with(ac_catalog(), None);
        let report = f
            .machine
            .on_provision_request("A1", br#"{"device_name": "AC"}"#)
            .await
            .unwrap();

        assert!(matches!(report.outcome, ProvisionOutcome::Bound { .. }));
        assert!(!report.observed);
        assert_eq!(
            f.registry.get("A1").await.unwrap().state(),
            ProvisionState::Provisioned
        );

        let sent = f.transport.published_on("down/provision/A1").await;
        assert_eq!(sent.len(), 1);
        let response = ProvisionResponse::from_slice(&sent[0].payload).unwrap();
        assert_eq!(response.into_schema().unwrap().device_type(), "AC");
        assert_eq!(f.machine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_repeat_request_rebroadcasts_same_schema() {
        let f = fixture_with(ac_catalog(), Some("AC"));
        let first = f.machine.on_provision_request("A1", b"").await.unwrap();
        let second = f.machine.on_provision_request("A1", b"").await.unwrap();

        assert!(matches!(second.outcome, ProvisionOutcome::Rebroadcast { .. }));
        assert!(Arc::ptr_eq(
            first.outcome.schema().unwrap(),
            second.outcome.schema().unwrap()
        ));

        let sent = f.transport.published_on("down/provision/A1").await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload, sent[1].payload);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let f = fixture_with(ac_catalog(), None);
        let report = f
            .machine
            .on_provision_request("A1", br#"{"device_name": "toaster"}"#)
            .await
            .unwrap();

        assert!(report.outcome.is_rejected());
        let device = f.registry.get("A1").await.unwrap();
        assert_eq!(device.state(), ProvisionState::ProvisionFailed);

        let sent = f.transport.published_on("down/provision/A1").await;
        let value: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(value["status"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_missing_type_without_fallback_rejected() {
        let f = fixture_with(ac_catalog(), None);
        let report = f.machine.on_provision_request("A1", b"{}").await.unwrap();
        assert!(report.outcome.is_rejected());
    }

    const DECLARING_REQUEST: &[u8] = br#"{
        "device_name": "AC",
        "device_id": "24A160",
        "channels": [
            {"relay01": {"type": 0, "command": false}},
            {"temp": {"type": 1, "command": true, "min": 20, "max": 30, "multipleof": 1}}
        ]
    }"#;

    #[tokio::test]
    async fn test_declared_channels_bind_without_published_schema() {
        let f = fixture_with(Arc::new(SchemaCatalog::new()), None);
        let report = f
            .machine
            .on_provision_request("24A160", DECLARING_REQUEST)
            .await
            .unwrap();

        let schema = report.outcome.schema().unwrap();
        assert_eq!(schema.device_type(), "AC");
        assert_eq!(schema.len(), 2);
        assert_eq!(
            schema.channel("temp").unwrap().channel_type(),
            ChannelType::Number
        );
        assert!(schema.channel("temp").unwrap().commandable);

        let sent = f.transport.published_on("down/provision/24A160").await;
        let response = ProvisionResponse::from_slice(&sent[0].payload).unwrap();
        assert!(response.is_accepted());
    }

    #[tokio::test]
    async fn test_published_schema_wins_over_declared() {
        let f = fixture_with(ac_catalog(), None);
        let report = f
            .machine
            .on_provision_request("24A160", DECLARING_REQUEST)
            .await
            .unwrap();

        let schema = report.outcome.schema().unwrap();
        assert_eq!(schema.len(), 1);
        assert!(schema.contains("relay01"));
        assert!(!schema.contains("temp"));
    }

    #[tokio::test]
    async fn test_invalid_declaration_rejected() {
        let f = fixture_with(Arc::new(SchemaCatalog::new()), None);
        let report = f
            .machine
            .on_provision_request(
                "A1",
                br#"{"device_name": "AC", "channels": [{"temp": {"type": 1, "min": 30, "max": 20}}]}"#,
            )
            .await
            .unwrap();

        assert!(matches!(
            &report.outcome,
            ProvisionOutcome::Rejected { reason } if reason.contains("greater than maximum")
        ));
        assert_eq!(
            f.registry.get("A1").await.unwrap().state(),
            ProvisionState::ProvisionFailed
        );
    }

    #[tokio::test]
    async fn test_declared_channels_ignored_when_disabled() {
        let registry = Arc::new(DeviceRegistry::new());
        let machine = ProvisioningMachine::new(
            registry,
            Arc::new(SchemaCatalog::new()),
            Arc::new(PayloadDeviceTypeResolver::default()),
            Arc::new(MemoryTransport::new()),
            TopicScheme::new(),
            Arc::new(EventBus::new()),
        )
        .with_declared_channels(false);

        let report = machine
            .on_provision_request("24A160", DECLARING_REQUEST)
            .await
            .unwrap();
        assert!(matches!(
            &report.outcome,
            ProvisionOutcome::Rejected { reason } if reason.contains("No schema for device type: AC")
        ));
    }

    #[tokio::test]
    async fn test_malformed_request_is_error() {
        let f = fixture_with(ac_catalog(), None);
        assert!(matches!(
            f.machine.on_provision_request("A1", b"[").await,
            Err(DeviceError::MalformedPayload(_))
        ));
        assert!(f.transport.published().await.is_empty());
    }

    /// Resolves only after being released, to hold a request in flight.
    struct GatedSource {
        inner: Arc<SchemaCatalog>,
        gate: tokio::sync::Semaphore,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SchemaSource for GatedSource {
        async fn resolve_schema(&self, device_type: &str) -> DeviceResult<SharedSchema> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            self.inner.resolve_schema(device_type).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_request_observes_first() {
        let source = Arc::new(GatedSource {
            inner: ac_catalog(),
            gate: tokio::sync::Semaphore::new(0),
            calls: Default::default(),
        });
        let f = fixture_with(source.clone(), Some("AC"));

        let first = {
            let machine = f.machine.clone();
            tokio::spawn(async move { machine.on_provision_request("A1", b"").await })
        };
        while f.machine.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = {
            let machine = f.machine.clone();
            tokio::spawn(async move { machine.on_provision_request("A1", b"").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.gate.add_permits(1);

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(!first.observed);
        assert!(second.observed);
        assert!(matches!(second.outcome, ProvisionOutcome::Bound { .. }));
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(f.transport.published_on("down/provision/A1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_taken_over() {
        let source = Arc::new(GatedSource {
            inner: ac_catalog(),
            gate: tokio::sync::Semaphore::new(0),
            calls: Default::default(),
        });
        let f = fixture_with(source.clone(), Some("AC"));

        let first = {
            let machine = f.machine.clone();
            tokio::spawn(async move { machine.on_provision_request("A1", b"").await })
        };
        while f.machine.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        first.abort();
        let _ = first.await;
        assert_eq!(f.machine.in_flight(), 0);

        source.gate.add_permits(1);
        let report = f.machine.on_provision_request("A1", b"").await.unwrap();
        assert!(!report.observed);
        assert!(matches!(report.outcome, ProvisionOutcome::Bound { .. }));
    }
}
