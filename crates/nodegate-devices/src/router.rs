//! Protocol router.
//!
//! Classifies inbound topics, hands provisioning requests to the
//! [`ProvisioningMachine`], validates and applies telemetry, and owns the
//! outbound command path. Inbound failures stop here: [`ProtocolRouter::dispatch`]
//! logs them, reports a [`GatewayEvent::MessageDropped`] and drops the message.

use std::sync::Arc;

use nodegate_core::{GatewayEvent, SharedEventBus};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{Action, ChannelUpdate, InboundRoute, TopicScheme};
use crate::provisioning::{ProvisionReport, ProvisioningMachine};
use crate::registry::DeviceRegistry;
use crate::transport::Transport;
use crate::validator::{validate_update, UpdateContext, ValidatedUpdate};

/// What an inbound message did.
#[derive(Debug, Clone)]
pub enum Dispatched {
    Provision(ProvisionReport),
    /// Number of channels written.
    Telemetry(usize),
}

pub struct ProtocolRouter {
    topics: TopicScheme,
    registry: Arc<DeviceRegistry>,
    provisioning: Arc<ProvisioningMachine>,
    transport: Arc<dyn Transport>,
    events: SharedEventBus,
}

impl ProtocolRouter {
    pub fn new(
        topics: TopicScheme,
        registry: Arc<DeviceRegistry>,
        provisioning: Arc<ProvisioningMachine>,
        transport: Arc<dyn Transport>,
        events: SharedEventBus,
    ) -> Self {
        Self {
            topics,
            registry,
            provisioning,
            transport,
            events,
        }
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Classify a topic without handling it.
    pub fn route(&self, topic: &str) -> DeviceResult<InboundRoute> {
        self.topics.parse_inbound(topic)
    }

    /// Handle one inbound message, returning any failure to the caller.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> DeviceResult<Dispatched> {
        let route = self.route(topic)?;
        self.handle_route(&route, payload).await
    }

    /// Handle a message whose topic is already classified.
    pub async fn handle_route(
        &self,
        route: &InboundRoute,
        payload: &[u8],
    ) -> DeviceResult<Dispatched> {
        match route.action {
            Action::Provision => self
                .provisioning
                .on_provision_request(&route.device_id, payload)
                .await
                .map(Dispatched::Provision),
            Action::Telemetry => self
                .ingest_telemetry(&route.device_id, payload)
                .await
                .map(Dispatched::Telemetry),
            Action::Command => Err(DeviceError::UnknownAction {
                action: route.action.to_string(),
                topic: self.topics.command(&route.device_id),
            }),
        }
    }

    /// Handle one inbound message; failures are reported and swallowed.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> Option<Dispatched> {
        match self.route(topic) {
            Ok(route) => self.dispatch_route(topic, &route, payload).await,
            Err(e) => {
                self.report_drop(topic, None, &e);
                None
            }
        }
    }

    /// [`dispatch`](Self::dispatch) for an already classified topic.
    pub async fn dispatch_route(
        &self,
        topic: &str,
        route: &InboundRoute,
        payload: &[u8],
    ) -> Option<Dispatched> {
        match self.handle_route(route, payload).await {
            Ok(dispatched) => Some(dispatched),
            Err(e) => {
                self.report_drop(topic, Some(&route.device_id), &e);
                None
            }
        }
    }

    /// Log and publish a dropped inbound message.
    pub fn report_drop(&self, topic: &str, device_id: Option<&str>, error: &DeviceError) {
        match error {
            DeviceError::InvalidTopic(_) | DeviceError::UnknownAction { .. } => {
                debug!("Dropped message on {}: {}", topic, error)
            }
            _ => warn!("Dropped message on {} ({}): {}", topic, error.kind(), error),
        }
        self.events.publish_from(
            GatewayEvent::MessageDropped {
                topic: topic.to_string(),
                device_id: device_id.map(str::to_string),
                reason: error.to_string(),
                timestamp: chrono::Utc::now().timestamp(),
            },
            "router",
        );
    }

    /// Validate telemetry against the bound schema and apply it.
    ///
    /// An empty update is accepted and changes nothing.
    pub async fn ingest_telemetry(&self, device_id: &str, payload: &[u8]) -> DeviceResult<usize> {
        let update = ChannelUpdate::from_slice(payload)?;
        let schema = self.registry.bound_schema(device_id).await?;
        if update.is_empty() {
            return Ok(0);
        }

        let validated = validate_update(&schema, &update, UpdateContext::TELEMETRY)?;
        let applied = self.registry.apply_telemetry(device_id, &validated).await?;

        debug!("Applied {} channels from {}", applied, device_id);
        self.events.publish_from(
            GatewayEvent::TelemetryAccepted {
                device_id: device_id.to_string(),
                channels: validated.channel_names(),
                timestamp: chrono::Utc::now().timestamp(),
            },
            "router",
        );
        Ok(applied)
    }

    /// Validate a command and publish it on `down/command/{deviceId}`.
    ///
    /// Nothing is published unless every channel is valid and commandable.
    pub async fn send_command(
        &self,
        device_id: &str,
        update: &ChannelUpdate,
    ) -> DeviceResult<ValidatedUpdate> {
        if update.is_empty() {
            return Err(DeviceError::MalformedPayload(
                "command has no channels".to_string(),
            ));
        }

        let topic = self.topics.checked_command(device_id)?;
        let schema = self.registry.bound_schema(device_id).await?;
        let validated = validate_update(&schema, update, UpdateContext::COMMAND)?;

        self.transport.publish(&topic, validated.to_payload()).await?;

        if let Err(e) = self.registry.record_command_sent(device_id, &validated).await {
            warn!("Command to {} published but not recorded: {}", device_id, e);
        }
        info!(
            "Sent command to {}: {}",
            device_id,
            validated.channel_names().join(", ")
        );
        self.events.publish_from(
            GatewayEvent::CommandSent {
                device_id: device_id.to_string(),
                channels: validated.channel_names(),
                timestamp: chrono::Utc::now().timestamp(),
            },
            "router",
        );
        Ok(validated)
    }
}
