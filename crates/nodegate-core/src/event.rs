//! Gateway events reported to observers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something the gateway did or refused to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayEvent {
    /// A device was bound to a schema, or an existing binding was re-sent.
    DeviceProvisioned {
        device_id: String,
        device_type: String,
        /// `true` when the device was already provisioned.
        repeated: bool,
        timestamp: i64,
    },
    /// A provisioning request was rejected.
    ProvisionRejected {
        device_id: String,
        reason: String,
        timestamp: i64,
    },
    /// A telemetry frame was applied to the registry.
    TelemetryAccepted {
        device_id: String,
        channels: Vec<String>,
        timestamp: i64,
    },
    /// A command was validated and published.
    CommandSent {
        device_id: String,
        channels: Vec<String>,
        timestamp: i64,
    },
    /// An inbound message was dropped at the router.
    MessageDropped {
        topic: String,
        device_id: Option<String>,
        reason: String,
        timestamp: i64,
    },
}

impl GatewayEvent {
    /// Variant name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceProvisioned { .. } => "DeviceProvisioned",
            Self::ProvisionRejected { .. } => "ProvisionRejected",
            Self::TelemetryAccepted { .. } => "TelemetryAccepted",
            Self::CommandSent { .. } => "CommandSent",
            Self::MessageDropped { .. } => "MessageDropped",
        }
    }

    /// Device the event concerns, if known.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceProvisioned { device_id, .. }
            | Self::ProvisionRejected { device_id, .. }
            | Self::TelemetryAccepted { device_id, .. }
            | Self::CommandSent { device_id, .. } => Some(device_id),
            Self::MessageDropped { device_id, .. } => device_id.as_deref(),
        }
    }

    pub fn is_provisioning_event(&self) -> bool {
        matches!(
            self,
            Self::DeviceProvisioned { .. } | Self::ProvisionRejected { .. }
        )
    }

    pub fn is_error_event(&self) -> bool {
        matches!(
            self,
            Self::ProvisionRejected { .. } | Self::MessageDropped { .. }
        )
    }
}

/// Envelope attached to every published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub source: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
