//! Errors raised by the protocol engine.

use thiserror::Error;

use crate::schema::SchemaError;
use crate::transport::TransportError;
use crate::validator::UpdateRejection;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Device-level error taxonomy.
///
/// Per-channel validation failures are carried inside [`UpdateRejection`];
/// everything else concerns the device, the topic or the payload as a whole.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A channel update failed validation. Nothing was applied.
    #[error("Update rejected: {0}")]
    Rejected(#[from] UpdateRejection),

    /// The device has no schema bound.
    #[error("Device not provisioned: {0}")]
    NotProvisioned(String),

    /// The device is already bound to a schema.
    #[error("Device already provisioned: {0}")]
    AlreadyProvisioned(String),

    /// The registry holds no record for the device.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Topic action outside the taxonomy.
    #[error("Unknown action '{action}' on topic {topic}")]
    UnknownAction { action: String, topic: String },

    /// No schema is published for the device type.
    #[error("No schema for device type: {0}")]
    SchemaNotFound(String),

    /// Payload is not the expected JSON shape.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Topic does not have the `up/{action}/{deviceId}` shape.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Schema document breaks a channel definition invariant.
    #[error("Invalid schema: {0}")]
    InvalidSchema(#[from] SchemaError),

    /// The update was validated against a schema the device no longer has.
    #[error("Schema bound to device {0} changed during the update")]
    StaleSchema(String),

    /// The gateway refused a provisioning request (device side).
    #[error("Provisioning rejected: {0}")]
    ProvisionRejected(String),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Schema store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The device's inbound queue is full; the message was dropped.
    #[error("Inbound queue for device {0} is full")]
    LaneFull(String),
}

impl From<nodegate_storage::Error> for DeviceError {
    fn from(e: nodegate_storage::Error) -> Self {
        DeviceError::Storage(e.to_string())
    }
}

impl DeviceError {
    /// Short machine-readable kind, used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "Rejected",
            Self::NotProvisioned(_) => "NotProvisioned",
            Self::AlreadyProvisioned(_) => "AlreadyProvisioned",
            Self::DeviceNotFound(_) => "DeviceNotFound",
            Self::UnknownAction { .. } => "UnknownAction",
            Self::SchemaNotFound(_) => "SchemaNotFound",
            Self::MalformedPayload(_) => "MalformedPayload",
            Self::InvalidTopic(_) => "InvalidTopic",
            Self::InvalidSchema(_) => "InvalidSchema",
            Self::StaleSchema(_) => "StaleSchema",
            Self::ProvisionRejected(_) => "ProvisionRejected",
            Self::Transport(_) => "Transport",
            Self::Storage(_) => "Storage",
            Self::LaneFull(_) => "LaneFull",
        }
    }
}
