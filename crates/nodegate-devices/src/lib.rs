//! Schema-driven channel protocol engine.
//!
//! This crate sits between a fleet of constrained devices and the rest of
//! the system. Devices obtain their channel schema through a provisioning
//! handshake, report telemetry, and receive commands, all over a fixed topic
//! taxonomy on a publish/subscribe transport.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT transport (rumqttc) |
//!
//! ## Architecture
//!
//! - **DeviceSchema**: channel definitions of one device type
//! - **validator**: all-or-nothing validation of channel updates
//! - **DeviceRegistry**: device records, serialized per device
//! - **ProtocolRouter**: topic classification, telemetry, commands
//! - **ProvisioningMachine**: gateway side of the handshake
//! - **Gateway**: wires the above to a [`Transport`] with per-device lanes
//! - **NodeProvisioner**: device side of the handshake

pub mod adapters;
pub mod catalog;
pub mod error;
pub mod node;
pub mod protocol;
pub mod provisioning;
pub mod registry;
pub mod router;
pub mod schema;
pub mod service;
pub mod transport;
pub mod validator;
pub mod value;

pub use adapters::MemoryTransport;
#[cfg(feature = "mqtt")]
pub use adapters::MqttTransport;
pub use catalog::{LayeredSchemaSource, SchemaCatalog, SchemaSource, StoredSchemaSource};
pub use error::{DeviceError, DeviceResult};
pub use node::{NodeEvent, NodeProvisioner, NodeState, OutboundFrame, RetryPolicy};
pub use protocol::{
    Action, ChannelUpdate, InboundRoute, ProvisionRequest, ProvisionResponse, TopicScheme,
};
pub use provisioning::{
    DeviceTypeResolver, PayloadDeviceTypeResolver, ProvisionOutcome, ProvisionReport,
    ProvisioningMachine,
};
pub use registry::{ChannelReading, CommandRecord, Device, DeviceRegistry, ProvisionState};
pub use router::{Dispatched, ProtocolRouter};
pub use schema::{
    ChannelDefinition, ChannelKind, ChannelSpec, ChannelType, DeviceSchema, NumberBounds,
    SchemaDocument, SchemaError, SharedSchema,
};
pub use service::{Gateway, GatewayBuilder};
pub use transport::{InboundMessage, MessageStream, Transport, TransportError};
pub use validator::{
    validate_update, validate_value, UpdateContext, UpdateRejection, ValidatedUpdate,
    ValidationError,
};
pub use value::ChannelValue;
