//! Topic taxonomy and payload shapes.
//!
//! ```text
//! up/provision/{deviceId}     device -> gateway   provisioning request
//! down/provision/{deviceId}   gateway -> device   provisioning response
//! down/command/{deviceId}     gateway -> device   command
//! up/telemetry/{deviceId}     device -> gateway   telemetry
//! ```
//!
//! The gateway subscribes to `up/+/+` only.

pub mod payload;
pub mod topic;

pub use payload::{ChannelUpdate, ProvisionRequest, ProvisionResponse};
pub use topic::{Action, InboundRoute, TopicScheme};
