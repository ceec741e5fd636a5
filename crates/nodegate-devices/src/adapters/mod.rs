//! Transport implementations.

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use memory::MemoryTransport;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
