//! Core types shared by the nodegate crates.
//!
//! Holds the gateway configuration, the error type used at crate boundaries,
//! and the event bus that carries gateway events to observers.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use event::{EventMetadata, GatewayEvent};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilterBuilder, FilteredReceiver,
    SharedEventBus,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{GatewayConfig, MqttSettings, env_vars};
    pub use crate::error::{Error, Result};
    pub use crate::event::{EventMetadata, GatewayEvent};
    pub use crate::eventbus::{EventBus, SharedEventBus};
}
