//! Device registry.
//!
//! Owns every [`Device`] record. Each record sits behind its own async
//! mutex, so all mutations of one device are linearized while different
//! devices proceed in parallel. The outer map is only touched to find or
//! insert a record and is never held across an await.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DeviceError, DeviceResult};
use crate::schema::SharedSchema;
use crate::validator::ValidatedUpdate;
use crate::value::ChannelValue;

/// Provisioning state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Unprovisioned,
    AwaitingBinding,
    Provisioned,
    /// Resolution failed; a new request starts over.
    ProvisionFailed,
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unprovisioned => write!(f, "unprovisioned"),
            Self::AwaitingBinding => write!(f, "awaiting_binding"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::ProvisionFailed => write!(f, "provision_failed"),
        }
    }
}

/// Last accepted value of a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReading {
    pub value: ChannelValue,
    pub updated_at: DateTime<Utc>,
}

/// Most recent command published to a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub values: BTreeMap<String, ChannelValue>,
    pub sent_at: DateTime<Utc>,
}

/// A known device.
#[derive(Debug, Clone)]
pub struct Device {
    device_id: String,
    schema: Option<SharedSchema>,
    state: ProvisionState,
    last_known: BTreeMap<String, ChannelReading>,
    created_at: DateTime<Utc>,
    last_seen: Option<DateTime<Utc>>,
    commands_sent: u64,
    last_command: Option<CommandRecord>,
    failure_reason: Option<String>,
}

impl Device {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            schema: None,
            state: ProvisionState::Unprovisioned,
            last_known: BTreeMap::new(),
            created_at: Utc::now(),
            last_seen: None,
            commands_sent: 0,
            last_command: None,
            failure_reason: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Bound schema, if provisioned.
    pub fn schema(&self) -> Option<&SharedSchema> {
        self.schema.as_ref()
    }

    pub fn device_type(&self) -> Option<&str> {
        self.schema.as_ref().map(|s| s.device_type())
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn is_provisioned(&self) -> bool {
        self.state == ProvisionState::Provisioned
    }

    pub fn last_known(&self) -> &BTreeMap<String, ChannelReading> {
        &self.last_known
    }

    pub fn channel_value(&self, channel: &str) -> Option<&ChannelValue> {
        self.last_known.get(channel).map(|r| &r.value)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent
    }

    pub fn last_command(&self) -> Option<&CommandRecord> {
        self.last_command.as_ref()
    }

    /// Why the last provisioning attempt failed.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    fn bound_schema_for(&self, update: &ValidatedUpdate) -> DeviceResult<()> {
        match &self.schema {
            Some(schema) if self.is_provisioned() => {
                if update.validated_against(schema) {
                    Ok(())
                } else {
                    Err(DeviceError::StaleSchema(self.device_id.clone()))
                }
            }
            _ => Err(DeviceError::NotProvisioned(self.device_id.clone())),
        }
    }
}

type DeviceHandle = Arc<Mutex<Device>>;

/// Keyed store of device records.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, device_id: &str) -> Option<DeviceHandle> {
        self.devices.get(device_id).map(|h| h.value().clone())
    }

    fn handle_or_create(&self, device_id: &str) -> DeviceHandle {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!("Registered device {}", device_id);
                Arc::new(Mutex::new(Device::new(device_id)))
            })
            .value()
            .clone()
    }

    fn require(&self, device_id: &str) -> DeviceResult<DeviceHandle> {
        self.handle(device_id)
            .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))
    }

    /// Existing record, or a new unprovisioned one.
    pub async fn get_or_create(&self, device_id: &str) -> Device {
        self.handle_or_create(device_id).lock().await.clone()
    }

    /// Snapshot of a device.
    pub async fn get(&self, device_id: &str) -> Option<Device> {
        match self.handle(device_id) {
            Some(handle) => Some(handle.lock().await.clone()),
            None => None,
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Schema bound to a provisioned device.
    pub async fn bound_schema(&self, device_id: &str) -> DeviceResult<SharedSchema> {
        let not_provisioned = || DeviceError::NotProvisioned(device_id.to_string());
        let handle = self.handle(device_id).ok_or_else(not_provisioned)?;
        let device = handle.lock().await;
        match &device.schema {
            Some(schema) if device.is_provisioned() => Ok(schema.clone()),
            _ => Err(not_provisioned()),
        }
    }

    /// Enter `AwaitingBinding`, creating the device if needed.
    pub async fn mark_awaiting(&self, device_id: &str) -> DeviceResult<()> {
        let handle = self.handle_or_create(device_id);
        let mut device = handle.lock().await;
        if device.is_provisioned() {
            return Err(DeviceError::AlreadyProvisioned(device_id.to_string()));
        }
        device.state = ProvisionState::AwaitingBinding;
        device.failure_reason = None;
        Ok(())
    }

    /// Bind `schema` and enter `Provisioned`.
    pub async fn bind_schema(&self, device_id: &str, schema: SharedSchema) -> DeviceResult<()> {
        let handle = self.require(device_id)?;
        let mut device = handle.lock().await;
        if device.is_provisioned() {
            return Err(DeviceError::AlreadyProvisioned(device_id.to_string()));
        }
        info!(
            "Device {} bound to schema '{}'",
            device_id,
            schema.device_type()
        );
        device.schema = Some(schema);
        device.state = ProvisionState::Provisioned;
        device.failure_reason = None;
        Ok(())
    }

    /// Enter `ProvisionFailed`. A provisioned device is left alone.
    pub async fn mark_failed(&self, device_id: &str, reason: impl Into<String>) -> DeviceResult<()> {
        let handle = self.require(device_id)?;
        let mut device = handle.lock().await;
        if device.is_provisioned() {
            return Err(DeviceError::AlreadyProvisioned(device_id.to_string()));
        }
        device.state = ProvisionState::ProvisionFailed;
        device.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Merge validated telemetry into the last known values.
    ///
    /// Unknown devices are not created. Returns the number of channels
    /// written.
    pub async fn apply_telemetry(
        &self,
        device_id: &str,
        update: &ValidatedUpdate,
    ) -> DeviceResult<usize> {
        let handle = self
            .handle(device_id)
            .ok_or_else(|| DeviceError::NotProvisioned(device_id.to_string()))?;
        let mut device = handle.lock().await;
        device.bound_schema_for(update)?;

        let now = Utc::now();
        for (channel, value) in update.values() {
            device.last_known.insert(
                channel.clone(),
                ChannelReading {
                    value: value.clone(),
                    updated_at: now,
                },
            );
        }
        device.last_seen = Some(now);
        Ok(update.len())
    }

    /// Record that a command was published. Last known values are untouched.
    pub async fn record_command_sent(
        &self,
        device_id: &str,
        update: &ValidatedUpdate,
    ) -> DeviceResult<()> {
        let handle = self
            .handle(device_id)
            .ok_or_else(|| DeviceError::NotProvisioned(device_id.to_string()))?;
        let mut device = handle.lock().await;
        device.bound_schema_for(update)?;

        device.commands_sent += 1;
        device.last_command = Some(CommandRecord {
            values: update.values().clone(),
            sent_at: Utc::now(),
        });
        Ok(())
    }

    /// Unbind the schema and clear channel data.
    pub async fn reset(&self, device_id: &str) -> DeviceResult<()> {
        let handle = self.require(device_id)?;
        let mut device = handle.lock().await;
        device.schema = None;
        device.state = ProvisionState::Unprovisioned;
        device.last_known.clear();
        device.failure_reason = None;
        info!("Device {} reset", device_id);
        Ok(())
    }

    /// Remove a device, returning its final snapshot.
    pub async fn deregister(&self, device_id: &str) -> DeviceResult<Device> {
        let (_, handle) = self
            .devices
            .remove(device_id)
            .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))?;
        info!("Device {} deregistered", device_id);
        let device = handle.lock().await.clone();
        Ok(device)
    }

    /// Snapshots of every device, ordered by id.
    pub async fn list(&self) -> Vec<Device> {
        let handles: Vec<DeviceHandle> = self.devices.iter().map(|e| e.value().clone()).collect();
        let mut devices = Vec::with_capacity(handles.len());
        for handle in handles {
            devices.push(handle.lock().await.clone());
        }
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelUpdate;
    use crate::schema::{ChannelDefinition, DeviceSchema};
    use crate::validator::{validate_update, UpdateContext};
    use serde_json::json;

    fn schema() -> SharedSchema {
        DeviceSchema::new(
            "AC",
            [
                ChannelDefinition::boolean("relay01"),
                ChannelDefinition::number("temp").with_range(20.0, 30.0).commandable(),
            ],
        )
        .unwrap()
        .into_shared()
    }

    fn telemetry(schema: &SharedSchema, temp: i64) -> ValidatedUpdate {
        validate_update(
            schema,
            &ChannelUpdate::new().with("temp", temp),
            UpdateContext::TELEMETRY,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = DeviceRegistry::new();
        let first = registry.get_or_create("A1").await;
        let second = registry.get_or_create("A1").await;
        assert_eq!(first.state(), ProvisionState::Unprovisioned);
        assert_eq!(first.created_at(), second.created_at());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let registry = DeviceRegistry::new();
        let schema = schema();
        registry.mark_awaiting("A1").await.unwrap();
        registry.bind_schema("A1", schema.clone()).await.unwrap();

        assert!(matches!(
            registry.bind_schema("A1", schema.clone()).await,
            Err(DeviceError::AlreadyProvisioned(_))
        ));
        assert!(matches!(
            registry.mark_awaiting("A1").await,
            Err(DeviceError::AlreadyProvisioned(_))
        ));

        registry.reset("A1").await.unwrap();
        registry.bind_schema("A1", schema).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_unknown_device() {
        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.bind_schema("ghost", schema()).await,
            Err(DeviceError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_telemetry_requires_provisioning() {
        let registry = DeviceRegistry::new();
        let schema = schema();
        let update = telemetry(&schema, 25);

        assert!(matches!(
            registry.apply_telemetry("A1", &update).await,
            Err(DeviceError::NotProvisioned(_))
        ));
        assert!(!registry.contains("A1"));

        registry.get_or_create("A1").await;
        assert!(matches!(
            registry.apply_telemetry("A1", &update).await,
            Err(DeviceError::NotProvisioned(_))
        ));
        assert!(registry.get("A1").await.unwrap().last_known().is_empty());
    }

    #[tokio::test]
    async fn test_apply_telemetry_merges() {
        let registry = DeviceRegistry::new();
        let schema = schema();
        registry.get_or_create("A1").await;
        registry.bind_schema("A1", schema.clone()).await.unwrap();

        registry.apply_telemetry("A1", &telemetry(&schema, 25)).await.unwrap();
        let relay = validate_update(
            &schema,
            &ChannelUpdate::new().with("relay01", true),
            UpdateContext::TELEMETRY,
        )
        .unwrap();
        registry.apply_telemetry("A1", &relay).await.unwrap();

        let device = registry.get("A1").await.unwrap();
        assert_eq!(device.channel_value("temp"), Some(&ChannelValue::Number(25.0)));
        assert_eq!(device.channel_value("relay01"), Some(&ChannelValue::Bool(true)));
        assert!(device.last_seen().is_some());
    }

    #[tokio::test]
    async fn test_stale_schema_rejected() {
        let registry = DeviceRegistry::new();
        let bound = schema();
        let other = schema();
        registry.get_or_create("A1").await;
        registry.bind_schema("A1", bound).await.unwrap();

        assert!(matches!(
            registry.apply_telemetry("A1", &telemetry(&other, 25)).await,
            Err(DeviceError::StaleSchema(_))
        ));
    }

    #[tokio::test]
    async fn test_command_bookkeeping_leaves_values() {
        let registry = DeviceRegistry::new();
        let schema = schema();
        registry.get_or_create("A1").await;
        registry.bind_schema("A1", schema.clone()).await.unwrap();

        let command = validate_update(
            &schema,
            &ChannelUpdate::new().with("temp", json!(22)),
            UpdateContext::COMMAND,
        )
        .unwrap();
        registry.record_command_sent("A1", &command).await.unwrap();

        let device = registry.get("A1").await.unwrap();
        assert_eq!(device.commands_sent(), 1);
        assert!(device.last_known().is_empty());
        assert_eq!(
            device.last_command().unwrap().values.get("temp"),
            Some(&ChannelValue::Number(22.0))
        );
    }

    #[tokio::test]
    async fn test_mark_failed_and_recover() {
        let registry = DeviceRegistry::new();
        registry.mark_awaiting("A1").await.unwrap();
        registry.mark_failed("A1", "no schema").await.unwrap();

        let device = registry.get("A1").await.unwrap();
        assert_eq!(device.state(), ProvisionState::ProvisionFailed);
        assert_eq!(device.failure_reason(), Some("no schema"));

        registry.mark_awaiting("A1").await.unwrap();
        registry.bind_schema("A1", schema()).await.unwrap();
        assert!(registry.get("A1").await.unwrap().failure_reason().is_none());
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = DeviceRegistry::new();
        registry.get_or_create("B2").await;
        registry.get_or_create("A1").await;
        let ids: Vec<String> = registry
            .list()
            .await
            .iter()
            .map(|d| d.device_id().to_string())
            .collect();
        assert_eq!(ids, vec!["A1", "B2"]);

        let removed = registry.deregister("A1").await.unwrap();
        assert_eq!(removed.device_id(), "A1");
        assert!(matches!(
            registry.deregister("A1").await,
            Err(DeviceError::DeviceNotFound(_))
        ));
        assert_eq!(registry.len(), 1);
    }
}
