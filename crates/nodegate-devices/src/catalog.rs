//! Schema sources.
//!
//! The protocol layer only ever resolves schemas by device type through
//! [`SchemaSource`]. Publishing is an administrative operation on the
//! concrete sources.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nodegate_storage::{SchemaDocumentStore, StoredSchemaDocument};
use tracing::{debug, info, warn};

use crate::error::DeviceError;
use crate::schema::{DeviceSchema, SharedSchema};

/// Lookup of the schema for a device type.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// `SchemaNotFound` when the type is unknown.
    async fn resolve_schema(&self, device_type: &str) -> Result<SharedSchema, DeviceError>;
}

/// In-memory schema catalog.
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: DashMap<String, SharedSchema>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a schema, replacing any previous one for the same type.
    ///
    /// Devices already bound keep the schema they were bound to.
    pub fn publish(&self, schema: DeviceSchema) -> SharedSchema {
        let shared = schema.into_shared();
        let previous = self
            .schemas
            .insert(shared.device_type().to_string(), shared.clone());
        if previous.is_some() {
            info!("Republished schema for device type '{}'", shared.device_type());
        } else {
            info!(
                "Published schema for device type '{}' ({} channels)",
                shared.device_type(),
                shared.len()
            );
        }
        shared
    }

    pub fn get(&self, device_type: &str) -> Option<SharedSchema> {
        self.schemas.get(device_type).map(|s| s.value().clone())
    }

    pub fn remove(&self, device_type: &str) -> Option<SharedSchema> {
        self.schemas.remove(device_type).map(|(_, s)| s)
    }

    /// Published device types, sorted.
    pub fn device_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.schemas.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Publish every `*.json` document in `dir`. A file without
    /// `device_name` takes its type from the file stem.
    ///
    /// Stops at the first invalid document.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, DeviceError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| DeviceError::Storage(format!("{}: {}", dir.display(), e)))?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let schema = read_schema_file(&path)?;
            self.publish(schema);
            loaded += 1;
        }

        info!("Loaded {} schema documents from {}", loaded, dir.display());
        Ok(loaded)
    }
}

/// Parse one schema file; the file stem names the type when the document
/// does not.
pub fn read_schema_file(path: &Path) -> Result<DeviceSchema, DeviceError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DeviceError::Storage(format!("{}: {}", path.display(), e)))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| DeviceError::MalformedPayload(format!("{}: {}", path.display(), e)))?;

    let has_name = value
        .get("device_name")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.trim().is_empty());
    let stem = path.file_stem().and_then(|s| s.to_str());
    let fallback = if has_name { None } else { stem };

    DeviceSchema::from_json_value(value, fallback)
}

#[async_trait]
impl SchemaSource for SchemaCatalog {
    async fn resolve_schema(&self, device_type: &str) -> Result<SharedSchema, DeviceError> {
        self.get(device_type)
            .ok_or_else(|| DeviceError::SchemaNotFound(device_type.to_string()))
    }
}

/// Identifies one saved version of a stored document. Revisions restart
/// at 1 after a delete, so the save time is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordVersion {
    revision: u64,
    updated_at: i64,
}

impl From<&StoredSchemaDocument> for RecordVersion {
    fn from(record: &StoredSchemaDocument) -> Self {
        Self {
            revision: record.revision,
            updated_at: record.updated_at,
        }
    }
}

/// Schema source backed by the redb document store.
///
/// Parsed schemas are cached per saved version, so repeated resolutions of
/// an unchanged document return the same `Arc`.
pub struct StoredSchemaSource {
    store: Arc<SchemaDocumentStore>,
    cache: DashMap<String, (RecordVersion, SharedSchema)>,
}

impl StoredSchemaSource {
    pub fn new(store: Arc<SchemaDocumentStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Open the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        Ok(Self::new(SchemaDocumentStore::open(path)?))
    }

    pub fn store(&self) -> &Arc<SchemaDocumentStore> {
        &self.store
    }

    /// Validate and persist a schema document.
    pub async fn publish(&self, schema: &DeviceSchema) -> Result<StoredSchemaDocument, DeviceError> {
        let document = serde_json::to_value(schema.to_document())
            .map_err(|e| DeviceError::Storage(e.to_string()))?;
        let store = self.store.clone();
        let device_type = schema.device_type().to_string();

        let record = tokio::task::spawn_blocking(move || store.save(&device_type, document))
            .await
            .map_err(|e| DeviceError::Storage(e.to_string()))??;
        self.cache.remove(&record.device_type);
        Ok(record)
    }

    /// Remove a stored document. Returns whether it existed.
    pub async fn delete(&self, device_type: &str) -> Result<bool, DeviceError> {
        let store = self.store.clone();
        let key = device_type.to_string();
        let existed = tokio::task::spawn_blocking(move || store.delete(&key))
            .await
            .map_err(|e| DeviceError::Storage(e.to_string()))??;
        self.cache.remove(device_type);
        Ok(existed)
    }

    /// Stored device types.
    pub async fn device_types(&self) -> Result<Vec<String>, DeviceError> {
        let store = self.store.clone();
        let records = tokio::task::spawn_blocking(move || store.list())
            .await
            .map_err(|e| DeviceError::Storage(e.to_string()))??;
        Ok(records.into_iter().map(|r| r.device_type).collect())
    }
}

#[async_trait]
impl SchemaSource for StoredSchemaSource {
    async fn resolve_schema(&self, device_type: &str) -> Result<SharedSchema, DeviceError> {
        let store = self.store.clone();
        let key = device_type.to_string();
        let record = tokio::task::spawn_blocking(move || store.load(&key))
            .await
            .map_err(|e| DeviceError::Storage(e.to_string()))??
            .ok_or_else(|| DeviceError::SchemaNotFound(device_type.to_string()))?;

        let version = RecordVersion::from(&record);
        if let Some(cached) = self.cache.get(device_type) {
            if cached.0 == version {
                return Ok(cached.1.clone());
            }
        }

        let schema = DeviceSchema::from_json_value(record.document, Some(device_type))
            .map_err(|e| {
                warn!("Stored schema for '{}' is invalid: {}", device_type, e);
                e
            })?
            .into_shared();
        debug!(
            "Loaded schema '{}' revision {} from store",
            device_type, record.revision
        );
        self.cache
            .insert(device_type.to_string(), (version, schema.clone()));
        Ok(schema)
    }
}

/// Tries each source in order; the first hit wins.
#[derive(Default)]
pub struct LayeredSchemaSource {
    layers: Vec<Arc<dyn SchemaSource>>,
}

impl LayeredSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, source: Arc<dyn SchemaSource>) -> Self {
        self.layers.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[async_trait]
impl SchemaSource for LayeredSchemaSource {
    async fn resolve_schema(&self, device_type: &str) -> Result<SharedSchema, DeviceError> {
        for layer in &self.layers {
            match layer.resolve_schema(device_type).await {
                Err(DeviceError::SchemaNotFound(_)) => continue,
                other => return other,
            }
        }
        Err(DeviceError::SchemaNotFound(device_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ChannelDefinition;

    fn fan(step: f64) -> DeviceSchema {
        DeviceSchema::new(
            "fan",
            [ChannelDefinition::number("speed")
                .with_range(0.0, 5.0)
                .with_multiple_of(step)
                .commandable()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_catalog_resolve() {
        let catalog = SchemaCatalog::new();
        assert!(matches!(
            catalog.resolve_schema("fan").await,
            Err(DeviceError::SchemaNotFound(t)) if t == "fan"
        ));

        let published = catalog.publish(fan(1.0));
        let resolved = catalog.resolve_schema("fan").await.unwrap();
        assert!(Arc::ptr_eq(&published, &resolved));
        assert_eq!(catalog.device_types(), vec!["fan".to_string()]);
    }

    #[tokio::test]
    async fn test_republish_keeps_old_handle_intact() {
        let catalog = SchemaCatalog::new();
        let v1 = catalog.publish(fan(1.0));
        let v2 = catalog.publish(fan(0.5));

        assert!(!Arc::ptr_eq(&v1, &v2));
        assert_ne!(*v1, *v2);
        let current = catalog.resolve_schema("fan").await.unwrap();
        assert!(Arc::ptr_eq(&current, &v2));
    }

    #[tokio::test]
    async fn test_layered_source_order() {
        let first = Arc::new(SchemaCatalog::new());
        let second = Arc::new(SchemaCatalog::new());
        second.publish(fan(1.0));
        let shadow = first.publish(fan(0.5));

        let layered = LayeredSchemaSource::new()
            .with_layer(first.clone())
            .with_layer(second.clone());
        let resolved = layered.resolve_schema("fan").await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &shadow));

        first.remove("fan");
        let resolved = layered.resolve_schema("fan").await.unwrap();
        assert!(!Arc::ptr_eq(&resolved, &shadow));
        assert!(layered.resolve_schema("toaster").await.is_err());
    }
}
