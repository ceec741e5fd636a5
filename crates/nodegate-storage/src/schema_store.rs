//! Schema document store backed by redb.
//!
//! Each device type maps to one [`StoredSchemaDocument`]. Saving a document
//! for an existing type bumps its revision; earlier revisions are not kept.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// device_type -> StoredSchemaDocument (JSON)
const SCHEMAS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("device_schemas");

/// A schema document as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSchemaDocument {
    pub device_type: String,
    /// Starts at 1 and increases on every save.
    pub revision: u64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    /// The raw schema document (`{"device_name": ..., "channels": {...}}`).
    pub document: serde_json::Value,
}

/// redb-backed store of schema documents.
pub struct SchemaDocumentStore {
    db: Database,
    path: String,
}

impl SchemaDocumentStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path_ref)?;

        // Make sure the table exists so readers never hit TableDoesNotExist
        let write_txn = db.begin_write()?;
        {
            let _schemas = write_txn.open_table(SCHEMAS_TABLE)?;
        }
        write_txn.commit()?;

        tracing::debug!("Opened schema store at {}", path_ref.display());

        Ok(Arc::new(Self {
            db,
            path: path_ref.to_string_lossy().to_string(),
        }))
    }

    /// Filesystem path of the database.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Save a document, returning the stored record with its new revision.
    pub fn save(
        &self,
        device_type: &str,
        document: serde_json::Value,
    ) -> Result<StoredSchemaDocument> {
        if device_type.trim().is_empty() {
            return Err(Error::InvalidInput("device type must not be empty".to_string()));
        }

        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(SCHEMAS_TABLE)?;
            let previous = match table.get(device_type)? {
                Some(existing) => {
                    serde_json::from_str::<StoredSchemaDocument>(existing.value())?.revision
                }
                None => 0,
            };
            let record = StoredSchemaDocument {
                device_type: device_type.to_string(),
                revision: previous + 1,
                updated_at: chrono::Utc::now().timestamp_millis(),
                document,
            };
            let json = serde_json::to_string(&record)?;
            table.insert(device_type, json.as_str())?;
            record
        };
        write_txn.commit()?;

        tracing::info!(
            "Stored schema for device type '{}' (revision {})",
            record.device_type,
            record.revision
        );
        Ok(record)
    }

    /// Load the document for a device type.
    pub fn load(&self, device_type: &str) -> Result<Option<StoredSchemaDocument>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCHEMAS_TABLE)?;

        match table.get(device_type)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    /// All stored documents, ordered by device type.
    pub fn list(&self) -> Result<Vec<StoredSchemaDocument>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCHEMAS_TABLE)?;

        let mut documents = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            match serde_json::from_str::<StoredSchemaDocument>(value.value()) {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    tracing::warn!("Skipping unreadable schema record '{}': {}", key.value(), e)
                }
            }
        }
        Ok(documents)
    }

    /// Remove a device type. Returns whether it existed.
    pub fn delete(&self, device_type: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SCHEMAS_TABLE)?;
            let removed = table.remove(device_type)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }
}
