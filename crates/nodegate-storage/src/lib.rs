//! Durable storage for nodegate.
//!
//! Device schemas are kept as JSON documents in a redb database keyed by
//! device type. The protocol engine never writes here; publishing schemas is
//! an administrative operation (see the `nodegate schema import` command).

pub mod error;
pub mod schema_store;

pub use error::{Error, Result};
pub use schema_store::{SchemaDocumentStore, StoredSchemaDocument};
