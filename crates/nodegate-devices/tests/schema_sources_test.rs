//! Schema catalog directory loading and the redb-backed source.

use std::sync::Arc;

use nodegate_devices::{
    ChannelDefinition, DeviceError, DeviceSchema, SchemaCatalog, SchemaError, SchemaSource,
    StoredSchemaSource,
};
use serde_json::json;

const AC_DOCUMENT: &str = r#"{
    "device_name": "AC",
    "channels": {
        "relay01": { "type": "bool" },
        "temp": { "type": "number", "minimum": 20, "maximum": 30, "multipleOf": 1, "command": true },
        "mode": { "type": "choice", "enum": ["mode1", "mode2"] }
    }
}"#;

#[test]
fn test_load_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ac.json"), AC_DOCUMENT).unwrap();
    std::fs::write(
        dir.path().join("fan.json"),
        json!({"channels": {"speed": {"type": "number", "minimum": 0, "maximum": 3}}}).to_string(),
    )
    .unwrap();
    std::fs::write(dir.path().join("README.txt"), "not a schema").unwrap();

    let catalog = SchemaCatalog::new();
    assert_eq!(catalog.load_dir(dir.path()).unwrap(), 2);
    assert_eq!(catalog.device_types(), vec!["AC".to_string(), "fan".to_string()]);
    assert!(catalog.get("AC").unwrap().channel("temp").unwrap().commandable);
}

#[test]
fn test_load_dir_rejects_invalid_document() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("bad.json"),
        json!({
            "device_name": "bad",
            "channels": {"temp": {"type": "number", "minimum": 30, "maximum": 20}}
        })
        .to_string(),
    )
    .unwrap();

    let err = SchemaCatalog::new().load_dir(dir.path()).unwrap_err();
    assert!(matches!(
        err,
        DeviceError::InvalidSchema(SchemaError::InvertedBounds { ref channel, .. }) if channel == "temp"
    ));
}

#[test]
fn test_load_missing_dir() {
    let dir = tempfile::tempdir().unwrap();
    let err = SchemaCatalog::new()
        .load_dir(dir.path().join("absent"))
        .unwrap_err();
    assert!(matches!(err, DeviceError::Storage(_)));
}

#[tokio::test]
async fn test_stored_source_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source = StoredSchemaSource::open(dir.path().join("schemas.redb")).unwrap();

    assert!(matches!(
        source.resolve_schema("AC").await,
        Err(DeviceError::SchemaNotFound(_))
    ));

    let schema = DeviceSchema::from_json_str(AC_DOCUMENT).unwrap();
    let record = source.publish(&schema).await.unwrap();
    assert_eq!(record.revision, 1);

    let resolved = source.resolve_schema("AC").await.unwrap();
    assert_eq!(*resolved, schema);
    // Unchanged revision resolves to the same handle
    let again = source.resolve_schema("AC").await.unwrap();
    assert!(Arc::ptr_eq(&resolved, &again));

    let updated = DeviceSchema::new(
        "AC",
        [ChannelDefinition::boolean("relay01").commandable()],
    )
    .unwrap();
    assert_eq!(source.publish(&updated).await.unwrap().revision, 2);
    let newer = source.resolve_schema("AC").await.unwrap();
    assert!(!Arc::ptr_eq(&resolved, &newer));
    assert_eq!(newer.len(), 1);

    assert_eq!(source.device_types().await.unwrap(), vec!["AC".to_string()]);
}

#[tokio::test]
async fn test_stored_invalid_document_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let source = StoredSchemaSource::open(dir.path().join("schemas.redb")).unwrap();
    source
        .store()
        .save(
            "broken",
            json!({"channels": {"mode": {"type": "choice", "enum": []}}}),
        )
        .unwrap();

    assert!(matches!(
        source.resolve_schema("broken").await,
        Err(DeviceError::InvalidSchema(SchemaError::EmptyChoice(_)))
    ));
}

#[tokio::test]
async fn test_stored_source_after_delete_and_resave() {
    let dir = tempfile::tempdir().unwrap();
    let source = StoredSchemaSource::open(dir.path().join("schemas.redb")).unwrap();

    let original = DeviceSchema::from_json_str(AC_DOCUMENT).unwrap();
    source.publish(&original).await.unwrap();
    let first = source.resolve_schema("AC").await.unwrap();

    // Deleted straight through the store: the revision restarts at 1.
    assert!(source.store().delete("AC").unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let replacement = json!({"device_name": "AC", "channels": {"relay01": {"type": "bool"}}});
    assert_eq!(source.store().save("AC", replacement).unwrap().revision, 1);

    let second = source.resolve_schema("AC").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.len(), 1);

    // Deleted through the source.
    assert!(source.delete("AC").await.unwrap());
    assert!(matches!(
        source.resolve_schema("AC").await,
        Err(DeviceError::SchemaNotFound(_))
    ));
    source.publish(&original).await.unwrap();
    let third = source.resolve_schema("AC").await.unwrap();
    assert!(!Arc::ptr_eq(&second, &third));
    assert_eq!(*third, original);
}
