//! Tests for the `schema` subcommands.

use predicates::prelude::*;

use super::AC_DOCUMENT;
use crate::nodegate;

#[test]
fn test_validate_accepts_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ac.json");
    std::fs::write(&path, AC_DOCUMENT).unwrap();

    nodegate()
        .args(["schema", "validate"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("PASSED"))
        .stdout(predicate::str::contains("AC"))
        .stdout(predicate::str::contains("mode1|mode2"));
}

#[test]
fn test_validate_rejects_inverted_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(
        &path,
        r#"{"device_name": "bad", "channels": {"temp": {"type": "number", "minimum": 30, "maximum": 20}}}"#,
    )
    .unwrap();

    nodegate()
        .args(["schema", "validate"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid schema document"))
        .stderr(predicate::str::contains("temp"));
}

#[test]
fn test_import_requires_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ac.json");
    std::fs::write(&path, AC_DOCUMENT).unwrap();

    nodegate()
        .args(["schema", "import"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No schema store configured"));
}

#[test]
fn test_import_then_list() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("ac.json");
    let store = dir.path().join("schemas.redb");
    std::fs::write(&doc, AC_DOCUMENT).unwrap();

    nodegate()
        .arg("--schema-store")
        .arg(&store)
        .args(["schema", "import"])
        .arg(&doc)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 'AC' (revision 1)"));

    nodegate()
        .arg("--schema-store")
        .arg(&store)
        .args(["schema", "import"])
        .arg(&doc)
        .assert()
        .success()
        .stdout(predicate::str::contains("revision 2"));

    nodegate()
        .arg("--schema-store")
        .arg(&store)
        .args(["schema", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("AC"))
        .stdout(predicate::str::contains("3 channel(s), revision 2"))
        .stdout(predicate::str::contains("Total: 1 schema(s)"));
}

#[test]
fn test_list_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ac.json"), AC_DOCUMENT).unwrap();
    std::fs::write(
        dir.path().join("fan.json"),
        r#"{"channels": {"speed": {"type": "number", "minimum": 0, "maximum": 3}}}"#,
    )
    .unwrap();

    nodegate()
        .arg("--schema-dir")
        .arg(dir.path())
        .args(["schema", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fan"))
        .stdout(predicate::str::contains("Total: 2 schema(s)"));
}

#[test]
fn test_list_without_sources() {
    nodegate()
        .args(["schema", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No schemas found."));
}
