mod command_test;
mod schema_test;

pub const AC_DOCUMENT: &str = r#"{
    "device_name": "AC",
    "channels": {
        "relay01": { "type": "bool", "title": "Relay" },
        "temp": { "type": "number", "minimum": 20, "maximum": 30, "multipleOf": 1, "command": true },
        "mode": { "type": "choice", "enum": ["mode1", "mode2"], "command": true }
    }
}"#;
