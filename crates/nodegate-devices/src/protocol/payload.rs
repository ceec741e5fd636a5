//! JSON payloads carried on the protocol topics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DeviceError;
use crate::schema::{
    ChannelDefinition, ChannelSpec, ChannelType, DeviceSchema, SchemaDocument, SharedSchema,
};

const STATUS_ACCEPTED: u8 = 1;
const STATUS_REJECTED: u8 = 0;

fn malformed(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::MalformedPayload(e.to_string())
}

/// Raw, unvalidated channel values: `{"channels": {"temp": 28}}`.
///
/// Used for telemetry (device to gateway) and commands (gateway to device).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    #[serde(default)]
    channels: Map<String, Value>,
}

impl ChannelUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one channel value.
    pub fn with(mut self, channel: impl Into<String>, value: impl Into<Value>) -> Self {
        self.channels.insert(channel.into(), value.into());
        self
    }

    pub fn insert(&mut self, channel: impl Into<String>, value: impl Into<Value>) {
        self.channels.insert(channel.into(), value.into());
    }

    /// Decode a wire payload. The body must be an object whose `channels`
    /// member, when present, is itself an object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DeviceError> {
        let value: Value = serde_json::from_slice(bytes).map_err(malformed)?;
        let Value::Object(mut body) = value else {
            return Err(DeviceError::MalformedPayload(
                "payload must be a JSON object".to_string(),
            ));
        };
        match body.remove("channels") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(channels)) => Ok(Self { channels }),
            Some(_) => Err(DeviceError::MalformedPayload(
                "'channels' must be a JSON object".to_string(),
            )),
        }
    }

    /// Build from the bare `{"temp": 28}` map form.
    pub fn from_channels(channels: Map<String, Value>) -> Self {
        Self { channels }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Channels in name order.
    pub fn channels(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.channels.iter()
    }

    pub fn get(&self, channel: &str) -> Option<&Value> {
        self.channels.get(channel)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

/// Channel type codes used by device firmware.
const TYPE_CODES: [(u64, ChannelType); 4] = [
    (0, ChannelType::Bool),
    (1, ChannelType::Number),
    (2, ChannelType::String),
    (3, ChannelType::Choice),
];

/// One entry of the `channels` array a device may send with its request:
/// `{"temp": {"type": 1, "command": true, "min": 20, "max": 30, "multipleof": 1}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DeclaredChannelWire {
    #[serde(rename = "type")]
    type_code: Value,
    #[serde(default)]
    command: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    multipleof: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    opts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
}

impl DeclaredChannelWire {
    fn channel_type(&self, name: &str) -> Result<ChannelType, DeviceError> {
        let found = match &self.type_code {
            Value::Number(n) => n
                .as_u64()
                .and_then(|code| TYPE_CODES.iter().find(|(c, _)| *c == code))
                .map(|(_, t)| *t),
            Value::String(s) => serde_json::from_value(Value::String(s.clone())).ok(),
            _ => None,
        };
        found.ok_or_else(|| {
            DeviceError::MalformedPayload(format!(
                "channel '{}' has unknown type {}",
                name, self.type_code
            ))
        })
    }

    fn into_spec(self, name: &str) -> Result<ChannelSpec, DeviceError> {
        Ok(ChannelSpec {
            channel_type: self.channel_type(name)?,
            minimum: self.min,
            maximum: self.max,
            multiple_of: self.multipleof,
            enum_values: self.opts,
            title: self.title,
            description: self.description,
            command: self.command,
        })
    }

    fn from_spec(spec: &ChannelSpec) -> Self {
        let spec = spec.clone();
        let code = TYPE_CODES
            .iter()
            .find(|(_, t)| *t == spec.channel_type)
            .map_or(0, |(c, _)| *c);
        Self {
            type_code: Value::from(code),
            command: spec.command,
            min: spec.minimum,
            max: spec.maximum,
            multipleof: spec.multiple_of,
            opts: spec.enum_values,
            title: spec.title,
            description: spec.description,
        }
    }
}

/// Body of `up/provision/{deviceId}`.
///
/// The body is optional. When present it is an object that may name the
/// device type under `device_name` or `device_type`, and may declare the
/// device's own channels as an array of single-key objects under
/// `channels`. Other members are kept for the resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionRequest {
    pub device_type: Option<String>,
    /// Channels declared by the device, in the order sent.
    pub declared: Option<Vec<(String, ChannelSpec)>>,
    pub extra: Map<String, Value>,
}

impl ProvisionRequest {
    /// Request naming `device_type`.
    pub fn for_type(device_type: impl Into<String>) -> Self {
        Self {
            device_type: Some(device_type.into()),
            ..Self::default()
        }
    }

    /// Request naming the schema's type and declaring all its channels.
    pub fn declaring(schema: &DeviceSchema) -> Self {
        Self {
            device_type: Some(schema.device_type().to_string()),
            declared: Some(
                schema
                    .channels()
                    .map(|c| (c.name.clone(), c.to_spec()))
                    .collect(),
            ),
            extra: Map::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DeviceError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_slice(bytes).map_err(malformed)?;
        let mut body = match value {
            Value::Object(body) => body,
            Value::Null => return Ok(Self::default()),
            _ => {
                return Err(DeviceError::MalformedPayload(
                    "provisioning request must be a JSON object".to_string(),
                ));
            }
        };

        let mut device_type = None;
        for key in ["device_name", "device_type"] {
            match body.remove(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => {
                    device_type.get_or_insert(s);
                }
                Some(Value::String(_)) | Some(Value::Null) | None => {}
                Some(_) => {
                    return Err(DeviceError::MalformedPayload(format!(
                        "'{}' must be a string",
                        key
                    )));
                }
            }
        }

        let declared = match body.remove("channels") {
            None | Some(Value::Null) => None,
            Some(Value::Array(entries)) => Some(parse_declared(entries)?),
            Some(_) => {
                return Err(DeviceError::MalformedPayload(
                    "'channels' must be an array of single-channel objects".to_string(),
                ));
            }
        };

        Ok(Self {
            device_type,
            declared,
            extra: body,
        })
    }

    /// Whether the device sent its own channel list.
    pub fn declares_channels(&self) -> bool {
        self.declared.is_some()
    }

    /// Schema built from the declared channels, checked like any published
    /// document.
    pub fn declared_schema(&self, device_type: &str) -> Result<DeviceSchema, DeviceError> {
        let declared = self.declared.as_ref().ok_or_else(|| {
            DeviceError::SchemaNotFound(device_type.to_string())
        })?;
        let definitions = declared
            .iter()
            .map(|(name, spec)| ChannelDefinition::from_spec(name.clone(), spec.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DeviceSchema::new(device_type, definitions)?)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut body = self.extra.clone();
        if let Some(device_type) = &self.device_type {
            body.insert("device_name".to_string(), Value::String(device_type.clone()));
        }
        if let Some(declared) = &self.declared {
            let entries = declared
                .iter()
                .filter_map(|(name, spec)| {
                    let wire = serde_json::to_value(DeclaredChannelWire::from_spec(spec)).ok()?;
                    let mut entry = Map::new();
                    entry.insert(name.clone(), wire);
                    Some(Value::Object(entry))
                })
                .collect();
            body.insert("channels".to_string(), Value::Array(entries));
        }
        Value::Object(body).to_string().into_bytes()
    }
}

fn parse_declared(entries: Vec<Value>) -> Result<Vec<(String, ChannelSpec)>, DeviceError> {
    let mut declared = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Object(entry) = entry else {
            return Err(DeviceError::MalformedPayload(
                "each declared channel must be a JSON object".to_string(),
            ));
        };
        if entry.len() != 1 {
            return Err(DeviceError::MalformedPayload(format!(
                "declared channel entry must have exactly one key, got {}",
                entry.len()
            )));
        }
        for (name, body) in entry {
            let wire: DeclaredChannelWire = serde_json::from_value(body)
                .map_err(|e| DeviceError::MalformedPayload(format!("channel '{}': {}", name, e)))?;
            let spec = wire.into_spec(&name)?;
            declared.push((name, spec));
        }
    }
    Ok(declared)
}

#[derive(Serialize, Deserialize)]
struct ResponseWire {
    status: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channels: Option<std::collections::BTreeMap<String, ChannelSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Body of `down/provision/{deviceId}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionResponse {
    /// `{"status": 1, "device_name": ..., "channels": {...}}`
    Accepted { document: SchemaDocument },
    /// `{"status": 0, "reason": ...}`
    Rejected { reason: String },
}

impl ProvisionResponse {
    pub fn accepted(schema: &DeviceSchema) -> Self {
        Self::Accepted {
            document: schema.to_document(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = match self {
            Self::Accepted { document } => ResponseWire {
                status: STATUS_ACCEPTED,
                device_name: document.device_name.clone(),
                channels: Some(document.channels.clone()),
                reason: None,
            },
            Self::Rejected { reason } => ResponseWire {
                status: STATUS_REJECTED,
                device_name: None,
                channels: None,
                reason: Some(reason.clone()),
            },
        };
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DeviceError> {
        let wire: ResponseWire = serde_json::from_slice(bytes).map_err(malformed)?;
        match wire.status {
            STATUS_ACCEPTED => Ok(Self::Accepted {
                document: SchemaDocument {
                    device_name: wire.device_name,
                    channels: wire.channels.unwrap_or_default(),
                },
            }),
            STATUS_REJECTED => Ok(Self::Rejected {
                reason: wire.reason.unwrap_or_default(),
            }),
            other => Err(DeviceError::MalformedPayload(format!(
                "unknown provisioning status {}",
                other
            ))),
        }
    }

    /// Schema carried by an accepted response; a rejection becomes
    /// `ProvisionRejected`.
    pub fn into_schema(self) -> Result<SharedSchema, DeviceError> {
        match self {
            Self::Accepted { document } => {
                Ok(DeviceSchema::from_document(document, None)?.into_shared())
            }
            Self::Rejected { reason } => Err(DeviceError::ProvisionRejected(reason)),
        }
    }
}
