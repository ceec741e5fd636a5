//! Device schema model.
//!
//! A [`DeviceSchema`] names a device type and lists its channels. Each
//! [`ChannelDefinition`] carries a [`ChannelKind`] whose variant holds the
//! rules that only make sense for that type (bounds for numbers, options for
//! choices), so invalid combinations cannot be represented after parsing.
//!
//! Schemas are immutable once built and shared as [`SharedSchema`]. A new
//! version of a device type is a new `Arc`; devices bound to the old one keep
//! it.
//!
//! ## Document format
//!
//! ```json
//! {
//!     "device_name": "AC",
//!     "channels": {
//!         "relay01": { "type": "bool" },
//!         "temp": { "type": "number", "minimum": 20, "maximum": 30,
//!                   "multipleOf": 1, "title": "Temperature", "command": true },
//!         "mode": { "type": "choice", "enum": ["mode1", "mode2"] },
//!         "something_else": { "type": "string" }
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared, immutable schema handle.
pub type SharedSchema = Arc<DeviceSchema>;

/// The closed set of channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Bool,
    Number,
    String,
    Choice,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Number => write!(f, "number"),
            Self::String => write!(f, "string"),
            Self::Choice => write!(f, "choice"),
        }
    }
}

/// Numeric constraints of a `number` channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NumberBounds {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub multiple_of: Option<f64>,
}

/// Channel type together with its type-specific rules.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelKind {
    Bool,
    Number(NumberBounds),
    String,
    Choice(BTreeSet<String>),
}

impl ChannelKind {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            Self::Bool => ChannelType::Bool,
            Self::Number(_) => ChannelType::Number,
            Self::String => ChannelType::String,
            Self::Choice(_) => ChannelType::Choice,
        }
    }
}

/// Schema definition errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("schema has no device type name")]
    MissingDeviceType,

    #[error("channel name must not be empty")]
    EmptyChannelName,

    #[error("channel '{0}' is defined twice")]
    DuplicateChannel(String),

    #[error("channel '{channel}': minimum {minimum} is greater than maximum {maximum}")]
    InvertedBounds {
        channel: String,
        minimum: f64,
        maximum: f64,
    },

    #[error("channel '{channel}': multipleOf must be positive, got {multiple_of}")]
    NonPositiveMultiple { channel: String, multiple_of: f64 },

    #[error("channel '{0}': numeric constraints must be finite")]
    NonFiniteBound(String),

    #[error("channel '{0}': choice channel needs at least one enum value")]
    EmptyChoice(String),

    #[error("channel '{channel}': {field} is only allowed on {allowed} channels")]
    MisplacedField {
        channel: String,
        field: &'static str,
        allowed: ChannelType,
    },
}

/// One named, typed data point of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDefinition {
    pub name: String,
    pub kind: ChannelKind,
    /// Whether the gateway may write to this channel.
    pub commandable: bool,
    pub title: String,
    pub description: String,
}

impl ChannelDefinition {
    fn with_kind(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            commandable: false,
            title: String::new(),
            description: String::new(),
        }
    }

    /// A `bool` channel.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::with_kind(name, ChannelKind::Bool)
    }

    /// An unbounded `number` channel.
    pub fn number(name: impl Into<String>) -> Self {
        Self::with_kind(name, ChannelKind::Number(NumberBounds::default()))
    }

    /// A `string` channel.
    pub fn string(name: impl Into<String>) -> Self {
        Self::with_kind(name, ChannelKind::String)
    }

    /// A `choice` channel over `options`.
    pub fn choice<I, S>(name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            name,
            ChannelKind::Choice(options.into_iter().map(Into::into).collect()),
        )
    }

    /// Set the inclusive range. Ignored on non-number channels.
    pub fn with_range(mut self, minimum: f64, maximum: f64) -> Self {
        if let ChannelKind::Number(bounds) = &mut self.kind {
            bounds.minimum = Some(minimum);
            bounds.maximum = Some(maximum);
        }
        self
    }

    /// Set the step. Ignored on non-number channels.
    pub fn with_multiple_of(mut self, step: f64) -> Self {
        if let ChannelKind::Number(bounds) = &mut self.kind {
            bounds.multiple_of = Some(step);
        }
        self
    }

    pub fn commandable(mut self) -> Self {
        self.commandable = true;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn channel_type(&self) -> ChannelType {
        self.kind.channel_type()
    }

    /// Check the definition invariants.
    pub fn check(&self) -> Result<(), SchemaError> {
        if self.name.is_empty() {
            return Err(SchemaError::EmptyChannelName);
        }
        match &self.kind {
            ChannelKind::Number(bounds) => {
                let finite = [bounds.minimum, bounds.maximum, bounds.multiple_of]
                    .into_iter()
                    .flatten()
                    .all(f64::is_finite);
                if !finite {
                    return Err(SchemaError::NonFiniteBound(self.name.clone()));
                }
                if let (Some(minimum), Some(maximum)) = (bounds.minimum, bounds.maximum) {
                    if minimum > maximum {
                        return Err(SchemaError::InvertedBounds {
                            channel: self.name.clone(),
                            minimum,
                            maximum,
                        });
                    }
                }
                if let Some(multiple_of) = bounds.multiple_of {
                    if multiple_of <= 0.0 {
                        return Err(SchemaError::NonPositiveMultiple {
                            channel: self.name.clone(),
                            multiple_of,
                        });
                    }
                }
            }
            ChannelKind::Choice(options) if options.is_empty() => {
                return Err(SchemaError::EmptyChoice(self.name.clone()));
            }
            _ => {}
        }
        Ok(())
    }

    /// Build from the wire form, rejecting fields that do not belong to the type.
    pub fn from_spec(name: impl Into<String>, spec: ChannelSpec) -> Result<Self, SchemaError> {
        let name = name.into();
        let has_bounds =
            spec.minimum.is_some() || spec.maximum.is_some() || spec.multiple_of.is_some();

        if has_bounds && spec.channel_type != ChannelType::Number {
            let field = if spec.minimum.is_some() {
                "minimum"
            } else if spec.maximum.is_some() {
                "maximum"
            } else {
                "multipleOf"
            };
            return Err(SchemaError::MisplacedField {
                channel: name,
                field,
                allowed: ChannelType::Number,
            });
        }
        if spec.enum_values.is_some() && spec.channel_type != ChannelType::Choice {
            return Err(SchemaError::MisplacedField {
                channel: name,
                field: "enum",
                allowed: ChannelType::Choice,
            });
        }

        let kind = match spec.channel_type {
            ChannelType::Bool => ChannelKind::Bool,
            ChannelType::String => ChannelKind::String,
            ChannelType::Number => ChannelKind::Number(NumberBounds {
                minimum: spec.minimum,
                maximum: spec.maximum,
                multiple_of: spec.multiple_of,
            }),
            ChannelType::Choice => {
                ChannelKind::Choice(spec.enum_values.unwrap_or_default().into_iter().collect())
            }
        };

        let definition = Self {
            name,
            kind,
            commandable: spec.command,
            title: spec.title,
            description: spec.description,
        };
        definition.check()?;
        Ok(definition)
    }

    /// Wire form of this definition.
    pub fn to_spec(&self) -> ChannelSpec {
        let (bounds, enum_values) = match &self.kind {
            ChannelKind::Number(bounds) => (*bounds, None),
            ChannelKind::Choice(options) => {
                (NumberBounds::default(), Some(options.iter().cloned().collect()))
            }
            ChannelKind::Bool | ChannelKind::String => (NumberBounds::default(), None),
        };
        ChannelSpec {
            channel_type: self.channel_type(),
            minimum: bounds.minimum,
            maximum: bounds.maximum,
            multiple_of: bounds.multiple_of,
            enum_values,
            title: self.title.clone(),
            description: self.description.clone(),
            command: self.commandable,
        }
    }
}

/// Wire form of a channel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, rename = "multipleOf", skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub command: bool,
}

/// Wire form of a whole schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    /// Device type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelSpec>,
}

/// The channel set of one device type.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSchema {
    device_type: String,
    channels: BTreeMap<String, ChannelDefinition>,
}

impl DeviceSchema {
    /// Build a schema, checking every definition and name uniqueness.
    pub fn new<I>(device_type: impl Into<String>, channels: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = ChannelDefinition>,
    {
        let device_type = device_type.into();
        if device_type.trim().is_empty() {
            return Err(SchemaError::MissingDeviceType);
        }

        let mut map = BTreeMap::new();
        for definition in channels {
            definition.check()?;
            if map.contains_key(&definition.name) {
                return Err(SchemaError::DuplicateChannel(definition.name));
            }
            map.insert(definition.name.clone(), definition);
        }

        Ok(Self {
            device_type,
            channels: map,
        })
    }

    /// Build from a document. `device_type` overrides the document's
    /// `device_name` when given.
    pub fn from_document(
        document: SchemaDocument,
        device_type: Option<&str>,
    ) -> Result<Self, SchemaError> {
        let device_type = device_type
            .map(str::to_string)
            .or(document.device_name)
            .ok_or(SchemaError::MissingDeviceType)?;

        let definitions = document
            .channels
            .into_iter()
            .map(|(name, spec)| ChannelDefinition::from_spec(name, spec))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(device_type, definitions)
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, crate::DeviceError> {
        let document: SchemaDocument = serde_json::from_str(json)
            .map_err(|e| crate::DeviceError::MalformedPayload(e.to_string()))?;
        Ok(Self::from_document(document, None)?)
    }

    /// Parse a JSON value.
    pub fn from_json_value(
        value: serde_json::Value,
        device_type: Option<&str>,
    ) -> Result<Self, crate::DeviceError> {
        let document: SchemaDocument = serde_json::from_value(value)
            .map_err(|e| crate::DeviceError::MalformedPayload(e.to_string()))?;
        Ok(Self::from_document(document, device_type)?)
    }

    pub fn to_document(&self) -> SchemaDocument {
        SchemaDocument {
            device_name: Some(self.device_type.clone()),
            channels: self
                .channels
                .iter()
                .map(|(name, def)| (name.clone(), def.to_spec()))
                .collect(),
        }
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelDefinition> {
        self.channels.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Channels in name order.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelDefinition> {
        self.channels.values()
    }

    pub fn commandable_channels(&self) -> impl Iterator<Item = &ChannelDefinition> {
        self.channels.values().filter(|c| c.commandable)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn into_shared(self) -> SharedSchema {
        Arc::new(self)
    }
}
