//! Channel validation.
//!
//! [`validate_value`] checks one raw value against one definition.
//! [`validate_update`] checks a whole [`ChannelUpdate`] against a schema and
//! is all-or-nothing: either every channel passes and a [`ValidatedUpdate`]
//! comes back, or the caller gets every failure and nothing to apply.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ChannelUpdate;
use crate::schema::{ChannelDefinition, ChannelKind, ChannelType, SharedSchema};
use crate::value::ChannelValue;

/// Relative tolerance for the `multipleOf` check.
const MULTIPLE_EPSILON: f64 = 1e-9;

/// A single channel failing validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("expected {expected}, got {found}")]
    TypeMismatch {
        expected: ChannelType,
        found: &'static str,
    },

    #[error("{value} is outside {}", describe_range(.minimum, .maximum))]
    OutOfRange {
        value: f64,
        minimum: Option<f64>,
        maximum: Option<f64>,
    },

    #[error("{value} is not a multiple of {multiple_of} from {base}")]
    NotMultiple {
        value: f64,
        multiple_of: f64,
        base: f64,
    },

    #[error("'{value}' is not one of the allowed options")]
    InvalidChoice { value: String },

    #[error("channel is not defined in the schema")]
    UnknownChannel,

    #[error("channel does not accept commands")]
    NotCommandable,
}

fn describe_range(minimum: &Option<f64>, maximum: &Option<f64>) -> String {
    match (*minimum, *maximum) {
        (Some(lo), Some(hi)) => format!("[{}, {}]", lo, hi),
        (Some(lo), None) => format!("[{}, +inf)", lo),
        (None, Some(hi)) => format!("(-inf, {}]", hi),
        (None, None) => "the allowed range".to_string(),
    }
}

/// Every failing channel of a rejected update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRejection {
    pub errors: Vec<(String, ValidationError)>,
}

impl UpdateRejection {
    /// Failure recorded for `channel`, if any.
    pub fn error_for(&self, channel: &str) -> Option<&ValidationError> {
        self.errors
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for UpdateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (channel, error)) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", channel, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for UpdateRejection {}

/// Whether an update is a command (gateway to device) or telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateContext {
    pub is_command: bool,
}

impl UpdateContext {
    pub const TELEMETRY: Self = Self { is_command: false };
    pub const COMMAND: Self = Self { is_command: true };
}

/// An update whose every value passed validation against `schema`.
///
/// Only [`validate_update`] constructs these, so anything holding one knows
/// the values are typed and in bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedUpdate {
    schema: SharedSchema,
    values: BTreeMap<String, ChannelValue>,
}

impl ValidatedUpdate {
    /// Schema the values were checked against.
    pub fn schema(&self) -> &SharedSchema {
        &self.schema
    }

    pub fn values(&self) -> &BTreeMap<String, ChannelValue> {
        &self.values
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelValue> {
        self.values.get(channel)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when validated against exactly this schema instance.
    pub fn validated_against(&self, schema: &SharedSchema) -> bool {
        Arc::ptr_eq(&self.schema, schema)
    }

    /// `{"channels": {...}}` wire payload.
    pub fn to_payload(&self) -> Vec<u8> {
        let channels: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        let mut body = serde_json::Map::new();
        body.insert("channels".to_string(), Value::Object(channels));
        Value::Object(body).to_string().into_bytes()
    }

    pub fn into_values(self) -> BTreeMap<String, ChannelValue> {
        self.values
    }
}

fn json_type_name(raw: &Value) -> &'static str {
    match raw {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate one raw value against one channel definition.
///
/// Checks run in order: type, range, step, choice membership.
pub fn validate_value(
    definition: &ChannelDefinition,
    raw: &Value,
) -> Result<ChannelValue, ValidationError> {
    let mismatch = || ValidationError::TypeMismatch {
        expected: definition.channel_type(),
        found: json_type_name(raw),
    };

    match &definition.kind {
        ChannelKind::Bool => raw.as_bool().map(ChannelValue::Bool).ok_or_else(mismatch),
        ChannelKind::Number(bounds) => {
            let value = match raw {
                Value::Number(n) => n.as_f64().ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            };

            let below = bounds.minimum.is_some_and(|lo| value < lo);
            let above = bounds.maximum.is_some_and(|hi| value > hi);
            if below || above {
                return Err(ValidationError::OutOfRange {
                    value,
                    minimum: bounds.minimum,
                    maximum: bounds.maximum,
                });
            }

            if let Some(step) = bounds.multiple_of {
                let base = bounds.minimum.unwrap_or(0.0);
                if !is_multiple(value - base, step) {
                    return Err(ValidationError::NotMultiple {
                        value,
                        multiple_of: step,
                        base,
                    });
                }
            }

            Ok(ChannelValue::Number(value))
        }
        ChannelKind::String => raw
            .as_str()
            .map(|s| ChannelValue::Text(s.to_string()))
            .ok_or_else(mismatch),
        ChannelKind::Choice(options) => {
            let value = raw.as_str().ok_or_else(mismatch)?;
            if options.contains(value) {
                Ok(ChannelValue::Text(value.to_string()))
            } else {
                Err(ValidationError::InvalidChoice {
                    value: value.to_string(),
                })
            }
        }
    }
}

fn is_multiple(offset: f64, step: f64) -> bool {
    let quotient = offset / step;
    (quotient - quotient.round()).abs() <= MULTIPLE_EPSILON * quotient.abs().max(1.0)
}

/// Validate a whole update against `schema`.
pub fn validate_update(
    schema: &SharedSchema,
    update: &ChannelUpdate,
    context: UpdateContext,
) -> Result<ValidatedUpdate, UpdateRejection> {
    let mut values = BTreeMap::new();
    let mut errors = Vec::new();

    for (name, raw) in update.channels() {
        let Some(definition) = schema.channel(name) else {
            errors.push((name.clone(), ValidationError::UnknownChannel));
            continue;
        };

        if context.is_command && !definition.commandable {
            errors.push((name.clone(), ValidationError::NotCommandable));
            continue;
        }

        match validate_value(definition, raw) {
            Ok(value) => {
                values.insert(name.clone(), value);
            }
            Err(e) => errors.push((name.clone(), e)),
        }
    }

    if errors.is_empty() {
        Ok(ValidatedUpdate {
            schema: schema.clone(),
            values,
        })
    } else {
        Err(UpdateRejection { errors })
    }
}
