//! Validated channel values.

use serde::{Deserialize, Serialize, Serializer};

/// A channel value that passed validation.
///
/// Raw wire values are `serde_json::Value`; only the validator produces these.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ChannelValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "string",
        }
    }

    /// JSON form; whole numbers are written without a fractional part.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => match whole_number(*n) {
                Some(i) => serde_json::Value::from(i),
                None => serde_json::Number::from_f64(*n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            },
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

fn whole_number(n: f64) -> Option<i64> {
    // 2^53: beyond this f64 can no longer represent every integer
    const EXACT_LIMIT: f64 = 9_007_199_254_740_992.0;
    (n.fract() == 0.0 && n.abs() <= EXACT_LIMIT).then_some(n as i64)
}

impl Serialize for ChannelValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => match whole_number(*n) {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*n),
            },
            Self::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl From<bool> for ChannelValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for ChannelValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for ChannelValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl std::fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{:?}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_numbers_serialize_as_integers() {
        assert_eq!(serde_json::to_string(&ChannelValue::Number(28.0)).unwrap(), "28");
        assert_eq!(serde_json::to_string(&ChannelValue::Number(28.5)).unwrap(), "28.5");
        assert_eq!(ChannelValue::Number(-3.0).to_json(), serde_json::json!(-3));
    }

    #[test]
    fn test_untagged_deserialize() {
        let v: ChannelValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, ChannelValue::Bool(true));
        let v: ChannelValue = serde_json::from_str("\"mode1\"").unwrap();
        assert_eq!(v.as_str(), Some("mode1"));
    }
}
