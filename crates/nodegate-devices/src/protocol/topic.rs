//! Topic construction and classification.

use crate::error::DeviceError;

const UP: &str = "up";
const DOWN: &str = "down";

/// Topic action segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Provision,
    Telemetry,
    Command,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Telemetry => "telemetry",
            Self::Command => "command",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRoute {
    pub action: Action,
    pub device_id: String,
}

/// A device id must be one non-empty segment without wildcards.
pub fn check_device_id(device_id: &str) -> Result<(), DeviceError> {
    if device_id.is_empty() || device_id.contains(['/', '+', '#']) {
        return Err(DeviceError::InvalidTopic(format!(
            "device id {:?} is not a single topic segment",
            device_id
        )));
    }
    Ok(())
}

/// Builds and parses topics, optionally below a root prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: Option<String>,
}

impl TopicScheme {
    /// Scheme with no prefix: topics are exactly `up/...` and `down/...`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme rooted at `prefix` (e.g. `site-a/up/...`).
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_matches('/');
        Self {
            prefix: (!trimmed.is_empty()).then(|| trimmed.to_string()),
        }
    }

    /// Scheme from an optional configured prefix.
    pub fn from_prefix(prefix: Option<&str>) -> Self {
        prefix.map(Self::with_prefix).unwrap_or_default()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn build(&self, direction: &str, action: Action, device_id: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}/{}/{}", prefix, direction, action, device_id),
            None => format!("{}/{}/{}", direction, action, device_id),
        }
    }

    /// The single pattern the gateway subscribes to.
    pub fn subscription_pattern(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}/+/+", prefix, UP),
            None => format!("{}/+/+", UP),
        }
    }

    pub fn provision_request(&self, device_id: &str) -> String {
        self.build(UP, Action::Provision, device_id)
    }

    pub fn provision_response(&self, device_id: &str) -> String {
        self.build(DOWN, Action::Provision, device_id)
    }

    pub fn telemetry(&self, device_id: &str) -> String {
        self.build(UP, Action::Telemetry, device_id)
    }

    pub fn command(&self, device_id: &str) -> String {
        self.build(DOWN, Action::Command, device_id)
    }

    /// Command topic for `device_id`, refusing ids that would not form a
    /// single topic segment.
    pub fn checked_command(&self, device_id: &str) -> Result<String, DeviceError> {
        check_device_id(device_id)?;
        Ok(self.command(device_id))
    }

    /// Classify an inbound topic as provision or telemetry.
    ///
    /// Anything not shaped `up/{action}/{deviceId}` is `InvalidTopic`; an
    /// action outside `{provision, telemetry}` is `UnknownAction`.
    pub fn parse_inbound(&self, topic: &str) -> Result<InboundRoute, DeviceError> {
        let invalid = || DeviceError::InvalidTopic(topic.to_string());

        let rest = match &self.prefix {
            Some(prefix) => topic
                .strip_prefix(prefix.as_str())
                .and_then(|r| r.strip_prefix('/'))
                .ok_or_else(invalid)?,
            None => topic,
        };

        let mut segments = rest.split('/');
        let (Some(direction), Some(action), Some(device_id), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(invalid());
        };

        if direction != UP || device_id.is_empty() {
            return Err(invalid());
        }

        let action = match action {
            "provision" => Action::Provision,
            "telemetry" => Action::Telemetry,
            other => {
                return Err(DeviceError::UnknownAction {
                    action: other.to_string(),
                    topic: topic.to_string(),
                });
            }
        };

        Ok(InboundRoute {
            action,
            device_id: device_id.to_string(),
        })
    }
}
