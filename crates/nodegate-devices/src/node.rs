//! Device-side provisioning client.
//!
//! [`NodeProvisioner`] is the loop a node runs to obtain its schema:
//! publish a request, wait for the response, retry on timeout. It never
//! sleeps or touches a transport. The caller supplies the current
//! [`Instant`] and publishes the frames it returns, so the same state
//! machine runs under a real clock, a test clock, or a firmware timer.
//!
//! ```text
//! Idle --start--> Requesting{1} --accepted--> Provisioned
//!                      |  ^
//!           timeout or |  | attempt < max
//!             rejected v  |
//!                 Requesting{n+1} --attempt == max--> GaveUp
//! ```

use std::time::{Duration, Instant};

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::{ChannelUpdate, ProvisionRequest, ProvisionResponse, TopicScheme};
use crate::schema::SharedSchema;
use crate::validator::{validate_update, UpdateContext, ValidatedUpdate};

/// Response timeout and attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub response_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeState {
    Idle,
    Requesting { attempt: u32, deadline: Instant },
    Provisioned { schema: SharedSchema },
    GaveUp { attempts: u32, last_reason: Option<String> },
}

/// A message the node should publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Result of feeding the state machine.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Publish this frame.
    Send(OutboundFrame),
    Provisioned(SharedSchema),
    /// The gateway refused; the next attempt goes out at `retry_at`.
    Rejected { reason: String, retry_at: Instant },
    GaveUp,
    /// Input did not apply to the current state.
    Ignored,
}

pub struct NodeProvisioner {
    device_id: String,
    request: ProvisionRequest,
    topics: TopicScheme,
    policy: RetryPolicy,
    state: NodeState,
    last_reason: Option<String>,
}

impl NodeProvisioner {
    pub fn new(
        device_id: impl Into<String>,
        request: ProvisionRequest,
        topics: TopicScheme,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            request,
            topics,
            policy: RetryPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
            state: NodeState::Idle,
            last_reason: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Topic the node must listen on for the response.
    pub fn response_topic(&self) -> String {
        self.topics.provision_response(&self.device_id)
    }

    /// Topic the node must listen on for commands.
    pub fn command_topic(&self) -> String {
        self.topics.command(&self.device_id)
    }

    pub fn schema(&self) -> Option<&SharedSchema> {
        match &self.state {
            NodeState::Provisioned { schema } => Some(schema),
            _ => None,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self.state, NodeState::Provisioned { .. })
    }

    fn request_frame(&self) -> OutboundFrame {
        OutboundFrame {
            topic: self.topics.provision_request(&self.device_id),
            payload: self.request.to_vec(),
        }
    }

    /// Begin (or restart) provisioning. Returns the first request.
    pub fn start(&mut self, now: Instant) -> OutboundFrame {
        self.last_reason = None;
        self.state = NodeState::Requesting {
            attempt: 1,
            deadline: now + self.policy.response_timeout,
        };
        self.request_frame()
    }

    /// Feed a payload received on [`response_topic`](Self::response_topic).
    ///
    /// A malformed payload is an error and leaves the state unchanged.
    pub fn on_response(&mut self, payload: &[u8], now: Instant) -> DeviceResult<NodeEvent> {
        let NodeState::Requesting { attempt, .. } = self.state else {
            return Ok(NodeEvent::Ignored);
        };

        match ProvisionResponse::from_slice(payload)?.into_schema() {
            Ok(schema) => {
                self.state = NodeState::Provisioned {
                    schema: schema.clone(),
                };
                Ok(NodeEvent::Provisioned(schema))
            }
            Err(DeviceError::ProvisionRejected(reason)) => {
                self.last_reason = Some(reason.clone());
                if attempt >= self.policy.max_attempts {
                    self.give_up(attempt);
                    return Ok(NodeEvent::GaveUp);
                }
                let retry_at = now + self.policy.response_timeout;
                self.state = NodeState::Requesting {
                    attempt,
                    deadline: retry_at,
                };
                Ok(NodeEvent::Rejected { reason, retry_at })
            }
            Err(e) => Err(e),
        }
    }

    /// Advance the timer. Re-sends the request once the deadline passes.
    pub fn on_tick(&mut self, now: Instant) -> NodeEvent {
        let NodeState::Requesting { attempt, deadline } = self.state else {
            return NodeEvent::Ignored;
        };
        if now < deadline {
            return NodeEvent::Ignored;
        }
        if attempt >= self.policy.max_attempts {
            self.give_up(attempt);
            return NodeEvent::GaveUp;
        }

        self.state = NodeState::Requesting {
            attempt: attempt + 1,
            deadline: now + self.policy.response_timeout,
        };
        NodeEvent::Send(self.request_frame())
    }

    fn give_up(&mut self, attempts: u32) {
        self.state = NodeState::GaveUp {
            attempts,
            last_reason: self.last_reason.clone(),
        };
    }

    /// Telemetry frame for `update`, checked against the bound schema.
    pub fn telemetry_frame(&self, update: &ChannelUpdate) -> DeviceResult<OutboundFrame> {
        let schema = self
            .schema()
            .ok_or_else(|| DeviceError::NotProvisioned(self.device_id.clone()))?;
        let validated = validate_update(schema, update, UpdateContext::TELEMETRY)?;
        Ok(OutboundFrame {
            topic: self.topics.telemetry(&self.device_id),
            payload: validated.to_payload(),
        })
    }

    /// Decode and check a payload received on the command topic.
    pub fn decode_command(&self, payload: &[u8]) -> DeviceResult<ValidatedUpdate> {
        let schema = self
            .schema()
            .ok_or_else(|| DeviceError::NotProvisioned(self.device_id.clone()))?;
        let update = ChannelUpdate::from_slice(payload)?;
        Ok(validate_update(schema, &update, UpdateContext::COMMAND)?)
    }
}
