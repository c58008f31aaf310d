//! Channel message envelope and event names.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::join::JoinPayload;

/// Topic used for socket-level messages such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the server expects on channel topics.
pub const TOPIC_PREFIX: &str = "realtime:";

/// Standard event names.
pub mod events {
    /// Join a channel.
    pub const JOIN: &str = "phx_join";
    /// Reply to a pushed message.
    pub const REPLY: &str = "phx_reply";
    /// Leave a channel.
    pub const LEAVE: &str = "phx_leave";
    /// Channel closed by the server.
    pub const CLOSE: &str = "phx_close";
    /// Channel crashed on the server.
    pub const ERROR: &str = "phx_error";
    /// Socket keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Row change notification.
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    /// Server status notification.
    pub const SYSTEM: &str = "system";
    /// Full presence state.
    pub const PRESENCE_STATE: &str = "presence_state";
    /// Presence delta.
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// Build the wire topic for a channel name.
pub fn channel_topic(name: &str) -> String {
    if name.starts_with(TOPIC_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", TOPIC_PREFIX, name)
    }
}

/// A message exchanged over the realtime socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Reference used to correlate replies with pushes.
    #[serde(rename = "ref", default, deserialize_with = "deserialize_ref")]
    pub msg_ref: Option<String>,
    /// Reference of the join that opened the channel.
    #[serde(default, deserialize_with = "deserialize_ref")]
    pub join_ref: Option<String>,
}

impl Message {
    /// Create a message.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: None,
            join_ref: None,
        }
    }

    /// Create a join message. The join reference doubles as the push reference.
    pub fn join(topic: impl Into<String>, join_ref: &str, payload: &JoinPayload) -> Result<Self, Error> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::Encode(format!("failed to serialize join payload: {}", e)))?;
        Ok(Self::new(topic, events::JOIN, payload)
            .with_ref(join_ref)
            .with_join_ref(join_ref))
    }

    /// Create a leave message.
    pub fn leave(topic: impl Into<String>, msg_ref: &str, join_ref: &str) -> Self {
        Self::new(topic, events::LEAVE, Value::Object(Default::default()))
            .with_ref(msg_ref)
            .with_join_ref(join_ref)
    }

    /// Create a heartbeat message.
    pub fn heartbeat(msg_ref: &str) -> Self {
        Self::new(PHOENIX_TOPIC, events::HEARTBEAT, Value::Object(Default::default()))
            .with_ref(msg_ref)
    }

    /// Set the push reference.
    pub fn with_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Set the join reference.
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| Error::Encode(format!("failed to serialize message: {}", e)))
    }

    /// Decode from a text frame.
    pub fn decode(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text)
            .map_err(|e| Error::Decode(format!("failed to parse message: {}", e)))
    }

    /// Classify the message by event name.
    pub fn kind(&self) -> MessageKind {
        match self.event.as_str() {
            events::REPLY => MessageKind::Reply,
            events::POSTGRES_CHANGES => MessageKind::PostgresChanges,
            events::CLOSE => MessageKind::Close,
            events::ERROR => MessageKind::Error,
            events::SYSTEM => MessageKind::System,
            events::PRESENCE_STATE | events::PRESENCE_DIFF => MessageKind::Presence,
            _ => MessageKind::Other,
        }
    }

    /// Parse the payload as a reply.
    pub fn reply(&self) -> Result<Reply, Error> {
        if self.event != events::REPLY {
            return Err(Error::UnexpectedEvent {
                expected: events::REPLY,
                actual: self.event.clone(),
            });
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Decode(format!("invalid reply payload: {}", e)))
    }
}

/// Broad classification of incoming messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Reply to a join, leave or heartbeat.
    Reply,
    /// Row change.
    PostgresChanges,
    /// Channel closed.
    Close,
    /// Channel errored.
    Error,
    /// Server status notice.
    System,
    /// Presence traffic.
    Presence,
    /// Anything else (broadcasts, unknown events).
    Other,
}

/// Status of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Request accepted.
    Ok,
    /// Request rejected.
    Error,
    /// Server timed out handling the request.
    Timeout,
}

/// Payload of a `phx_reply` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Response body.
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Human-readable reason for a failed reply.
    pub fn reason(&self) -> String {
        match &self.response {
            Value::Object(map) => map
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.response.to_string()),
            Value::String(s) => s.clone(),
            Value::Null => format!("{:?}", self.status).to_lowercase(),
            other => other.to_string(),
        }
    }
}

/// References are strings in the v1 JSON serializer, but some servers and
/// clients send integers.
fn deserialize_ref<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
