//! Channel join negotiation types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::filter::{EventKind, FilterDescriptor};

/// Payload of a `phx_join` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    /// Channel configuration.
    pub config: JoinConfig,
    /// Token the server authorizes the channel with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl JoinPayload {
    /// Build a join payload for the given filters.
    pub fn new(filters: &[FilterDescriptor]) -> Self {
        Self {
            config: JoinConfig {
                broadcast: BroadcastConfig::default(),
                presence: PresenceConfig::default(),
                postgres_changes: filters.iter().map(PostgresChangeSpec::from).collect(),
                private: false,
            },
            access_token: None,
        }
    }

    /// Attach an access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// Channel configuration sent on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Broadcast settings (unused by change listeners, but expected by the server).
    pub broadcast: BroadcastConfig,
    /// Presence settings.
    pub presence: PresenceConfig,
    /// Change-data-capture bindings, in registration order.
    pub postgres_changes: Vec<PostgresChangeSpec>,
    /// Whether the channel requires RLS-authorized access.
    #[serde(default)]
    pub private: bool,
}

/// Broadcast settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Request acknowledgement of broadcast messages.
    pub ack: bool,
    /// Receive own broadcasts.
    #[serde(rename = "self")]
    pub receive_own: bool,
}

/// Presence settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Presence key; empty lets the server choose.
    pub key: String,
}

/// A single change-data-capture binding as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresChangeSpec {
    /// Event kind.
    pub event: EventKind,
    /// Schema; `*` stands for any schema.
    pub schema: String,
    /// Table, omitted for any table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Row filter expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl From<&FilterDescriptor> for PostgresChangeSpec {
    fn from(filter: &FilterDescriptor) -> Self {
        Self {
            event: filter.event,
            schema: filter.schema.clone().unwrap_or_else(|| "*".to_string()),
            table: filter.table.clone(),
            filter: filter.filter.clone(),
        }
    }
}

/// Successful join response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Bindings accepted by the server, in the order they were requested.
    #[serde(default)]
    pub postgres_changes: Vec<ServerBinding>,
}

impl JoinResponse {
    /// Parse the `response` field of an `ok` join reply.
    ///
    /// Servers that do not echo bindings reply with an empty object.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| Error::Decode(format!("invalid join response: {}", e)))
    }

    /// Server ids of the accepted bindings, in request order.
    pub fn binding_ids(&self) -> Vec<u64> {
        self.postgres_changes.iter().map(|b| b.id).collect()
    }
}

/// A binding acknowledged by the server with its assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBinding {
    /// Server-assigned id; change payloads list the ids they matched.
    pub id: u64,
    /// Event kind.
    pub event: EventKind,
    /// Schema.
    pub schema: String,
    /// Table.
    #[serde(default)]
    pub table: Option<String>,
    /// Row filter expression.
    #[serde(default)]
    pub filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_join_payload_serialization() {
        let payload = JoinPayload::new(&[
            FilterDescriptor::insert()
                .with_schema("public")
                .with_table("user_messages"),
            FilterDescriptor::insert(),
        ])
        .with_access_token("test-key");

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "config": {
                    "broadcast": {"ack": false, "self": false},
                    "presence": {"key": ""},
                    "postgres_changes": [
                        {"event": "INSERT", "schema": "public", "table": "user_messages"},
                        {"event": "INSERT", "schema": "*"}
                    ],
                    "private": false
                },
                "access_token": "test-key"
            })
        );
    }

    #[test]
    fn test_row_filter_is_forwarded() {
        let spec = PostgresChangeSpec::from(
            &FilterDescriptor::update()
                .with_schema("public")
                .with_table("orders")
                .with_filter("status=eq.paid"),
        );
        assert_eq!(spec.filter.as_deref(), Some("status=eq.paid"));
        assert_eq!(spec.event, EventKind::Update);
    }

    #[test]
    fn test_join_response_ids() {
        let response = JoinResponse::from_value(json!({
            "postgres_changes": [
                {"id": 101, "event": "INSERT", "schema": "public", "table": "user_messages", "filter": null},
                {"id": 102, "event": "INSERT", "schema": "*"}
            ]
        }))
        .unwrap();

        assert_eq!(response.binding_ids(), vec![101, 102]);
        assert_eq!(response.postgres_changes[1].table, None);
    }

    #[test]
    fn test_join_response_empty() {
        assert!(JoinResponse::from_value(json!({})).unwrap().postgres_changes.is_empty());
        assert!(JoinResponse::from_value(Value::Null).unwrap().postgres_changes.is_empty());
    }
}
