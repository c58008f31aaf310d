//! tablewatch protocol types and serialization.
//!
//! This crate defines the wire types spoken with a realtime change-data-capture
//! server over a Phoenix-channels style WebSocket, using the v1 JSON
//! serializer.
//!
//! # Modules
//!
//! - [`message`] - Message envelope, event names and replies
//! - [`join`] - Channel join payloads and responses
//! - [`filter`] - Filter descriptors and event kinds
//! - [`change`] - Change payloads and the records handed to callbacks
//! - [`error`] - Protocol error types
//!
//! # Example
//!
//! ```ignore
//! use tablewatch_proto::{FilterDescriptor, JoinPayload, Message};
//!
//! let filters = [FilterDescriptor::insert().with_schema("public").with_table("user_messages")];
//! let join = Message::join("realtime:public:user_messages", "1", &JoinPayload::new(&filters))?;
//! let frame = join.encode()?;
//! ```

pub mod change;
pub mod error;
pub mod filter;
pub mod join;
pub mod message;

pub use error::Error;

// Re-export commonly used types at crate root
pub use change::{ChangeData, ChangeEventRecord, Column, PostgresChangesPayload};
pub use filter::{EventKind, FilterDescriptor};
pub use join::{JoinPayload, JoinResponse, PostgresChangeSpec, ServerBinding};
pub use message::{
    channel_topic, events, Message, MessageKind, Reply, ReplyStatus, PHOENIX_TOPIC, TOPIC_PREFIX,
};

/// Serializer version announced in the socket URL.
pub const PROTOCOL_VSN: &str = "1.0.0";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VSN, "1.0.0");
    }

    #[test]
    fn test_change_message_to_record() {
        let text = json!({
            "topic": "realtime:public:user_messages",
            "event": "postgres_changes",
            "payload": {
                "ids": [5],
                "data": {
                    "schema": "public",
                    "table": "user_messages",
                    "type": "INSERT",
                    "record": {"user_id": 42, "message": "hello"}
                }
            },
            "ref": null
        })
        .to_string();

        let msg = Message::decode(&text).unwrap();
        assert_eq!(msg.kind(), MessageKind::PostgresChanges);

        let payload = PostgresChangesPayload::from_value(msg.payload).unwrap();
        let record = ChangeEventRecord::from(payload.data);
        assert!(FilterDescriptor::insert()
            .with_schema("public")
            .with_table("user_messages")
            .matches(&record));
        assert_eq!(record.field("message"), Some(&json!("hello")));
    }
}
