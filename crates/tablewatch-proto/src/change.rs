//! Change payloads delivered for `postgres_changes` bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::filter::EventKind;

/// Column metadata attached to a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Postgres type name.
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Payload of a `postgres_changes` message as sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChangesPayload {
    /// Server-assigned ids of the bindings this change matched.
    #[serde(default)]
    pub ids: Vec<u64>,
    /// The change itself.
    pub data: ChangeData,
}

impl PostgresChangesPayload {
    /// Parse the payload of a `postgres_changes` message.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        serde_json::from_value(value).map_err(|e| {
            Error::Decode(format!("invalid postgres_changes payload: {}", e))
        })
    }
}

/// Raw change description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeData {
    /// Schema of the changed table.
    pub schema: String,
    /// Name of the changed table.
    pub table: String,
    /// Commit time as reported by the server.
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    /// Mutation kind.
    #[serde(rename = "type", alias = "eventType")]
    pub event_type: EventKind,
    /// Row after the change (inserts and updates).
    #[serde(default)]
    pub record: Option<Value>,
    /// Row before the change (updates and deletes, replica identity permitting).
    #[serde(default)]
    pub old_record: Option<Value>,
    /// Column metadata.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Errors reported by the server for this change (e.g. payload too large).
    #[serde(default)]
    pub errors: Option<Value>,
}

/// A change event as handed to channel callbacks.
///
/// `new` holds the inserted or updated row's column values; it is empty for
/// deletes. Values are kept as JSON since column types vary per table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEventRecord {
    /// Schema of the changed table.
    pub schema: String,
    /// Name of the changed table.
    pub table: String,
    /// Mutation kind.
    pub event_type: EventKind,
    /// Commit time, when the server sent a parseable one.
    pub commit_timestamp: Option<DateTime<Utc>>,
    /// Row after the change.
    pub new: Map<String, Value>,
    /// Row before the change.
    pub old: Map<String, Value>,
    /// Column metadata.
    pub columns: Vec<Column>,
    /// Server-reported errors, if any.
    pub errors: Option<Value>,
}

impl ChangeEventRecord {
    /// Look up a column of the new row.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.new.get(name)
    }

    /// Look up a column of the old row.
    pub fn old_field(&self, name: &str) -> Option<&Value> {
        self.old.get(name)
    }

    /// Whether the server flagged errors for this change.
    pub fn has_errors(&self) -> bool {
        match &self.errors {
            None | Some(Value::Null) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }
}

impl From<ChangeData> for ChangeEventRecord {
    fn from(data: ChangeData) -> Self {
        let commit_timestamp = data
            .commit_timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Self {
            schema: data.schema,
            table: data.table,
            event_type: data.event_type,
            commit_timestamp,
            new: into_row(data.record),
            old: into_row(data.old_record),
            columns: data.columns,
            errors: data.errors,
        }
    }
}

fn into_row(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
