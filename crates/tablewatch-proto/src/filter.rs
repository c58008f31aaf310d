//! Filter descriptors selecting which change events a binding receives.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::change::ChangeEventRecord;

/// Kind of row mutation a filter listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Row inserted.
    #[serde(rename = "INSERT")]
    Insert,
    /// Row updated.
    #[serde(rename = "UPDATE")]
    Update,
    /// Row deleted.
    #[serde(rename = "DELETE")]
    Delete,
    /// Any mutation.
    #[serde(rename = "*")]
    All,
}

impl EventKind {
    /// Wire representation of the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::All => "*",
        }
    }

    /// Check whether a filter on `self` accepts an event of kind `actual`.
    pub fn accepts(&self, actual: EventKind) -> bool {
        *self == EventKind::All || *self == actual
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects the subset of change events a channel binding should receive.
///
/// A missing schema or table matches any schema or table. The optional row
/// filter (for example `user_id=eq.42`) is forwarded to the server and is
/// not evaluated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterDescriptor {
    /// Event kind to listen for.
    pub event: EventKind,
    /// Schema name, or any schema when `None`.
    pub schema: Option<String>,
    /// Table name, or any table when `None`.
    pub table: Option<String>,
    /// Server-side row filter expression.
    pub filter: Option<String>,
}

impl FilterDescriptor {
    /// Create a filter for the given event kind with no schema/table restriction.
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            schema: None,
            table: None,
            filter: None,
        }
    }

    /// Filter for inserts.
    pub fn insert() -> Self {
        Self::new(EventKind::Insert)
    }

    /// Filter for updates.
    pub fn update() -> Self {
        Self::new(EventKind::Update)
    }

    /// Filter for deletes.
    pub fn delete() -> Self {
        Self::new(EventKind::Delete)
    }

    /// Filter for every event kind.
    pub fn all() -> Self {
        Self::new(EventKind::All)
    }

    /// Restrict to a schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Restrict to a table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attach a server-side row filter expression.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Check whether a change record falls within this filter.
    pub fn matches(&self, record: &ChangeEventRecord) -> bool {
        if !self.event.accepts(record.event_type) {
            return false;
        }
        if let Some(schema) = &self.schema {
            if schema != "*" && *schema != record.schema {
                return false;
            }
        }
        if let Some(table) = &self.table {
            if table != "*" && *table != record.table {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}.{}",
            self.event,
            self.schema.as_deref().unwrap_or("*"),
            self.table.as_deref().unwrap_or("*")
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " where {}", filter)?;
        }
        Ok(())
    }
}
