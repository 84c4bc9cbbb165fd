//! JSON envelope protocol for batch and presence exchange.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! {
//!   "user":     "A",            sender identity
//!   "batch_id": 7,              per-sender sequence, -1 = presence only
//!   "changes":  [ record, … ],  tagged by "type"
//!   "version":  1               optional, absent on legacy peers
//! }
//! ```
//!
//! Change records are kept as raw JSON values until the application engine
//! interprets them, so a record of an unknown kind only costs that record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision written by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// `batch_id` reserved for presence-only envelopes.
pub const PRESENCE_BATCH_ID: i64 = -1;

/// Record tag marking a presence entry inside `changes`.
pub const PRESENCE_TYPE: &str = "presence";

/// A single replicated edit.
///
/// Field names follow the wire format through `serde(rename)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    SetProperty {
        #[serde(rename = "node")]
        node_path: String,
        #[serde(rename = "property")]
        property_name: String,
        value: Value,
    },
    AddNode {
        #[serde(rename = "parent")]
        parent_path: String,
        #[serde(rename = "name")]
        child_name: String,
        #[serde(rename = "scene")]
        resource_reference: String,
    },
    RemoveNode {
        #[serde(rename = "node")]
        node_path: String,
    },
}

impl Change {
    /// Wire tag of this change.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::SetProperty { .. } => "set_property",
            Change::AddNode { .. } => "add_node",
            Change::RemoveNode { .. } => "remove_node",
        }
    }

    /// Interpret a raw change record.
    ///
    /// Distinguishes a missing tag and an unknown tag from a malformed body so
    /// the caller can report each precisely.
    pub fn from_record(record: &Value) -> Result<Self, ProtocolError> {
        let kind = record
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?;

        match kind {
            "set_property" | "add_node" | "remove_node" => {
                Change::deserialize(record)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))
            }
            other => Err(ProtocolError::UnknownChangeType(other.to_string())),
        }
    }

    /// Serialize into a raw change record.
    pub fn to_record(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Remote selection/tool state. An empty `selected_path` means nothing is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    #[serde(rename = "selected", default)]
    pub selected_path: String,
    #[serde(rename = "tool", default)]
    pub tool_name: String,
}

impl Presence {
    pub fn new(selected_path: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            selected_path: selected_path.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Selected path, `None` when nothing is selected.
    pub fn selected(&self) -> Option<&str> {
        if self.selected_path.is_empty() {
            None
        } else {
            Some(&self.selected_path)
        }
    }

    fn to_record(&self) -> Value {
        serde_json::json!({
            "type": PRESENCE_TYPE,
            "selected": self.selected_path,
            "tool": self.tool_name,
        })
    }
}

/// Ordered group of local changes flushed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    changes: Vec<Change>,
}

impl Batch {
    pub fn new(changes: Vec<Change>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// A batch received from the remote peer, records not yet interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedBatch {
    pub origin: String,
    pub batch_id: i64,
    pub records: Vec<Value>,
}

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub batch_id: i64,
    pub changes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl Envelope {
    /// Wrap a local batch.
    pub fn for_batch(user: &str, batch_id: i64, batch: &Batch) -> Result<Self, ProtocolError> {
        let changes = batch
            .changes()
            .iter()
            .map(Change::to_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            user: user.to_string(),
            batch_id,
            changes,
            version: Some(PROTOCOL_VERSION),
        })
    }

    /// Wrap a presence update; always a single record with `batch_id = -1`.
    pub fn for_presence(user: &str, presence: &Presence) -> Self {
        Self {
            user: user.to_string(),
            batch_id: PRESENCE_BATCH_ID,
            changes: vec![presence.to_record()],
            version: Some(PROTOCOL_VERSION),
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    ///
    /// Unknown top-level fields are ignored. Anything that is not a JSON
    /// object, or an object without `changes`, is rejected.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        if !object.contains_key("changes") {
            return Err(ProtocolError::MissingField("changes"));
        }
        Envelope::deserialize(value).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn is_presence(&self) -> bool {
        self.batch_id == PRESENCE_BATCH_ID
    }

    /// Whether the sender speaks a newer protocol than this build.
    pub fn is_newer_version(&self) -> bool {
        self.version.is_some_and(|v| v > PROTOCOL_VERSION)
    }

    /// Split the payload into presence entries and change records, keeping
    /// arrival order within each group.
    ///
    /// Presence entries that fail to parse are logged and dropped. Every
    /// other record, including unknown or untagged ones, stays in the change
    /// list so the application engine can report it.
    pub fn split(self) -> (Vec<Presence>, Vec<Value>) {
        let mut presence = Vec::new();
        let mut changes = Vec::new();

        for record in self.changes {
            let is_presence = record.get("type").and_then(Value::as_str) == Some(PRESENCE_TYPE);
            if !is_presence {
                changes.push(record);
                continue;
            }
            match Presence::deserialize(&record) {
                Ok(p) => presence.push(p),
                Err(e) => log::warn!("Dropping malformed presence record from {}: {e}", self.user),
            }
        }

        (presence, changes)
    }
}

/// Codec and transport errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Envelope is not a JSON object")]
    NotAnObject,
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Unknown change type: {0}")]
    UnknownChangeType(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("No async runtime available to drive the connection")]
    NoRuntime,
}
