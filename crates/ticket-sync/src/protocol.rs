use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// A ticket as seen by the engine: a stable id plus an opaque field bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Server-side `updatedAt`, when present and RFC 3339.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.fields
            .get("updatedAt")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Shallow-merges `patch` into the field bag. `id` in the patch is ignored.
    pub fn merge_fields(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            self.fields.insert(key, value);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    #[serde(default)]
    pub is_first_page: bool,
    #[serde(default)]
    pub is_last_page: bool,
    pub current_page: u32,
    #[serde(default)]
    pub previous_page: Option<u32>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub data: Vec<Record>,
    pub meta: PageMeta,
}

impl Page {
    /// A page without a `nextPage` (or flagged as the last one) ends the listing.
    pub fn has_more(&self) -> bool {
        self.meta.next_page.is_some() && !self.meta.is_last_page
    }
}

/// One decoded stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Connected,
    Heartbeat { timestamp: Option<String> },
    Upsert(Record),
    Delete(String),
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Tombstone {
    id: String,
}

impl StreamMessage {
    pub fn parse(text: &str) -> SyncResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "connected" => Ok(StreamMessage::Connected),
            "heartbeat" => Ok(StreamMessage::Heartbeat {
                timestamp: envelope.timestamp.map(|value| match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                }),
            }),
            "upsert" => decode_upsert(envelope.data),
            "delete" => decode_delete(envelope.data),
            "issue_update" => match envelope.action.as_deref() {
                Some("created") | Some("updated") => decode_upsert(envelope.data),
                Some("deleted") => decode_delete(envelope.data),
                Some(other) => Err(SyncError::Decode(format!(
                    "unsupported issue_update action {other}"
                ))),
                None => Err(SyncError::Decode("issue_update without action".into())),
            },
            _ => Ok(StreamMessage::Unknown(envelope.kind)),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            StreamMessage::Connected => "connected",
            StreamMessage::Heartbeat { .. } => "heartbeat",
            StreamMessage::Upsert(_) => "upsert",
            StreamMessage::Delete(_) => "delete",
            StreamMessage::Unknown(kind) => kind,
        }
    }
}

fn decode_upsert(data: Option<Value>) -> SyncResult<StreamMessage> {
    let data = data.ok_or_else(|| SyncError::Decode("upsert without data".into()))?;
    let record: Record = serde_json::from_value(data)?;
    if record.id.is_empty() {
        return Err(SyncError::Decode("upsert with empty id".into()));
    }
    Ok(StreamMessage::Upsert(record))
}

fn decode_delete(data: Option<Value>) -> SyncResult<StreamMessage> {
    let data = data.ok_or_else(|| SyncError::Decode("delete without data".into()))?;
    let Tombstone { id } = serde_json::from_value(data)?;
    if id.is_empty() {
        return Err(SyncError::Decode("delete with empty id".into()));
    }
    Ok(StreamMessage::Delete(id))
}
