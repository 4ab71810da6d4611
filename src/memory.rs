//! Memory record types and the canonical rendering used for content hashing

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Store-assigned record identity.
///
/// Supabase hands out `bigint` ids while the local store uses UUIDs, so the id
/// is kept opaque and accepted from either a JSON number or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MemoryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(Self(s)),
            serde_json::Value::Number(n) => Ok(Self(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "memory id must be a string or number, got {}",
                other
            ))),
        }
    }
}

/// A stored memory: one agent task output or conversation summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,

    /// Agent that produced the memory
    pub agent_id: String,

    /// Category of the task, e.g. `refactor` or `conversation_summary`
    pub task_type: String,

    /// The retrievable payload
    #[serde(default)]
    pub context_content: String,

    /// Opaque structured payload, never searched
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw_data: serde_json::Value,

    /// Embedding vector; usually not selected on reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    #[serde(default, deserialize_with = "nullable_tags")]
    pub tags: Vec<String>,

    /// When the task happened. The similarity function returns this column as
    /// `timestamp`.
    #[serde(
        default,
        alias = "timestamp",
        deserialize_with = "timestamp::deserialize_opt"
    )]
    pub task_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A record produced by similarity search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub record: MemoryRecord,

    /// Closeness to the query in [0, 1], higher is closer
    pub similarity: f32,
}

/// Payload for a new memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub agent_id: String,
    pub task_type: String,
    pub context_content: String,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw_data: serde_json::Value,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timestamp: Option<DateTime<Utc>>,
}

impl NewMemory {
    pub fn new(
        agent_id: impl Into<String>,
        task_type: impl Into<String>,
        context_content: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            context_content: context_content.into(),
            raw_data: serde_json::Value::Null,
            tags: Vec::new(),
            task_timestamp: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_raw_data(mut self, raw_data: serde_json::Value) -> Self {
        self.raw_data = raw_data;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.task_timestamp = Some(timestamp);
        self
    }

    /// Canonical text form of the payload.
    ///
    /// The content hash is taken over exactly this string, so any change here
    /// changes duplicate detection for every stored record.
    pub fn render(&self) -> String {
        format!(
            "AGENT_ID: {}\nTASK_TYPE: {}\nCONTEXT:\n{}",
            self.agent_id, self.task_type, self.context_content
        )
    }

    /// SHA-256 hex digest of [`NewMemory::render`]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn nullable_tags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Lenient timestamp parsing for Postgres `timestamp` and `timestamptz` columns
pub mod timestamp {
    use super::*;

    /// Parse RFC 3339, or a naive timestamp interpreted as UTC
    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f%#z"]
            .iter()
            .find_map(|fmt| {
                DateTime::parse_from_str(s, fmt)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
                    .or_else(|| NaiveDateTime::parse_from_str(s, fmt).ok().map(|n| n.and_utc()))
            })
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s))),
        }
    }
}
