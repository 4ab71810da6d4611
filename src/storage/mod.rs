//! Storage backends for agent-memory

mod sqlite;
mod supabase;

pub use sqlite::SqliteStore;
pub use supabase::{match_function_sql, SupabaseStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::memory::{MemoryRecord, NewMemory, ScoredMemory};

/// Attribute filters shared by similarity search and plain queries.
///
/// Every field is optional; an empty filter matches all records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// `agent_id` equality
    pub agent_id: Option<String>,

    /// `task_type` membership
    pub task_types: Vec<String>,

    /// `tags` overlap (at least one shared tag)
    pub tags: Vec<String>,

    /// `task_timestamp` lower bound, inclusive
    pub after: Option<DateTime<Utc>>,
}

impl SearchFilter {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }

    pub fn with_task_types(mut self, task_types: Vec<String>) -> Self {
        self.task_types = task_types;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn after(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    /// Whether a record passes every filter
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if &record.agent_id != agent_id {
                return false;
            }
        }
        if !self.task_types.is_empty() && !self.task_types.contains(&record.task_type) {
            return false;
        }
        if !self.tags.is_empty() && !record.tags.iter().any(|t| self.tags.contains(t)) {
            return false;
        }
        if let Some(after) = self.after {
            match record.task_timestamp {
                Some(ts) if ts >= after => {}
                _ => return false,
            }
        }
        true
    }
}

/// Parameters of the store's similarity function
#[derive(Debug, Clone)]
pub struct SimilarityRequest {
    pub embedding: Vec<f32>,

    /// Only records scoring strictly above this qualify
    pub threshold: f32,

    pub limit: usize,

    pub filter: SearchFilter,
}

/// Result ordering for [`RecordQuery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordOrder {
    /// Whatever order the store produces
    #[default]
    Native,

    /// `task_timestamp` descending
    NewestFirst,
}

/// A typed attribute query over the record collection
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub filter: SearchFilter,

    /// Full-text match against `context_content`
    pub text: Option<String>,

    /// Exact `content_hash` match
    pub content_hash: Option<String>,

    pub order: RecordOrder,

    pub limit: usize,
}

impl RecordQuery {
    pub fn new(filter: SearchFilter, limit: usize) -> Self {
        Self {
            filter,
            limit,
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = RecordOrder::NewestFirst;
        self
    }
}

/// Persistence for memory records.
///
/// Records are insert-only. `similarity_search` may be unavailable on some
/// deployments; callers treat its errors as a signal to fall back to `query`.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Rank records by similarity to `request.embedding`
    async fn similarity_search(&self, request: &SimilarityRequest) -> Result<Vec<ScoredMemory>>;

    /// Attribute-filtered read
    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>>;

    /// Write a new record and return it as stored
    async fn insert(
        &self,
        memory: &NewMemory,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> Result<MemoryRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryId;
    use chrono::Duration;

    fn record(
        agent: &str,
        task_type: &str,
        tags: &[&str],
        ts: Option<DateTime<Utc>>,
    ) -> MemoryRecord {
        MemoryRecord {
            id: MemoryId::new("1"),
            agent_id: agent.to_string(),
            task_type: task_type.to_string(),
            context_content: String::new(),
            raw_data: serde_json::Value::Null,
            embedding: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            task_timestamp: ts,
            content_hash: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(SearchFilter::default().matches(&record("a", "t", &[], None)));
    }

    #[test]
    fn filters_combine() {
        let now = Utc::now();
        let filter = SearchFilter::for_agent("refactor_agent")
            .with_task_types(vec!["refactor".into(), "review".into()])
            .with_tags(vec!["db".into()])
            .after(now - Duration::hours(1));

        assert!(filter.matches(&record("refactor_agent", "review", &["db", "auth"], Some(now))));
        assert!(!filter.matches(&record("other", "review", &["db"], Some(now))));
        assert!(!filter.matches(&record("refactor_agent", "plan", &["db"], Some(now))));
        assert!(!filter.matches(&record("refactor_agent", "review", &["ui"], Some(now))));
        assert!(!filter.matches(&record(
            "refactor_agent",
            "review",
            &["db"],
            Some(now - Duration::hours(2))
        )));
        assert!(!filter.matches(&record("refactor_agent", "review", &["db"], None)));
    }
}
