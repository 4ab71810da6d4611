//! Recent memories for an agent

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::memory::MemoryRecord;
use crate::storage::{MemoryStore, RecordQuery, SearchFilter};

/// Reads the newest records from the store. Store failures yield an empty
/// result.
pub struct RecencyFetcher {
    store: Arc<dyn MemoryStore>,
}

impl RecencyFetcher {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    /// Records of `agent_id` from the last `window_hours`, newest first
    pub async fn recent(
        &self,
        agent_id: &str,
        window_hours: u32,
        limit: usize,
    ) -> Vec<MemoryRecord> {
        if limit == 0 {
            return Vec::new();
        }

        let filter = match window_start(window_hours) {
            Some(cutoff) => SearchFilter::for_agent(agent_id).after(cutoff),
            None => {
                debug!(window_hours, "Recency window reaches past the epoch, not bounding by time");
                SearchFilter::for_agent(agent_id)
            }
        };
        let query = RecordQuery::new(filter, limit).newest_first();

        match self.store.query(&query).await {
            Ok(mut records) => {
                records.truncate(limit);
                info!(agent_id, count = records.len(), window_hours, "Fetched recent memories");
                records
            }
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to fetch recent memories");
                Vec::new()
            }
        }
    }

    /// Newest records of one task type, across all agents
    pub async fn by_task_type(&self, task_type: &str, limit: usize) -> Vec<MemoryRecord> {
        if limit == 0 {
            return Vec::new();
        }

        let filter = SearchFilter::default().with_task_types(vec![task_type.to_string()]);
        match self.store.query(&RecordQuery::new(filter, limit).newest_first()).await {
            Ok(mut records) => {
                records.truncate(limit);
                records
            }
            Err(e) => {
                warn!(task_type, error = %e, "Failed to fetch memories by task type");
                Vec::new()
            }
        }
    }
}

/// Start of a window of `hours` ending now. `None` when the window reaches
/// back past the Unix epoch, which covers every stored record.
fn window_start(hours: u32) -> Option<DateTime<Utc>> {
    Duration::try_hours(i64::from(hours))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .filter(|cutoff| cutoff.timestamp() > 0)
}
