//! Context assembly: similarity and recency merged into one bounded bundle

use std::collections::HashSet;

use chrono::SecondsFormat;
use serde::Serialize;
use tracing::{debug, info};

use crate::memory::{MemoryId, MemoryRecord};
use crate::recency::RecencyFetcher;
use crate::refine::QueryRefiner;
use crate::search::{SearchOutcome, SimilaritySearcher};
use crate::storage::SearchFilter;

/// Rendered form of an empty bundle
pub const NO_MEMORIES: &str = "RELEVANT_MEMORIES: None found for this context.";

const CONTEXT_HEADER: &str = "RELEVANT_HISTORICAL_CONTEXT:";

/// Which retrieval path produced a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Similarity,
    TextSearch,
    Recent,
}

/// A memory in a context bundle
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    #[serde(flatten)]
    pub record: MemoryRecord,

    /// Present only for similarity results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,

    pub source: MemorySource,
}

impl RetrievedMemory {
    pub fn id(&self) -> &MemoryId {
        &self.record.id
    }
}

/// Retrieved memories ready for injection into an agent prompt
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    /// Newest first, at most `max_memories`
    pub memories: Vec<RetrievedMemory>,

    /// Rendered context block
    pub formatted: String,
}

impl ContextBundle {
    pub fn empty() -> Self {
        Self {
            memories: Vec::new(),
            formatted: NO_MEMORIES.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

/// Rendering switches
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Append each memory's `raw_data` as pretty JSON
    pub include_raw_data: bool,
}

/// Builds context bundles from similarity search and recent history
pub struct ContextAssembler {
    refiner: QueryRefiner,
    searcher: SimilaritySearcher,
    recency: RecencyFetcher,
    threshold: f32,
    render: RenderOptions,
}

impl ContextAssembler {
    pub fn new(
        refiner: QueryRefiner,
        searcher: SimilaritySearcher,
        recency: RecencyFetcher,
        threshold: f32,
    ) -> Self {
        Self {
            refiner,
            searcher,
            recency,
            threshold,
            render: RenderOptions::default(),
        }
    }

    pub fn with_render_options(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    /// Retrieve the memories relevant to `task` for `agent_id`.
    ///
    /// Similarity and recency scores are not comparable, so after merging
    /// the final order is by task timestamp alone.
    pub async fn assemble(
        &self,
        task: &str,
        agent_id: &str,
        max_memories: usize,
        include_recent: bool,
        recent_hours: u32,
    ) -> ContextBundle {
        if max_memories == 0 {
            return ContextBundle::empty();
        }

        let filter = SearchFilter::for_agent(agent_id);
        let similar = async {
            let query = self.refiner.refine(task).await;
            self.searcher
                .search(&query, max_memories, self.threshold, &filter)
                .await
        };
        let recent = async {
            if include_recent {
                self.recency.recent(agent_id, recent_hours, max_memories).await
            } else {
                Vec::new()
            }
        };
        let (similar, recent) = futures::join!(similar, recent);

        debug!(
            similar = similar.len(),
            ranked = similar.is_ranked(),
            recent = recent.len(),
            "Merging memories"
        );

        let memories = merge_memories(similar, recent, max_memories);
        let formatted = render_context(&memories, &self.render);
        info!(agent_id, count = memories.len(), "Assembled memory context");

        ContextBundle {
            memories,
            formatted,
        }
    }
}

/// Merge search and recency results into at most `max_memories` entries.
///
/// Recent records whose id already appeared are dropped, the list is capped
/// at twice `max_memories`, stably sorted by task timestamp (newest first,
/// undated last) and cut to `max_memories`.
pub fn merge_memories(
    similar: SearchOutcome,
    recent: Vec<MemoryRecord>,
    max_memories: usize,
) -> Vec<RetrievedMemory> {
    let found = match similar {
        SearchOutcome::Ranked(scored) => scored
            .into_iter()
            .map(|s| RetrievedMemory {
                record: s.record,
                similarity: Some(s.similarity),
                source: MemorySource::Similarity,
            })
            .collect::<Vec<_>>(),
        SearchOutcome::Unranked(records) => records
            .into_iter()
            .map(|record| RetrievedMemory {
                record,
                similarity: None,
                source: MemorySource::TextSearch,
            })
            .collect(),
    };

    let recent = recent.into_iter().map(|record| RetrievedMemory {
        record,
        similarity: None,
        source: MemorySource::Recent,
    });

    let mut seen: HashSet<MemoryId> = HashSet::new();
    let mut merged: Vec<RetrievedMemory> = found
        .into_iter()
        .chain(recent)
        .filter(|m| seen.insert(m.id().clone()))
        .collect();

    merged.truncate(max_memories.saturating_mul(2));
    merged.sort_by(|a, b| b.record.task_timestamp.cmp(&a.record.task_timestamp));
    merged.truncate(max_memories);
    merged
}

/// Render memories as a numbered context block
pub fn render_context(memories: &[RetrievedMemory], options: &RenderOptions) -> String {
    if memories.is_empty() {
        return NO_MEMORIES.to_string();
    }

    let mut parts = vec![CONTEXT_HEADER.to_string()];
    for (i, memory) in memories.iter().enumerate() {
        let record = &memory.record;
        parts.push(format!("\n--- MEMORY_{} ---", i + 1));
        parts.push(format!(
            "TIMESTAMP: {}",
            record
                .task_timestamp
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_else(|| "unknown".to_string())
        ));
        parts.push(format!("TASK_TYPE: {}", or_unknown(&record.task_type)));
        parts.push(format!("AGENT_ID: {}", or_unknown(&record.agent_id)));
        parts.push("CONTEXT:".to_string());
        parts.push(record.context_content.clone());

        if !record.tags.is_empty() {
            parts.push(format!("TAGS: {}", record.tags.join(", ")));
        }

        if options.include_raw_data {
            if let Some(raw) = pretty_raw_data(&record.raw_data) {
                parts.push("RAW_DATA:".to_string());
                parts.push(raw);
            }
        }
    }

    parts.join("\n")
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "unknown"
    } else {
        value
    }
}

/// Pretty JSON for a raw payload; strings holding JSON are decoded first
fn pretty_raw_data(raw: &serde_json::Value) -> Option<String> {
    let value = match raw {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => serde_json::from_str(s).ok()?,
        other => other.clone(),
    };
    serde_json::to_string_pretty(&value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::record;
    use crate::memory::ScoredMemory;
    use chrono::{DateTime, Duration, Utc};

    fn at(hours_ago: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(hours_ago)
    }

    fn scored(id: &str, hours_ago: i64, similarity: f32) -> ScoredMemory {
        ScoredMemory {
            record: record(id, "a", "refactor", id, at(hours_ago)),
            similarity,
        }
    }

    fn ids(memories: &[RetrievedMemory]) -> Vec<&str> {
        memories.iter().map(|m| m.id().as_str()).collect()
    }

    #[test]
    fn merge_dedups_by_id_and_orders_by_time() {
        let similar = SearchOutcome::Ranked(vec![scored("s1", 30, 0.9), scored("r1", 1, 0.8)]);
        let recent = vec![
            record("r1", "a", "refactor", "r1", at(1)),
            record("r2", "a", "refactor", "r2", at(2)),
        ];

        let merged = merge_memories(similar, recent, 5);
        assert_eq!(ids(&merged), vec!["r1", "r2", "s1"]);
        assert_eq!(merged[0].source, MemorySource::Similarity);
        assert_eq!(merged[0].similarity, Some(0.8));
        assert_eq!(merged[1].source, MemorySource::Recent);
        assert_eq!(merged[1].similarity, None);
    }

    #[test]
    fn merge_caps_before_sorting() {
        // Five unique entries for max 2: only the first four survive the
        // pre-sort cap, so the newest record (r3) is never considered.
        let similar = SearchOutcome::Ranked(vec![scored("s1", 10, 0.9), scored("s2", 20, 0.8)]);
        let recent = vec![
            record("r1", "a", "t", "r1", at(5)),
            record("r2", "a", "t", "r2", at(6)),
            record("r3", "a", "t", "r3", at(0)),
        ];

        let merged = merge_memories(similar, recent, 2);
        assert_eq!(ids(&merged), vec!["r1", "r2"]);
    }

    #[test]
    fn merge_drops_duplicates_inside_one_list() {
        let recent = vec![
            record("r1", "a", "t", "first", at(1)),
            record("r1", "a", "t", "again", at(1)),
        ];
        let merged = merge_memories(SearchOutcome::empty(), recent, 5);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].record.context_content, "first");
    }

    #[test]
    fn unranked_results_keep_no_score() {
        let similar = SearchOutcome::Unranked(vec![record("t1", "a", "t", "text hit", at(3))]);
        let merged = merge_memories(similar, Vec::new(), 5);
        assert_eq!(merged[0].source, MemorySource::TextSearch);
        assert_eq!(merged[0].similarity, None);
    }

    #[test]
    fn undated_records_sort_last() {
        let mut undated = record("u", "a", "t", "undated", at(0));
        undated.task_timestamp = None;
        let merged = merge_memories(
            SearchOutcome::Unranked(vec![undated]),
            vec![record("d", "a", "t", "dated", at(100))],
            5,
        );
        assert_eq!(ids(&merged), vec!["d", "u"]);
    }

    #[test]
    fn render_empty_is_sentinel() {
        assert_eq!(render_context(&[], &RenderOptions::default()), NO_MEMORIES);
    }

    #[test]
    fn render_numbers_blocks_and_keeps_full_content() {
        let long = "x".repeat(5000);
        let ts = DateTime::parse_from_rfc3339("2025-03-01T10:15:00Z").unwrap().with_timezone(&Utc);
        let mut first = record("1", "refactor_agent", "refactor", &long, ts);
        first.tags = vec!["db".into(), "auth".into()];
        let second = record("2", "refactor_agent", "review", "second", ts);

        let memories: Vec<_> = [first, second]
            .into_iter()
            .map(|record| RetrievedMemory {
                record,
                similarity: None,
                source: MemorySource::Recent,
            })
            .collect();

        let rendered = render_context(&memories, &RenderOptions::default());
        let expected_start = format!(
            "RELEVANT_HISTORICAL_CONTEXT:\n\n--- MEMORY_1 ---\nTIMESTAMP: 2025-03-01T10:15:00Z\n\
             TASK_TYPE: refactor\nAGENT_ID: refactor_agent\nCONTEXT:\n{}\nTAGS: db, auth\n\n\
             --- MEMORY_2 ---",
            long
        );
        assert!(rendered.starts_with(&expected_start));
        assert!(rendered.ends_with("CONTEXT:\nsecond"));
    }

    #[test]
    fn render_raw_data_when_asked() {
        let mut with_raw = record("1", "a", "t", "content", at(0));
        with_raw.raw_data = serde_json::Value::String("{\"files\":[\"auth.rs\"]}".to_string());
        let mut broken = record("2", "a", "t", "content", at(0));
        broken.raw_data = serde_json::Value::String("not json".to_string());

        let memories: Vec<_> = [with_raw, broken]
            .into_iter()
            .map(|record| RetrievedMemory {
                record,
                similarity: None,
                source: MemorySource::Recent,
            })
            .collect();

        let plain = render_context(&memories, &RenderOptions::default());
        assert!(!plain.contains("RAW_DATA"));

        let rendered = render_context(&memories, &RenderOptions { include_raw_data: true });
        assert_eq!(rendered.matches("RAW_DATA:").count(), 1);
        assert!(rendered.contains("\"files\": [\n    \"auth.rs\"\n  ]"));
    }
}
