//! Similarity search with a text-search fallback

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingProvider;
use crate::memory::{MemoryRecord, ScoredMemory};
use crate::storage::{MemoryStore, RecordQuery, SearchFilter, SimilarityRequest};

/// What a search produced.
///
/// `Ranked` comes from the store's similarity function, `Unranked` from the
/// text-search fallback, which carries no score.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "results", rename_all = "snake_case")]
pub enum SearchOutcome {
    Ranked(Vec<ScoredMemory>),
    Unranked(Vec<MemoryRecord>),
}

impl SearchOutcome {
    pub fn empty() -> Self {
        Self::Ranked(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ranked(r) => r.len(),
            Self::Unranked(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ranked(&self) -> bool {
        matches!(self, Self::Ranked(_))
    }
}

/// Embeds queries and ranks stored memories against them
pub struct SimilaritySearcher {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn MemoryStore>,
}

impl SimilaritySearcher {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn MemoryStore>) -> Self {
        Self { embedder, store }
    }

    /// Search for memories similar to `query`.
    ///
    /// Ranked results score strictly above `threshold` and come best first.
    /// Nothing here returns an error: embedding failures yield an empty
    /// result, similarity failures fall back to text search, and a failing
    /// fallback yields an empty result.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        filter: &SearchFilter,
    ) -> SearchOutcome {
        if limit == 0 {
            return SearchOutcome::empty();
        }
        let threshold = normalize_threshold(threshold);

        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) if !embedding.is_empty() => embedding,
            Ok(_) => {
                warn!("Embedding provider returned an empty vector");
                return SearchOutcome::empty();
            }
            Err(e) => {
                warn!(error = %e, "Failed to embed search query");
                return SearchOutcome::empty();
            }
        };

        let request = SimilarityRequest {
            embedding,
            threshold,
            limit,
            filter: filter.clone(),
        };

        match self.store.similarity_search(&request).await {
            Ok(mut results) => {
                // Hold the store to its ordering contract.
                results.retain(|r| r.similarity > threshold);
                results.sort_by(|a, b| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                results.truncate(limit);

                if results.is_empty() {
                    info!("No similar memories found");
                } else {
                    info!(count = results.len(), "Found similar memories");
                }
                SearchOutcome::Ranked(results)
            }
            Err(e) => {
                warn!(error = %e, "Similarity search failed, falling back to text search");
                SearchOutcome::Unranked(self.fallback_text_search(query, limit, filter).await)
            }
        }
    }

    /// Literal text search over `context_content`.
    ///
    /// Applies the agent, task type and time filters; tag overlap is not part
    /// of the fallback.
    async fn fallback_text_search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Vec<MemoryRecord> {
        let fallback_filter = SearchFilter {
            tags: Vec::new(),
            ..filter.clone()
        };
        let request = RecordQuery::new(fallback_filter, limit).with_text(query);

        match self.store.query(&request).await {
            Ok(mut records) => {
                records.truncate(limit);
                info!(count = records.len(), "Fallback text search finished");
                records
            }
            Err(e) => {
                warn!(error = %e, "Fallback text search failed");
                Vec::new()
            }
        }
    }
}

fn normalize_threshold(threshold: f32) -> f32 {
    if threshold.is_nan() {
        debug!("NaN similarity threshold, using 0.0");
        return 0.0;
    }
    let clamped = threshold.clamp(0.0, 1.0);
    if clamped != threshold {
        debug!(threshold, clamped, "Similarity threshold clamped to [0, 1]");
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{record, FailingEmbedder, FixedEmbedder, InMemoryStore};
    use chrono::{Duration, Utc};

    fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store.seed(record("1", "a", "refactor", "auth query tuning", now), vec![1.0, 0.0]);
        store.seed(record("2", "a", "refactor", "auth cache layer", now), vec![0.8, 0.6]);
        store.seed(record("3", "a", "review", "unrelated css work", now), vec![0.0, 1.0]);
        store.seed(
            record("4", "b", "refactor", "auth query for agent b", now - Duration::hours(1)),
            vec![1.0, 0.0],
        );
        store
    }

    fn searcher(store: Arc<InMemoryStore>) -> SimilaritySearcher {
        SimilaritySearcher::new(Arc::new(FixedEmbedder::new(vec![1.0, 0.0])), store)
    }

    #[tokio::test]
    async fn ranked_results_respect_threshold_and_order() {
        let searcher = searcher(seeded_store());
        let outcome = searcher.search("auth", 10, 0.5, &SearchFilter::for_agent("a")).await;

        let SearchOutcome::Ranked(results) = outcome else {
            panic!("expected ranked results");
        };
        let ids: Vec<_> = results.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(results.iter().all(|r| r.similarity > 0.5));
    }

    #[tokio::test]
    async fn misbehaving_store_is_held_to_contract() {
        let store = seeded_store();
        let now = Utc::now();
        store.script_similarity(vec![
            ScoredMemory { record: record("x", "a", "t", "low", now), similarity: 0.2 },
            ScoredMemory { record: record("y", "a", "t", "mid", now), similarity: 0.75 },
            ScoredMemory { record: record("z", "a", "t", "high", now), similarity: 0.95 },
        ]);

        let outcome = searcher(store).search("q", 10, 0.5, &SearchFilter::default()).await;
        let SearchOutcome::Ranked(results) = outcome else {
            panic!("expected ranked results");
        };
        let ids: Vec<_> = results.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "y"]);
    }

    #[tokio::test]
    async fn falls_back_to_text_search_when_rpc_missing() {
        let store = seeded_store();
        store.set_similarity_available(false);

        let outcome = searcher(store.clone())
            .search("auth query", 1, 0.7, &SearchFilter::for_agent("a"))
            .await;

        let SearchOutcome::Unranked(records) = outcome else {
            panic!("expected unranked fallback results");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_str(), "1");
        assert_eq!(store.query_calls(), 1);
    }

    #[tokio::test]
    async fn fallback_ignores_tag_filter() {
        let store = seeded_store();
        store.set_similarity_available(false);

        let filter = SearchFilter::for_agent("a").with_tags(vec!["missing".into()]);
        let outcome = searcher(store).search("auth", 10, 0.7, &filter).await;
        assert_eq!(outcome.len(), 2);
    }

    #[tokio::test]
    async fn failing_fallback_returns_empty() {
        let store = seeded_store();
        store.set_similarity_available(false);
        store.set_queries_fail(true);

        let outcome = searcher(store).search("auth", 5, 0.7, &SearchFilter::default()).await;
        assert!(!outcome.is_ranked());
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_is_a_hard_stop() {
        let store = seeded_store();
        let searcher = SimilaritySearcher::new(Arc::new(FailingEmbedder), store.clone());

        let outcome = searcher.search("auth", 5, 0.7, &SearchFilter::default()).await;
        assert!(outcome.is_empty());
        assert_eq!(store.similarity_calls(), 0);
        assert_eq!(store.query_calls(), 0);
    }

    #[tokio::test]
    async fn empty_embedding_is_a_hard_stop() {
        let store = seeded_store();
        let embedder = Arc::new(FixedEmbedder::new(Vec::new()));
        let searcher = SimilaritySearcher::new(embedder, store.clone());

        assert!(searcher.search("auth", 5, 0.7, &SearchFilter::default()).await.is_empty());
        assert_eq!(store.similarity_calls(), 0);
    }

    #[tokio::test]
    async fn zero_limit_skips_everything() {
        let store = seeded_store();
        let embedder = Arc::new(FixedEmbedder::new(vec![1.0, 0.0]));
        let searcher = SimilaritySearcher::new(embedder.clone(), store.clone());

        assert!(searcher.search("auth", 0, 0.7, &SearchFilter::default()).await.is_empty());
        assert_eq!(embedder.calls(), 0);
        assert_eq!(store.similarity_calls(), 0);
    }

    #[tokio::test]
    async fn out_of_range_thresholds_do_not_panic() {
        let searcher = searcher(seeded_store());
        for threshold in [-3.0, 1.5, f32::NAN, f32::INFINITY] {
            let outcome = searcher.search("auth", 10, threshold, &SearchFilter::default()).await;
            assert!(outcome.is_ranked());
        }

        let everything = searcher.search("auth", 10, -3.0, &SearchFilter::for_agent("a")).await;
        assert_eq!(everything.len(), 2);
        let nothing = searcher.search("auth", 10, 1.5, &SearchFilter::default()).await;
        assert!(nothing.is_empty());
    }
}
