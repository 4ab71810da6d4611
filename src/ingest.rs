//! Ingestion: embed and store new memories, skipping exact duplicates

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::memory::{MemoryId, NewMemory};
use crate::storage::{MemoryStore, RecordQuery, SearchFilter};

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A new record was written
    Stored { id: MemoryId, content_hash: String },

    /// A record with the same content hash already existed; nothing written
    Duplicate { id: MemoryId, content_hash: String },
}

impl IngestOutcome {
    pub fn id(&self) -> &MemoryId {
        match self {
            Self::Stored { id, .. } | Self::Duplicate { id, .. } => id,
        }
    }
}

/// Writes memories. Unlike retrieval, every failure is returned to the caller.
pub struct MemoryWriter {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn MemoryStore>,
}

impl MemoryWriter {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn MemoryStore>) -> Self {
        Self { embedder, store }
    }

    /// Store `memory` unless a byte-identical rendering is already stored.
    ///
    /// The existence check and the insert are separate calls; two concurrent
    /// writers can both insert.
    pub async fn ingest(&self, memory: &NewMemory) -> Result<IngestOutcome> {
        validate(memory)?;

        let content_hash = memory.content_hash();
        let existing = self
            .store
            .query(&RecordQuery::new(SearchFilter::default(), 1).with_content_hash(&content_hash))
            .await?;

        if let Some(record) = existing.into_iter().next() {
            info!(id = %record.id, content_hash = %content_hash, "Memory already stored, skipping");
            return Ok(IngestOutcome::Duplicate {
                id: record.id,
                content_hash,
            });
        }

        let embedding = self.embedder.embed(&memory.context_content).await?;
        if embedding.is_empty() {
            return Err(Error::embedding("Embedding provider returned an empty vector"));
        }
        if embedding.len() != self.embedder.dimensions() {
            return Err(Error::embedding(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.embedder.dimensions(),
                embedding.len()
            )));
        }

        let record = self.store.insert(memory, embedding, &content_hash).await?;
        info!(
            id = %record.id,
            agent_id = %record.agent_id,
            task_type = %record.task_type,
            "Stored new memory"
        );

        Ok(IngestOutcome::Stored {
            id: record.id,
            content_hash,
        })
    }
}

fn validate(memory: &NewMemory) -> Result<()> {
    if memory.agent_id.trim().is_empty() {
        return Err(Error::invalid_input("agent_id must not be empty"));
    }
    if memory.task_type.trim().is_empty() {
        return Err(Error::invalid_input("task_type must not be empty"));
    }
    if memory.context_content.trim().is_empty() {
        return Err(Error::invalid_input("context_content must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FailingEmbedder, FixedEmbedder, InMemoryStore};

    fn writer(store: Arc<InMemoryStore>) -> MemoryWriter {
        MemoryWriter::new(Arc::new(FixedEmbedder::new(vec![0.5, 0.5])), store)
    }

    #[tokio::test]
    async fn second_identical_write_is_a_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());
        let memory =
            NewMemory::new("refactor_agent", "refactor", "Moved auth queries behind a cache");

        let first = writer.ingest(&memory).await.unwrap();
        let second = writer.ingest(&memory).await.unwrap();

        assert!(matches!(first, IngestOutcome::Stored { .. }));
        assert!(matches!(second, IngestOutcome::Duplicate { .. }));
        assert_eq!(first.id(), second.id());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn different_content_is_stored() {
        let store = Arc::new(InMemoryStore::new());
        let writer = writer(store.clone());

        writer.ingest(&NewMemory::new("a", "t", "one")).await.unwrap();
        writer.ingest(&NewMemory::new("a", "t", "one ")).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn rejects_empty_content() {
        let writer = writer(Arc::new(InMemoryStore::new()));
        let err = writer.ingest(&NewMemory::new("a", "t", "  ")).await.unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn write_failures_propagate() {
        let store = Arc::new(InMemoryStore::new());
        let writer = MemoryWriter::new(Arc::new(FailingEmbedder), store.clone());
        let err = writer.ingest(&NewMemory::new("a", "t", "content")).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert!(store.is_empty());

        store.set_queries_fail(true);
        let err = writer.ingest(&NewMemory::new("a", "t", "content")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn wrong_length_vector_is_not_stored() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = FixedEmbedder::new(vec![0.5, 0.5]).declaring(3);
        let writer = MemoryWriter::new(Arc::new(embedder), store.clone());

        let err = writer.ingest(&NewMemory::new("a", "t", "content")).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(msg) if msg.contains("expected 3, got 2")));
        assert!(store.is_empty());
    }

    #[test]
    fn outcome_serializes_with_status() {
        let outcome = IngestOutcome::Duplicate {
            id: MemoryId::new("9"),
            content_hash: "abc".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "duplicate");
        assert_eq!(json["id"], "9");
    }
}
