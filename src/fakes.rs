//! In-memory fakes for the external collaborators (testing only)
//!
//! `InMemoryStore` honours the [`MemoryStore`] contract and can be switched
//! into the failure modes the retrieval engine has to survive: a missing
//! similarity function and a failing table query.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::generation::TextGenerator;
use crate::memory::{MemoryId, MemoryRecord, NewMemory, ScoredMemory};
use crate::storage::{MemoryStore, RecordOrder, RecordQuery, SimilarityRequest};

/// Build a record with the fields retrieval cares about
pub fn record(
    id: &str,
    agent_id: &str,
    task_type: &str,
    content: &str,
    task_timestamp: DateTime<Utc>,
) -> MemoryRecord {
    MemoryRecord {
        id: MemoryId::new(id),
        agent_id: agent_id.to_string(),
        task_type: task_type.to_string(),
        context_content: content.to_string(),
        raw_data: serde_json::Value::Null,
        embedding: None,
        tags: Vec::new(),
        task_timestamp: Some(task_timestamp),
        content_hash: None,
    }
}

/// Vector store held in a `Vec`, insertion order is the native order
#[derive(Debug)]
pub struct InMemoryStore {
    records: Mutex<Vec<(MemoryRecord, Vec<f32>)>>,
    scripted: Mutex<Option<Vec<ScoredMemory>>>,
    next_id: AtomicU64,
    similarity_available: AtomicBool,
    queries_fail: AtomicBool,
    similarity_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            scripted: Mutex::new(None),
            next_id: AtomicU64::new(1),
            similarity_available: AtomicBool::new(true),
            queries_fail: AtomicBool::new(false),
            similarity_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as-is with `embedding`
    pub fn seed(&self, record: MemoryRecord, embedding: Vec<f32>) {
        self.records.lock().unwrap().push((record, embedding));
    }

    /// Make `similarity_search` fail like a missing server-side function
    pub fn set_similarity_available(&self, available: bool) {
        self.similarity_available.store(available, Ordering::SeqCst);
    }

    /// Make every `query` fail
    pub fn set_queries_fail(&self, fail: bool) {
        self.queries_fail.store(fail, Ordering::SeqCst);
    }

    /// Return exactly `results` from `similarity_search`
    pub fn script_similarity(&self, results: Vec<ScoredMemory>) {
        *self.scripted.lock().unwrap() = Some(results);
    }

    pub fn similarity_calls(&self) -> usize {
        self.similarity_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn similarity_search(&self, request: &SimilarityRequest) -> Result<Vec<ScoredMemory>> {
        self.similarity_calls.fetch_add(1, Ordering::SeqCst);
        if !self.similarity_available.load(Ordering::SeqCst) {
            return Err(Error::rpc("function match_memories does not exist"));
        }
        if let Some(scripted) = self.scripted.lock().unwrap().clone() {
            return Ok(scripted);
        }

        let records = self.records.lock().unwrap();
        let mut scored: Vec<ScoredMemory> = records
            .iter()
            .filter(|(record, _)| request.filter.matches(record))
            .map(|(record, embedding)| ScoredMemory {
                record: record.clone(),
                similarity: cosine_similarity(&request.embedding, embedding),
            })
            .filter(|s| s.similarity > request.threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(request.limit);
        Ok(scored)
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.queries_fail.load(Ordering::SeqCst) {
            return Err(Error::storage("connection reset by peer"));
        }

        let terms: Vec<String> = query
            .text
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let records = self.records.lock().unwrap();
        let mut matched: Vec<MemoryRecord> = records
            .iter()
            .map(|(record, _)| record)
            .filter(|record| query.filter.matches(record))
            .filter(|record| {
                let content = record.context_content.to_lowercase();
                terms.iter().all(|t| content.contains(t.as_str()))
            })
            .filter(|record| match &query.content_hash {
                Some(hash) => record.content_hash.as_ref() == Some(hash),
                None => true,
            })
            .cloned()
            .collect();

        if query.order == RecordOrder::NewestFirst {
            matched.sort_by(|a, b| b.task_timestamp.cmp(&a.task_timestamp));
        }
        matched.truncate(query.limit);
        Ok(matched)
    }

    async fn insert(
        &self,
        memory: &NewMemory,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> Result<MemoryRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = MemoryRecord {
            id: MemoryId::new(id.to_string()),
            agent_id: memory.agent_id.clone(),
            task_type: memory.task_type.clone(),
            context_content: memory.context_content.clone(),
            raw_data: memory.raw_data.clone(),
            embedding: None,
            tags: memory.tags.clone(),
            task_timestamp: Some(memory.task_timestamp.unwrap_or_else(Utc::now)),
            content_hash: Some(content_hash.to_string()),
        };
        self.records.lock().unwrap().push((record.clone(), embedding));
        Ok(record)
    }
}

/// Returns the same vector for every text
#[derive(Debug, Default)]
pub struct FixedEmbedder {
    vector: Vec<f32>,
    dimensions: usize,
    calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            dimensions: vector.len(),
            vector,
            calls: AtomicUsize::new(0),
        }
    }

    /// Claim a vector length other than the one actually returned
    pub fn declaring(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Fails every call, like an unreachable embedding API
#[derive(Debug, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::embedding("embedding API returned 503"))
    }

    fn dimensions(&self) -> usize {
        0
    }
}

/// Replies with a fixed completion (or error) and records the prompts it saw
#[derive(Debug)]
pub struct ScriptedGenerator {
    reply: std::result::Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Ok(reply.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            reply: Err(message.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, _system_prompt: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone().map_err(Error::generation)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
