//! SQLite storage for memory records
//!
//! Embeddings are stored as JSON arrays and ranked in process with cosine
//! similarity, which is adequate for a single developer's history.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{MemoryStore, RecordOrder, RecordQuery, SearchFilter, SimilarityRequest};
use crate::config::Config;
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::memory::{timestamp, MemoryId, MemoryRecord, NewMemory, ScoredMemory};

const COLUMNS: &str = "id, agent_id, task_type, context_content, raw_data, embedding, \
                       tags, task_timestamp, content_hash";

/// SQLite storage backend
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    dimensions: usize,
}

impl SqliteStore {
    /// Open the database configured for this process
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path(), config.embedding_dimensions)
    }

    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dimensions,
        })
    }

    /// Number of stored records
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM context_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn select(&self, sql: &str, params_vec: &[Box<dyn ToSql>]) -> Result<Vec<MemoryRow>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let mut stmt = conn.prepare(sql)?;
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(MemoryRow {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                task_type: row.get(2)?,
                context_content: row.get(3)?,
                raw_data: row.get(4)?,
                embedding: row.get(5)?,
                tags: row.get(6)?,
                task_timestamp: row.get(7)?,
                content_hash: row.get(8)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
    }
}

/// Append `AND ...` clauses for `filter` to `sql`
fn push_filter(filter: &SearchFilter, sql: &mut String, params_vec: &mut Vec<Box<dyn ToSql>>) {
    if let Some(agent_id) = &filter.agent_id {
        sql.push_str(" AND agent_id = ?");
        params_vec.push(Box::new(agent_id.clone()));
    }

    if !filter.task_types.is_empty() {
        sql.push_str(&format!(" AND task_type IN ({})", placeholders(filter.task_types.len())));
        for task_type in &filter.task_types {
            params_vec.push(Box::new(task_type.clone()));
        }
    }

    if !filter.tags.is_empty() {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(context_history.tags) \
             WHERE json_each.value IN ({}))",
            placeholders(filter.tags.len())
        ));
        for tag in &filter.tags {
            params_vec.push(Box::new(tag.clone()));
        }
    }

    if let Some(after) = filter.after {
        sql.push_str(" AND task_timestamp >= ?");
        params_vec.push(Box::new(format_timestamp(after)));
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Fixed-width UTC form so that string comparison orders chronologically
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn similarity_search(&self, request: &SimilarityRequest) -> Result<Vec<ScoredMemory>> {
        if request.embedding.len() != self.dimensions {
            return Err(Error::rpc(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                request.embedding.len()
            )));
        }

        let mut sql = format!("SELECT {} FROM context_history WHERE 1=1", COLUMNS);
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        push_filter(&request.filter, &mut sql, &mut params_vec);

        let mut scored = Vec::new();
        for row in self.select(&sql, &params_vec)? {
            let mut record = row.into_record()?;
            let similarity = record
                .embedding
                .take()
                .map(|e| cosine_similarity(&request.embedding, &e))
                .unwrap_or(0.0);

            if similarity > request.threshold {
                scored.push(ScoredMemory { record, similarity });
            }
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(request.limit);

        Ok(scored)
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!("SELECT {} FROM context_history WHERE 1=1", COLUMNS);
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        push_filter(&query.filter, &mut sql, &mut params_vec);

        if let Some(text) = &query.text {
            for term in text.split_whitespace() {
                sql.push_str(" AND context_content LIKE ? ESCAPE '\\'");
                params_vec.push(Box::new(format!("%{}%", escape_like(term))));
            }
        }

        if let Some(hash) = &query.content_hash {
            sql.push_str(" AND content_hash = ?");
            params_vec.push(Box::new(hash.clone()));
        }

        match query.order {
            RecordOrder::Native => sql.push_str(" ORDER BY rowid"),
            RecordOrder::NewestFirst => sql.push_str(" ORDER BY task_timestamp DESC"),
        }

        sql.push_str(" LIMIT ?");
        params_vec.push(Box::new(query.limit as i64));

        self.select(&sql, &params_vec)?
            .into_iter()
            .map(|row| {
                let mut record = row.into_record()?;
                record.embedding = None;
                Ok(record)
            })
            .collect()
    }

    async fn insert(
        &self,
        memory: &NewMemory,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> Result<MemoryRecord> {
        if embedding.len() != self.dimensions {
            return Err(Error::storage(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        let record = MemoryRecord {
            id: MemoryId::new(Uuid::new_v4().to_string()),
            agent_id: memory.agent_id.clone(),
            task_type: memory.task_type.clone(),
            context_content: memory.context_content.clone(),
            raw_data: memory.raw_data.clone(),
            embedding: None,
            tags: memory.tags.clone(),
            task_timestamp: Some(memory.task_timestamp.unwrap_or_else(Utc::now)),
            content_hash: Some(content_hash.to_string()),
        };

        let raw_data = if record.raw_data.is_null() {
            None
        } else {
            Some(serde_json::to_string(&record.raw_data)?)
        };

        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO context_history (
                id, agent_id, task_type, context_content, raw_data, embedding,
                tags, task_timestamp, content_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id.as_str(),
                record.agent_id,
                record.task_type,
                record.context_content,
                raw_data,
                serde_json::to_string(&embedding)?,
                serde_json::to_string(&record.tags)?,
                record.task_timestamp.map(format_timestamp),
                content_hash,
            ],
        )?;

        Ok(record)
    }
}

/// Intermediate struct for reading from SQLite
struct MemoryRow {
    id: String,
    agent_id: String,
    task_type: String,
    context_content: String,
    raw_data: Option<String>,
    embedding: String,
    tags: String,
    task_timestamp: String,
    content_hash: Option<String>,
}

impl MemoryRow {
    fn into_record(self) -> Result<MemoryRecord> {
        let raw_data = match self.raw_data {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        };

        Ok(MemoryRecord {
            id: MemoryId::new(self.id),
            agent_id: self.agent_id,
            task_type: self.task_type,
            context_content: self.context_content,
            raw_data,
            embedding: Some(serde_json::from_str(&self.embedding)?),
            tags: serde_json::from_str(&self.tags)?,
            task_timestamp: Some(timestamp::parse(&self.task_timestamp).ok_or_else(|| {
                Error::storage(format!("Invalid task_timestamp: {}", self.task_timestamp))
            })?),
            content_hash: self.content_hash,
        })
    }
}
