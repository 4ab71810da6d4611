//! Supabase storage over PostgREST
//!
//! Similarity search calls a SQL function (`match_memories` by default, see
//! [`match_function_sql`]); everything else goes through the table endpoint.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response};
use serde::Serialize;
use tracing::debug;

use super::{MemoryStore, RecordOrder, RecordQuery, SearchFilter, SimilarityRequest};
use crate::config::{Config, StoreBackend};
use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, NewMemory, ScoredMemory};

/// Columns read back from the table. The embedding is left out because
/// PostgREST renders pgvector values as strings.
const SELECT_COLUMNS: &str =
    "id,agent_id,task_type,context_content,raw_data,tags,task_timestamp,content_hash";

/// SQL installing the similarity function this backend calls, sized for the
/// configured table, function name and embedding dimensions
pub fn match_function_sql(config: &Config) -> String {
    format!(
        r#"alter table {table}
  add column if not exists content_hash text;

create index if not exists {table}_content_hash_idx
  on {table} (content_hash);

create or replace function {function}(
  query_embedding vector({dimensions}),
  match_threshold float,
  match_count int,
  filter_agent_id text default null,
  filter_task_types text[] default null,
  filter_tags text[] default null,
  filter_after_date timestamp default null
)
returns table (
  id bigint,
  agent_id text,
  task_type text,
  context_content text,
  raw_data jsonb,
  "timestamp" timestamp,
  tags text[],
  similarity float
)
language sql stable
as $$
  select
    ch.id,
    ch.agent_id,
    ch.task_type,
    ch.context_content,
    ch.raw_data,
    ch.task_timestamp as "timestamp",
    ch.tags,
    1 - (ch.embedding <=> query_embedding) as similarity
  from {table} ch
  where
    (1 - (ch.embedding <=> query_embedding)) > match_threshold
    and (filter_agent_id is null or ch.agent_id = filter_agent_id)
    and (filter_task_types is null or ch.task_type = any(filter_task_types))
    and (filter_tags is null or ch.tags && filter_tags)
    and (filter_after_date is null or ch.task_timestamp >= filter_after_date)
  order by similarity desc
  limit match_count;
$$;
"#,
        table = config.table,
        function = config.match_function,
        dimensions = config.embedding_dimensions,
    )
}

#[derive(Debug, Serialize)]
struct MatchParams<'a> {
    query_embedding: &'a [f32],
    match_threshold: f32,
    match_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_agent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_task_types: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_tags: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_after_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct InsertRow<'a> {
    agent_id: &'a str,
    task_type: &'a str,
    context_content: &'a str,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    raw_data: &'a serde_json::Value,
    embedding: Vec<f32>,
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    task_timestamp: Option<String>,
    content_hash: &'a str,
}

/// PostgREST-backed memory store
pub struct SupabaseStore {
    base_url: String,
    api_key: String,
    table: String,
    match_function: String,
    http_client: reqwest::Client,
}

impl SupabaseStore {
    pub fn new(config: &Config, http_client: reqwest::Client) -> Result<Self> {
        let StoreBackend::Supabase { url, key } = &config.store else {
            return Err(Error::config("Supabase store requires SUPABASE_URL and SUPABASE_KEY"));
        };

        Ok(Self {
            base_url: format!("{}/rest/v1", url),
            api_key: key.clone(),
            table: config.table.clone(),
            match_function: config.match_function.clone(),
            http_client,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.base_url, self.table)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn match_params<'a>(request: &'a SimilarityRequest) -> MatchParams<'a> {
    let filter = &request.filter;
    MatchParams {
        query_embedding: &request.embedding,
        match_threshold: request.threshold,
        match_count: request.limit,
        filter_agent_id: filter.agent_id.as_deref(),
        filter_task_types: (!filter.task_types.is_empty()).then_some(filter.task_types.as_slice()),
        filter_tags: (!filter.tags.is_empty()).then_some(filter.tags.as_slice()),
        filter_after_date: filter.after.map(format_timestamp),
    }
}

/// Quote a value for use inside a PostgREST list operator
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn filter_params(filter: &SearchFilter, params: &mut Vec<(String, String)>) {
    if let Some(agent_id) = &filter.agent_id {
        params.push(("agent_id".into(), format!("eq.{}", agent_id)));
    }
    if !filter.task_types.is_empty() {
        let values: Vec<_> = filter.task_types.iter().map(|t| quote(t)).collect();
        params.push(("task_type".into(), format!("in.({})", values.join(","))));
    }
    if !filter.tags.is_empty() {
        let values: Vec<_> = filter.tags.iter().map(|t| quote(t)).collect();
        params.push(("tags".into(), format!("ov.{{{}}}", values.join(","))));
    }
    if let Some(after) = filter.after {
        params.push(("task_timestamp".into(), format!("gte.{}", format_timestamp(after))));
    }
}

fn query_params(query: &RecordQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), SELECT_COLUMNS.to_string())];
    filter_params(&query.filter, &mut params);

    if let Some(text) = &query.text {
        params.push(("context_content".into(), format!("plfts.{}", text)));
    }
    if let Some(hash) = &query.content_hash {
        params.push(("content_hash".into(), format!("eq.{}", hash)));
    }
    if query.order == RecordOrder::NewestFirst {
        params.push(("order".into(), "task_timestamp.desc".into()));
    }
    params.push(("limit".into(), query.limit.to_string()));
    params
}

async fn error_body(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("{}: {}", status, body)
}

#[async_trait]
impl MemoryStore for SupabaseStore {
    async fn similarity_search(&self, request: &SimilarityRequest) -> Result<Vec<ScoredMemory>> {
        let url = format!("{}/rpc/{}", self.base_url, self.match_function);
        let response = self
            .authorized(self.http_client.post(&url))
            .json(&match_params(request))
            .send()
            .await
            .map_err(|e| Error::rpc(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::rpc(format!(
                "{} failed with {}",
                self.match_function,
                error_body(response).await
            )));
        }

        let rows: Vec<ScoredMemory> = response.json().await.map_err(|e| {
            Error::rpc(format!("Unreadable {} response: {}", self.match_function, e))
        })?;
        debug!(count = rows.len(), "Similarity function returned rows");
        Ok(rows)
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<MemoryRecord>> {
        let response = self
            .authorized(self.http_client.get(self.table_url()))
            .query(&query_params(query))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "Query on {} failed with {}",
                self.table,
                error_body(response).await
            )));
        }

        Ok(response.json().await?)
    }

    async fn insert(
        &self,
        memory: &NewMemory,
        embedding: Vec<f32>,
        content_hash: &str,
    ) -> Result<MemoryRecord> {
        let row = InsertRow {
            agent_id: &memory.agent_id,
            task_type: &memory.task_type,
            context_content: &memory.context_content,
            raw_data: &memory.raw_data,
            embedding,
            tags: &memory.tags,
            task_timestamp: memory.task_timestamp.map(format_timestamp),
            content_hash,
        };

        let response = self
            .authorized(self.http_client.post(self.table_url()))
            .header("Prefer", "return=representation")
            .query(&[("select", SELECT_COLUMNS)])
            .json(&row)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "Insert into {} failed with {}",
                self.table,
                error_body(response).await
            )));
        }

        let mut rows: Vec<MemoryRecord> = response.json().await?;
        rows.pop()
            .ok_or_else(|| Error::storage(format!("Insert into {} returned no row", self.table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn match_params_skip_absent_filters() {
        let request = SimilarityRequest {
            embedding: vec![0.1, 0.2],
            threshold: 0.7,
            limit: 5,
            filter: SearchFilter::for_agent("refactor_agent"),
        };

        let json = serde_json::to_value(match_params(&request)).unwrap();
        assert_eq!(json["match_count"], 5);
        assert_eq!(json["filter_agent_id"], "refactor_agent");
        assert!(json.get("filter_task_types").is_none());
        assert!(json.get("filter_tags").is_none());
        assert!(json.get("filter_after_date").is_none());
        assert_eq!(json["query_embedding"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn query_params_encode_every_filter() {
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let filter = SearchFilter::for_agent("a")
            .with_task_types(vec!["refactor".into(), "code review".into()])
            .with_tags(vec!["db".into()])
            .after(after);
        let query = RecordQuery::new(filter, 10)
            .with_text("slow auth query")
            .newest_first();

        let params = query_params(&query);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("select"), Some(SELECT_COLUMNS));
        assert_eq!(get("agent_id"), Some("eq.a"));
        assert_eq!(get("task_type"), Some("in.(\"refactor\",\"code review\")"));
        assert_eq!(get("tags"), Some("ov.{\"db\"}"));
        assert_eq!(get("task_timestamp"), Some("gte.2025-03-01T00:00:00.000000Z"));
        assert_eq!(get("context_content"), Some("plfts.slow auth query"));
        assert_eq!(get("order"), Some("task_timestamp.desc"));
        assert_eq!(get("limit"), Some("10"));
    }

    #[test]
    fn requires_supabase_backend() {
        let result = SupabaseStore::new(&Config::default(), reqwest::Client::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn function_sql_follows_config() {
        let config = Config {
            table: "agent_notes".into(),
            match_function: "match_agent_notes".into(),
            embedding_dimensions: 1536,
            ..Config::default()
        };

        let sql = match_function_sql(&config);
        assert!(sql.contains("create or replace function match_agent_notes("));
        assert!(sql.contains("query_embedding vector(1536)"));
        assert!(sql.contains("alter table agent_notes"));
        assert!(sql.contains("on agent_notes (content_hash)"));
        assert!(sql.contains("from agent_notes ch"));
        assert!(!sql.contains("context_history"));
    }

    #[test]
    fn function_sql_returns_timestamp_column() {
        let sql = match_function_sql(&Config::default());
        assert!(sql.contains("create or replace function match_memories("));
        assert!(sql.contains("query_embedding vector(384)"));
        assert!(sql.contains("from context_history ch"));
        assert!(sql.contains("as \"timestamp\""));
    }
}
