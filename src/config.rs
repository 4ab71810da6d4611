//! Configuration for agent-memory

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Where memory records live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Supabase project exposing the `context_history` table over PostgREST
    Supabase { url: String, key: String },

    /// Local SQLite file under the data directory
    Sqlite,
}

/// Which embedding model turns text into vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// OpenAI-compatible `/v1/embeddings` endpoint
    OpenAi,

    /// Local fastembed model, no API key needed
    Local,
}

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for local storage
    pub data_dir: PathBuf,

    /// Storage backend
    pub store: StoreBackend,

    /// Table holding memory records
    pub table: String,

    /// Name of the server-side similarity function
    pub match_function: String,

    /// Embedding backend
    pub embedder: EmbeddingBackend,

    /// API key for OpenAI-compatible endpoints (embeddings and query refinement)
    pub openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible endpoints
    pub openai_base_url: String,

    /// Embedding model name
    pub embedding_model: String,

    /// Embedding dimensions, constant across the whole store
    pub embedding_dimensions: usize,

    /// Whether prompts are condensed into a search query before embedding
    pub refine_query: bool,

    /// Chat model used for query refinement
    pub refine_model: String,

    /// Token budget for the prompt handed to the refiner
    pub refine_max_prompt_tokens: usize,

    /// Agent used when the hook input does not name one
    pub default_agent_id: String,

    /// Maximum number of memories in a context bundle
    pub max_memories: usize,

    /// Minimum similarity score for retrieval (0.0 - 1.0)
    pub match_threshold: f32,

    /// Whether recent memories are merged into the bundle
    pub include_recent: bool,

    /// Recency window in hours
    pub recent_hours: u32,

    /// Per-request timeout for external HTTP calls
    pub http_timeout: Duration,
}

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_OPENAI_EMBEDDING_DIMENSIONS: usize = 1536;
pub const DEFAULT_LOCAL_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_LOCAL_EMBEDDING_DIMENSIONS: usize = 384;

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-memory");

        Self {
            data_dir,
            store: StoreBackend::Sqlite,
            table: "context_history".to_string(),
            match_function: "match_memories".to_string(),
            embedder: EmbeddingBackend::Local,
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            embedding_model: DEFAULT_LOCAL_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: DEFAULT_LOCAL_EMBEDDING_DIMENSIONS,
            refine_query: false,
            refine_model: "gpt-4o-mini".to_string(),
            refine_max_prompt_tokens: 2000,
            default_agent_id: "claude_code".to_string(),
            max_memories: 5,
            match_threshold: 0.7,
            include_recent: true,
            recent_hours: 24,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load configuration from the process environment, reading `.env` first
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "Failed to load .env file");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Missing credentials for the selected backends are reported as
    /// [`Error::Config`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let data_dir = get("MEMORY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let store = match get("MEMORY_STORE").as_deref().unwrap_or("supabase") {
            "supabase" => {
                let url = get("SUPABASE_URL")
                    .ok_or_else(|| Error::config("SUPABASE_URL must be set"))?;
                let key = get("SUPABASE_KEY")
                    .ok_or_else(|| Error::config("SUPABASE_KEY must be set"))?;
                StoreBackend::Supabase {
                    url: url.trim_end_matches('/').to_string(),
                    key,
                }
            }
            "sqlite" => StoreBackend::Sqlite,
            other => return Err(Error::config(format!("Unknown MEMORY_STORE: {}", other))),
        };

        let openai_api_key = get("OPENAI_API_KEY");

        let embedder = match get("MEMORY_EMBEDDER").as_deref().unwrap_or("openai") {
            "openai" => EmbeddingBackend::OpenAi,
            "local" => EmbeddingBackend::Local,
            other => return Err(Error::config(format!("Unknown MEMORY_EMBEDDER: {}", other))),
        };

        if embedder == EmbeddingBackend::OpenAi && openai_api_key.is_none() {
            return Err(Error::config("OPENAI_API_KEY must be set for OpenAI embeddings"));
        }

        let (default_model, default_dimensions) = match embedder {
            EmbeddingBackend::OpenAi => (
                DEFAULT_OPENAI_EMBEDDING_MODEL,
                DEFAULT_OPENAI_EMBEDDING_DIMENSIONS,
            ),
            EmbeddingBackend::Local => (
                DEFAULT_LOCAL_EMBEDDING_MODEL,
                DEFAULT_LOCAL_EMBEDDING_DIMENSIONS,
            ),
        };

        let refine_query = match get("MEMORY_REFINE_QUERY") {
            Some(v) => parse_bool("MEMORY_REFINE_QUERY", &v)?,
            None => openai_api_key.is_some(),
        };
        if refine_query && openai_api_key.is_none() {
            return Err(Error::config("OPENAI_API_KEY must be set for query refinement"));
        }

        let match_threshold: f32 = parse_or(
            "MEMORY_MATCH_THRESHOLD",
            get("MEMORY_MATCH_THRESHOLD"),
            defaults.match_threshold,
        )?;
        if !(0.0..=1.0).contains(&match_threshold) {
            return Err(Error::config(format!(
                "MEMORY_MATCH_THRESHOLD must be within 0.0 and 1.0, got {}",
                match_threshold
            )));
        }

        let table = sql_identifier("MEMORY_TABLE", get("MEMORY_TABLE"), defaults.table)?;
        let match_function = sql_identifier(
            "MEMORY_MATCH_FUNCTION",
            get("MEMORY_MATCH_FUNCTION"),
            defaults.match_function,
        )?;

        let embedding_dimensions = parse_or(
            "MEMORY_EMBEDDING_DIMENSIONS",
            get("MEMORY_EMBEDDING_DIMENSIONS"),
            default_dimensions,
        )?;
        if embedding_dimensions == 0 {
            return Err(Error::config("MEMORY_EMBEDDING_DIMENSIONS must be positive"));
        }

        Ok(Self {
            data_dir,
            store,
            table,
            match_function,
            embedder,
            openai_api_key,
            openai_base_url: get("OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_base_url),
            embedding_model: get("MEMORY_EMBEDDING_MODEL")
                .unwrap_or_else(|| default_model.to_string()),
            embedding_dimensions,
            refine_query,
            refine_model: get("MEMORY_REFINE_MODEL").unwrap_or(defaults.refine_model),
            refine_max_prompt_tokens: defaults.refine_max_prompt_tokens,
            default_agent_id: get("MEMORY_AGENT_ID").unwrap_or(defaults.default_agent_id),
            max_memories: parse_or(
                "MEMORY_MAX_MEMORIES",
                get("MEMORY_MAX_MEMORIES"),
                defaults.max_memories,
            )?,
            match_threshold,
            include_recent: match get("MEMORY_INCLUDE_RECENT") {
                Some(v) => parse_bool("MEMORY_INCLUDE_RECENT", &v)?,
                None => defaults.include_recent,
            },
            recent_hours: parse_or(
                "MEMORY_RECENT_HOURS",
                get("MEMORY_RECENT_HOURS"),
                defaults.recent_hours,
            )?,
            http_timeout: Duration::from_secs(parse_or(
                "MEMORY_HTTP_TIMEOUT_SECS",
                get("MEMORY_HTTP_TIMEOUT_SECS"),
                defaults.http_timeout.as_secs(),
            )?),
        })
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memories.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| Error::config(format!("{} has an invalid value: {}", key, v))),
        None => Ok(default),
    }
}

/// Table and function names end up in generated SQL and request paths
fn sql_identifier(key: &str, value: Option<String>, default: String) -> Result<String> {
    let Some(name) = value else {
        return Ok(default);
    };
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(Error::config(format!(
            "{} must be a lowercase SQL identifier, got {}",
            key, name
        )));
    }
    Ok(name)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{} has an invalid value: {}", key, value))),
    }
}
