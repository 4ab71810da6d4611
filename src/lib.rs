//! # Agent Memory
//!
//! Contextual memory retrieval for AI agents.
//!
//! ## Architecture
//!
//! A retrieval runs three steps and merges the results:
//! - **Refine**: condense the raw task prompt into a short search query
//! - **Search**: embed the query and rank stored memories by cosine
//!   similarity, falling back to literal text search when the store's
//!   similarity function is unavailable
//! - **Recent**: fetch the agent's newest memories from a time window
//!
//! The merged set is deduplicated by id, capped, ordered newest first and
//! rendered as a plain-text block for prompt injection. Writes go through
//! [`MemoryWriter`], which skips content already stored under the same hash.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_memory::{ContextAssembler, QueryRefiner, RecencyFetcher, SimilaritySearcher};
//!
//! let assembler = ContextAssembler::new(
//!     QueryRefiner::passthrough(),
//!     SimilaritySearcher::new(embedder, store.clone()),
//!     RecencyFetcher::new(store),
//!     config.match_threshold,
//! );
//!
//! let bundle = assembler.assemble(prompt, "claude_code", 5, true, 24).await;
//! println!("{}", bundle.formatted);
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod fakes;
pub mod generation;
pub mod hook;
pub mod ingest;
pub mod memory;
pub mod recency;
pub mod refine;
pub mod retrieval;
pub mod search;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
pub use ingest::{IngestOutcome, MemoryWriter};
pub use memory::{MemoryId, MemoryRecord, NewMemory, ScoredMemory};
pub use recency::RecencyFetcher;
pub use refine::QueryRefiner;
pub use retrieval::{ContextAssembler, ContextBundle, RetrievedMemory};
pub use search::{SearchOutcome, SimilaritySearcher};
pub use storage::MemoryStore;
