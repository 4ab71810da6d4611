//! Agent Memory hook binary
//!
//! Reads a JSON payload on stdin and writes JSON on stdout. Logs go to
//! stderr so hook output stays clean.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent_memory::{
    config::{Config, EmbeddingBackend, StoreBackend},
    embedding::{EmbeddingProvider, FastEmbedProvider, OpenAiEmbedder},
    generation::OpenAiChat,
    hook::{self, HookDefaults, HookResponse, EXIT_FAILURE},
    retrieval::RenderOptions,
    storage::{match_function_sql, MemoryStore, SqliteStore, SupabaseStore},
    ContextAssembler, MemoryWriter, QueryRefiner, RecencyFetcher, SimilaritySearcher,
};

#[derive(Parser)]
#[command(name = "agent-memory")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Contextual memory retrieval for AI agents", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve memories relevant to the prompt on stdin
    Read {
        /// Emit `{context, memories}` instead of the bare memory list
        #[arg(long)]
        context: bool,

        /// Include raw_data in the rendered context
        #[arg(long)]
        raw_data: bool,
    },

    /// Store the memory described on stdin
    Write,

    /// Print the SQL that installs the similarity function
    Schema,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "agent_memory=debug" } else { "agent_memory=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn build_store(config: &Config, http_client: &reqwest::Client) -> Result<Arc<dyn MemoryStore>> {
    let store: Arc<dyn MemoryStore> = match &config.store {
        StoreBackend::Supabase { .. } => Arc::new(SupabaseStore::new(config, http_client.clone())?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::new(config)?),
    };
    Ok(store)
}

fn build_embedder(
    config: &Config,
    http_client: &reqwest::Client,
) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match config.embedder {
        EmbeddingBackend::OpenAi => Arc::new(OpenAiEmbedder::new(config, http_client.clone())?),
        EmbeddingBackend::Local => Arc::new(FastEmbedProvider::new(config)?),
    };
    Ok(embedder)
}

fn build_assembler(config: &Config, include_raw_data: bool) -> Result<ContextAssembler> {
    let http_client = build_http_client(config)?;
    let store = build_store(config, &http_client)?;
    let embedder = build_embedder(config, &http_client)?;

    let refiner = if config.refine_query {
        let chat = OpenAiChat::new(config, http_client.clone())?;
        QueryRefiner::new(Arc::new(chat), config.refine_max_prompt_tokens)
    } else {
        QueryRefiner::passthrough()
    };
    debug!(
        refine = refiner.refine_enabled(),
        embedding_dimensions = embedder.dimensions(),
        "Built retrieval pipeline"
    );

    Ok(ContextAssembler::new(
        refiner,
        SimilaritySearcher::new(embedder, store.clone()),
        RecencyFetcher::new(store),
        config.match_threshold,
    )
    .with_render_options(RenderOptions { include_raw_data }))
}

fn build_writer(config: &Config) -> Result<MemoryWriter> {
    let http_client = build_http_client(config)?;
    let store = build_store(config, &http_client)?;
    let embedder = build_embedder(config, &http_client)?;
    Ok(MemoryWriter::new(embedder, store))
}

async fn read_stdin() -> std::io::Result<String> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}

async fn run_read(config: &Config, with_context: bool, include_raw_data: bool) -> HookResponse {
    let input = match read_stdin().await {
        Ok(input) => input,
        Err(e) => {
            error!(error = %e, "Failed to read stdin");
            String::new()
        }
    };

    let assembler = match build_assembler(config, include_raw_data) {
        Ok(assembler) => assembler,
        Err(e) => {
            error!(error = %e, "Retrieval unavailable");
            return HookResponse {
                stdout: "[]".to_string(),
                exit_code: hook::EXIT_OK,
            };
        }
    };

    hook::read_hook(&assembler, &HookDefaults::from(config), &input, with_context).await
}

async fn run_write(config: &Config) -> HookResponse {
    let writer = match build_writer(config) {
        Ok(writer) => writer,
        Err(e) => {
            let message = format!("Failed to initialize memory writer: {:#}", e);
            return hook::failure(EXIT_FAILURE, &message);
        }
    };

    let input = match read_stdin().await {
        Ok(input) => input,
        Err(e) => return hook::failure(EXIT_FAILURE, &format!("Failed to read stdin: {}", e)),
    };

    hook::write_hook(&writer, &HookDefaults::from(config), &input).await
}

fn load_config() -> Option<Config> {
    match Config::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("agent-memory: {}", e);
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let response = match cli.command {
        Commands::Schema => {
            let Some(config) = load_config() else {
                return ExitCode::from(EXIT_FAILURE);
            };
            println!("{}", match_function_sql(&config));
            return ExitCode::SUCCESS;
        }
        Commands::Read { context, raw_data } => {
            let Some(config) = load_config() else {
                return ExitCode::from(EXIT_FAILURE);
            };
            run_read(&config, context, raw_data).await
        }
        Commands::Write => {
            let Some(config) = load_config() else {
                return ExitCode::from(EXIT_FAILURE);
            };
            run_write(&config).await
        }
    };

    println!("{}", response.stdout);
    ExitCode::from(response.exit_code)
}
