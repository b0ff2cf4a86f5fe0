//! The `docqa` binary.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create the database schema (idempotent) |
//! | `docqa watch` | Run the ingestion pipeline over the drop directory |
//! | `docqa serve` | Start the HTTP API |
//! | `docqa ask <prompt>` | One-shot query from the terminal |
//!
//! `watch` and `serve` are long-running and stop on Ctrl-C. They are
//! meant to run as separate processes sharing the database and the
//! drop/archive/bad directories.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;

use docqa::chunker::Chunker;
use docqa::config::Config;
use docqa::convert::PdfConverter;
use docqa::embedding::OllamaEmbedder;
use docqa::llm::LlmClient;
use docqa::pipeline::{IngestPipeline, PipelineHandle, DRAIN_DEADLINE};
use docqa::retrieval::{RetrievalOptions, RetrievalService};
use docqa::server::{self, AppState};
use docqa::store::PostgresStore;
use docqa::vision::LlavaExtractor;
use docqa::watcher::DropWatcher;
use docqa::{db, logging, migrate};

/// Retrieval-augmented question answering over a watched PDF corpus.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the pgvector extension, all tables and indices, and seeds
    /// the LLM config row. Safe to run multiple times.
    Init,

    /// Watch the drop directory and ingest stable files.
    ///
    /// Runs the watcher → parser → persister pipeline until Ctrl-C.
    /// Ingested files move to `ARCHIVE_DIR/<date>/`; stale re-uploads
    /// move to `BAD_DIR/<date>/`.
    Watch,

    /// Start the HTTP API.
    Serve,

    /// Answer a single prompt from the terminal.
    Ask {
        /// The question to answer.
        prompt: String,

        /// Use the local generate LLM instead of the hosted chat one.
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.database_url).await?;
            migrate::run_migrations(&pool, config.embedding_dimension).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Watch => {
            config.ensure_directories()?;
            let pool = db::connect(&config.database_url).await?;
            migrate::run_migrations(&pool, config.embedding_dimension).await?;
            let store = Arc::new(PostgresStore::new(pool));

            let (handle, shutdown_tx) = spawn_pipeline(&config, store.clone());
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown signal received, draining pipeline");

            shutdown_tx.send(true).ok();
            handle.drain(DRAIN_DEADLINE).await;
            store.close().await;
            tracing::info!("ingest service stopped");
        }
        Commands::Serve => {
            let pool = db::connect(&config.database_url).await?;
            migrate::run_migrations(&pool, config.embedding_dimension).await?;
            let store = Arc::new(PostgresStore::new(pool));

            let state = AppState {
                retrieval: Arc::new(retrieval_service(&config, store.clone())),
                store: store.clone(),
                drop_dir: config.drop_dir.clone(),
            };
            config.ensure_directories()?;
            server::run(&config.server_addr, state).await?;
            store.close().await;
        }
        Commands::Ask { prompt, local } => {
            let pool = db::connect(&config.database_url).await?;
            let store = Arc::new(PostgresStore::new(pool));
            let service = retrieval_service(&config, store.clone());

            let answer = service.answer(&prompt, local).await?;
            println!("{}", answer.answer);
            if !answer.sources.is_empty() {
                println!();
                println!("Sources (confidence {:.2}):", answer.confidence);
                for source in &answer.sources {
                    println!("  [{}] {} (chunk {})", source.doc_id, source.title, source.index);
                }
            }
            store.close().await;
        }
    }

    Ok(())
}

fn retrieval_service(config: &Config, store: Arc<PostgresStore>) -> RetrievalService {
    let embedder = Arc::new(OllamaEmbedder::new(
        config.embedding_url.clone(),
        config.embedding_model.clone(),
        config.embedding_dimension,
    ));
    RetrievalService::new(
        store,
        embedder,
        LlmClient::new(config.llm_api_key.clone()),
        RetrievalOptions {
            top_k: config.search_top_k,
            min_distance: config.search_min_distance,
            overlap: config.chunk_overlap,
            context_budget: config.context_budget,
        },
    )
}

fn spawn_pipeline(
    config: &Config,
    store: Arc<PostgresStore>,
) -> (PipelineHandle, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let embedder = Arc::new(OllamaEmbedder::new(
        config.embedding_url.clone(),
        config.embedding_model.clone(),
        config.embedding_dimension,
    ));
    let vision = Arc::new(LlavaExtractor::new(
        config.vision_url.clone(),
        config.vision_model.clone(),
    ));

    let pipeline = IngestPipeline {
        store,
        watcher: Arc::new(DropWatcher::new(
            config.drop_dir.clone(),
            config.monitoring_time,
        )),
        converter: Arc::new(PdfConverter::new(
            config.converter_url.clone(),
            config.pdf_crop_top_pt,
            config.pdf_crop_bottom_pt,
        )),
        chunker: Arc::new(Chunker::new(
            embedder,
            vision,
            config.chunk_size,
            config.chunk_overlap,
        )),
        archive_dir: config.archive_dir.clone(),
        bad_dir: config.bad_dir.clone(),
    };

    (pipeline.spawn(shutdown_rx), shutdown_tx)
}
