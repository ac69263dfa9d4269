use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use groundrank::config::Config;
use groundrank::embedding::EmbeddingPipeline;
use groundrank::feedback::store::open_store;
use groundrank::feedback::{filter_recommendations, Feedback, FeedbackManager, RecommendationSet};
use groundrank::index::{build_or_load, IndexOptions};
use groundrank::ingest::{collect_chunks, JsonChunkSource};
use groundrank::logging;
use groundrank::service::{build_embedding_pipeline, RetrievalRequest, RetrievalService};

#[derive(Parser)]
#[command(name = "groundrank", version, about = "Hybrid retrieval, reranking and feedback-adaptive filtering")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "groundrank.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Corpus index management
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Run a retrieval against the persisted index
    Search {
        /// One or more phrasings of the query; the first one drives reranking
        #[arg(required = true)]
        queries: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        top_n: Option<usize>,
        /// Apply this session's feedback to the boosts
        #[arg(long)]
        session: Option<String>,
        /// Return fused retrieval order without the cross-encoder pass
        #[arg(long)]
        no_rerank: bool,
    },
    /// Per-session feedback (use the file or sqlite backend to keep it across runs)
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },
    /// Filter a recommendation set (JSON file) with a session's feedback
    Filter {
        #[arg(long)]
        session: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Collect chunks and load the matching index, rebuilding it when allowed
    Build {
        /// Directory of *.json / *.jsonl chunk files (defaults to ingestion.chunks_dir)
        #[arg(long)]
        chunks_dir: Option<PathBuf>,
        /// Permit regeneration even when index.read_only is set
        #[arg(long)]
        allow_rebuild: bool,
    },
    /// Show what the persisted index contains
    Status,
}

#[derive(Subcommand)]
enum FeedbackAction {
    /// Record one piece of feedback
    Submit {
        #[arg(long)]
        session: String,
        /// positive, negative, correction, preference or block
        #[arg(long = "type")]
        feedback_type: String,
        /// Payload as JSON, e.g. '{"blocked_content": {"code": "97110"}}'
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long)]
        recommendation: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Print the session's feedback state
    Show {
        #[arg(long)]
        session: String,
    },
    /// Delete everything recorded for the session
    Clear {
        #[arg(long)]
        session: String,
    },
}

async fn open_feedback(config: &Config) -> Result<FeedbackManager> {
    Ok(FeedbackManager::new(open_store(&config.feedback).await?))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration
    let config = Config::load_from(&cli.config).unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        Config::default()
    });

    // 3. Initialize logging before any other output; stdout carries results only
    logging::init_logging(&config);

    match cli.command {
        Commands::Index { action: IndexAction::Build { chunks_dir, allow_rebuild } } => {
            let dir = chunks_dir.unwrap_or_else(|| PathBuf::from(&config.ingestion.chunks_dir));
            let source = JsonChunkSource::new(&dir);
            let report = collect_chunks(
                &source,
                Duration::from_secs(config.ingestion.unit_timeout_secs),
            )
            .await
            .with_context(|| format!("Failed to collect chunks from {}", dir.display()))?;

            for (unit, reason) in &report.skipped {
                eprintln!("skipped {}: {}", unit, reason);
            }

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("embedding [{bar:30}] {pos}/{len} batches [{elapsed_precise} / {eta_precise}]")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let pipeline = build_embedding_pipeline(&config.embedding).await?.with_progress(pb);

            let options = IndexOptions {
                dir: PathBuf::from(&config.index.dir),
                read_only: config.index.read_only && !allow_rebuild,
            };
            let index = build_or_load(report.chunks, &options, &pipeline).await?;

            print_json(&serde_json::json!({
                "dir": config.index.dir,
                "content_hash": index.content_hash(),
                "dimension": index.dimension(),
                "skipped_units": report.skipped.len(),
                "duplicate_chunks": report.duplicates,
                "sources": index.sources_info(),
            }))?;
        }

        Commands::Index { action: IndexAction::Status } => {
            // Read-only with no strategies: inspecting the index never embeds anything
            let options = IndexOptions {
                dir: PathBuf::from(&config.index.dir),
                read_only: true,
            };
            let index = build_or_load(Vec::new(), &options, &EmbeddingPipeline::new(Vec::new())).await?;
            print_json(&serde_json::json!({
                "dir": config.index.dir,
                "content_hash": index.content_hash(),
                "dimension": index.dimension(),
                "sources": index.sources_info(),
            }))?;
        }

        Commands::Search { queries, top_k, top_n, session, no_rerank } => {
            let service = RetrievalService::init(config, Vec::new()).await?;
            let request = RetrievalRequest {
                top_k,
                top_n,
                session_id: session,
                rerank: !no_rerank,
                ..RetrievalRequest::new(queries)
            };
            let outcome = service.retrieve(request).await;
            service.shutdown().await?;
            let response = outcome?;

            if response.degraded {
                eprintln!("warning: reranking failed, results are in retrieval order");
            }
            if response.missing_priority_source {
                eprintln!("warning: no results from the prioritized source");
            }
            print_json(&response.results)?;
        }

        Commands::Feedback { action } => {
            let manager = open_feedback(&config).await?;
            let result = match action {
                FeedbackAction::Submit { session, feedback_type, data, recommendation, comment } => {
                    let data: serde_json::Value =
                        serde_json::from_str(&data).context("--data must be valid JSON")?;
                    let feedback = Feedback::from_parts(&feedback_type, data)?;
                    let entry = manager.store_feedback(&session, recommendation, feedback, comment).await?;
                    print_json(&entry)
                }
                FeedbackAction::Show { session } => print_json(&manager.get_feedback_state(&session).await?),
                FeedbackAction::Clear { session } => {
                    manager.clear_feedback(&session).await?;
                    println!("Cleared feedback for session '{}'.", session);
                    Ok(())
                }
            };
            manager.close().await;
            result?;
        }

        Commands::Filter { session, file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let set: RecommendationSet = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a recommendation set", file.display()))?;

            let manager = open_feedback(&config).await?;
            let state = manager.get_feedback_state(&session).await;
            manager.close().await;
            print_json(&filter_recommendations(&state?, &set))?;
        }
    }

    Ok(())
}
