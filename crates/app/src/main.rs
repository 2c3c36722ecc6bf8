use chrono::Utc;
use clap::{Parser, Subcommand};
use notebook_rag_core::ingest::read_document;
use notebook_rag_core::{
    read_documents_best_effort, ChatCompletionsGenerator, Embedder, HttpEmbeddingLoader,
    LazyEmbedder, NgramModel, NotebookCoordinator, RagConfig, SqliteBackend,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DATABASE_FILE: &str = "notebook.db";

#[derive(Parser)]
#[command(name = "notebook-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the notebook database.
    #[arg(long, env = "NOTEBOOK_RAG_DATA_DIR", default_value = ".notebook-rag")]
    data_dir: PathBuf,

    /// JSON file overriding retrieval settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// OpenAI-compatible embeddings base URL. The local n-gram model is used when absent.
    #[arg(long)]
    embedding_url: Option<String>,

    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// OpenAI-compatible chat-completions base URL.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    generation_url: String,

    #[arg(long, default_value = "gpt-4o-mini")]
    generation_model: String,

    #[arg(long, env = "NOTEBOOK_RAG_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Index every .txt/.md document under a folder.
    Ingest {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Index a single document.
    Add {
        #[arg(long)]
        file: PathBuf,
        /// Display name, defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a source and its chunks.
    Remove {
        #[arg(long)]
        source_id: String,
    },
    /// List known sources and their status.
    Sources,
    /// Print the passages closest to a query.
    Search {
        #[arg(long)]
        query: String,
        /// Restrict to these sources; all indexed sources when omitted.
        #[arg(long = "source-id")]
        source_ids: Vec<String>,
        #[arg(long, default_value = "5")]
        top_k: usize,
        #[arg(long, default_value = "0.3")]
        min_score: f32,
    },
    /// Answer a question from the indexed sources with citations.
    Ask {
        #[arg(long)]
        query: String,
        #[arg(long = "source-id")]
        source_ids: Vec<String>,
    },
    /// Suggest questions about the indexed sources.
    Suggest {
        #[arg(long = "source-id")]
        source_ids: Vec<String>,
        #[arg(long, default_value = "3")]
        count: usize,
    },
    /// Print index statistics.
    Stats,
    /// Delete every source and chunk.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RagConfig::from_json_file(path)?,
        None => RagConfig::default(),
    };

    let embedder: Arc<dyn Embedder> = match &cli.embedding_url {
        Some(url) => Arc::new(
            LazyEmbedder::new(HttpEmbeddingLoader {
                base_url: url.clone(),
                model: cli.embedding_model.clone(),
                api_key: cli.api_key.clone(),
            })
            .with_batch_size(config.embedding_batch_size),
        ),
        None => Arc::new(
            LazyEmbedder::new(NgramModel::default()).with_batch_size(config.embedding_batch_size),
        ),
    };
    let generator = ChatCompletionsGenerator::new(
        &cli.generation_url,
        cli.generation_model.clone(),
        cli.api_key.clone(),
    )?;
    if !generator.is_configured() {
        warn!("no API key set, ask and suggest will fail");
    }

    let backend = Arc::new(SqliteBackend::open(cli.data_dir.join(DATABASE_FILE)).await?);
    let coordinator = NotebookCoordinator::new(backend, embedder, Arc::new(generator), config);
    coordinator.initialize().await;
    info!(
        version = app_version,
        data_dir = %cli.data_dir.display(),
        started_at = %Utc::now().to_rfc3339(),
        "notebook-rag boot"
    );

    match cli.command {
        Command::Ingest { folder } => {
            let report = read_documents_best_effort(&folder)?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }

            let mut indexed = 0usize;
            for document in report.documents {
                match coordinator
                    .index_source(&document.source_id, &document.source_name, &document.text)
                    .await
                {
                    Ok(record) => {
                        indexed += 1;
                        println!(
                            "{} {} chunks={}",
                            record.source_id, record.source_name, record.chunk_count
                        );
                    }
                    Err(error) => {
                        warn!(path = %document.path.display(), error = %error, "indexing failed");
                    }
                }
            }

            println!(
                "{indexed} sources indexed, {} skipped at {}",
                report.skipped_files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Add { file, name } => {
            let document = read_document(&file)?;
            let source_name = name.unwrap_or(document.source_name);
            let record = coordinator
                .index_source(&document.source_id, &source_name, &document.text)
                .await?;
            println!(
                "{} {} chunks={}",
                record.source_id, record.source_name, record.chunk_count
            );
        }
        Command::Remove { source_id } => {
            let removed = coordinator.remove_source(&source_id).await;
            println!("removed {removed} chunks of {source_id}");
        }
        Command::Sources => {
            for record in coordinator.sources() {
                println!(
                    "{} {} status={:?} chunks={} updated_at={}",
                    record.source_id,
                    record.source_name,
                    record.status,
                    record.chunk_count,
                    record.updated_at.to_rfc3339()
                );
            }
        }
        Command::Search {
            query,
            source_ids,
            top_k,
            min_score,
        } => {
            let enabled = enabled_sources(&coordinator, source_ids);
            let results = coordinator
                .search(&query, &enabled, top_k, min_score)
                .await?;

            println!("query: {query}");
            for result in results {
                println!(
                    "score={:.4} chunk={} source={}",
                    result.score, result.chunk.id, result.chunk.source_name
                );
                println!("  {}", result.chunk.content);
            }
        }
        Command::Ask { query, source_ids } => {
            let enabled = enabled_sources(&coordinator, source_ids);
            let answer = coordinator.ask_question(&query, &enabled, &[]).await?;

            println!("{}", answer.answer_text);
            if !answer.grounded {
                return Ok(());
            }

            println!();
            let referenced = answer.referenced_indices();
            for citation in &answer.citations {
                let marker = if referenced.contains(&citation.index) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker}[Source {}] {} ({})",
                    citation.index, citation.source_name, citation.chunk_id
                );
            }
        }
        Command::Suggest { source_ids, count } => {
            let enabled = enabled_sources(&coordinator, source_ids);
            for question in coordinator.suggest_questions(&enabled, count).await? {
                println!("{question}");
            }
        }
        Command::Stats => {
            let stats = coordinator.index_stats();
            println!(
                "chunks={} sources={} average_chunks_per_source={:.2}",
                stats.total_chunks, stats.total_sources, stats.average_chunks_per_source
            );
        }
        Command::Clear => {
            coordinator.clear().await;
            println!("cleared {}", cli.data_dir.display());
        }
    }

    Ok(())
}

fn enabled_sources(coordinator: &NotebookCoordinator, source_ids: Vec<String>) -> HashSet<String> {
    if source_ids.is_empty() {
        coordinator.indexed_source_ids()
    } else {
        source_ids.into_iter().collect()
    }
}
