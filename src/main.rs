use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use rag_service::cache::MemoryCache;
use rag_service::chunker::{PageText, TextChunker};
use rag_service::config::Settings;
use rag_service::embeddings::OllamaEmbedder;
use rag_service::error::VectorStoreError;
use rag_service::generator::OllamaGenerator;
use rag_service::indexer::{ExtractedDocument, Indexer};
use rag_service::orchestrator::{QueryOrchestrator, QueryRequest, StreamEvent};
use rag_service::progress::LogProgress;
use rag_service::vector_index::VectorIndex;

fn get_log_dir() -> String {
    std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string())
}

fn get_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn setup_logging() -> Result<()> {
    let log_dir = get_log_dir();
    let log_level = get_log_level();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let is_development = std::env::var("DEVELOPMENT").is_ok() || std::env::var("DEV").is_ok();
    let force_console = std::env::var("CONSOLE_LOGS").is_ok();

    if is_development || force_console {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .init();
        tracing::info!("Development mode: logging to console");
    } else {
        std::fs::create_dir_all(&log_dir)?;
        let log_file = format!("{}/rag-service.log", log_dir);
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .json()
            .init();
    }

    tracing::info!("Logging initialized");
    tracing::info!("Log level: {}", log_level);

    Ok(())
}

/// Index a plain-text file as a single one-page document, using the file
/// stem as both id and title.
async fn index_text_file(
    indexer: &Indexer,
    path: &str,
) -> Result<rag_service::indexer::IndexSummary> {
    let text = tokio::fs::read_to_string(path).await?;
    let stem = std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string();

    indexer
        .index_document(ExtractedDocument {
            document_id: stem.clone(),
            title: stem,
            pages: vec![PageText {
                page_number: 1,
                text,
            }],
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    setup_logging()?;

    let settings = Settings::from_env();
    tokio::fs::create_dir_all(&settings.data_dir).await?;
    let index_path = std::path::Path::new(&settings.data_dir).join("index.json");

    tracing::info!("Ollama URL: {}", settings.ollama_url);
    tracing::info!("Embedding model: {}", settings.embedding_model);
    tracing::info!("Generation model: {}", settings.llm_model);
    tracing::info!("Data directory: {}", settings.data_dir);

    let embedder = Arc::new(OllamaEmbedder::new(&settings)?);
    embedder.preflight().await?;

    let generation = Arc::new(OllamaGenerator::new(&settings)?);
    generation.preflight().await?;

    let index = match VectorIndex::load(&index_path, &settings.embedding_model).await {
        Ok(index) => index,
        Err(VectorStoreError::ModelMismatch { expected, found }) => {
            tracing::warn!(
                "Index was built with model '{found}', now configured for '{expected}'. \
                 Starting with an empty index; re-index your documents."
            );
            VectorIndex::new(&settings.embedding_model)
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        "Index ready: {} chunks across {} documents",
        index.len(),
        index.document_count()
    );
    let index = Arc::new(RwLock::new(index));

    let chunker = TextChunker::new(settings.chunk_size, settings.chunk_overlap)?;
    let indexer = Indexer::new(
        chunker,
        embedder.clone(),
        index.clone(),
        Arc::new(LogProgress),
        Some(index_path),
    );

    let cache = Arc::new(MemoryCache::new());
    let orchestrator = Arc::new(QueryOrchestrator::new(
        settings,
        embedder,
        index,
        generation,
        cache,
    ));

    // Interactive loop: one question per line on stdin, streamed answer on
    // stdout. `:index <file>` indexes a plain-text file as one document.
    println!("Ready. Type a question, or `:index <file>` (Ctrl-D to exit).");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        if let Some(path) = question.strip_prefix(":index ") {
            match index_text_file(&indexer, path.trim()).await {
                Ok(summary) => println!(
                    "Indexed '{}': {} chunks stored",
                    summary.document_id, summary.chunks_stored
                ),
                Err(e) => println!("Indexing failed: {e:#}"),
            }
            continue;
        }

        let mut events = orchestrator
            .clone()
            .query_stream(QueryRequest::new(question))
            .await;

        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Metadata {
                    sources,
                    confidence,
                } => {
                    if !sources.is_empty() {
                        let titles: Vec<&str> =
                            sources.iter().map(|s| s.title.as_str()).collect();
                        println!("[sources: {} | confidence: {confidence}]", titles.join(", "));
                    }
                }
                StreamEvent::Chunk { content } => {
                    print!("{content}");
                    std::io::stdout().flush()?;
                }
                StreamEvent::Done => {
                    println!();
                }
                StreamEvent::Error { error, message } => {
                    println!("\n[{error}] {message}");
                }
            }
        }
    }

    Ok(())
}
