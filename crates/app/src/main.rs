use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use study_library_core::{
    ChunkingConfig, DocumentCatalog, DocumentMetadata, DuplicateDetector, EmbeddingConfig,
    EmbeddingService, IngestionPipeline, OpenAiConfig, PgVectorStore, QueryFilters,
    SearchOptions, SearchQuery, SemanticSearchEngine, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "study-library", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Postgres connection string (pgvector required)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Embedding backend
    #[arg(long, env = "EMBEDDING_BACKEND", value_enum, default_value = "ngram")]
    embedding_backend: EmbeddingBackend,

    /// Output dimensionality of the embedding model
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Model name sent to the OpenAI-compatible endpoint
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "all-MiniLM-L6-v2")]
    embedding_model: String,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long, env = "EMBEDDING_ENDPOINT", default_value = "http://localhost:8080/v1")]
    embedding_endpoint: String,

    /// Bearer token for the embedding endpoint
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Texts per embedding request
    #[arg(long, default_value = "64")]
    embedding_batch_size: usize,

    /// Upper bound applied to every search limit
    #[arg(long, default_value = "50")]
    max_search_limit: usize,

    /// Characters of chunk text shown per result
    #[arg(long, default_value = "500")]
    snippet_chars: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbeddingBackend {
    /// Local hashed character trigrams
    Ngram,
    /// OpenAI-compatible HTTP endpoint
    Openai,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and store one document, replacing its previous chunks.
    Ingest {
        /// Library identifier of the document.
        #[arg(long)]
        document_id: i64,
        /// PDF or plain text source file.
        #[arg(long)]
        path: PathBuf,
        /// Display title recorded when the document is new.
        #[arg(long)]
        title: Option<String>,
        /// Characters per chunk.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Characters shared by consecutive chunks.
        #[arg(long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
        overlap: usize,
    },
    /// Remove every chunk of a document.
    Delete {
        #[arg(long)]
        document_id: i64,
    },
    /// Clear the processing status left behind by an interrupted ingest.
    ResetStatus {
        #[arg(long)]
        document_id: i64,
    },
    /// Semantic search over stored chunks.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of results to return.
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Only documents tagged with this topic.
        #[arg(long)]
        topic: Option<String>,
        /// Only documents published in or after this year.
        #[arg(long)]
        year_min: Option<i32>,
        /// Only documents published in or before this year.
        #[arg(long)]
        year_max: Option<i32>,
        /// Print results as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List pairs of documents whose content looks near-identical.
    Duplicates {
        /// Minimum cosine similarity of the document mean vectors.
        #[arg(long, default_value = "0.95")]
        threshold: f32,
        /// Print pairs as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Cli {
    fn embedding_config(&self) -> EmbeddingConfig {
        match self.embedding_backend {
            EmbeddingBackend::Ngram => EmbeddingConfig::Ngram {
                dimensions: self.embedding_dimensions,
            },
            EmbeddingBackend::Openai => EmbeddingConfig::OpenAi(OpenAiConfig {
                api_key: self.embedding_api_key.clone(),
                batch_size: self.embedding_batch_size,
                timeout: Duration::from_secs(60),
                ..OpenAiConfig::new(
                    &self.embedding_endpoint,
                    &self.embedding_model,
                    self.embedding_dimensions,
                )
            }),
        }
    }
}

/// Accepts SQLAlchemy-style driver prefixes as plain Postgres URLs.
fn normalize_database_url(url: &str) -> String {
    for prefix in ["postgresql+asyncpg://", "postgresql+psycopg2://"] {
        if let Some(rest) = url.strip_prefix(prefix) {
            return format!("postgresql://{rest}");
        }
    }
    url.to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "study-library boot"
    );

    let embedder = Arc::new(EmbeddingService::new(cli.embedding_config()));
    let dimensions = embedder
        .warm_up()
        .await
        .with_context(|| format!("loading embedding model {}", embedder.model_id()))?;

    let store = Arc::new(
        PgVectorStore::connect(&normalize_database_url(&cli.database_url), dimensions)
            .await
            .context("connecting to the vector store")?,
    );

    match cli.command {
        Command::Ingest {
            document_id,
            path,
            title,
            chunk_size,
            overlap,
        } => {
            let config = ChunkingConfig::new(chunk_size, overlap)?;
            let title = title.unwrap_or_else(|| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("document {document_id}"))
            });
            store
                .register(DocumentMetadata::titled(document_id, title))
                .await?;

            let pipeline = IngestionPipeline::new(embedder, store.clone(), store);
            let report = pipeline
                .ingest_path(document_id, &path, config)
                .await
                .with_context(|| format!("ingesting {}", path.display()))?;

            println!(
                "{} chunks from {} pages stored for document {} at {}",
                report.chunk_count,
                report.page_count,
                report.document_id,
                report.finished_at.to_rfc3339()
            );
        }
        Command::Delete { document_id } => {
            let pipeline = IngestionPipeline::new(embedder, store.clone(), store);
            pipeline.delete_document(document_id).await?;
            println!("document {document_id} removed from the index");
        }
        Command::ResetStatus { document_id } => {
            let pipeline = IngestionPipeline::new(embedder, store.clone(), store);
            if pipeline.release_stale_lock(document_id).await? {
                println!("document {document_id} released and marked failed");
            } else {
                println!("document {document_id} was not held by a run");
            }
        }
        Command::Search {
            query,
            limit,
            topic,
            year_min,
            year_max,
            json,
        } => {
            let engine = SemanticSearchEngine::new(
                embedder,
                store.clone(),
                store,
                SearchOptions {
                    max_limit: cli.max_search_limit,
                    snippet_chars: cli.snippet_chars,
                },
            );
            let search_query = SearchQuery {
                text: query,
                limit,
                filters: QueryFilters {
                    topic,
                    year_min,
                    year_max,
                    document_ids: None,
                },
            };

            let response = engine.search(&search_query).await?;

            if json {
                let results: Vec<_> = response
                    .results
                    .iter()
                    .map(|result| {
                        json!({
                            "document_id": result.document_id,
                            "page_number": result.page_number,
                            "chunk_text": result.snippet,
                            "score": result.score,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "query": response.query,
                        "results": results,
                    }))?
                );
            } else {
                println!("query: {}", response.query);
                for result in response.results {
                    println!(
                        "score={:.4} document_id={} page={} chunk={}",
                        result.score, result.document_id, result.page_number, result.chunk_index
                    );
                    if let Some(title) = &result.title {
                        println!("  title={title}");
                    }
                    println!("  chunk_text:\n{}", result.snippet);
                }
            }
        }
        Command::Duplicates { threshold, json } => {
            let detector = DuplicateDetector::new(store);
            let pairs = detector.find_duplicates(threshold).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&pairs)?);
            } else if pairs.is_empty() {
                println!("no duplicate candidates at threshold {threshold:.2}");
            } else {
                for pair in pairs {
                    println!(
                        "similarity={:.4} documents={} and {}",
                        pair.similarity, pair.first, pair.second
                    );
                }
            }
        }
    }

    Ok(())
}
