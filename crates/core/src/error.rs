use crate::models::DocumentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding model failed to load: {0}")]
    ModelLoad(String),

    #[error("embedding inference failed: {0}")]
    Inference(String),

    #[error("model returned {found} embeddings for {expected} inputs")]
    CountMismatch { expected: usize, found: usize },

    #[error("model returned a {found}-dimensional vector, expected {expected}")]
    InconsistentDimensions { expected: usize, found: usize },

    #[error("model returned a degenerate vector for input {index}")]
    Degenerate { index: usize },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored vectors are {expected}-dimensional but the query vector has {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("invalid chunk record: {0}")]
    InvalidRecord(String),

    #[error("unknown document {0}")]
    UnknownDocument(DocumentId),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("document {document_id} is already being processed")]
    AlreadyProcessing { document_id: DocumentId },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("similarity threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
