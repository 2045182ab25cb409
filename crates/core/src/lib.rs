pub mod chunking;
pub mod duplicates;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod search;
pub mod stores;
pub mod traits;

pub use chunking::{
    chunk_pages, clean_text, ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE,
};
pub use duplicates::{candidate_pairs, DuplicateDetector};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingConfig, EmbeddingModel, EmbeddingService, ModelLoader,
    OpenAiConfig, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IngestError, SearchError, StoreError};
pub use extractor::{
    extract_page_texts, LopdfExtractor, PageText, PlainTextExtractor, TextExtractor,
};
pub use ingest::{digest_file, IngestionPipeline};
pub use models::{
    ChunkFilter, DocumentId, DocumentMetadata, DocumentStatus, DocumentVector,
    DuplicateCandidatePair, EmbeddedChunk, IngestionReport, QueryFilters, ScoredChunk,
    SearchOptions, SearchQuery, SimilarityResult, TextChunk,
};
pub use search::{SearchResponse, SemanticSearchEngine};
pub use stores::{InMemoryCatalog, InMemoryVectorStore, PgVectorStore};
pub use traits::{DocumentCatalog, VectorStore};
