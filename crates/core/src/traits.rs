use crate::error::{IngestError, StoreError};
use crate::models::{
    ChunkFilter, DocumentId, DocumentMetadata, DocumentStatus, DocumentVector, EmbeddedChunk,
    QueryFilters, ScoredChunk,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// Chunk persistence with vector similarity lookup.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replaces every chunk of `document_id` in one step. On error the
    /// previously stored set stays visible unchanged.
    async fn upsert_chunks(
        &self,
        document_id: DocumentId,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<(), StoreError>;

    /// Removes every chunk of `document_id`. Missing documents are not an error.
    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError>;

    /// Up to `top_k` chunks by descending cosine similarity, ties broken by
    /// document id then chunk index. `filter` narrows the population first.
    async fn similarity_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    async fn document_chunks(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<EmbeddedChunk>, StoreError>;

    /// Un-normalized mean chunk vector for every document holding chunks.
    async fn document_vectors(&self) -> Result<Vec<DocumentVector>, StoreError>;
}

/// Document status and display metadata. The status doubles as the
/// single-writer lock for ingestion runs.
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    /// Records metadata for a document not seen before; existing entries win.
    async fn register(&self, metadata: DocumentMetadata) -> Result<(), StoreError>;

    async fn status(&self, document_id: DocumentId) -> Result<Option<DocumentStatus>, StoreError>;

    /// Moves the document to `chunking` unless another run holds it.
    async fn begin_processing(&self, document_id: DocumentId) -> Result<(), IngestError>;

    /// Claims a known document for chunk removal, holding it as `chunking`
    /// until the caller releases it. Returns false for unknown documents,
    /// which are left unclaimed.
    async fn begin_deletion(&self, document_id: DocumentId) -> Result<bool, IngestError>;

    async fn set_status(
        &self,
        document_id: DocumentId,
        status: DocumentStatus,
    ) -> Result<(), StoreError>;

    async fn metadata(
        &self,
        document_ids: &[DocumentId],
    ) -> Result<HashMap<DocumentId, DocumentMetadata>, StoreError>;

    /// Document ids satisfying the bibliographic part of `filters`.
    async fn matching_documents(
        &self,
        filters: &QueryFilters,
    ) -> Result<BTreeSet<DocumentId>, StoreError>;
}
