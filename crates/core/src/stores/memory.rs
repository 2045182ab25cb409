use super::{cosine_similarity, mean_vector, rank_order, validate_chunks};
use crate::error::{IngestError, StoreError};
use crate::models::{
    ChunkFilter, DocumentId, DocumentMetadata, DocumentStatus, DocumentVector, EmbeddedChunk,
    QueryFilters, ScoredChunk,
};
use crate::traits::{DocumentCatalog, VectorStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

/// Process-local store with exact cosine scan. Each document's chunk set is
/// swapped in whole under the write lock, so readers never see a mix.
pub struct InMemoryVectorStore {
    dimensions: usize,
    documents: RwLock<BTreeMap<DocumentId, Vec<EmbeddedChunk>>>,
}

impl InMemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            documents: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn chunk_count(&self) -> usize {
        self.documents.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert_chunks(
        &self,
        document_id: DocumentId,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<(), StoreError> {
        validate_chunks(document_id, &chunks, self.dimensions)?;

        let mut documents = self.documents.write().await;
        if chunks.is_empty() {
            documents.remove(&document_id);
        } else {
            documents.insert(document_id, chunks);
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.documents.write().await.remove(&document_id);
        Ok(())
    }

    async fn similarity_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let documents = self.documents.read().await;
        if documents.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query_vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                found: query_vector.len(),
            });
        }

        let mut hits = Vec::new();
        for (document_id, chunks) in documents.iter() {
            if !filter.allows(*document_id) {
                continue;
            }
            for record in chunks {
                hits.push(ScoredChunk {
                    chunk: record.chunk.clone(),
                    score: cosine_similarity(query_vector, &record.embedding),
                });
            }
        }

        hits.sort_by(rank_order);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn document_chunks(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<EmbeddedChunk>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn document_vectors(&self) -> Result<Vec<DocumentVector>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter_map(|(document_id, chunks)| {
                mean_vector(chunks.iter().map(|record| record.embedding.as_slice())).map(
                    |vector| DocumentVector {
                        document_id: *document_id,
                        chunk_count: chunks.len(),
                        vector,
                    },
                )
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    metadata: DocumentMetadata,
    status: DocumentStatus,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    documents: RwLock<BTreeMap<DocumentId, CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentCatalog for InMemoryCatalog {
    async fn register(&self, metadata: DocumentMetadata) -> Result<(), StoreError> {
        self.documents
            .write()
            .await
            .entry(metadata.document_id)
            .or_insert(CatalogEntry {
                metadata,
                status: DocumentStatus::Unprocessed,
            });
        Ok(())
    }

    async fn status(&self, document_id: DocumentId) -> Result<Option<DocumentStatus>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .get(&document_id)
            .map(|entry| entry.status))
    }

    async fn begin_processing(&self, document_id: DocumentId) -> Result<(), IngestError> {
        let mut documents = self.documents.write().await;
        let entry = documents.entry(document_id).or_insert_with(|| CatalogEntry {
            metadata: DocumentMetadata::titled(document_id, format!("document {document_id}")),
            status: DocumentStatus::Unprocessed,
        });

        if entry.status.is_in_progress() {
            return Err(IngestError::AlreadyProcessing { document_id });
        }
        entry.status = DocumentStatus::Chunking;
        Ok(())
    }

    async fn begin_deletion(&self, document_id: DocumentId) -> Result<bool, IngestError> {
        let mut documents = self.documents.write().await;
        let Some(entry) = documents.get_mut(&document_id) else {
            return Ok(false);
        };

        if entry.status.is_in_progress() {
            return Err(IngestError::AlreadyProcessing { document_id });
        }
        entry.status = DocumentStatus::Chunking;
        Ok(true)
    }

    async fn set_status(
        &self,
        document_id: DocumentId,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .get_mut(&document_id)
            .ok_or(StoreError::UnknownDocument(document_id))?;
        entry.status = status;
        Ok(())
    }

    async fn metadata(
        &self,
        document_ids: &[DocumentId],
    ) -> Result<HashMap<DocumentId, DocumentMetadata>, StoreError> {
        let documents = self.documents.read().await;
        Ok(document_ids
            .iter()
            .filter_map(|id| {
                documents
                    .get(id)
                    .map(|entry| (*id, entry.metadata.clone()))
            })
            .collect())
    }

    async fn matching_documents(
        &self,
        filters: &QueryFilters,
    ) -> Result<BTreeSet<DocumentId>, StoreError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .filter(|entry| filters.matches(&entry.metadata))
            .map(|entry| entry.metadata.document_id)
            .collect())
    }
}
