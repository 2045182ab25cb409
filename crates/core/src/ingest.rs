use crate::chunking::{chunk_pages, ChunkingConfig};
use crate::embeddings::EmbeddingService;
use crate::error::IngestError;
use crate::extractor::{extract_page_texts, PageText};
use crate::models::{DocumentId, DocumentStatus, EmbeddedChunk, IngestionReport};
use crate::traits::{DocumentCatalog, VectorStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// The write path: extract, chunk, embed, replace the stored chunk set.
///
/// A run claims the document through the catalog status before touching its
/// chunks and releases it as `embedded` or `failed`. A failed run never
/// reaches the store, so the last good chunk set stays searchable.
pub struct IngestionPipeline<S, C> {
    embedder: Arc<EmbeddingService>,
    store: Arc<S>,
    catalog: Arc<C>,
}

impl<S, C> IngestionPipeline<S, C>
where
    S: VectorStore,
    C: DocumentCatalog,
{
    pub fn new(embedder: Arc<EmbeddingService>, store: Arc<S>, catalog: Arc<C>) -> Self {
        Self {
            embedder,
            store,
            catalog,
        }
    }

    pub async fn ingest_path(
        &self,
        document_id: DocumentId,
        path: &Path,
        config: ChunkingConfig,
    ) -> Result<IngestionReport, IngestError> {
        config.validate()?;
        self.catalog.begin_processing(document_id).await?;

        let owned = path.to_path_buf();
        let outcome = async {
            let (pages, checksum) = extract_blocking(owned).await?;
            self.write_chunks(document_id, &pages, config, Some(checksum))
                .await
        }
        .instrument(info_span!("ingest", document_id, source = %path.display()))
        .await;

        self.finish(document_id, outcome).await
    }

    pub async fn ingest_pages(
        &self,
        document_id: DocumentId,
        pages: &[PageText],
        config: ChunkingConfig,
    ) -> Result<IngestionReport, IngestError> {
        config.validate()?;
        self.catalog.begin_processing(document_id).await?;

        let outcome = self
            .write_chunks(document_id, pages, config, None)
            .instrument(info_span!("ingest", document_id))
            .await;

        self.finish(document_id, outcome).await
    }

    /// Drops the document's chunks. The document is claimed like an
    /// ingestion run for the duration, so it refuses while a run holds it
    /// and no run can start until the chunks are gone.
    pub async fn delete_document(&self, document_id: DocumentId) -> Result<(), IngestError> {
        if !self.catalog.begin_deletion(document_id).await? {
            debug!(document_id, "delete of unknown document ignored");
            return Ok(());
        }

        if let Err(error) = self.store.delete_document(document_id).await {
            self.mark_failed(document_id).await;
            return Err(error.into());
        }
        self.catalog
            .set_status(document_id, DocumentStatus::Unprocessed)
            .await?;
        info!(document_id, "document chunks deleted");
        Ok(())
    }

    /// Marks a document left in `chunking` or `embedding` by an interrupted
    /// run as `failed` so it can be ingested again. Returns whether a stale
    /// status was cleared.
    pub async fn release_stale_lock(&self, document_id: DocumentId) -> Result<bool, IngestError> {
        match self.catalog.status(document_id).await? {
            Some(status) if status.is_in_progress() => {
                warn!(document_id, %status, "releasing processing status");
                self.catalog
                    .set_status(document_id, DocumentStatus::Failed)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn write_chunks(
        &self,
        document_id: DocumentId,
        pages: &[PageText],
        config: ChunkingConfig,
        source_checksum: Option<String>,
    ) -> Result<IngestionReport, IngestError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let chunks = chunk_pages(document_id, pages, config)?;
        info!(%run_id, chunk_count = chunks.len(), "document chunked");

        self.catalog
            .set_status(document_id, DocumentStatus::Embedding)
            .await?;
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        let dimensions = vectors.first().map_or(0, Vec::len);

        let records: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
            .collect();
        let chunk_count = records.len();
        self.store.upsert_chunks(document_id, records).await?;

        Ok(IngestionReport {
            run_id,
            document_id,
            page_count: pages.len(),
            chunk_count,
            dimensions,
            source_checksum,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn finish(
        &self,
        document_id: DocumentId,
        outcome: Result<IngestionReport, IngestError>,
    ) -> Result<IngestionReport, IngestError> {
        let outcome = match outcome {
            Ok(report) => self
                .catalog
                .set_status(document_id, DocumentStatus::Embedded)
                .await
                .map(|()| report)
                .map_err(IngestError::from),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(report) => {
                info!(
                    document_id,
                    run_id = %report.run_id,
                    chunk_count = report.chunk_count,
                    "document embedded"
                );
                Ok(report)
            }
            Err(error) => {
                warn!(document_id, %error, "ingestion failed");
                self.mark_failed(document_id).await;
                Err(error)
            }
        }
    }

    async fn mark_failed(&self, document_id: DocumentId) {
        if let Err(status_error) = self
            .catalog
            .set_status(document_id, DocumentStatus::Failed)
            .await
        {
            warn!(document_id, %status_error, "could not mark document failed");
        }
    }
}

async fn extract_blocking(path: PathBuf) -> Result<(Vec<PageText>, String), IngestError> {
    tokio::task::spawn_blocking(move || {
        let pages = extract_page_texts(&path)?;
        let checksum = digest_file(&path)?;
        Ok::<_, IngestError>((pages, checksum))
    })
    .await
    .map_err(|error| IngestError::Io(std::io::Error::other(error)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{
        CharacterNgramEmbedder, EmbeddingConfig, EmbeddingModel, ModelLoader,
    };
    use crate::error::{EmbeddingError, StoreError};
    use crate::models::{DocumentMetadata, QueryFilters};
    use crate::stores::{InMemoryCatalog, InMemoryVectorStore};
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    const DIMENSIONS: usize = 48;

    /// Fails any batch containing the marker text.
    struct PoisonedModel {
        inner: CharacterNgramEmbedder,
    }

    #[async_trait]
    impl EmbeddingModel for PoisonedModel {
        fn dimensions(&self) -> usize {
            self.inner.dimensions
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.iter().any(|text| text.contains("POISON")) {
                return Err(EmbeddingError::Inference("model crashed".to_string()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    struct PoisonedLoader;

    #[async_trait]
    impl ModelLoader for PoisonedLoader {
        fn model_id(&self) -> String {
            "poisoned".to_string()
        }

        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
            Ok(Arc::new(PoisonedModel {
                inner: CharacterNgramEmbedder::new(DIMENSIONS),
            }))
        }
    }

    /// Catalog that lets a test slip a competing run in front of a delete
    /// or lose the final status write of an ingestion.
    #[derive(Default)]
    struct InterferingCatalog {
        inner: InMemoryCatalog,
        claim_before_delete: AtomicBool,
        fail_embedded: AtomicBool,
    }

    #[async_trait]
    impl DocumentCatalog for InterferingCatalog {
        async fn register(&self, metadata: DocumentMetadata) -> Result<(), StoreError> {
            self.inner.register(metadata).await
        }

        async fn status(
            &self,
            document_id: DocumentId,
        ) -> Result<Option<DocumentStatus>, StoreError> {
            self.inner.status(document_id).await
        }

        async fn begin_processing(&self, document_id: DocumentId) -> Result<(), IngestError> {
            self.inner.begin_processing(document_id).await
        }

        async fn begin_deletion(&self, document_id: DocumentId) -> Result<bool, IngestError> {
            if self.claim_before_delete.load(Ordering::SeqCst) {
                self.inner.begin_processing(document_id).await?;
            }
            self.inner.begin_deletion(document_id).await
        }

        async fn set_status(
            &self,
            document_id: DocumentId,
            status: DocumentStatus,
        ) -> Result<(), StoreError> {
            if status == DocumentStatus::Embedded && self.fail_embedded.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidRecord("catalog unavailable".to_string()));
            }
            self.inner.set_status(document_id, status).await
        }

        async fn metadata(
            &self,
            document_ids: &[DocumentId],
        ) -> Result<HashMap<DocumentId, DocumentMetadata>, StoreError> {
            self.inner.metadata(document_ids).await
        }

        async fn matching_documents(
            &self,
            filters: &QueryFilters,
        ) -> Result<BTreeSet<DocumentId>, StoreError> {
            self.inner.matching_documents(filters).await
        }
    }

    fn interfering_pipeline() -> (
        IngestionPipeline<InMemoryVectorStore, InterferingCatalog>,
        Arc<InMemoryVectorStore>,
        Arc<InterferingCatalog>,
    ) {
        let store = Arc::new(InMemoryVectorStore::new(DIMENSIONS));
        let catalog = Arc::new(InterferingCatalog::default());
        let pipeline = IngestionPipeline::new(
            Arc::new(EmbeddingService::new(EmbeddingConfig::Ngram {
                dimensions: DIMENSIONS,
            })),
            store.clone(),
            catalog.clone(),
        );
        (pipeline, store, catalog)
    }

    type Pipeline = IngestionPipeline<InMemoryVectorStore, InMemoryCatalog>;

    fn pipeline_with(
        loader: impl ModelLoader + 'static,
    ) -> (Pipeline, Arc<InMemoryVectorStore>, Arc<InMemoryCatalog>) {
        let store = Arc::new(InMemoryVectorStore::new(DIMENSIONS));
        let catalog = Arc::new(InMemoryCatalog::new());
        let pipeline = IngestionPipeline::new(
            Arc::new(EmbeddingService::new(loader)),
            store.clone(),
            catalog.clone(),
        );
        (pipeline, store, catalog)
    }

    fn pipeline() -> (Pipeline, Arc<InMemoryVectorStore>, Arc<InMemoryCatalog>) {
        pipeline_with(EmbeddingConfig::Ngram {
            dimensions: DIMENSIONS,
        })
    }

    fn pages(text: &str) -> Vec<PageText> {
        vec![
            PageText {
                number: 1,
                text: text.to_string(),
            },
            PageText {
                number: 2,
                text: String::new(),
            },
            PageText {
                number: 3,
                text: text.to_uppercase(),
            },
        ]
    }

    #[tokio::test]
    async fn ingestion_stores_contiguous_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let (pipeline, store, catalog) = pipeline();
        let text = "Cells divide by mitosis. ".repeat(20);

        let report = pipeline
            .ingest_pages(11, &pages(&text), ChunkingConfig::new(100, 10)?)
            .await?;

        let stored = store.document_chunks(11).await?;
        assert_eq!(stored.len(), report.chunk_count);
        assert_eq!(report.dimensions, DIMENSIONS);
        for (position, record) in stored.iter().enumerate() {
            assert_eq!(record.chunk.chunk_index as usize, position);
            assert_eq!(record.embedding.len(), DIMENSIONS);
        }
        assert_eq!(catalog.status(11).await?, Some(DocumentStatus::Embedded));
        Ok(())
    }

    #[tokio::test]
    async fn reingestion_replaces_rather_than_appends() -> Result<(), Box<dyn std::error::Error>>
    {
        let (pipeline, store, _catalog) = pipeline();
        let text = "x".repeat(1200);
        let single_page = vec![PageText {
            number: 1,
            text: text.clone(),
        }];

        pipeline
            .ingest_pages(5, &single_page, ChunkingConfig::new(100, 0)?)
            .await?;
        assert_eq!(store.document_chunks(5).await?.len(), 12);

        pipeline
            .ingest_pages(5, &single_page, ChunkingConfig::new(500, 50)?)
            .await?;
        let stored = store.document_chunks(5).await?;
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].chunk.char_start, 900);
        assert_eq!(stored[2].chunk.char_end, 1200);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_any_work() {
        let (pipeline, store, catalog) = pipeline();
        let config = ChunkingConfig {
            chunk_size: 50,
            overlap: 50,
        };

        let result = pipeline.ingest_pages(1, &pages("text"), config).await;
        assert!(matches!(result, Err(IngestError::Configuration(_))));
        assert_eq!(catalog.status(1).await.unwrap(), None);
        assert_eq!(store.chunk_count().await, 0);
    }

    #[tokio::test]
    async fn embedding_failure_marks_failed_and_keeps_old_chunks() {
        let (pipeline, store, catalog) = pipeline_with(PoisonedLoader);
        let config = ChunkingConfig::new(40, 5).unwrap();

        pipeline
            .ingest_pages(2, &pages("Thermodynamics lecture notes, week one."), config)
            .await
            .unwrap();
        let before = store.document_chunks(2).await.unwrap();
        assert!(!before.is_empty());

        let result = pipeline
            .ingest_pages(2, &pages("POISON in the second revision"), config)
            .await;
        assert!(matches!(result, Err(IngestError::Embedding(_))));
        assert_eq!(
            catalog.status(2).await.unwrap(),
            Some(DocumentStatus::Failed)
        );
        assert_eq!(store.document_chunks(2).await.unwrap(), before);
    }

    #[tokio::test]
    async fn concurrent_run_on_same_document_is_refused() {
        let (pipeline, store, catalog) = pipeline();
        catalog.begin_processing(8).await.unwrap();

        let result = pipeline
            .ingest_pages(8, &pages("Graph theory"), ChunkingConfig::default())
            .await;
        assert!(matches!(
            result,
            Err(IngestError::AlreadyProcessing { document_id: 8 })
        ));
        assert_eq!(
            catalog.status(8).await.unwrap(),
            Some(DocumentStatus::Chunking)
        );
        assert_eq!(store.chunk_count().await, 0);
    }

    #[tokio::test]
    async fn text_files_are_ingested_with_checksum() -> Result<(), Box<dyn std::error::Error>> {
        let (pipeline, store, _catalog) = pipeline();
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "Page one text.\u{000c}Page two text.")?;

        let report = pipeline
            .ingest_path(3, &path, ChunkingConfig::new(10, 2)?)
            .await?;

        assert_eq!(report.page_count, 2);
        assert_eq!(report.source_checksum, Some(digest_file(&path)?));
        let stored = store.document_chunks(3).await?;
        assert_eq!(stored.first().map(|r| r.chunk.page_number), Some(1));
        assert_eq!(stored.last().map(|r| r.chunk.page_number), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_marks_document_failed() {
        let (pipeline, _store, catalog) = pipeline();
        let dir = tempdir().unwrap();

        let result = pipeline
            .ingest_path(4, &dir.path().join("absent.txt"), ChunkingConfig::default())
            .await;
        assert!(matches!(result, Err(IngestError::Io(_))));
        assert_eq!(
            catalog.status(4).await.unwrap(),
            Some(DocumentStatus::Failed)
        );
    }

    #[tokio::test]
    async fn delete_removes_chunks_and_is_idempotent() {
        let (pipeline, store, catalog) = pipeline();
        pipeline
            .ingest_pages(6, &pages("Set theory axioms"), ChunkingConfig::default())
            .await
            .unwrap();

        pipeline.delete_document(6).await.unwrap();
        pipeline.delete_document(6).await.unwrap();
        pipeline.delete_document(99).await.unwrap();

        assert_eq!(store.chunk_count().await, 0);
        assert_eq!(
            catalog.status(6).await.unwrap(),
            Some(DocumentStatus::Unprocessed)
        );
    }

    #[tokio::test]
    async fn delete_refuses_a_document_claimed_by_a_concurrent_run() {
        let (pipeline, store, catalog) = interfering_pipeline();
        pipeline
            .ingest_pages(1, &pages("Krebs cycle summary"), ChunkingConfig::default())
            .await
            .unwrap();
        let before = store.document_chunks(1).await.unwrap();

        catalog.claim_before_delete.store(true, Ordering::SeqCst);
        let result = pipeline.delete_document(1).await;

        assert!(matches!(
            result,
            Err(IngestError::AlreadyProcessing { document_id: 1 })
        ));
        assert_eq!(
            catalog.status(1).await.unwrap(),
            Some(DocumentStatus::Chunking)
        );
        assert!(catalog.begin_processing(1).await.is_err());
        assert_eq!(store.document_chunks(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn lost_final_status_write_leaves_document_retryable() {
        let (pipeline, store, catalog) = interfering_pipeline();
        catalog.fail_embedded.store(true, Ordering::SeqCst);

        let result = pipeline
            .ingest_pages(2, &pages("Plate tectonics"), ChunkingConfig::default())
            .await;
        assert!(matches!(result, Err(IngestError::Store(_))));
        assert_eq!(
            catalog.status(2).await.unwrap(),
            Some(DocumentStatus::Failed)
        );

        catalog.fail_embedded.store(false, Ordering::SeqCst);
        pipeline
            .ingest_pages(2, &pages("Plate tectonics"), ChunkingConfig::default())
            .await
            .unwrap();
        assert!(!store.document_chunks(2).await.unwrap().is_empty());
        assert_eq!(
            catalog.status(2).await.unwrap(),
            Some(DocumentStatus::Embedded)
        );
    }

    #[tokio::test]
    async fn abandoned_run_status_can_be_released() {
        let (pipeline, _store, catalog) = pipeline();
        catalog.begin_processing(7).await.unwrap();
        catalog
            .set_status(7, DocumentStatus::Embedding)
            .await
            .unwrap();

        assert!(pipeline
            .ingest_pages(7, &pages("Sorting networks"), ChunkingConfig::default())
            .await
            .is_err());
        assert!(pipeline.release_stale_lock(7).await.unwrap());
        assert_eq!(
            catalog.status(7).await.unwrap(),
            Some(DocumentStatus::Failed)
        );

        pipeline
            .ingest_pages(7, &pages("Sorting networks"), ChunkingConfig::default())
            .await
            .unwrap();
        assert!(!pipeline.release_stale_lock(7).await.unwrap());
        assert!(!pipeline.release_stale_lock(70).await.unwrap());
    }
}
