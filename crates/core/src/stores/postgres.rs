//! Postgres + pgvector backend for both the vector store and the catalog.

use super::validate_chunks;
use crate::error::{IngestError, StoreError};
use crate::models::{
    ChunkFilter, DocumentId, DocumentMetadata, DocumentStatus, DocumentVector, EmbeddedChunk,
    QueryFilters, ScoredChunk, TextChunk,
};
use crate::traits::{DocumentCatalog, VectorStore};
use async_trait::async_trait;
use pgvector::Vector;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

const CHUNK_COLUMNS: &str =
    "document_id, chunk_index, page_number, page_end, char_start, char_end, chunk_text";

const INSERT_CHUNK: &str = "INSERT INTO text_chunk \
    (document_id, chunk_index, page_number, page_end, char_start, char_end, chunk_text, embedding) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const SEARCH_CHUNKS: &str = "SELECT document_id, chunk_index, page_number, page_end, char_start, \
    char_end, chunk_text, 1 - (embedding <=> $1) AS score \
    FROM text_chunk \
    WHERE ($3::BIGINT[] IS NULL OR document_id = ANY($3)) \
    ORDER BY embedding <=> $1 ASC, document_id ASC, chunk_index ASC \
    LIMIT $2";

const DOCUMENT_MEANS: &str = "SELECT document_id, COUNT(*) AS chunk_count, AVG(embedding) AS mean \
    FROM text_chunk GROUP BY document_id ORDER BY document_id";

const BEGIN_PROCESSING: &str = "INSERT INTO library_document (document_id, title, status) \
    VALUES ($1, $2, 'chunking') \
    ON CONFLICT (document_id) DO UPDATE SET status = 'chunking' \
    WHERE library_document.status NOT IN ('chunking', 'embedding') \
    RETURNING document_id";

const BEGIN_DELETION: &str = "UPDATE library_document SET status = 'chunking' \
    WHERE document_id = $1 AND status NOT IN ('chunking', 'embedding') \
    RETURNING document_id";

const MATCHING_DOCUMENTS: &str = "SELECT document_id FROM library_document \
    WHERE ($1::TEXT IS NULL OR EXISTS ( \
        SELECT 1 FROM unnest(topics) AS topic WHERE lower(topic) = $1)) \
    AND ($2::INTEGER IS NULL OR year >= $2) \
    AND ($3::INTEGER IS NULL OR year <= $3) \
    AND ($4::BIGINT[] IS NULL OR document_id = ANY($4))";

fn schema_sql(dimensions: usize) -> String {
    format!(
        "CREATE EXTENSION IF NOT EXISTS vector;
        CREATE TABLE IF NOT EXISTS library_document (
            document_id BIGINT PRIMARY KEY,
            title TEXT NOT NULL,
            authors TEXT[] NOT NULL DEFAULT '{{}}',
            year INTEGER,
            topics TEXT[] NOT NULL DEFAULT '{{}}',
            status TEXT NOT NULL DEFAULT 'unprocessed'
        );
        CREATE TABLE IF NOT EXISTS text_chunk (
            document_id BIGINT NOT NULL REFERENCES library_document (document_id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            page_number INTEGER NOT NULL,
            page_end INTEGER NOT NULL,
            char_start BIGINT NOT NULL,
            char_end BIGINT NOT NULL,
            chunk_text TEXT NOT NULL,
            embedding VECTOR({dimensions}) NOT NULL,
            PRIMARY KEY (document_id, chunk_index)
        );"
    )
}

/// Reads and writes share one connection; upserts take it exclusively for
/// the span of their transaction.
pub struct PgVectorStore {
    client: RwLock<Client>,
    dimensions: usize,
}

impl PgVectorStore {
    /// Connects, creates the schema if missing and reads back the stored
    /// vector dimensionality, which may differ from `dimensions` when the
    /// table predates a model change.
    pub async fn connect(database_url: &str, dimensions: usize) -> Result<Self, StoreError> {
        if dimensions == 0 {
            return Err(StoreError::InvalidRecord(
                "embedding dimension must be positive".to_string(),
            ));
        }

        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(%err, "postgres connection closed");
            }
        });

        client.batch_execute(&schema_sql(dimensions)).await?;
        let stored = client
            .query_one(
                "SELECT atttypmod FROM pg_attribute \
                 WHERE attrelid = 'text_chunk'::regclass AND attname = 'embedding'",
                &[],
            )
            .await?
            .get::<_, i32>(0);
        let stored = usize::try_from(stored).unwrap_or(dimensions);

        info!(dimensions = stored, "connected to pgvector store");
        Ok(Self {
            client: RwLock::new(client),
            dimensions: stored,
        })
    }

    /// Dimensionality of the stored `embedding` column.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn as_i32<T>(value: T, field: &str) -> Result<i32, StoreError>
where
    i32: TryFrom<T>,
    T: Copy + std::fmt::Display,
{
    i32::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("{field} value {value} exceeds i32 range")))
}

fn as_i64<T>(value: T, field: &str) -> Result<i64, StoreError>
where
    i64: TryFrom<T>,
    T: Copy + std::fmt::Display,
{
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("{field} value {value} exceeds i64 range")))
}

fn chunk_from_row(row: &Row) -> Result<TextChunk, StoreError> {
    let non_negative = |value: i64, field: &str| {
        usize::try_from(value)
            .map_err(|_| StoreError::InvalidRecord(format!("negative {field}: {value}")))
    };
    let as_u32 = |value: i32, field: &str| {
        u32::try_from(value)
            .map_err(|_| StoreError::InvalidRecord(format!("negative {field}: {value}")))
    };

    Ok(TextChunk {
        document_id: row.get("document_id"),
        chunk_index: as_u32(row.get("chunk_index"), "chunk_index")?,
        page_number: as_u32(row.get("page_number"), "page_number")?,
        page_end: as_u32(row.get("page_end"), "page_end")?,
        char_start: non_negative(row.get("char_start"), "char_start")?,
        char_end: non_negative(row.get("char_end"), "char_end")?,
        text: row.get("chunk_text"),
    })
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert_chunks(
        &self,
        document_id: DocumentId,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<(), StoreError> {
        validate_chunks(document_id, &chunks, self.dimensions)?;

        let mut client = self.client.write().await;
        let transaction = client.transaction().await?;
        let removed = transaction
            .execute("DELETE FROM text_chunk WHERE document_id = $1", &[&document_id])
            .await?;

        let statement = transaction.prepare(INSERT_CHUNK).await?;
        for record in &chunks {
            let chunk = &record.chunk;
            let vector = Vector::from(record.embedding.clone());
            transaction
                .execute(
                    &statement,
                    &[
                        &document_id,
                        &as_i32(chunk.chunk_index, "chunk_index")?,
                        &as_i32(chunk.page_number, "page_number")?,
                        &as_i32(chunk.page_end, "page_end")?,
                        &as_i64(chunk.char_start, "char_start")?,
                        &as_i64(chunk.char_end, "char_end")?,
                        &chunk.text,
                        &vector,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;

        debug!(document_id, removed, inserted = chunks.len(), "replaced chunks");
        Ok(())
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        self.client
            .read()
            .await
            .execute("DELETE FROM text_chunk WHERE document_id = $1", &[&document_id])
            .await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if query_vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                found: query_vector.len(),
            });
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = Vector::from(query_vector.to_vec());
        let limit = as_i64(top_k, "top_k")?;
        let allowed: Option<Vec<i64>> = filter
            .document_ids
            .as_ref()
            .map(|ids| ids.iter().copied().collect());

        let rows = self
            .client
            .read()
            .await
            .query(SEARCH_CHUNKS, &[&vector, &limit, &allowed])
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ScoredChunk {
                    chunk: chunk_from_row(row)?,
                    score: row.get::<_, f64>("score") as f32,
                })
            })
            .collect()
    }

    async fn document_chunks(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<EmbeddedChunk>, StoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS}, embedding FROM text_chunk \
             WHERE document_id = $1 ORDER BY chunk_index"
        );
        let rows = self
            .client
            .read()
            .await
            .query(&sql, &[&document_id])
            .await?;

        rows.iter()
            .map(|row| {
                Ok(EmbeddedChunk {
                    chunk: chunk_from_row(row)?,
                    embedding: row.get::<_, Vector>("embedding").to_vec(),
                })
            })
            .collect()
    }

    async fn document_vectors(&self) -> Result<Vec<DocumentVector>, StoreError> {
        let rows = self.client.read().await.query(DOCUMENT_MEANS, &[]).await?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.get("chunk_count");
                Ok(DocumentVector {
                    document_id: row.get("document_id"),
                    chunk_count: usize::try_from(count).unwrap_or_default(),
                    vector: row.get::<_, Vector>("mean").to_vec(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentCatalog for PgVectorStore {
    async fn register(&self, metadata: DocumentMetadata) -> Result<(), StoreError> {
        self.client
            .read()
            .await
            .execute(
                "INSERT INTO library_document (document_id, title, authors, year, topics) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (document_id) DO NOTHING",
                &[
                    &metadata.document_id,
                    &metadata.title,
                    &metadata.authors,
                    &metadata.year,
                    &metadata.topics,
                ],
            )
            .await?;
        Ok(())
    }

    async fn status(&self, document_id: DocumentId) -> Result<Option<DocumentStatus>, StoreError> {
        let row = self
            .client
            .read()
            .await
            .query_opt(
                "SELECT status FROM library_document WHERE document_id = $1",
                &[&document_id],
            )
            .await?;

        row.map(|row| {
            row.get::<_, String>("status")
                .parse::<DocumentStatus>()
                .map_err(StoreError::InvalidRecord)
        })
        .transpose()
    }

    async fn begin_processing(&self, document_id: DocumentId) -> Result<(), IngestError> {
        let title = format!("document {document_id}");
        let claimed = self
            .client
            .read()
            .await
            .query_opt(BEGIN_PROCESSING, &[&document_id, &title])
            .await
            .map_err(StoreError::from)?;

        match claimed {
            Some(_) => Ok(()),
            None => Err(IngestError::AlreadyProcessing { document_id }),
        }
    }

    async fn begin_deletion(&self, document_id: DocumentId) -> Result<bool, IngestError> {
        let client = self.client.read().await;
        let claimed = client
            .query_opt(BEGIN_DELETION, &[&document_id])
            .await
            .map_err(StoreError::from)?;
        if claimed.is_some() {
            return Ok(true);
        }

        let known = client
            .query_opt(
                "SELECT 1 FROM library_document WHERE document_id = $1",
                &[&document_id],
            )
            .await
            .map_err(StoreError::from)?;
        match known {
            Some(_) => Err(IngestError::AlreadyProcessing { document_id }),
            None => Ok(false),
        }
    }

    async fn set_status(
        &self,
        document_id: DocumentId,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let updated = self
            .client
            .read()
            .await
            .execute(
                "UPDATE library_document SET status = $2 WHERE document_id = $1",
                &[&document_id, &status.as_str()],
            )
            .await?;

        if updated == 0 {
            return Err(StoreError::UnknownDocument(document_id));
        }
        Ok(())
    }

    async fn metadata(
        &self,
        document_ids: &[DocumentId],
    ) -> Result<HashMap<DocumentId, DocumentMetadata>, StoreError> {
        let ids = document_ids.to_vec();
        let rows = self
            .client
            .read()
            .await
            .query(
                "SELECT document_id, title, authors, year, topics FROM library_document \
                 WHERE document_id = ANY($1)",
                &[&ids],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let metadata = DocumentMetadata {
                    document_id: row.get("document_id"),
                    title: row.get("title"),
                    authors: row.get("authors"),
                    year: row.get("year"),
                    topics: row.get("topics"),
                };
                (metadata.document_id, metadata)
            })
            .collect())
    }

    async fn matching_documents(
        &self,
        filters: &QueryFilters,
    ) -> Result<BTreeSet<DocumentId>, StoreError> {
        let topic = filters.topic.as_deref().map(str::to_lowercase);
        let rows = self
            .client
            .read()
            .await
            .query(
                MATCHING_DOCUMENTS,
                &[
                    &topic,
                    &filters.year_min,
                    &filters.year_max,
                    &filters.document_ids,
                ],
            )
            .await?;

        Ok(rows.iter().map(|row| row.get::<_, i64>(0)).collect())
    }
}
