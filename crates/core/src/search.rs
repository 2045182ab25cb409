use crate::embeddings::EmbeddingService;
use crate::error::SearchError;
use crate::models::{
    ChunkFilter, DocumentId, SearchOptions, SearchQuery, SimilarityResult,
};
use crate::traits::{DocumentCatalog, VectorStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    /// Limit actually applied after capping.
    pub limit: usize,
    pub results: Vec<SimilarityResult>,
}

/// The read path: embed the query, rank stored chunks, attach display data.
pub struct SemanticSearchEngine<S, C> {
    embedder: Arc<EmbeddingService>,
    store: Arc<S>,
    catalog: Arc<C>,
    options: SearchOptions,
}

impl<S, C> SemanticSearchEngine<S, C>
where
    S: VectorStore,
    C: DocumentCatalog,
{
    pub fn new(
        embedder: Arc<EmbeddingService>,
        store: Arc<S>,
        catalog: Arc<C>,
        options: SearchOptions,
    ) -> Self {
        Self {
            embedder,
            store,
            catalog,
            options,
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::InvalidQuery("query is empty".to_string()));
        }
        if query.limit == 0 {
            return Err(SearchError::InvalidQuery(
                "limit must be positive".to_string(),
            ));
        }
        let limit = query.limit.min(self.options.max_limit.max(1));

        let filter = self.resolve_filter(query).await?;
        if filter
            .document_ids
            .as_ref()
            .is_some_and(|allowed| allowed.is_empty())
        {
            debug!("filters matched no documents");
            return Ok(SearchResponse {
                query: query.text.clone(),
                limit,
                results: Vec::new(),
            });
        }

        let query_vector = self.embedder.embed_query(&query.text).await?;
        let hits = self
            .store
            .similarity_search(&query_vector, limit, &filter)
            .await?;

        let mut document_ids: Vec<DocumentId> =
            hits.iter().map(|hit| hit.chunk.document_id).collect();
        document_ids.sort_unstable();
        document_ids.dedup();
        let metadata = self.catalog.metadata(&document_ids).await?;

        let results: Vec<SimilarityResult> = hits
            .into_iter()
            .map(|hit| SimilarityResult {
                document_id: hit.chunk.document_id,
                chunk_index: hit.chunk.chunk_index,
                title: metadata
                    .get(&hit.chunk.document_id)
                    .map(|entry| entry.title.clone()),
                page_number: hit.chunk.page_number,
                snippet: truncate_chars(&hit.chunk.text, self.options.snippet_chars),
                score: hit.score,
            })
            .collect();

        info!(limit, result_count = results.len(), "semantic search");
        Ok(SearchResponse {
            query: query.text.clone(),
            limit,
            results,
        })
    }

    async fn resolve_filter(&self, query: &SearchQuery) -> Result<ChunkFilter, SearchError> {
        let filters = &query.filters;
        if filters.has_bibliographic_terms() {
            let allowed = self.catalog.matching_documents(filters).await?;
            return Ok(ChunkFilter {
                document_ids: Some(allowed),
            });
        }
        Ok(ChunkFilter {
            document_ids: filters
                .document_ids
                .as_ref()
                .map(|ids| ids.iter().copied().collect()),
        })
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}
