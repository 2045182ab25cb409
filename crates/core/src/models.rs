use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub type DocumentId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Unprocessed,
    Chunking,
    Embedding,
    Embedded,
    Failed,
}

impl DocumentStatus {
    /// A pipeline run owns the document while it sits in a non-terminal status.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Chunking | Self::Embedding)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Embedded => "embedded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unprocessed" => Ok(Self::Unprocessed),
            "chunking" => Ok(Self::Chunking),
            "embedding" => Ok(Self::Embedding),
            "embedded" => Ok(Self::Embedded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

/// Display metadata owned by the bibliographic side of the library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub topics: Vec<String>,
}

impl DocumentMetadata {
    pub fn titled(document_id: DocumentId, title: impl Into<String>) -> Self {
        Self {
            document_id,
            title: title.into(),
            ..Self::default()
        }
    }
}

/// A text window cut from one document, not yet embedded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub document_id: DocumentId,
    pub chunk_index: u32,
    /// Page holding the first character of the window.
    pub page_number: u32,
    /// Page holding the last character of the window.
    pub page_end: u32,
    /// Character offset into `page_number`'s text.
    pub char_start: usize,
    /// Exclusive character offset into `page_end`'s text.
    pub char_end: usize,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: TextChunk,
    pub embedding: Vec<f32>,
}

/// Mean of a document's chunk vectors, as read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentVector {
    pub document_id: DocumentId,
    pub chunk_count: usize,
    pub vector: Vec<f32>,
}

/// Restricts the candidate population before ranking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkFilter {
    pub document_ids: Option<BTreeSet<DocumentId>>,
}

impl ChunkFilter {
    pub fn allows(&self, document_id: DocumentId) -> bool {
        self.document_ids
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&document_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub topic: Option<String>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub document_ids: Option<Vec<DocumentId>>,
}

impl QueryFilters {
    pub fn has_bibliographic_terms(&self) -> bool {
        self.topic.is_some() || self.year_min.is_some() || self.year_max.is_some()
    }

    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        let topic_ok = self.topic.as_ref().map_or(true, |topic| {
            metadata
                .topics
                .iter()
                .any(|candidate| candidate.to_lowercase() == topic.to_lowercase())
        });
        let min_ok = self
            .year_min
            .map_or(true, |min| metadata.year.is_some_and(|year| year >= min));
        let max_ok = self
            .year_max
            .map_or(true, |max| metadata.year.is_some_and(|year| year <= max));
        let id_ok = self
            .document_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&metadata.document_id));

        topic_ok && min_ok && max_ok && id_ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub text: String,
    pub limit: usize,
    pub filters: QueryFilters,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            limit,
            filters: QueryFilters::default(),
        }
    }
}

/// A stored chunk ranked against a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityResult {
    pub document_id: DocumentId,
    pub chunk_index: u32,
    pub title: Option<String>,
    pub page_number: u32,
    pub snippet: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DuplicateCandidatePair {
    /// Always the lower of the two document ids.
    pub first: DocumentId,
    pub second: DocumentId,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchOptions {
    pub max_limit: usize,
    pub snippet_chars: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_limit: 50,
            snippet_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: uuid::Uuid,
    pub document_id: DocumentId,
    pub page_count: usize,
    pub chunk_count: usize,
    pub dimensions: usize,
    pub source_checksum: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
