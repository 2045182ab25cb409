pub mod memory;
pub mod postgres;

pub use memory::{InMemoryCatalog, InMemoryVectorStore};
pub use postgres::PgVectorStore;

use crate::error::StoreError;
use crate::models::{DocumentId, EmbeddedChunk, ScoredChunk};
use std::cmp::Ordering;

/// Checks a replacement chunk set before any store sees it: every chunk
/// belongs to `document_id`, indices run 0..n in order, and every vector is
/// finite with the store's dimensionality.
pub fn validate_chunks(
    document_id: DocumentId,
    chunks: &[EmbeddedChunk],
    dimensions: usize,
) -> Result<(), StoreError> {
    for (position, record) in chunks.iter().enumerate() {
        if record.chunk.document_id != document_id {
            return Err(StoreError::InvalidRecord(format!(
                "chunk {} belongs to document {}, not {}",
                record.chunk.chunk_index, record.chunk.document_id, document_id
            )));
        }
        if record.chunk.chunk_index as usize != position {
            return Err(StoreError::InvalidRecord(format!(
                "chunk index {} at position {}; indices must be contiguous from 0",
                record.chunk.chunk_index, position
            )));
        }
        if record.embedding.len() != dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: dimensions,
                found: record.embedding.len(),
            });
        }
        if record.embedding.iter().any(|value| !value.is_finite()) {
            return Err(StoreError::InvalidRecord(format!(
                "chunk {} has a non-finite embedding",
                record.chunk.chunk_index
            )));
        }
    }
    Ok(())
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|v| v * v).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|v| v * v).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

/// Descending score, then ascending document id, then ascending chunk index.
pub fn rank_order(left: &ScoredChunk, right: &ScoredChunk) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then(left.chunk.document_id.cmp(&right.chunk.document_id))
        .then(left.chunk.chunk_index.cmp(&right.chunk.chunk_index))
}

/// Component-wise mean of `vectors`; `None` when there are none.
pub fn mean_vector<'a>(vectors: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;
    for vector in vectors {
        let acc = sum.get_or_insert_with(|| vec![0.0; vector.len()]);
        for (slot, value) in acc.iter_mut().zip(vector) {
            *slot += value;
        }
        count += 1;
    }
    sum.map(|mut acc| {
        for slot in &mut acc {
            *slot /= count as f32;
        }
        acc
    })
}
