//! Near-duplicate detection over whole documents.
//!
//! Each document is reduced to the re-normalized mean of its chunk vectors
//! and every unordered pair of documents is compared. That is O(n²) in the
//! number of documents: fine for a personal library of a few thousand
//! documents, not for much larger collections without an index. Mean pooling
//! also cannot see partial overlap between otherwise different documents.

use crate::embeddings::{dot, normalize};
use crate::error::SearchError;
use crate::models::{DocumentVector, DuplicateCandidatePair};
use crate::traits::VectorStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Absorbs rounding so that identical documents pass a threshold of 1.0.
const SCORE_EPSILON: f32 = 1e-6;

pub struct DuplicateDetector<S> {
    store: Arc<S>,
}

impl<S: VectorStore> DuplicateDetector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn find_duplicates(
        &self,
        threshold: f32,
    ) -> Result<Vec<DuplicateCandidatePair>, SearchError> {
        validate_threshold(threshold)?;
        let signatures = self.store.document_vectors().await?;
        let pairs = candidate_pairs(signatures, threshold);
        info!(threshold, pair_count = pairs.len(), "duplicate scan finished");
        Ok(pairs)
    }
}

pub fn validate_threshold(threshold: f32) -> Result<(), SearchError> {
    if threshold.is_finite() && threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(SearchError::InvalidThreshold(threshold))
    }
}

/// Pairs of documents whose normalized mean vectors reach `threshold`.
/// Each pair appears once with the lower id first, ordered by descending
/// similarity.
pub fn candidate_pairs(
    signatures: Vec<DocumentVector>,
    threshold: f32,
) -> Vec<DuplicateCandidatePair> {
    let mut normalized: Vec<DocumentVector> = signatures
        .into_iter()
        .filter_map(|mut signature| {
            if normalize(&mut signature.vector) {
                Some(signature)
            } else {
                warn!(
                    document_id = signature.document_id,
                    "document has a degenerate mean vector, skipped"
                );
                None
            }
        })
        .collect();
    normalized.sort_by_key(|signature| signature.document_id);
    normalized.dedup_by_key(|signature| signature.document_id);

    let mut pairs = Vec::new();
    for (position, left) in normalized.iter().enumerate() {
        for right in &normalized[position + 1..] {
            if left.vector.len() != right.vector.len() {
                continue;
            }
            let similarity = dot(&left.vector, &right.vector).clamp(-1.0, 1.0);
            if similarity + SCORE_EPSILON >= threshold {
                pairs.push(DuplicateCandidatePair {
                    first: left.document_id,
                    second: right.document_id,
                    similarity,
                });
            }
        }
    }

    pairs.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.first.cmp(&b.first))
            .then(a.second.cmp(&b.second))
    });
    pairs
}
