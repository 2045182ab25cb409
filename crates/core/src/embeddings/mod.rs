pub mod ngram;
pub mod openai;

pub use ngram::{CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use openai::{OpenAiConfig, OpenAiEmbedder};

use crate::error::EmbeddingError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// A loaded embedding model. Read-only once constructed.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn dimensions(&self) -> usize;

    fn max_batch_size(&self) -> usize {
        64
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn model_id(&self) -> String;

    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError>;
}

#[derive(Debug, Clone)]
pub enum EmbeddingConfig {
    Ngram { dimensions: usize },
    OpenAi(OpenAiConfig),
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::Ngram {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

#[async_trait]
impl ModelLoader for EmbeddingConfig {
    fn model_id(&self) -> String {
        match self {
            Self::Ngram { dimensions } => format!("char-trigram-{dimensions}"),
            Self::OpenAi(config) => config.model.clone(),
        }
    }

    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        match self {
            Self::Ngram { dimensions } => {
                if *dimensions == 0 {
                    return Err(EmbeddingError::ModelLoad(
                        "embedding dimensions must be positive".to_string(),
                    ));
                }
                Ok(Arc::new(CharacterNgramEmbedder::new(*dimensions)))
            }
            Self::OpenAi(config) => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        }
    }
}

/// Owns the embedding model for the lifetime of the application.
///
/// The model is loaded on first use (or by [`EmbeddingService::warm_up`]);
/// concurrent first callers wait on the same initialization. Every vector
/// handed out is unit length, so cosine similarity is a dot product.
pub struct EmbeddingService {
    loader: Box<dyn ModelLoader>,
    model: OnceCell<Arc<dyn EmbeddingModel>>,
}

impl EmbeddingService {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            model: OnceCell::new(),
        }
    }

    pub fn model_id(&self) -> String {
        self.loader.model_id()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> Result<&Arc<dyn EmbeddingModel>, EmbeddingError> {
        self.model
            .get_or_try_init(|| async {
                let model = self.loader.load().await?;
                info!(
                    model = %self.loader.model_id(),
                    dimensions = model.dimensions(),
                    "embedding model loaded"
                );
                Ok(model)
            })
            .await
    }

    /// Loads the model now and returns its dimensionality.
    pub async fn warm_up(&self) -> Result<usize, EmbeddingError> {
        Ok(self.model().await?.dimensions())
    }

    pub async fn dimensions(&self) -> Result<usize, EmbeddingError> {
        self.warm_up().await
    }

    /// Embeds `texts` in order. Any failure fails the whole call.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model().await?;
        let dimensions = model.dimensions();
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(model.max_batch_size().max(1)) {
            let embedded = model.embed_batch(batch).await?;
            if embedded.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: batch.len(),
                    found: embedded.len(),
                });
            }

            for mut vector in embedded {
                if vector.len() != dimensions {
                    return Err(EmbeddingError::InconsistentDimensions {
                        expected: dimensions,
                        found: vector.len(),
                    });
                }
                if !normalize(&mut vector) {
                    return Err(EmbeddingError::Degenerate {
                        index: vectors.len(),
                    });
                }
                vectors.push(vector);
            }
        }

        debug!(count = vectors.len(), dimensions, "embedded batch");
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            found: 0,
        })
    }
}

/// Scales `vector` to unit length in place. Returns false, leaving the
/// vector untouched, when its norm is zero or not finite.
pub fn normalize(vector: &mut [f32]) -> bool {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if !magnitude.is_finite() || magnitude == 0.0 {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= magnitude;
    }
    true
}

pub fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        fn model_id(&self) -> String {
            "counting".to_string()
        }

        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Arc::new(CharacterNgramEmbedder::new(24)))
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl ModelLoader for FailingLoader {
        fn model_id(&self) -> String {
            "missing".to_string()
        }

        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
            Err(EmbeddingError::ModelLoad("weights not found".to_string()))
        }
    }

    /// Returns the wrong number of vectors for batches larger than one.
    struct ShortModel;

    #[async_trait]
    impl EmbeddingModel for ShortModel {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().skip(1).map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct StaticLoader(Arc<dyn EmbeddingModel>);

    #[async_trait]
    impl ModelLoader for StaticLoader {
        fn model_id(&self) -> String {
            "static".to_string()
        }

        async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = Arc::new(EmbeddingService::new(CountingLoader {
            loads: loads.clone(),
        }));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.embed_query(&format!("query {worker}")).await
            }));
        }
        for handle in handles {
            let vector = handle.await.unwrap().unwrap();
            assert_eq!(vector.len(), 24);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(service.is_loaded());
    }

    #[tokio::test]
    async fn embeddings_are_unit_length_and_ordered() {
        let service = EmbeddingService::new(EmbeddingConfig::Ngram { dimensions: 64 });
        let texts = vec![
            "Krebs cycle".to_string(),
            "electron transport chain".to_string(),
            "Krebs cycle".to_string(),
        ];

        let vectors = service.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        for vector in &vectors {
            assert_eq!(vector.len(), 64);
            let norm = dot(vector, vector).sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn load_failure_surfaces_on_warm_up() {
        let service = EmbeddingService::new(FailingLoader);
        assert!(matches!(
            service.warm_up().await,
            Err(EmbeddingError::ModelLoad(_))
        ));
        assert!(!service.is_loaded());
    }

    #[tokio::test]
    async fn short_batches_fail_as_a_whole() {
        let service = EmbeddingService::new(StaticLoader(Arc::new(ShortModel)));
        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(
            service.embed(&texts).await,
            Err(EmbeddingError::CountMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn zero_vectors_cannot_be_normalized() {
        let mut zero = vec![0.0, 0.0];
        assert!(!normalize(&mut zero));

        let mut vector = vec![3.0, 4.0];
        assert!(normalize(&mut vector));
        assert_eq!(vector, vec![0.6, 0.8]);
    }
}
