//! Text embeddings
//!
//! [`Embedder`] is the only thing the rest of the crate knows about
//! embeddings. [`FastEmbedder`] runs a small local model (multilingual-e5-small
//! by default) through fastembed; [`CachedEmbedder`] puts an LRU cache in
//! front of any embedder so repeated query texts are embedded once.

use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{RecollectError, Result};
pub use crate::memory::types::EMBEDDING_DIMENSION;

/// Default number of cached query embeddings
pub const DEFAULT_CACHE_SIZE: usize = 512;

/// Turns text into fixed-size, L2-normalised vectors.
///
/// Implementations must be deterministic for identical input.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIMENSION
    }
}

/// Scale `v` to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Cosine similarity in [-1, 1]; 0.0 for empty or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Local fastembed model, multilingual-e5-small unless configured otherwise
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedder {
    pub fn new() -> Result<Self> {
        Self::with_model(FastEmbedModel::MultilingualE5Small)
    }

    /// Load a model by its config name. Only 384-dimension models are
    /// accepted.
    pub fn from_name(name: &str) -> Result<Self> {
        let model = match name.to_ascii_lowercase().as_str() {
            "multilingual-e5-small" => FastEmbedModel::MultilingualE5Small,
            "all-minilm-l6-v2" => FastEmbedModel::AllMiniLML6V2,
            "bge-small-en-v1.5" => FastEmbedModel::BGESmallENV15,
            other => {
                return Err(RecollectError::Config(format!(
                    "Unsupported embedding model: {other}"
                )));
            }
        };
        Self::with_model(model)
    }

    fn with_model(model: FastEmbedModel) -> Result<Self> {
        debug!("Loading embedding model {:?}", model);
        let model = TextEmbedding::try_new(InitOptions::new(model))
            .map_err(|e| RecollectError::Embedding(e.to_string()))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| RecollectError::Embedding("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| RecollectError::Embedding(format!("Embedding model lock poisoned: {e}")))?;
        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| RecollectError::Embedding(e.to_string()))?;
        Ok(embeddings.into_iter().map(l2_normalize).collect())
    }
}

/// LRU cache in front of another embedder
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Number of cached embeddings
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(text) {
                debug!("Embedding cache hit");
                return Ok(hit.clone());
            }
        }

        let embedding = self.inner.embed(text)?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for CountingEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MockEmbedder.embed(text)
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_cache_avoids_recomputation() {
        let embedder = CachedEmbedder::new(
            CountingEmbedder {
                calls: AtomicUsize::new(0),
            },
            2,
        );
        let a = embedder.embed("alpha").unwrap();
        let b = embedder.embed("alpha").unwrap();
        assert_eq!(a, b);
        assert_eq!(embedder.inner().calls.load(Ordering::SeqCst), 1);

        embedder.embed("beta").unwrap();
        embedder.embed("gamma").unwrap();
        assert_eq!(embedder.cached(), 2);
        // "alpha" was evicted
        embedder.embed("alpha").unwrap();
        assert_eq!(embedder.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[cfg(feature = "ml-tests")]
    #[test]
    fn test_fastembed_dimension_and_norm() {
        let model = FastEmbedder::new().expect("Failed to load model");
        let v = model.embed("Hello, world!").expect("Failed to embed");
        assert_eq!(v.len(), EMBEDDING_DIMENSION);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[cfg(feature = "ml-tests")]
    #[test]
    fn test_similar_texts_have_high_similarity() {
        let model = FastEmbedder::new().expect("Failed to load model");
        let a = model.embed("The quick brown fox jumps over the lazy dog").unwrap();
        let b = model.embed("A fast brown fox leaps over a sleepy dog").unwrap();
        let c = model.embed("Quantum computing revolutionizes cryptography").unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }
}
