//! Text embedders

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{KeepsakeError, Result};
use crate::memory::keywords::keyword_tokens;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Feature-hashing embedder: each keyword adds ±1 to a bucket chosen by its
/// SHA-256 digest, then the vector is L2-normalized. Texts sharing words get
/// similar vectors, and the output is stable across builds and platforms.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in keyword_tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KeepsakeError::Embedding("Cannot embed empty text".to_string()));
        }
        Ok(self.embed_sync(text))
    }
}

#[cfg(feature = "fastembed")]
pub use local::FastEmbedder;

#[cfg(feature = "fastembed")]
mod local {
    use super::*;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tokio::sync::Mutex;

    pub const FASTEMBED_DIMENSION: usize = 384;

    /// Local ONNX sentence embeddings (multilingual E5 small)
    pub struct FastEmbedder {
        model: Mutex<TextEmbedding>,
    }

    impl FastEmbedder {
        pub fn new() -> Result<Self> {
            let model = TextEmbedding::try_new(InitOptions::new(EmbeddingModel::MultilingualE5Small))
                .map_err(|e| KeepsakeError::Embedding(e.to_string()))?;
            Ok(Self {
                model: Mutex::new(model),
            })
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        fn name(&self) -> &str {
            "fastembed"
        }

        fn dimension(&self) -> usize {
            FASTEMBED_DIMENSION
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut model = self.model.lock().await;
            let embeddings = model
                .embed(vec![text.to_string()], None)
                .map_err(|e| KeepsakeError::Embedding(e.to_string()))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| KeepsakeError::Embedding("No embedding returned".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("rust borrow checker").await.unwrap();
        let b = embedder.embed("rust borrow checker").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_shared_words_are_closer() {
        let embedder = HashEmbedder::new(384);
        let base = embedder.embed("the garden needs watering today").await.unwrap();
        let related = embedder.embed("watering the garden").await.unwrap();
        let unrelated = embedder.embed("quarterly invoice totals").await.unwrap();

        assert!(cosine_similarity(&base, &related) > cosine_similarity(&base, &unrelated));
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let err = HashEmbedder::new(8).embed("   ").await.unwrap_err();
        assert!(matches!(err, KeepsakeError::Embedding(_)));
    }
}
