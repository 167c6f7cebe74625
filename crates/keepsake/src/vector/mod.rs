//! Vector index and embedder seams
//!
//! Both are optional collaborators: when either is missing or failing,
//! relevance falls back to keyword overlap.

pub mod embed;
pub mod lance;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{KeepsakeError, Result};

pub use embed::{Embedder, HashEmbedder};
#[cfg(feature = "fastembed")]
pub use embed::FastEmbedder;
pub use lance::LanceVectorIndex;

/// One nearest-neighbour hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VectorMatch {
    pub id: Uuid,
    /// Cosine similarity clamped to [0, 1]
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace the vector for `id`, returning its reference
    async fn upsert(&self, id: Uuid, vector: Vec<f32>, metadata: serde_json::Value) -> Result<String>;

    /// Closest vectors first
    async fn query(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorMatch>>;

    async fn remove(&self, id: Uuid) -> Result<()>;
}

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
    dot / (norm_a * norm_b)
}

/// Brute-force index kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    vectors: RwLock<HashMap<Uuid, Vec<f32>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, id: Uuid, vector: Vec<f32>, _metadata: serde_json::Value) -> Result<String> {
        if vector.is_empty() {
            return Err(KeepsakeError::VectorIndexUnavailable(
                "Refusing to index an empty vector".to_string(),
            ));
        }
        self.vectors.write().await.insert(id, vector);
        Ok(id.to_string())
    }

    async fn query(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorMatch>> {
        let vectors = self.vectors.read().await;
        let mut matches: Vec<VectorMatch> = vectors
            .iter()
            .map(|(id, stored)| VectorMatch {
                id: *id,
                similarity: cosine_similarity(vector, stored).clamp(0.0, 1.0),
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then(a.id.cmp(&b.id)));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.vectors.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_query_orders_by_similarity() {
        let index = InMemoryVectorIndex::new();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();
        index
            .upsert(close, vec![1.0, 0.1], serde_json::Value::Null)
            .await
            .unwrap();
        index
            .upsert(far, vec![0.0, 1.0], serde_json::Value::Null)
            .await
            .unwrap();

        let matches = index.query(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, close);
        assert!(matches[0].similarity > matches[1].similarity);

        index.remove(close).await.unwrap();
        assert_eq!(index.len().await, 1);
    }
}
