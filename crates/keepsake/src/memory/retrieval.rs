//! Retrieval ranking
//!
//! Candidates come from two places: a keyword scan of the store and a vector
//! query that over-fetches `limit * candidate_multiplier` ids. Each candidate's
//! relevance is the better of its keyword score and vector similarity, which
//! is then blended with recency.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::RetrievalConfig;
use crate::memory::keywords::{keyword_overlap, keyword_tokens};
use crate::memory::types::MemoryRecord;

/// A retrieved record with scoring information
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub record: MemoryRecord,
    /// Fraction of query tokens present in the record
    pub keyword_score: f32,
    /// Similarity reported by the vector index, if it returned this record
    pub similarity_score: Option<f32>,
    /// max(keyword, similarity)
    pub relevance: f32,
    /// Decay since last access, 1.0 when just touched
    pub recency: f32,
    /// Final combined score for ranking
    pub final_score: f32,
}

/// Scores and orders retrieval candidates
#[derive(Debug, Clone)]
pub struct RetrievalRanker {
    config: RetrievalConfig,
}

impl RetrievalRanker {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Number of vector candidates to request for `limit` results
    pub fn candidate_limit(&self, limit: usize) -> usize {
        limit.saturating_mul(self.config.candidate_multiplier.max(1))
    }

    /// Score one candidate; `None` when it is not relevant at all
    pub fn score(
        &self,
        record: MemoryRecord,
        query_tokens: &HashSet<String>,
        similarity: Option<f32>,
        now: DateTime<Utc>,
    ) -> Option<RetrievedMemory> {
        let keyword_score = keyword_overlap(query_tokens, &searchable_tokens(&record));
        let similarity_score = similarity
            .map(|s| s.clamp(0.0, 1.0))
            .filter(|s| *s >= self.config.min_similarity);

        let relevance = keyword_score.max(similarity_score.unwrap_or(0.0));
        if relevance <= 0.0 {
            return None;
        }

        let hours = (now - record.last_accessed_at).num_seconds().max(0) as f32 / 3600.0;
        let half_life = self.config.recency_half_life_hours.max(f32::EPSILON);
        let recency = 0.5_f32.powf(hours / half_life);

        let final_score =
            relevance * self.config.relevance_weight + recency * self.config.recency_weight;

        Some(RetrievedMemory {
            record,
            keyword_score,
            similarity_score,
            relevance,
            recency,
            final_score,
        })
    }

    /// Sort by final score descending (newest first on ties) and keep `limit`
    pub fn rank(&self, mut results: Vec<RetrievedMemory>, limit: usize) -> Vec<RetrievedMemory> {
        results.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        results.truncate(limit);
        results
    }
}

/// Tokens a keyword query can hit: content, tags and data type
pub fn searchable_tokens(record: &MemoryRecord) -> HashSet<String> {
    let mut tokens = keyword_tokens(&record.content);
    tokens.extend(record.metadata.tags.iter().map(|t| t.to_lowercase()));
    if !record.metadata.data_type.is_empty() {
        tokens.insert(record.metadata.data_type.to_lowercase());
    }
    tokens
}
