//! Value scoring for stored records
//!
//! A record's value is a weighted sum of four independently normalized
//! factors. The weights come from a named strategy profile so operators can
//! trade recency against structure without touching code.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::error::{KeepsakeError, Result};
use crate::memory::keywords::{keyword_overlap, keyword_tokens};
use crate::memory::types::{MemoryKind, MemoryRecord};

const WEIGHT_SUM_TOLERANCE: f32 = 1e-3;

/// Named weighting of the four value factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyProfile {
    /// Favours structural signals (content type, relations)
    Conservative,
    /// Equal weights
    #[default]
    Balanced,
    /// Favours current activity (access, context)
    Aggressive,
}

impl StrategyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyProfile::Conservative => "conservative",
            StrategyProfile::Balanced => "balanced",
            StrategyProfile::Aggressive => "aggressive",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "conservative" => Some(StrategyProfile::Conservative),
            "balanced" => Some(StrategyProfile::Balanced),
            "aggressive" => Some(StrategyProfile::Aggressive),
            _ => None,
        }
    }

    /// Built-in weights for this profile
    pub fn default_weights(&self) -> ScoringWeights {
        match self {
            StrategyProfile::Conservative => ScoringWeights::new(0.3, 0.2, 0.2, 0.3),
            StrategyProfile::Balanced => ScoringWeights::new(0.25, 0.25, 0.25, 0.25),
            StrategyProfile::Aggressive => ScoringWeights::new(0.2, 0.3, 0.3, 0.2),
        }
    }
}

impl fmt::Display for StrategyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Factor weights; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub type_weight: f32,
    pub access_frequency: f32,
    pub context_relevance: f32,
    pub relational_weight: f32,
}

impl ScoringWeights {
    pub const fn new(
        type_weight: f32,
        access_frequency: f32,
        context_relevance: f32,
        relational_weight: f32,
    ) -> Self {
        Self {
            type_weight,
            access_frequency,
            context_relevance,
            relational_weight,
        }
    }

    pub fn sum(&self) -> f32 {
        self.type_weight + self.access_frequency + self.context_relevance + self.relational_weight
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let all = [
            self.type_weight,
            self.access_frequency,
            self.context_relevance,
            self.relational_weight,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(KeepsakeError::Config(format!(
                "Profile '{name}' has a negative or non-finite weight"
            )));
        }
        if (self.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(KeepsakeError::Config(format!(
                "Profile '{name}' weights sum to {:.3}, expected 1.0",
                self.sum()
            )));
        }
        Ok(())
    }
}

/// Individual factor values and the combined score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueBreakdown {
    pub type_weight: f32,
    pub access_frequency: f32,
    pub context_relevance: f32,
    pub relational_weight: f32,
    pub score: f32,
    pub profile: StrategyProfile,
}

/// What the caller is currently focused on (e.g. the conversation topic)
#[derive(Debug, Clone, Default)]
pub struct ActiveContext {
    text: String,
    tokens: HashSet<String>,
    similarities: HashMap<Uuid, f32>,
}

impl ActiveContext {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let tokens = keyword_tokens(&text);
        Self {
            text,
            tokens,
            similarities: HashMap::new(),
        }
    }

    /// Attach per-record similarities returned by the vector index
    pub fn with_similarities(mut self, similarities: HashMap<Uuid, f32>) -> Self {
        self.similarities = similarities;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.similarities.is_empty()
    }

    pub fn has_similarities(&self) -> bool {
        !self.similarities.is_empty()
    }

    pub fn similarity(&self, id: &Uuid) -> Option<f32> {
        self.similarities.get(id).copied()
    }
}

/// Inputs shared by every evaluation in one scoring pass
pub struct EvaluationContext<'a> {
    pub active: Option<&'a ActiveContext>,
    /// Number of live records referencing each id
    pub inbound_links: &'a HashMap<Uuid, usize>,
    pub profile: StrategyProfile,
    pub now: DateTime<Utc>,
}

/// Computes normalized value scores
#[derive(Debug, Clone)]
pub struct ValueEvaluationEngine {
    config: ScoringConfig,
}

impl ValueEvaluationEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Weights for a profile, including configured overrides
    pub fn weights_for(&self, profile: StrategyProfile) -> ScoringWeights {
        match profile {
            StrategyProfile::Conservative => self.config.profiles.conservative,
            StrategyProfile::Balanced => self.config.profiles.balanced,
            StrategyProfile::Aggressive => self.config.profiles.aggressive,
        }
    }

    /// Score a record against the current context
    pub fn evaluate(&self, record: &MemoryRecord, ctx: &EvaluationContext<'_>) -> ValueBreakdown {
        let weights = self.weights_for(ctx.profile);

        let type_weight = self.type_factor(record);
        let access_frequency = self.access_factor(record, ctx.now);
        let context_relevance = self.relevance_factor(record, ctx.active);
        let relational_weight =
            self.relational_factor(ctx.inbound_links.get(&record.id).copied().unwrap_or(0));

        let raw = weights.type_weight * type_weight
            + weights.access_frequency * access_frequency
            + weights.context_relevance * context_relevance
            + weights.relational_weight * relational_weight;
        let score = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) };

        ValueBreakdown {
            type_weight,
            access_frequency,
            context_relevance,
            relational_weight,
            score,
            profile: ctx.profile,
        }
    }

    /// Static weight for the content kind, averaged with an upstream importance label
    pub fn type_factor(&self, record: &MemoryRecord) -> f32 {
        let weights = &self.config.kind_weights;
        let base = match record.metadata.kind {
            MemoryKind::Dialogue => weights.dialogue,
            MemoryKind::Episodic => weights.episodic,
            MemoryKind::Semantic => weights.semantic,
            MemoryKind::Procedural => weights.procedural,
        };

        let value = match record.metadata.importance {
            Some(importance) => (base + importance.clamp(0.0, 1.0)) / 2.0,
            None => base,
        };
        value.clamp(0.0, 1.0)
    }

    /// Recency-weighted access frequency.
    ///
    /// `recency * (1 + frequency) / 2`: a record touched just now scores at
    /// least 0.5, a heavily used one approaches 1.0, and both decay with the
    /// configured half-life.
    pub fn access_factor(&self, record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
        let hours = (now - record.last_accessed_at).num_seconds().max(0) as f32 / 3600.0;
        let half_life = self.config.access_half_life_hours.max(f32::EPSILON);
        let recency = 0.5_f32.powf(hours / half_life);

        let saturation = self.config.frequency_saturation.max(1) as f32;
        let frequency = ((record.access_count as f32 + 1.0).ln() / (saturation + 1.0).ln()).min(1.0);

        (recency * (1.0 + frequency) / 2.0).clamp(0.0, 1.0)
    }

    /// Similarity to the active context.
    ///
    /// Uses the vector similarity when the index returned one for this record,
    /// keyword overlap otherwise, and a neutral value without any context.
    pub fn relevance_factor(&self, record: &MemoryRecord, active: Option<&ActiveContext>) -> f32 {
        let Some(active) = active.filter(|a| !a.is_empty()) else {
            return self.config.neutral_relevance.clamp(0.0, 1.0);
        };

        if let Some(similarity) = active.similarity(&record.id) {
            return similarity.clamp(0.0, 1.0);
        }

        let mut tokens = keyword_tokens(&record.content);
        tokens.extend(record.metadata.tags.iter().map(|t| t.to_lowercase()));
        keyword_overlap(&active.tokens, &tokens)
    }

    /// Saturating function of inbound references: n / (n + k)
    pub fn relational_factor(&self, inbound: usize) -> f32 {
        if inbound == 0 {
            return 0.0;
        }
        let n = inbound as f32;
        let k = self.config.relation_saturation.max(f32::EPSILON);
        (n / (n + k)).clamp(0.0, 1.0)
    }
}

/// Count references from live records to live records.
///
/// Ids that are not in `live` are dangling and ignored.
pub fn inbound_link_counts<'a>(
    records: impl IntoIterator<Item = (&'a Uuid, &'a std::collections::BTreeSet<Uuid>)>,
    live: &HashSet<Uuid>,
) -> HashMap<Uuid, usize> {
    let mut counts = HashMap::new();
    for (source, related) in records {
        for target in related {
            if target != source && live.contains(target) {
                *counts.entry(*target).or_insert(0) += 1;
            }
        }
    }
    counts
}
