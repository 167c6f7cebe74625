//! Initial tier placement for new records

use std::collections::BTreeSet;

use crate::config::{Config, TieringConfig};
use crate::memory::types::{MemoryKind, RecordMetadata, TierName};

/// Picks the tier a new record is stored in
#[derive(Debug, Clone)]
pub struct TierClassifier {
    config: TieringConfig,
    tiers: BTreeSet<TierName>,
    keywords: Vec<String>,
}

impl TierClassifier {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.tiering.clone(),
            tiers: config.tiers.iter().map(|t| t.name.clone()).collect(),
            keywords: config
                .tiering
                .long_term_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    /// Classify in order: explicit hint, tier-named tag, episodic kind,
    /// long-term keywords or length, then the default tier.
    pub fn classify(&self, content: &str, metadata: &RecordMetadata) -> TierName {
        if let Some(hint) = &metadata.tier_hint {
            if self.tiers.contains(hint) {
                return hint.clone();
            }
            tracing::warn!("Unknown tier hint '{}', using classification rules", hint);
        }

        if let Some(tag) = metadata
            .tags
            .iter()
            .find(|tag| self.tiers.contains(&TierName::new(tag.as_str())))
        {
            return TierName::new(tag.as_str());
        }

        if metadata.kind == MemoryKind::Episodic && self.tiers.contains(&self.config.episodic_tier)
        {
            return self.config.episodic_tier.clone();
        }

        if self.tiers.contains(&self.config.long_term_tier) && self.is_long_term(content) {
            return self.config.long_term_tier.clone();
        }

        self.config.default_tier.clone()
    }

    fn is_long_term(&self, content: &str) -> bool {
        if content.chars().count() > self.config.long_content_chars {
            return true;
        }
        let lowered = content.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TierClassifier {
        TierClassifier::new(&Config::default())
    }

    #[test]
    fn test_hint_wins_when_tier_exists() {
        let metadata = RecordMetadata::new(MemoryKind::Episodic).with_tier_hint("short_term");
        assert_eq!(
            classifier().classify("we went to the lake", &metadata).as_str(),
            "short_term"
        );
    }

    #[test]
    fn test_unknown_hint_falls_through() {
        let metadata = RecordMetadata::new(MemoryKind::Dialogue).with_tier_hint("attic");
        assert_eq!(
            classifier().classify("hello", &metadata).as_str(),
            TierName::WORKING
        );
    }

    #[test]
    fn test_tag_matching_tier_name() {
        let metadata = RecordMetadata::new(MemoryKind::Dialogue).with_tag("long_term");
        assert_eq!(
            classifier().classify("hello", &metadata).as_str(),
            TierName::LONG_TERM
        );
    }

    #[test]
    fn test_episodic_kind() {
        let metadata = RecordMetadata::new(MemoryKind::Episodic);
        assert_eq!(
            classifier().classify("we went to the lake", &metadata).as_str(),
            TierName::EPISODIC
        );
    }

    #[test]
    fn test_keywords_and_length_route_long_term() {
        let c = classifier();
        let metadata = RecordMetadata::new(MemoryKind::Semantic);

        assert_eq!(
            c.classify("Please REMEMBER my birthday", &metadata).as_str(),
            TierName::LONG_TERM
        );

        let long = "x".repeat(501);
        assert_eq!(c.classify(&long, &metadata).as_str(), TierName::LONG_TERM);
        assert_eq!(
            c.classify("short note", &metadata).as_str(),
            TierName::WORKING
        );
    }
}
