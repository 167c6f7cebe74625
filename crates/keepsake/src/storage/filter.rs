//! Filter types for record queries
//!
//! All fields are optional; unset fields do not restrict the result.
//! Set fields are combined with AND logic.

use chrono::{DateTime, Utc};

use crate::memory::keywords::keyword_tokens;
use crate::memory::retrieval::searchable_tokens;
use crate::memory::types::{MemoryKind, MemoryRecord, TierName};

/// Filter criteria for `query` and retrieval.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    /// Restrict to these tiers (OR logic within this filter)
    pub tiers: Option<Vec<TierName>>,
    /// Record must carry this tag
    pub tag: Option<String>,
    /// Exact data type label
    pub data_type: Option<String>,
    /// Restrict to these kinds
    pub kinds: Option<Vec<MemoryKind>>,
    /// Only records created at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Only records created before this time
    pub until: Option<DateTime<Utc>>,
    /// Every keyword must appear in content, tags or data type
    pub keywords: Vec<String>,
    /// Minimum value score (inclusive)
    pub min_score: Option<f32>,
    pub include_protected: bool,
    pub include_pending: bool,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            tiers: None,
            tag: None,
            data_type: None,
            kinds: None,
            since: None,
            until: None,
            keywords: Vec::new(),
            min_score: None,
            include_protected: true,
            include_pending: true,
        }
    }
}

impl RecordFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_tier(mut self, tier: impl Into<TierName>) -> Self {
        self.tiers.get_or_insert_with(Vec::new).push(tier.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<MemoryKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn exclude_protected(mut self) -> Self {
        self.include_protected = false;
        self
    }

    pub fn exclude_pending(mut self) -> Self {
        self.include_pending = false;
        self
    }

    /// Whether the filter only touches tiers in `tiers`
    pub fn allows_tier(&self, tier: &TierName) -> bool {
        self.tiers
            .as_ref()
            .map(|tiers| tiers.contains(tier))
            .unwrap_or(true)
    }

    /// Check a record against every set criterion
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.allows_tier(&record.tier) {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !record.metadata.tags.contains(tag) {
                return false;
            }
        }
        if let Some(data_type) = &self.data_type {
            if &record.metadata.data_type != data_type {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&record.metadata.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at >= until {
                return false;
            }
        }
        if let Some(min_score) = self.min_score {
            if record.value_score < min_score {
                return false;
            }
        }
        if !self.include_protected && record.is_protected() {
            return false;
        }
        if !self.include_pending && record.is_pending() {
            return false;
        }
        if !self.keywords.is_empty() {
            let tokens = searchable_tokens(record);
            let lowered = record.content.to_lowercase();
            for keyword in &self.keywords {
                let wanted = keyword_tokens(keyword);
                let hit = if wanted.is_empty() {
                    lowered.contains(&keyword.to_lowercase())
                } else {
                    wanted.iter().all(|w| tokens.contains(w))
                };
                if !hit {
                    return false;
                }
            }
        }
        true
    }

    /// Check if this filter is empty (no conditions set)
    pub fn is_empty(&self) -> bool {
        self.tiers.is_none()
            && self.tag.is_none()
            && self.data_type.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.keywords.is_empty()
            && self.min_score.is_none()
            && self.include_protected
            && self.include_pending
    }
}
