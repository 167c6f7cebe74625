//! Memory types for the Keepsake store
//!
//! Defines the record stored in each tier together with its metadata,
//! tier naming and the bookkeeping used for promotion and confirmation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::memory::value::ValueBreakdown;

/// Score given to a record before its first evaluation
pub const NEUTRAL_SCORE: f32 = 0.5;

/// Name of a retention tier.
///
/// Tiers are configurable, so this is a string newtype rather than an enum.
/// The well-known names are exposed as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierName(String);

impl TierName {
    pub const WORKING: &'static str = "working";
    pub const SHORT_TERM: &'static str = "short_term";
    pub const LONG_TERM: &'static str = "long_term";
    pub const EPISODIC: &'static str = "episodic";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TierName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TierName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl PartialEq<str> for TierName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Classification of memory content, used for the static type weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Routine conversational turns
    #[default]
    Dialogue,
    /// What happened (events, experiences)
    Episodic,
    /// Facts and knowledge
    Semantic,
    /// How to do things
    Procedural,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Dialogue => "dialogue",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dialogue" => Some(MemoryKind::Dialogue),
            "episodic" => Some(MemoryKind::Episodic),
            "semantic" => Some(MemoryKind::Semantic),
            "procedural" => Some(MemoryKind::Procedural),
            _ => None,
        }
    }
}

/// Caller-supplied description of a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Content classification
    #[serde(default)]
    pub kind: MemoryKind,
    /// Free-form data type label (e.g. `dialogue_text`, `learned_fact`)
    #[serde(default)]
    pub data_type: String,
    /// Tags used for filtering and tier classification
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Explicit tier request, honoured when the tier exists
    #[serde(default)]
    pub tier_hint: Option<TierName>,
    /// Upstream importance label in [0, 1]
    #[serde(default)]
    pub importance: Option<f32>,
    /// Never evict this record automatically
    #[serde(default)]
    pub protected: bool,
    /// Other records this one refers to
    #[serde(default)]
    pub related_ids: BTreeSet<Uuid>,
    /// Arbitrary structured attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl RecordMetadata {
    pub fn new(kind: MemoryKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tier_hint(mut self, tier: impl Into<TierName>) -> Self {
        self.tier_hint = Some(tier.into());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn related_to(mut self, id: Uuid) -> Self {
        self.related_ids.insert(id);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Deferred eviction decision attached to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Access counter for the current promotion window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessWindow {
    pub started_at: DateTime<Utc>,
    pub count: u32,
}

/// A single record stored in one of the tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier for this record
    pub id: Uuid,
    /// The stored payload
    pub content: String,
    /// Structured metadata supplied at store time
    pub metadata: RecordMetadata,
    /// Tier currently holding the record
    pub tier: TierName,
    /// When this record was created
    pub created_at: DateTime<Utc>,
    /// When this record was last accessed
    pub last_accessed_at: DateTime<Utc>,
    /// How many times this record has been accessed
    pub access_count: u64,
    /// Last computed value score in [0, 1]
    pub value_score: f32,
    /// When `value_score` was computed; `None` until the first evaluation
    pub scored_at: Option<DateTime<Utc>>,
    /// Factor values behind `value_score`
    #[serde(default)]
    pub score_breakdown: Option<ValueBreakdown>,
    /// Set while a confirmation decision is outstanding
    #[serde(default)]
    pub pending_confirmation: Option<PendingConfirmation>,
    /// Handle into the vector index
    #[serde(default)]
    pub vector_ref: Option<String>,
    /// Hex SHA-256 of `content`
    pub checksum: String,
    /// Accesses counted towards tier promotion
    pub access_window: AccessWindow,
}

impl MemoryRecord {
    /// Create a new record with a neutral, stale score
    pub fn new(content: impl Into<String>, metadata: RecordMetadata, tier: TierName) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            checksum: content_checksum(&content),
            content,
            metadata,
            tier,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            value_score: NEUTRAL_SCORE,
            scored_at: None,
            score_breakdown: None,
            pending_confirmation: None,
            vector_ref: None,
            access_window: AccessWindow {
                started_at: now,
                count: 0,
            },
        }
    }

    /// Record one access at `now`.
    ///
    /// Returns the number of accesses inside the current promotion window.
    pub fn mark_accessed(&mut self, now: DateTime<Utc>, window: Duration) -> u32 {
        self.access_count = self.access_count.saturating_add(1);
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }

        if now - self.access_window.started_at > window {
            self.access_window = AccessWindow {
                started_at: now,
                count: 0,
            };
        }
        self.access_window.count = self.access_window.count.saturating_add(1);
        self.access_window.count
    }

    /// Store a freshly computed score
    pub fn apply_score(&mut self, breakdown: ValueBreakdown, now: DateTime<Utc>) {
        self.value_score = breakdown.score.clamp(0.0, 1.0);
        self.score_breakdown = Some(breakdown);
        self.scored_at = Some(now);
    }

    /// Overwrite the score directly, e.g. from an operator tool
    pub fn set_score(&mut self, score: f32, now: DateTime<Utc>) {
        self.value_score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
        self.scored_at = Some(now);
    }

    /// True when the score was never computed or is older than `staleness`
    pub fn is_stale(&self, staleness: Duration, now: DateTime<Utc>) -> bool {
        match self.scored_at {
            Some(at) => now - at > staleness,
            None => true,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.metadata.protected
    }

    pub fn is_pending(&self) -> bool {
        self.pending_confirmation.is_some()
    }

    pub fn related_ids(&self) -> &BTreeSet<Uuid> {
        &self.metadata.related_ids
    }

    /// Check that the stored checksum still matches the content
    pub fn verify_checksum(&self) -> bool {
        self.checksum == content_checksum(&self.content)
    }
}

/// Hex encoded SHA-256 of a record's content
pub fn content_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(content: &str) -> MemoryRecord {
        MemoryRecord::new(
            content,
            RecordMetadata::new(MemoryKind::Semantic),
            TierName::from(TierName::WORKING),
        )
    }

    #[test]
    fn test_record_new_defaults() {
        let record = create_test_record("Test content");

        assert_eq!(record.value_score, NEUTRAL_SCORE);
        assert!(record.scored_at.is_none());
        assert_eq!(record.access_count, 0);
        assert!(!record.is_protected());
        assert!(!record.is_pending());
        assert!(record.verify_checksum());
        assert_eq!(record.tier.as_str(), TierName::WORKING);
    }

    #[test]
    fn test_record_serialization() {
        let metadata = RecordMetadata::new(MemoryKind::Episodic)
            .with_tag("trip")
            .with_data_type("dialogue_text")
            .with_attribute("mood", serde_json::json!("happy"));
        let record = MemoryRecord::new("Went hiking", metadata, TierName::from("episodic"));

        let json = serde_json::to_string(&record).expect("Failed to serialize record");
        let deserialized: MemoryRecord =
            serde_json::from_str(&json).expect("Failed to deserialize record");

        assert_eq!(record, deserialized);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut record = create_test_record("original");
        record.content = "tampered".to_string();
        assert!(!record.verify_checksum());
    }

    #[test]
    fn test_mark_accessed_is_monotonic() {
        let mut record = create_test_record("Test");
        let later = record.last_accessed_at + Duration::seconds(5);
        let earlier = record.last_accessed_at - Duration::seconds(5);

        record.mark_accessed(later, Duration::hours(1));
        record.mark_accessed(earlier, Duration::hours(1));

        assert_eq!(record.access_count, 2);
        assert_eq!(record.last_accessed_at, later);
    }

    #[test]
    fn test_access_window_resets() {
        let mut record = create_test_record("Test");
        let start = record.created_at;

        assert_eq!(record.mark_accessed(start, Duration::minutes(10)), 1);
        assert_eq!(record.mark_accessed(start, Duration::minutes(10)), 2);

        let outside = start + Duration::minutes(30);
        assert_eq!(record.mark_accessed(outside, Duration::minutes(10)), 1);
        assert_eq!(record.access_count, 3);
    }

    #[test]
    fn test_set_score_clamps() {
        let mut record = create_test_record("Test");
        let now = Utc::now();

        record.set_score(1.5, now);
        assert_eq!(record.value_score, 1.0);

        record.set_score(-0.2, now);
        assert_eq!(record.value_score, 0.0);

        record.set_score(f32::NAN, now);
        assert_eq!(record.value_score, 0.0);
    }

    #[test]
    fn test_staleness() {
        let mut record = create_test_record("Test");
        let now = Utc::now();
        assert!(record.is_stale(Duration::minutes(15), now));

        record.set_score(0.4, now);
        assert!(!record.is_stale(Duration::minutes(15), now));
        assert!(record.is_stale(Duration::minutes(15), now + Duration::minutes(16)));
    }

    #[test]
    fn test_memory_kind_parse() {
        assert_eq!(MemoryKind::parse("Episodic"), Some(MemoryKind::Episodic));
        assert_eq!(MemoryKind::parse("dialogue"), Some(MemoryKind::Dialogue));
        assert_eq!(MemoryKind::parse("unknown"), None);
    }
}
