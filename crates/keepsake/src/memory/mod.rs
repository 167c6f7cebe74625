//! Memory types and operations
//!
//! Records, their value scoring, tier classification and retrieval ranking.

pub mod backup;
pub mod classify;
pub mod keywords;
pub mod retrieval;
pub mod types;
pub mod value;

pub use backup::{BackupReason, BackupSnapshot};
pub use classify::TierClassifier;
pub use retrieval::{RetrievalRanker, RetrievedMemory};
pub use types::{
    MemoryKind, MemoryRecord, PendingConfirmation, RecordMetadata, TierName, NEUTRAL_SCORE,
};
pub use value::{
    ActiveContext, EvaluationContext, ScoringWeights, StrategyProfile, ValueBreakdown,
    ValueEvaluationEngine,
};
