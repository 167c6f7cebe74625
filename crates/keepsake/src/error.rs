//! Error types for Keepsake

use thiserror::Error;
use uuid::Uuid;

use crate::memory::types::TierName;
use crate::storage::tiers::TierStats;

/// Main error type for Keepsake operations
#[derive(Error, Debug)]
pub enum KeepsakeError {
    /// Storage-related errors (LanceDB, file system, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Memory operation errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// No live record with this id
    #[error("Memory not found: {0}")]
    NotFound(Uuid),

    /// A tier is full and synchronous eviction could not make room
    #[error(
        "Tier '{tier}' is at capacity ({count}/{capacity} records, mean score {mean:.2}); \
         raise the tier capacity or disable synchronous eviction",
        count = .stats.count,
        capacity = .stats.capacity,
        mean = .stats.mean_score
    )]
    CapacityExceeded { tier: TierName, stats: TierStats },

    /// A backup snapshot could not be written or read
    #[error("Backup failure: {0}")]
    BackupFailure(String),

    /// The vector index collaborator is missing or failed
    #[error("Vector index unavailable: {0}")]
    VectorIndexUnavailable(String),

    /// No confirmation decision arrived before the deadline
    #[error("Confirmation for {record} timed out, applied {decision}")]
    ConfirmationTimeout { record: Uuid, decision: String },

    /// A persisted record failed to deserialize or verify
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Plugin registration or construction errors
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

/// Result type alias for Keepsake operations
pub type Result<T> = std::result::Result<T, KeepsakeError>;
