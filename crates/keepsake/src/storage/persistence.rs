//! Durable storage seam for the tiered store
//!
//! The store keeps every live record in memory and writes changes behind to a
//! `RecordPersistence` implementation on `flush`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KeepsakeError, Result};
use crate::memory::types::MemoryRecord;

/// A persisted row that could not be turned back into a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub tier: String,
    pub payload: String,
    pub error: String,
    pub quarantined_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        id: impl Into<String>,
        tier: impl Into<String>,
        payload: impl Into<String>,
        error: &KeepsakeError,
    ) -> Self {
        Self {
            id: id.into(),
            tier: tier.into(),
            payload: payload.into(),
            error: error.to_string(),
            quarantined_at: Utc::now(),
        }
    }
}

/// Result of loading all persisted records
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<MemoryRecord>,
    /// Rows that failed to decode or verify; not yet quarantined
    pub corrupt: Vec<DeadLetter>,
}

#[async_trait]
pub trait RecordPersistence: Send + Sync {
    async fn load_records(&self) -> Result<LoadedRecords>;

    /// Insert or replace records by id
    async fn upsert_records(&self, records: &[MemoryRecord]) -> Result<()>;

    async fn delete_records(&self, ids: &[Uuid]) -> Result<()>;

    /// Move rows into the dead letter table and drop them from the record table
    async fn quarantine(&self, letters: &[DeadLetter]) -> Result<()>;

    async fn dead_letter_count(&self) -> Result<usize>;
}

/// Decode a persisted payload and verify its checksum
pub fn decode_record(id: &str, payload: &str, checksum: &str) -> Result<MemoryRecord> {
    let record: MemoryRecord =
        serde_json::from_str(payload).map_err(|e| KeepsakeError::CorruptRecord {
            id: id.to_string(),
            reason: format!("invalid payload: {e}"),
        })?;

    if record.id.to_string() != id {
        return Err(KeepsakeError::CorruptRecord {
            id: id.to_string(),
            reason: format!("payload belongs to {}", record.id),
        });
    }

    if record.checksum != checksum || !record.verify_checksum() {
        return Err(KeepsakeError::CorruptRecord {
            id: id.to_string(),
            reason: "checksum mismatch".to_string(),
        });
    }

    Ok(record)
}
