//! Backup snapshots of removed records
//!
//! Every record that leaves the store through eviction, age cleanup or an
//! operator delete is first captured here so it can be restored until the
//! snapshot expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::memory::types::MemoryRecord;

/// Full copy of a record taken just before removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Identifier of this snapshot
    pub backup_id: Uuid,
    /// Identifier of the record that was backed up
    pub original_id: Uuid,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Why the record was removed
    pub reason: BackupReason,
    /// The record as it was at snapshot time
    pub record: MemoryRecord,
}

/// Why a record was backed up and removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    /// Removed by the eviction scheduler
    AutoEvict,
    /// Removed by age-based cleanup
    AgeCleanup,
    /// Deleted by an operator
    ManualDelete,
}

impl BackupSnapshot {
    pub fn new(record: MemoryRecord, reason: BackupReason) -> Self {
        Self {
            backup_id: Uuid::new_v4(),
            original_id: record.id,
            created_at: Utc::now(),
            reason,
            record,
        }
    }

    /// True when the snapshot was taken before `cutoff`
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at < cutoff
    }
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::AutoEvict => "auto_evict",
            BackupReason::AgeCleanup => "age_cleanup",
            BackupReason::ManualDelete => "manual_delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto_evict" => Some(BackupReason::AutoEvict),
            "age_cleanup" => Some(BackupReason::AgeCleanup),
            "manual_delete" => Some(BackupReason::ManualDelete),
            _ => None,
        }
    }
}

impl fmt::Display for BackupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
