//! Backup storage and the manager that owns backup-before-delete
//!
//! No record leaves the store without a snapshot written here first. The
//! manager turns every backend error into `BackupFailure` so callers can tell
//! "could not back up" apart from other storage failures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{BackupConfig, window_secs};
use crate::error::{KeepsakeError, Result};
use crate::memory::backup::{BackupReason, BackupSnapshot};
use crate::memory::types::MemoryRecord;

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn write_backup(&self, snapshot: &BackupSnapshot) -> Result<()>;

    async fn read_backup(&self, backup_id: Uuid) -> Result<Option<BackupSnapshot>>;

    /// All snapshots, newest first
    async fn list_backups(&self) -> Result<Vec<BackupSnapshot>>;

    /// Returns whether a snapshot was removed
    async fn remove_backup(&self, backup_id: Uuid) -> Result<bool>;

    /// Remove snapshots taken before `cutoff`, returning how many were removed
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Volatile backup store for tests and `persist = false`
#[derive(Debug, Default)]
pub struct InMemoryBackupStore {
    snapshots: RwLock<HashMap<Uuid, BackupSnapshot>>,
}

impl InMemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn write_backup(&self, snapshot: &BackupSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.backup_id, snapshot.clone());
        Ok(())
    }

    async fn read_backup(&self, backup_id: Uuid) -> Result<Option<BackupSnapshot>> {
        Ok(self.snapshots.read().await.get(&backup_id).cloned())
    }

    async fn list_backups(&self) -> Result<Vec<BackupSnapshot>> {
        let mut all: Vec<BackupSnapshot> = self.snapshots.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn remove_backup(&self, backup_id: Uuid) -> Result<bool> {
        Ok(self.snapshots.write().await.remove(&backup_id).is_some())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|_, s| !s.is_older_than(cutoff));
        Ok(before - snapshots.len())
    }
}

/// Writes, restores and expires record backups
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<dyn BackupStore>,
    ttl: Duration,
}

impl BackupManager {
    pub fn new(store: Arc<dyn BackupStore>, config: &BackupConfig) -> Self {
        Self {
            store,
            ttl: window_secs(config.ttl_days.saturating_mul(86_400)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write a snapshot of `record`; the caller may delete it only on success
    pub async fn snapshot(&self, record: &MemoryRecord, reason: BackupReason) -> Result<Uuid> {
        let snapshot = BackupSnapshot::new(record.clone(), reason);
        self.store
            .write_backup(&snapshot)
            .await
            .map_err(|e| {
                KeepsakeError::BackupFailure(format!("Failed to back up {}: {}", record.id, e))
            })?;
        tracing::debug!(
            "Backed up record {} as {} ({})",
            record.id,
            snapshot.backup_id,
            reason
        );
        Ok(snapshot.backup_id)
    }

    /// Fetch the record stored in a snapshot
    pub async fn restore(&self, backup_id: Uuid) -> Result<MemoryRecord> {
        let snapshot = self
            .store
            .read_backup(backup_id)
            .await
            .map_err(|e| KeepsakeError::BackupFailure(e.to_string()))?
            .ok_or(KeepsakeError::NotFound(backup_id))?;
        Ok(snapshot.record)
    }

    pub async fn get(&self, backup_id: Uuid) -> Result<Option<BackupSnapshot>> {
        self.store
            .read_backup(backup_id)
            .await
            .map_err(|e| KeepsakeError::BackupFailure(e.to_string()))
    }

    /// Drop snapshots older than the configured TTL
    pub async fn purge_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.ttl;
        let purged = self
            .store
            .purge_older_than(cutoff)
            .await
            .map_err(|e| KeepsakeError::BackupFailure(e.to_string()))?;
        if purged > 0 {
            tracing::info!("Purged {} expired backups", purged);
        }
        Ok(purged)
    }

    /// Remove a snapshot whose deletion did not go ahead
    pub async fn discard(&self, backup_id: Uuid) -> Result<bool> {
        self.store
            .remove_backup(backup_id)
            .await
            .map_err(|e| KeepsakeError::BackupFailure(e.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<BackupSnapshot>> {
        self.store
            .list_backups()
            .await
            .map_err(|e| KeepsakeError::BackupFailure(e.to_string()))
    }

    /// Snapshots of one original record, newest first
    pub async fn for_record(&self, original_id: Uuid) -> Result<Vec<BackupSnapshot>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.original_id == original_id)
            .collect())
    }
}
