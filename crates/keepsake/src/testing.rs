//! Test utilities for keepsake - shared config and mocks
//!
//! These are public so integration tests under `tests/` can use them:
//! - `test_config` for an in-memory store with default tiers
//! - `MockVectorIndex` with switchable availability and pinned similarities
//! - `FailingBackupStore` for injecting backup failures
//! - `InMemoryPersistence` for planting rows, corrupt ones included

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{KeepsakeError, Result};
use crate::memory::backup::BackupSnapshot;
use crate::memory::types::MemoryRecord;
use crate::storage::backup::{BackupStore, InMemoryBackupStore};
use crate::storage::persistence::{DeadLetter, LoadedRecords, RecordPersistence, decode_record};
use crate::vector::{InMemoryVectorIndex, VectorIndex, VectorMatch};

/// Default configuration with persistence switched off
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.persist = false;
    config.storage.data_dir = std::env::temp_dir().join("keepsake-test");
    config.scheduler.enabled = false;
    config
}

/// Vector index whose failures and similarities are under test control.
///
/// While similarities are pinned, `query` answers from them instead of the
/// stored vectors.
#[derive(Debug)]
pub struct MockVectorIndex {
    inner: InMemoryVectorIndex,
    available: AtomicBool,
    pinned: RwLock<HashMap<Uuid, f32>>,
    upserts: AtomicUsize,
}

impl Default for MockVectorIndex {
    fn default() -> Self {
        Self {
            inner: InMemoryVectorIndex::new(),
            available: AtomicBool::new(true),
            pinned: RwLock::new(HashMap::new()),
            upserts: AtomicUsize::new(0),
        }
    }
}

impl MockVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `query` report `similarity` for `id`
    pub async fn pin_similarity(&self, id: Uuid, similarity: f32) {
        self.pinned.write().await.insert(id, similarity);
    }

    pub async fn clear_pinned(&self) {
        self.pinned.write().await.clear();
    }

    /// Successful upserts so far
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KeepsakeError::VectorIndexUnavailable(
                "mock index switched off".to_string(),
            ))
        }
    }
}

#[async_trait]
impl VectorIndex for MockVectorIndex {
    fn name(&self) -> &str {
        "mock"
    }

    async fn upsert(&self, id: Uuid, vector: Vec<f32>, metadata: serde_json::Value) -> Result<String> {
        self.check_available()?;
        let reference = self.inner.upsert(id, vector, metadata).await?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(reference)
    }

    async fn query(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorMatch>> {
        self.check_available()?;

        let pinned = self.pinned.read().await;
        if pinned.is_empty() {
            return self.inner.query(vector, limit).await;
        }

        let mut matches: Vec<VectorMatch> = pinned
            .iter()
            .map(|(id, similarity)| VectorMatch {
                id: *id,
                similarity: *similarity,
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then(a.id.cmp(&b.id)));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.check_available()?;
        self.pinned.write().await.remove(&id);
        self.inner.remove(id).await
    }
}

/// Backup store that rejects writes while `failing` is set
#[derive(Debug, Default)]
pub struct FailingBackupStore {
    inner: InMemoryBackupStore,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FailingBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write attempts, failed ones included
    pub fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupStore for FailingBackupStore {
    async fn write_backup(&self, snapshot: &BackupSnapshot) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(KeepsakeError::Storage("backup volume unavailable".to_string()));
        }
        self.inner.write_backup(snapshot).await
    }

    async fn read_backup(&self, backup_id: Uuid) -> Result<Option<BackupSnapshot>> {
        self.inner.read_backup(backup_id).await
    }

    async fn list_backups(&self) -> Result<Vec<BackupSnapshot>> {
        self.inner.list_backups().await
    }

    async fn remove_backup(&self, backup_id: Uuid) -> Result<bool> {
        self.inner.remove_backup(backup_id).await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_older_than(cutoff).await
    }
}

/// A persisted row as `InMemoryPersistence` keeps it
#[derive(Debug, Clone)]
struct StoredRow {
    tier: String,
    checksum: String,
    payload: String,
}

/// Record persistence held in memory, decoding rows the way a durable
/// backend does
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    rows: RwLock<BTreeMap<String, StoredRow>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row exactly as given, without validation
    pub async fn plant_row(&self, id: &str, tier: &str, checksum: &str, payload: &str) {
        self.rows.write().await.insert(
            id.to_string(),
            StoredRow {
                tier: tier.to_string(),
                checksum: checksum.to_string(),
                payload: payload.to_string(),
            },
        );
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().await.clone()
    }
}

#[async_trait]
impl RecordPersistence for InMemoryPersistence {
    async fn load_records(&self) -> Result<LoadedRecords> {
        let mut loaded = LoadedRecords::default();
        for (id, row) in self.rows.read().await.iter() {
            match decode_record(id, &row.payload, &row.checksum) {
                Ok(record) => loaded.records.push(record),
                Err(e) => loaded
                    .corrupt
                    .push(DeadLetter::new(id.as_str(), row.tier.as_str(), row.payload.as_str(), &e)),
            }
        }
        Ok(loaded)
    }

    async fn upsert_records(&self, records: &[MemoryRecord]) -> Result<()> {
        let mut rows = self.rows.write().await;
        for record in records {
            let payload = serde_json::to_string(record)
                .map_err(|e| KeepsakeError::Serialization(e.to_string()))?;
            rows.insert(
                record.id.to_string(),
                StoredRow {
                    tier: record.tier.to_string(),
                    checksum: record.checksum.clone(),
                    payload,
                },
            );
        }
        Ok(())
    }

    async fn delete_records(&self, ids: &[Uuid]) -> Result<()> {
        let mut rows = self.rows.write().await;
        for id in ids {
            rows.remove(&id.to_string());
        }
        Ok(())
    }

    async fn quarantine(&self, letters: &[DeadLetter]) -> Result<()> {
        let mut rows = self.rows.write().await;
        for letter in letters {
            rows.remove(&letter.id);
        }
        self.dead_letters.write().await.extend_from_slice(letters);
        Ok(())
    }

    async fn dead_letter_count(&self) -> Result<usize> {
        Ok(self.dead_letters.read().await.len())
    }
}
