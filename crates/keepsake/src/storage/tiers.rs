//! Tiered record store
//!
//! Every tier owns its records and its eviction queue behind a single
//! `RwLock`, so a queue never disagrees with the map it indexes. A `DashMap`
//! locator maps each live id to its tier. Operations that touch two tiers
//! take both locks in configuration order.
//!
//! Changes are written behind: mutations mark ids dirty or removed and
//! `flush` pushes them to the configured `RecordPersistence`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::config::{Config, TierConfig, TieringConfig, window_secs};
use crate::error::{KeepsakeError, Result};
use crate::memory::classify::TierClassifier;
use crate::memory::types::{
    AccessWindow, MemoryRecord, PendingConfirmation, RecordMetadata, TierName,
};
use crate::memory::value::{ValueBreakdown, inbound_link_counts};
use crate::storage::filter::RecordFilter;
use crate::storage::persistence::RecordPersistence;
use crate::storage::queue::EvictionPriorityQueue;

/// A record can move between locating it and locking its tier
const LOCATE_RETRIES: usize = 3;

/// Point-in-time summary of one tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: TierName,
    pub count: usize,
    pub capacity: usize,
    pub mean_score: f32,
    pub protected: usize,
    pub pending: usize,
}

impl TierStats {
    /// count / capacity
    pub fn fill_ratio(&self) -> f32 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.count as f32 / self.capacity as f32
    }

    /// Records above capacity
    pub fn excess(&self) -> usize {
        self.count.saturating_sub(self.capacity)
    }
}

/// Summary of the whole store
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub tiers: Vec<TierStats>,
    /// Rows quarantined because they could not be loaded
    pub dead_letters: usize,
    pub total: usize,
}

impl StoreStats {
    pub fn tier(&self, name: &str) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier.as_str() == name)
    }
}

/// Result of a removal that only proceeds if the record is as expected
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalRemoval {
    Removed(MemoryRecord),
    /// Accessed or moved since the snapshot was taken
    Changed,
    Protected,
    Gone,
}

#[derive(Debug, Default)]
struct TierState {
    records: HashMap<Uuid, MemoryRecord>,
    queue: EvictionPriorityQueue,
}

impl TierState {
    fn stats(&self, config: &TierConfig) -> TierStats {
        let count = self.records.len();
        let total: f32 = self.records.values().map(|r| r.value_score).sum();
        TierStats {
            tier: config.name.clone(),
            count,
            capacity: config.capacity,
            mean_score: if count == 0 { 0.0 } else { total / count as f32 },
            protected: self.records.values().filter(|r| r.is_protected()).count(),
            pending: self.records.values().filter(|r| r.is_pending()).count(),
        }
    }

    fn insert(&mut self, record: MemoryRecord) {
        if !record.is_protected() {
            self.queue
                .insert(record.id, record.value_score, record.created_at);
        }
        self.records.insert(record.id, record);
    }
}

struct Tier {
    config: TierConfig,
    state: RwLock<TierState>,
}

#[derive(Debug, Default)]
struct PendingWrites {
    dirty: HashSet<Uuid>,
    removed: HashSet<Uuid>,
}

/// Sliding window of store and access events
#[derive(Debug)]
pub struct ActivityTracker {
    window: Duration,
    events: Mutex<VecDeque<DateTime<Utc>>>,
}

impl ActivityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, at: DateTime<Utc>) {
        let mut events = self.events.lock().await;
        events.push_back(at);
        Self::prune(&mut events, at - self.window);
    }

    /// Events inside the window ending at `now`
    pub async fn count(&self, now: DateTime<Utc>) -> usize {
        let mut events = self.events.lock().await;
        Self::prune(&mut events, now - self.window);
        events.len()
    }

    fn prune(events: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while events.front().is_some_and(|at| *at < cutoff) {
            events.pop_front();
        }
    }
}

/// Lazy, restartable view over the records matching a filter.
///
/// The matching ids are fixed when the cursor is created; records are fetched
/// one at a time, so records removed in the meantime are skipped.
pub struct RecordCursor<'a> {
    store: &'a TieredMemoryStore,
    filter: RecordFilter,
    ids: Vec<Uuid>,
    position: usize,
}

impl<'a> RecordCursor<'a> {
    pub async fn next(&mut self) -> Option<MemoryRecord> {
        while self.position < self.ids.len() {
            let id = self.ids[self.position];
            self.position += 1;
            if let Some(record) = self.store.get(id).await {
                if self.filter.matches(&record) {
                    return Some(record);
                }
            }
        }
        None
    }

    /// Start again from the first match
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Number of ids matched when the cursor was created
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn into_stream(self) -> impl Stream<Item = MemoryRecord> + 'a {
        stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|record| (record, cursor))
        })
    }

    pub async fn collect_all(mut self) -> Vec<MemoryRecord> {
        let mut out = Vec::with_capacity(self.ids.len());
        while let Some(record) = self.next().await {
            out.push(record);
        }
        out
    }
}

/// In-memory tiers with write-behind persistence
pub struct TieredMemoryStore {
    tiers: Vec<Arc<Tier>>,
    index: HashMap<TierName, usize>,
    locator: DashMap<Uuid, TierName>,
    classifier: TierClassifier,
    tiering: TieringConfig,
    activity: ActivityTracker,
    persistence: Option<Arc<dyn RecordPersistence>>,
    pending: Mutex<PendingWrites>,
    dead_letters: AtomicUsize,
    pressure: Arc<Notify>,
}

impl TieredMemoryStore {
    /// Create an empty, purely in-memory store
    pub fn new(config: &Config) -> Self {
        let tiers = config
            .tiers
            .iter()
            .map(|tier| {
                Arc::new(Tier {
                    config: tier.clone(),
                    state: RwLock::new(TierState::default()),
                })
            })
            .collect();
        let index = config
            .tiers
            .iter()
            .enumerate()
            .map(|(i, tier)| (tier.name.clone(), i))
            .collect();

        Self {
            tiers,
            index,
            locator: DashMap::new(),
            classifier: TierClassifier::new(config),
            tiering: config.tiering.clone(),
            activity: ActivityTracker::new(window_secs(
                i64::try_from(config.retention.activity_window_secs).unwrap_or(i64::MAX),
            )),
            persistence: None,
            pending: Mutex::new(PendingWrites::default()),
            dead_letters: AtomicUsize::new(0),
            pressure: Arc::new(Notify::new()),
        }
    }

    /// Create a store backed by `persistence`, loading every persisted record.
    ///
    /// Rows that fail to decode or verify are quarantined and counted in
    /// `StoreStats::dead_letters`; they never abort the load.
    pub async fn open(config: &Config, persistence: Arc<dyn RecordPersistence>) -> Result<Self> {
        let mut store = Self::new(config);
        store.persistence = Some(persistence.clone());

        let loaded = persistence.load_records().await?;
        let loaded_count = loaded.records.len();

        for mut record in loaded.records {
            let relocated = !store.index.contains_key(&record.tier);
            if relocated {
                tracing::warn!(
                    "Record {} belongs to unknown tier '{}', moving it to '{}'",
                    record.id,
                    record.tier,
                    store.tiering.default_tier
                );
                record.tier = store.tiering.default_tier.clone();
            }
            let id = record.id;
            store.insert_loaded(record).await;
            if relocated {
                store.mark_dirty(id).await;
            }
        }

        if !loaded.corrupt.is_empty() {
            for letter in &loaded.corrupt {
                tracing::warn!("Quarantining record {}: {}", letter.id, letter.error);
            }
            persistence.quarantine(&loaded.corrupt).await?;
        }

        let dead = persistence.dead_letter_count().await?;
        store.dead_letters.store(dead, Ordering::Relaxed);

        tracing::info!(
            "Loaded {} records ({} quarantined this load, {} dead letters total)",
            loaded_count,
            loaded.corrupt.len(),
            dead
        );
        Ok(store)
    }

    async fn insert_loaded(&self, record: MemoryRecord) {
        let Some(tier) = self.tier(&record.tier) else {
            return;
        };
        self.locator.insert(record.id, record.tier.clone());
        tier.state.write().await.insert(record);
    }

    fn tier(&self, name: &TierName) -> Option<&Arc<Tier>> {
        self.index.get(name).map(|i| &self.tiers[*i])
    }

    fn locate(&self, id: &Uuid) -> Result<Arc<Tier>> {
        let name = self
            .locator
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(KeepsakeError::NotFound(*id))?;
        self.tier(&name)
            .cloned()
            .ok_or(KeepsakeError::NotFound(*id))
    }

    /// Run `f` on a live record under its tier's write lock
    async fn update_record<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut MemoryRecord, &mut EvictionPriorityQueue, &TierConfig) -> R,
    ) -> Result<R> {
        for _ in 0..LOCATE_RETRIES {
            let tier = self.locate(&id)?;
            let mut guard = tier.state.write().await;
            let state = &mut *guard;
            if let Some(record) = state.records.get_mut(&id) {
                return Ok(f(record, &mut state.queue, &tier.config));
            }
        }
        Err(KeepsakeError::NotFound(id))
    }

    async fn mark_dirty(&self, id: Uuid) {
        if self.persistence.is_none() {
            return;
        }
        let mut pending = self.pending.lock().await;
        pending.removed.remove(&id);
        pending.dirty.insert(id);
    }

    async fn mark_removed(&self, id: Uuid) {
        if self.persistence.is_none() {
            return;
        }
        let mut pending = self.pending.lock().await;
        pending.dirty.remove(&id);
        pending.removed.insert(id);
    }

    fn check_pressure(&self, config: &TierConfig, count: usize) {
        if count > config.capacity + self.tiering.overflow_slack {
            tracing::debug!(
                "Tier '{}' over capacity ({}/{}), waking scheduler",
                config.name,
                count,
                config.capacity
            );
            self.pressure.notify_one();
        }
    }

    async fn insert_record(&self, record: MemoryRecord, enforce_capacity: bool) -> Result<Uuid> {
        let tier = self
            .tier(&record.tier)
            .cloned()
            .ok_or_else(|| KeepsakeError::Memory(format!("Unknown tier '{}'", record.tier)))?;
        let id = record.id;

        let count = {
            let mut state = tier.state.write().await;
            if enforce_capacity
                && self.tiering.synchronous_eviction
                && state.records.len() >= tier.config.capacity
            {
                return Err(KeepsakeError::CapacityExceeded {
                    tier: tier.config.name.clone(),
                    stats: state.stats(&tier.config),
                });
            }
            self.locator.insert(id, tier.config.name.clone());
            state.insert(record);
            state.records.len()
        };

        self.mark_dirty(id).await;
        self.check_pressure(&tier.config, count);
        Ok(id)
    }

    /// Classify and store a new record, returning its id
    pub async fn store(&self, content: impl Into<String>, metadata: RecordMetadata) -> Result<Uuid> {
        let content = content.into();
        let tier = self.classifier.classify(&content, &metadata);
        let record = MemoryRecord::new(content, metadata, tier.clone());
        let id = self.insert_record(record, true).await?;
        self.activity.record(Utc::now()).await;
        tracing::debug!("Stored record {} in tier '{}'", id, tier);
        Ok(id)
    }

    /// Record an access and return the updated record.
    ///
    /// Promotes the record when it reaches the promotion threshold inside the
    /// promotion window and its tier has a `promote_to` target.
    pub async fn access(&self, id: Uuid) -> Result<MemoryRecord> {
        let now = Utc::now();
        let window = window_secs(self.tiering.promotion_window_hours.saturating_mul(3_600));

        let (record, window_count, promote_to) = self
            .update_record(id, |record, queue, config| {
                let count = record.mark_accessed(now, window);
                queue.remove(&record.id);
                (record.clone(), count, config.promote_to.clone())
            })
            .await?;

        self.mark_dirty(id).await;
        self.activity.record(now).await;

        if let Some(target) = promote_to {
            if window_count >= self.tiering.promotion_threshold {
                tracing::info!(
                    "Promoting record {} from '{}' to '{}' after {} accesses",
                    id,
                    record.tier,
                    target,
                    window_count
                );
                return self.move_to(id, &target).await;
            }
        }

        Ok(record)
    }

    /// Read a record without access bookkeeping
    pub async fn get(&self, id: Uuid) -> Option<MemoryRecord> {
        for _ in 0..LOCATE_RETRIES {
            let Ok(tier) = self.locate(&id) else {
                return None;
            };
            if let Some(record) = tier.state.read().await.records.get(&id) {
                return Some(record.clone());
            }
        }
        None
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.locator.contains_key(id)
    }

    /// Records matching `filter`, newest first
    pub async fn query(&self, filter: &RecordFilter) -> RecordCursor<'_> {
        let mut hits: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        for tier in &self.tiers {
            if !filter.allows_tier(&tier.config.name) {
                continue;
            }
            let state = tier.state.read().await;
            hits.extend(
                state
                    .records
                    .values()
                    .filter(|r| filter.matches(r))
                    .map(|r| (r.created_at, r.id)),
            );
        }
        hits.sort_by(|a, b| b.cmp(a));

        RecordCursor {
            store: self,
            filter: filter.clone(),
            ids: hits.into_iter().map(|(_, id)| id).collect(),
            position: 0,
        }
    }

    /// Hard delete, returning the removed record
    pub async fn remove(&self, id: Uuid) -> Result<MemoryRecord> {
        for _ in 0..LOCATE_RETRIES {
            let tier = self.locate(&id)?;
            let removed = {
                let mut state = tier.state.write().await;
                let removed = state.records.remove(&id);
                if removed.is_some() {
                    state.queue.remove(&id);
                    self.locator.remove(&id);
                }
                removed
            };
            if let Some(record) = removed {
                self.mark_removed(id).await;
                tracing::debug!("Removed record {} from tier '{}'", id, record.tier);
                return Ok(record);
            }
        }
        Err(KeepsakeError::NotFound(id))
    }

    /// Remove `expected.id` only if it has not been accessed, moved or
    /// protected since `expected` was read.
    pub async fn remove_if_unchanged(&self, expected: &MemoryRecord) -> ConditionalRemoval {
        let id = expected.id;
        let Ok(tier) = self.locate(&id) else {
            return ConditionalRemoval::Gone;
        };

        let removed = {
            let mut state = tier.state.write().await;
            let verdict = match state.records.get(&id) {
                None => Some(if self.locator.contains_key(&id) {
                    ConditionalRemoval::Changed
                } else {
                    ConditionalRemoval::Gone
                }),
                Some(current) if current.is_protected() => Some(ConditionalRemoval::Protected),
                Some(current)
                    if current.access_count != expected.access_count
                        || current.last_accessed_at != expected.last_accessed_at
                        || current.tier != expected.tier =>
                {
                    Some(ConditionalRemoval::Changed)
                }
                Some(_) => None,
            };
            if let Some(verdict) = verdict {
                return verdict;
            }
            let removed = state.records.remove(&id);
            state.queue.remove(&id);
            self.locator.remove(&id);
            removed
        };

        match removed {
            Some(record) => {
                self.mark_removed(id).await;
                ConditionalRemoval::Removed(record)
            }
            None => ConditionalRemoval::Gone,
        }
    }

    /// Move a record to another tier
    pub async fn move_to(&self, id: Uuid, target: &TierName) -> Result<MemoryRecord> {
        let target_idx = *self
            .index
            .get(target)
            .ok_or_else(|| KeepsakeError::Memory(format!("Unknown tier '{target}'")))?;

        for _ in 0..LOCATE_RETRIES {
            let source_name = self
                .locator
                .get(&id)
                .map(|entry| entry.value().clone())
                .ok_or(KeepsakeError::NotFound(id))?;
            let source_idx = *self
                .index
                .get(&source_name)
                .ok_or(KeepsakeError::NotFound(id))?;
            if source_idx == target_idx {
                return self.get(id).await.ok_or(KeepsakeError::NotFound(id));
            }

            let source = &self.tiers[source_idx];
            let dest = &self.tiers[target_idx];
            let (mut src, mut dst) = if source_idx < target_idx {
                let src = source.state.write().await;
                let dst = dest.state.write().await;
                (src, dst)
            } else {
                let dst = dest.state.write().await;
                let src = source.state.write().await;
                (src, dst)
            };

            let Some(mut record) = src.records.remove(&id) else {
                continue;
            };
            src.queue.remove(&id);

            record.tier = target.clone();
            record.access_window = AccessWindow {
                started_at: Utc::now(),
                count: 0,
            };
            dst.insert(record.clone());
            self.locator.insert(id, target.clone());
            let count = dst.records.len();
            drop(dst);
            drop(src);

            self.mark_dirty(id).await;
            self.check_pressure(&dest.config, count);
            tracing::debug!("Moved record {} from '{}' to '{}'", id, source_name, target);
            return Ok(record);
        }
        Err(KeepsakeError::NotFound(id))
    }

    /// Move to the tier's `promote_to` target; a no-op without one
    pub async fn promote(&self, id: Uuid) -> Result<MemoryRecord> {
        let tier = self.locate(&id)?;
        match tier.config.promote_to.clone() {
            Some(target) => self.move_to(id, &target).await,
            None => self.get(id).await.ok_or(KeepsakeError::NotFound(id)),
        }
    }

    /// Move to the tier's `demote_to` target; a no-op without one
    pub async fn demote(&self, id: Uuid) -> Result<MemoryRecord> {
        let tier = self.locate(&id)?;
        match tier.config.demote_to.clone() {
            Some(target) => self.move_to(id, &target).await,
            None => self.get(id).await.ok_or(KeepsakeError::NotFound(id)),
        }
    }

    pub async fn set_protected(&self, id: Uuid, protected: bool) -> Result<()> {
        self.update_record(id, |record, queue, _| {
            record.metadata.protected = protected;
            if protected {
                queue.remove(&record.id);
            } else {
                queue.insert(record.id, record.value_score, record.created_at);
            }
        })
        .await?;
        self.mark_dirty(id).await;
        Ok(())
    }

    /// Record that `from` refers to `to`; both must be live
    pub async fn link(&self, from: Uuid, to: Uuid) -> Result<()> {
        if from == to {
            return Err(KeepsakeError::Memory(format!(
                "Record {from} cannot be linked to itself"
            )));
        }
        if !self.contains(&to) {
            return Err(KeepsakeError::NotFound(to));
        }

        self.update_record(from, |record, _, _| {
            record.metadata.related_ids.insert(to);
        })
        .await?;
        self.mark_dirty(from).await;

        if self.tiering.symmetric_relations {
            self.update_record(to, |record, _, _| {
                record.metadata.related_ids.insert(from);
            })
            .await?;
            self.mark_dirty(to).await;
        }
        Ok(())
    }

    /// Add `by` to a numeric metadata attribute, creating it at zero
    pub async fn increment_attribute(&self, id: Uuid, field: &str, by: f64) -> Result<f64> {
        let value = self
            .update_record(id, |record, _, _| -> Result<f64> {
                let current = match record.metadata.attributes.get(field) {
                    None => 0.0,
                    Some(value) => value.as_f64().ok_or_else(|| {
                        KeepsakeError::Memory(format!(
                            "Attribute '{field}' on {} is not numeric",
                            record.id
                        ))
                    })?,
                };
                let next = current + by;
                let number = serde_json::Number::from_f64(next).ok_or_else(|| {
                    KeepsakeError::Memory(format!("Attribute '{field}' would not be finite"))
                })?;
                record
                    .metadata
                    .attributes
                    .insert(field.to_string(), Value::Number(number));
                Ok(next)
            })
            .await??;
        self.mark_dirty(id).await;
        Ok(value)
    }

    /// Overwrite a record's score
    pub async fn set_score(&self, id: Uuid, score: f32) -> Result<()> {
        let now = Utc::now();
        self.update_record(id, |record, queue, _| {
            record.set_score(score, now);
            if queue.contains(&record.id) {
                queue.insert(record.id, record.value_score, record.created_at);
            }
        })
        .await?;
        self.mark_dirty(id).await;
        Ok(())
    }

    pub async fn set_vector_ref(&self, id: Uuid, vector_ref: Option<String>) -> Result<()> {
        self.update_record(id, |record, _, _| record.vector_ref = vector_ref)
            .await?;
        self.mark_dirty(id).await;
        Ok(())
    }

    pub async fn mark_pending(&self, id: Uuid, pending: Option<PendingConfirmation>) -> Result<()> {
        self.update_record(id, |record, _, _| record.pending_confirmation = pending)
            .await?;
        self.mark_dirty(id).await;
        Ok(())
    }

    /// Put a previously removed record back, bypassing capacity checks
    pub async fn reinstate(&self, mut record: MemoryRecord) -> Result<Uuid> {
        if self.contains(&record.id) {
            return Err(KeepsakeError::Memory(format!(
                "Record {} is already live",
                record.id
            )));
        }
        if !self.index.contains_key(&record.tier) {
            tracing::warn!(
                "Restoring record {} into '{}', its tier '{}' no longer exists",
                record.id,
                self.tiering.default_tier,
                record.tier
            );
            record.tier = self.tiering.default_tier.clone();
        }
        record.pending_confirmation = None;
        self.insert_record(record, false).await
    }

    /// Refill a tier's queue from its unprotected records
    pub async fn rebuild_queue(&self, name: &TierName) -> usize {
        let Some(tier) = self.tier(name) else {
            return 0;
        };
        let mut guard = tier.state.write().await;
        let TierState { records, queue } = &mut *guard;
        queue.clear();
        for record in records.values().filter(|r| !r.is_protected()) {
            queue.insert(record.id, record.value_score, record.created_at);
        }
        queue.len()
    }

    /// Pop the lowest-valued eviction candidate from a tier
    pub async fn next_candidate(&self, name: &TierName, tolerance: f32) -> Option<MemoryRecord> {
        let tier = self.tier(name)?;
        let mut guard = tier.state.write().await;
        let TierState { records, queue } = &mut *guard;
        let entry = queue.pop_min_validated(
            |id| {
                records
                    .get(id)
                    .filter(|r| !r.is_protected())
                    .map(|r| r.value_score)
            },
            tolerance,
        )?;
        records.get(&entry.id).cloned()
    }

    /// Put records that were popped but kept back into their tier's queue
    pub async fn requeue(&self, name: &TierName, ids: &[Uuid]) {
        let Some(tier) = self.tier(name) else {
            return;
        };
        let mut guard = tier.state.write().await;
        let TierState { records, queue } = &mut *guard;
        for id in ids {
            if let Some(record) = records.get(id).filter(|r| !r.is_protected()) {
                queue.insert(record.id, record.value_score, record.created_at);
            }
        }
    }

    /// Live records whose score is older than `staleness`
    pub async fn stale_records(&self, staleness: Duration, now: DateTime<Utc>) -> Vec<MemoryRecord> {
        let mut stale = Vec::new();
        for tier in &self.tiers {
            let state = tier.state.read().await;
            stale.extend(
                state
                    .records
                    .values()
                    .filter(|r| r.is_stale(staleness, now))
                    .cloned(),
            );
        }
        stale
    }

    /// Live records with an outstanding confirmation
    pub async fn pending_records(&self) -> Vec<MemoryRecord> {
        let mut pending = Vec::new();
        for tier in &self.tiers {
            let state = tier.state.read().await;
            pending.extend(state.records.values().filter(|r| r.is_pending()).cloned());
        }
        pending
    }

    /// Store freshly computed scores; records that disappeared are skipped
    pub async fn apply_scores(&self, scores: Vec<(Uuid, ValueBreakdown)>, now: DateTime<Utc>) -> usize {
        let mut by_tier: HashMap<TierName, Vec<(Uuid, ValueBreakdown)>> = HashMap::new();
        for (id, breakdown) in scores {
            if let Some(tier) = self.locator.get(&id).map(|e| e.value().clone()) {
                by_tier.entry(tier).or_default().push((id, breakdown));
            }
        }

        let mut updated = Vec::new();
        for (name, items) in by_tier {
            let Some(tier) = self.tier(&name) else {
                continue;
            };
            let mut guard = tier.state.write().await;
            let TierState { records, queue } = &mut *guard;
            for (id, breakdown) in items {
                if let Some(record) = records.get_mut(&id) {
                    record.apply_score(breakdown, now);
                    if queue.contains(&id) {
                        queue.insert(id, record.value_score, record.created_at);
                    }
                    updated.push(id);
                }
            }
        }

        for id in &updated {
            self.mark_dirty(*id).await;
        }
        updated.len()
    }

    /// Inbound reference counts between live records
    pub async fn inbound_links(&self) -> HashMap<Uuid, usize> {
        let mut edges: Vec<(Uuid, BTreeSet<Uuid>)> = Vec::new();
        for tier in &self.tiers {
            let state = tier.state.read().await;
            edges.extend(
                state
                    .records
                    .values()
                    .filter(|r| !r.related_ids().is_empty())
                    .map(|r| (r.id, r.related_ids().clone())),
            );
        }
        let live: HashSet<Uuid> = self.locator.iter().map(|entry| *entry.key()).collect();
        inbound_link_counts(edges.iter().map(|(id, related)| (id, related)), &live)
    }

    pub async fn stats(&self) -> StoreStats {
        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            tiers.push(tier.state.read().await.stats(&tier.config));
        }
        let total = tiers.iter().map(|t| t.count).sum();
        StoreStats {
            tiers,
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            total,
        }
    }

    pub async fn tier_stats(&self, name: &TierName) -> Option<TierStats> {
        let tier = self.tier(name)?;
        let stats = tier.state.read().await.stats(&tier.config);
        Some(stats)
    }

    /// Tier names in configuration order
    pub fn tier_names(&self) -> Vec<TierName> {
        self.tiers.iter().map(|t| t.config.name.clone()).collect()
    }

    pub fn tier_config(&self, name: &TierName) -> Option<&TierConfig> {
        self.tier(name).map(|t| &t.config)
    }

    pub fn len(&self) -> usize {
        self.locator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locator.is_empty()
    }

    /// Store and access events inside the activity window
    pub async fn activity_count(&self, now: DateTime<Utc>) -> usize {
        self.activity.count(now).await
    }

    /// Notified when a tier grows past capacity plus slack
    pub fn pressure_signal(&self) -> Arc<Notify> {
        self.pressure.clone()
    }

    /// Number of ids waiting to be written or deleted
    pub async fn pending_writes(&self) -> usize {
        let pending = self.pending.lock().await;
        pending.dirty.len() + pending.removed.len()
    }

    /// Write pending changes to persistence, returning the number of rows touched
    pub async fn flush(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };

        let (dirty, removed) = {
            let mut pending = self.pending.lock().await;
            (
                std::mem::take(&mut pending.dirty),
                std::mem::take(&mut pending.removed),
            )
        };
        if dirty.is_empty() && removed.is_empty() {
            return Ok(0);
        }

        let mut records = Vec::with_capacity(dirty.len());
        for id in &dirty {
            if let Some(record) = self.get(*id).await {
                records.push(record);
            }
        }
        let removed_ids: Vec<Uuid> = removed.iter().copied().collect();

        let result = async {
            if !records.is_empty() {
                persistence.upsert_records(&records).await?;
            }
            if !removed_ids.is_empty() {
                persistence.delete_records(&removed_ids).await?;
            }
            Ok::<(), KeepsakeError>(())
        }
        .await;

        if let Err(e) = result {
            let mut pending = self.pending.lock().await;
            for id in dirty {
                if !pending.removed.contains(&id) {
                    pending.dirty.insert(id);
                }
            }
            for id in removed {
                if !pending.dirty.contains(&id) {
                    pending.removed.insert(id);
                }
            }
            return Err(e);
        }

        tracing::debug!(
            "Flushed {} records and {} deletions",
            records.len(),
            removed_ids.len()
        );
        Ok(records.len() + removed_ids.len())
    }
}
