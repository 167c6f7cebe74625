//! Background eviction cycle
//!
//! One cycle walks `Scoring -> Prioritizing -> Evicting -> Idle`:
//!
//! 1. stale scores are recomputed against the active context,
//! 2. every tier over its eviction ratio (or over capacity) gets a fresh queue,
//! 3. candidates are popped lowest-value first and pass the confirmation
//!    gate, a backup, and a conditional removal.
//!
//! Records above capacity are removed regardless of threshold; below that,
//! only records scoring under the threshold go, and only a bounded number
//! per cycle. Anything kept or deferred is requeued for the next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{SchedulerConfig, window_secs};
use crate::eviction::confirmation::{ConfirmationGate, ConfirmationOutcome};
use crate::eviction::retention::{RetentionFactors, RetentionPolicyController};
use crate::memory::backup::BackupReason;
use crate::memory::types::{MemoryRecord, PendingConfirmation, TierName};
use crate::memory::value::{ActiveContext, EvaluationContext, ValueEvaluationEngine};
use crate::storage::backup::BackupManager;
use crate::storage::tiers::{ConditionalRemoval, TierStats, TieredMemoryStore};
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum SchedulerPhase {
    Idle,
    Scoring,
    Prioritizing,
    Evicting { batch: usize },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeptReason {
    Denied,
    /// Accessed or moved between selection and removal
    Reaccessed,
    Protected,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredReason {
    ConfirmationPending,
    BackupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EvictionOutcome {
    Deleted { backup_id: Uuid },
    Kept { reason: KeptReason },
    Deferred { reason: DeferredReason },
}

/// What happened to one candidate
#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub record_id: Uuid,
    pub tier: TierName,
    pub score: f32,
    /// Removed because the tier was over capacity rather than for a low score
    pub forced: bool,
    pub outcome: EvictionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierCycleReport {
    pub tier: TierName,
    pub factors: RetentionFactors,
    pub count_before: usize,
    pub count_after: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rescored: usize,
    pub tiers: Vec<TierCycleReport>,
    pub candidates: Vec<CandidateResult>,
    pub backups_purged: usize,
    pub rows_flushed: usize,
    /// Stopped early by a shutdown request
    pub interrupted: bool,
}

impl CycleReport {
    fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            finished_at: started_at,
            rescored: 0,
            tiers: Vec::new(),
            candidates: Vec::new(),
            backups_purged: 0,
            rows_flushed: 0,
            interrupted: false,
        }
    }

    pub fn deleted(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| matches!(c.outcome, EvictionOutcome::Deleted { .. }))
            .count()
    }

    pub fn kept(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| matches!(c.outcome, EvictionOutcome::Kept { .. }))
            .count()
    }

    pub fn deferred(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| matches!(c.outcome, EvictionOutcome::Deferred { .. }))
            .count()
    }

    pub fn outcome_for(&self, id: Uuid) -> Option<EvictionOutcome> {
        self.candidates
            .iter()
            .find(|c| c.record_id == id)
            .map(|c| c.outcome)
    }

    pub fn tier(&self, name: &str) -> Option<&TierCycleReport> {
        self.tiers.iter().find(|t| t.tier == *name)
    }
}

/// `max(min_interval, interval - records * step)` when adaptive
pub fn cycle_interval(config: &SchedulerConfig, records: usize) -> StdDuration {
    let base = config.interval_secs.max(1);
    if !config.adaptive_interval {
        return StdDuration::from_secs(base);
    }
    let reduction = config.interval_step_secs.saturating_mul(records as u64);
    let floor = config.min_interval_secs.max(1).min(base);
    StdDuration::from_secs(base.saturating_sub(reduction).max(floor))
}

pub struct EvictionScheduler {
    config: SchedulerConfig,
    store: Arc<TieredMemoryStore>,
    engine: ValueEvaluationEngine,
    retention: Arc<RetentionPolicyController>,
    backups: BackupManager,
    gate: Arc<ConfirmationGate>,
    vectors: Option<Arc<dyn VectorIndex>>,
    context: Arc<RwLock<Option<ActiveContext>>>,
    running: Mutex<()>,
    phase: watch::Sender<SchedulerPhase>,
    cycles: AtomicU64,
}

impl EvictionScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<TieredMemoryStore>,
        engine: ValueEvaluationEngine,
        retention: Arc<RetentionPolicyController>,
        backups: BackupManager,
        gate: Arc<ConfirmationGate>,
    ) -> Self {
        let (phase, _) = watch::channel(SchedulerPhase::Idle);
        Self {
            config,
            store,
            engine,
            retention,
            backups,
            gate,
            vectors: None,
            context: Arc::new(RwLock::new(None)),
            running: Mutex::new(()),
            phase,
            cycles: AtomicU64::new(0),
        }
    }

    /// Remove vector entries of evicted records from this index
    pub fn with_vector_index(mut self, vectors: Option<Arc<dyn VectorIndex>>) -> Self {
        self.vectors = vectors;
        self
    }

    /// Share the active context used when rescoring
    pub fn with_context(mut self, context: Arc<RwLock<Option<ActiveContext>>>) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase.subscribe()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn next_interval(&self) -> StdDuration {
        cycle_interval(&self.config, self.store.len())
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        self.phase.send_replace(phase);
    }

    /// Run one full cycle, waiting for a running one to finish first
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.running.lock().await;
        self.cycle(None, 0, None).await
    }

    /// Run one cycle unless one is already in progress
    pub async fn try_run_cycle(&self) -> Option<CycleReport> {
        let _guard = self.running.try_lock().ok()?;
        Some(self.cycle(None, 0, None).await)
    }

    /// Cycle over a single tier that also frees `reserve` extra slots.
    ///
    /// Used before retrying a store that hit `CapacityExceeded`.
    pub async fn run_tier_cycle(&self, tier: &TierName, reserve: usize) -> CycleReport {
        let _guard = self.running.lock().await;
        self.cycle(Some(tier), reserve, None).await
    }

    async fn cycle(
        &self,
        scope: Option<&TierName>,
        reserve: usize,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> CycleReport {
        let now = Utc::now();
        let cycle = self.cycles.load(Ordering::Relaxed) + 1;
        let mut report = CycleReport::new(cycle, now);
        let tiers: Vec<TierName> = match scope {
            Some(tier) => vec![tier.clone()],
            None => self.store.tier_names(),
        };

        self.set_phase(SchedulerPhase::Scoring);
        report.rescored = self.rescore(scope, now).await;

        self.set_phase(SchedulerPhase::Prioritizing);
        let interactions = self.store.activity_count(now).await;
        let mut targets: Vec<(TierStats, RetentionFactors)> = Vec::new();
        for name in &tiers {
            let Some(mut stats) = self.store.tier_stats(name).await else {
                continue;
            };
            let factors = self.retention.factors(&stats, interactions);
            // Reserved slots count as occupied so the tier is cut below capacity
            stats.count += reserve;
            if !self.retention.is_eviction_target(&stats) {
                report.tiers.push(TierCycleReport {
                    tier: name.clone(),
                    factors,
                    count_before: stats.count - reserve,
                    count_after: stats.count - reserve,
                    capacity: stats.capacity,
                });
                continue;
            }
            let queued = self.store.rebuild_queue(name).await;
            tracing::debug!(
                "Tier '{}' queued {} candidates (fill {:.2}, threshold {:.3}, status {})",
                name,
                queued,
                stats.fill_ratio(),
                factors.threshold,
                factors.status.as_str()
            );
            targets.push((stats, factors));
        }

        let mut processed = 0usize;
        let mut batch = 0usize;
        self.set_phase(SchedulerPhase::Evicting { batch });
        'tiers: for (stats, factors) in targets {
            let tier = stats.tier.clone();
            let threshold = factors.threshold;
            let mut excess = stats.excess();
            let live = stats.count.saturating_sub(reserve);
            let mut discretionary = self
                .config
                .discretionary_floor
                .max((live as f32 * self.config.discretionary_fraction) as usize);
            let mut requeue = Vec::new();

            loop {
                if processed > 0 && processed % self.config.batch_size.max(1) == 0 {
                    if shutdown.is_some_and(|rx| *rx.borrow()) {
                        report.interrupted = true;
                        self.store.requeue(&tier, &requeue).await;
                        self.push_tier_report(&mut report, &stats, reserve, factors).await;
                        break 'tiers;
                    }
                    batch += 1;
                    self.set_phase(SchedulerPhase::Evicting { batch });
                    tokio::task::yield_now().await;
                }

                let Some(candidate) = self
                    .store
                    .next_candidate(&tier, self.config.requeue_tolerance)
                    .await
                else {
                    break;
                };

                let forced = excess > 0;
                let below = candidate.value_score < threshold;
                if !forced && (!below || discretionary == 0) {
                    requeue.push(candidate.id);
                    break;
                }

                let outcome = self.evict_candidate(&candidate, threshold).await;
                match outcome {
                    EvictionOutcome::Deleted { .. }
                    | EvictionOutcome::Kept {
                        reason: KeptReason::Gone,
                    } => {
                        if forced {
                            excess -= 1;
                        } else {
                            discretionary -= 1;
                        }
                    }
                    _ => requeue.push(candidate.id),
                }
                report.candidates.push(CandidateResult {
                    record_id: candidate.id,
                    tier: tier.clone(),
                    score: candidate.value_score,
                    forced,
                    outcome,
                });
                processed += 1;
            }

            self.store.requeue(&tier, &requeue).await;
            if excess > 0 {
                tracing::warn!(
                    "Tier '{}' still {} over capacity; remaining records are protected, denied or pending",
                    tier,
                    excess
                );
            }
            self.push_tier_report(&mut report, &stats, reserve, factors)
                .await;
        }

        match self.backups.purge_expired().await {
            Ok(purged) => report.backups_purged = purged,
            Err(e) => tracing::warn!("Backup purge failed: {}", e),
        }
        match self.store.flush().await {
            Ok(rows) => report.rows_flushed = rows,
            Err(e) => tracing::warn!("Flush after eviction cycle failed: {}", e),
        }

        report.finished_at = Utc::now();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.set_phase(SchedulerPhase::Idle);
        tracing::info!(
            "Eviction cycle {} done: rescored {}, deleted {}, kept {}, deferred {}",
            cycle,
            report.rescored,
            report.deleted(),
            report.kept(),
            report.deferred()
        );
        report
    }

    async fn push_tier_report(
        &self,
        report: &mut CycleReport,
        stats: &TierStats,
        reserve: usize,
        factors: RetentionFactors,
    ) {
        let count_after = self
            .store
            .tier_stats(&stats.tier)
            .await
            .map(|s| s.count)
            .unwrap_or(0);
        report.tiers.push(TierCycleReport {
            tier: stats.tier.clone(),
            factors,
            count_before: stats.count.saturating_sub(reserve),
            count_after,
            capacity: stats.capacity,
        });
    }

    /// Recompute scores older than the staleness window
    async fn rescore(&self, scope: Option<&TierName>, now: DateTime<Utc>) -> usize {
        let staleness = window_secs(self.config.staleness_secs);
        let stale: Vec<MemoryRecord> = self
            .store
            .stale_records(staleness, now)
            .await
            .into_iter()
            .filter(|r| scope.is_none_or(|tier| r.tier == *tier))
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let inbound = self.store.inbound_links().await;
        let active = self.context.read().await.clone();
        let ctx = EvaluationContext {
            active: active.as_ref(),
            inbound_links: &inbound,
            profile: self.retention.strategy_profile(),
            now,
        };
        let scores = stale
            .iter()
            .map(|record| (record.id, self.engine.evaluate(record, &ctx)))
            .collect();
        self.store.apply_scores(scores, now).await
    }

    /// Gate, back up, then conditionally remove one record
    async fn evict_candidate(&self, candidate: &MemoryRecord, threshold: f32) -> EvictionOutcome {
        let id = candidate.id;
        match self.gate.request_confirmation(candidate, threshold).await {
            ConfirmationOutcome::Approved => {}
            ConfirmationOutcome::Denied => {
                self.clear_pending(candidate).await;
                return EvictionOutcome::Kept {
                    reason: KeptReason::Denied,
                };
            }
            ConfirmationOutcome::Pending {
                requested_at,
                deadline,
            } => {
                let pending = PendingConfirmation {
                    requested_at,
                    deadline,
                };
                if candidate.pending_confirmation != Some(pending) {
                    if let Err(e) = self.store.mark_pending(id, Some(pending)).await {
                        tracing::debug!("Could not mark {} pending: {}", id, e);
                    }
                }
                return EvictionOutcome::Deferred {
                    reason: DeferredReason::ConfirmationPending,
                };
            }
        }

        let mut snapshot = candidate.clone();
        snapshot.pending_confirmation = None;
        let backup_id = match self.backups.snapshot(&snapshot, BackupReason::AutoEvict).await {
            Ok(backup_id) => backup_id,
            Err(e) => {
                tracing::warn!("Not evicting {}: {}", id, e);
                return EvictionOutcome::Deferred {
                    reason: DeferredReason::BackupFailed,
                };
            }
        };

        let reason = match self.store.remove_if_unchanged(candidate).await {
            ConditionalRemoval::Removed(_) => {
                self.gate.forget(id).await;
                if let Some(vectors) = &self.vectors {
                    if let Err(e) = vectors.remove(id).await {
                        tracing::warn!("Failed to remove vector for evicted {}: {}", id, e);
                    }
                }
                tracing::debug!(
                    "Evicted {} from '{}' (score {:.3}, backup {})",
                    id,
                    candidate.tier,
                    candidate.value_score,
                    backup_id
                );
                return EvictionOutcome::Deleted { backup_id };
            }
            ConditionalRemoval::Changed => KeptReason::Reaccessed,
            ConditionalRemoval::Protected => KeptReason::Protected,
            ConditionalRemoval::Gone => KeptReason::Gone,
        };

        if let Err(e) = self.backups.discard(backup_id).await {
            tracing::warn!("Failed to discard unused backup {}: {}", backup_id, e);
        }
        if reason != KeptReason::Gone {
            self.clear_pending(candidate).await;
        }
        EvictionOutcome::Kept { reason }
    }

    async fn clear_pending(&self, record: &MemoryRecord) {
        if record.is_pending() {
            if let Err(e) = self.store.mark_pending(record.id, None).await {
                tracing::debug!("Could not clear pending state of {}: {}", record.id, e);
            }
        }
    }

    /// Write outstanding confirmations onto their records and flush
    async fn persist_state(&self) {
        for (id, requested_at, deadline) in self.gate.pending_deadlines().await {
            let pending = PendingConfirmation {
                requested_at,
                deadline,
            };
            if let Err(e) = self.store.mark_pending(id, Some(pending)).await {
                tracing::debug!("Pending record {} vanished before shutdown: {}", id, e);
            }
        }
        if let Err(e) = self.store.flush().await {
            tracing::warn!("Final flush failed: {}", e);
        }
    }

    /// Start the background task
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let phase = self.subscribe();
        let scheduler = self.clone();
        let join = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        SchedulerHandle {
            shutdown: shutdown_tx,
            phase,
            join,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let pressure = self.store.pressure_signal();
        tracing::info!(
            "Eviction scheduler started (next cycle in {:?})",
            self.next_interval()
        );

        loop {
            let interval = self.next_interval();
            let trigger = tokio::select! {
                _ = tokio::time::sleep(interval) => "interval",
                _ = pressure.notified() => "capacity pressure",
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            if *shutdown.borrow() {
                break;
            }

            tracing::debug!("Eviction cycle triggered by {}", trigger);
            let interrupted = match self.running.try_lock() {
                Ok(_guard) => {
                    let report = self.cycle(None, 0, Some(&shutdown)).await;
                    report.interrupted
                }
                Err(_) => {
                    tracing::debug!("Eviction cycle already running, skipping trigger");
                    false
                }
            };
            if interrupted {
                break;
            }
        }

        let _guard = self.running.lock().await;
        self.persist_state().await;
        self.set_phase(SchedulerPhase::Stopped);
        tracing::info!("Eviction scheduler stopped");
    }
}

/// Owner of a running scheduler task
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    phase: watch::Receiver<SchedulerPhase>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase.clone()
    }

    /// Ask the task to stop after its current batch and wait for it
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.join.await {
            tracing::warn!("Eviction scheduler task failed: {}", e);
        }
    }
}
