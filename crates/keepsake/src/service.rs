//! The public face of the library
//!
//! `MemoryService` wires the tiered store to scoring, eviction, backups and the
//! optional vector index. Foreground calls never wait on the scheduler except
//! when synchronous eviction is on and a tier is full, in which case one
//! targeted cycle runs before the store is retried once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{KeepsakeError, Result};
use crate::eviction::confirmation::{ConfirmationGate, ConfirmationRequest};
use crate::eviction::retention::{
    ProfileProvider, RetentionFactors, RetentionPolicyController, SharedProfile, SystemLoadProbe,
};
use crate::eviction::scheduler::{CycleReport, EvictionScheduler, SchedulerHandle};
use crate::memory::backup::{BackupReason, BackupSnapshot};
use crate::memory::keywords::keyword_tokens;
use crate::memory::retrieval::{RetrievalRanker, RetrievedMemory};
use crate::memory::types::{MemoryRecord, RecordMetadata, TierName};
use crate::memory::value::{ActiveContext, ValueEvaluationEngine};
use crate::plugins::{PluginContext, PluginRegistry};
use crate::storage::backup::{BackupManager, BackupStore, InMemoryBackupStore};
use crate::storage::codec::PayloadCodec;
use crate::storage::filter::RecordFilter;
use crate::storage::lance::LanceStore;
use crate::storage::persistence::RecordPersistence;
use crate::storage::tiers::{ConditionalRemoval, StoreStats, TieredMemoryStore};
use crate::vector::{Embedder, VectorIndex};

/// Builds a `MemoryService` from a `Config` and optional overrides
pub struct ServiceBuilder {
    config: Config,
    registry: PluginRegistry,
    vectors: Option<Option<Arc<dyn VectorIndex>>>,
    embedder: Option<Arc<dyn Embedder>>,
    profile: Option<Arc<dyn ProfileProvider>>,
    load_probe: Option<Arc<dyn SystemLoadProbe>>,
    backup_store: Option<Arc<dyn BackupStore>>,
    persistence: Option<Arc<dyn RecordPersistence>>,
}

impl ServiceBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: PluginRegistry::with_defaults(),
            vectors: None,
            embedder: None,
            profile: None,
            load_probe: None,
            backup_store: None,
            persistence: None,
        }
    }

    /// Use a registry with extra plugins registered
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use this index instead of the configured backend
    pub fn vector_index(mut self, vectors: Arc<dyn VectorIndex>) -> Self {
        self.vectors = Some(Some(vectors));
        self
    }

    /// Run on keyword relevance only
    pub fn without_vector_index(mut self) -> Self {
        self.vectors = Some(None);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn profile_provider(mut self, profile: Arc<dyn ProfileProvider>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn load_probe(mut self, probe: Arc<dyn SystemLoadProbe>) -> Self {
        self.load_probe = Some(probe);
        self
    }

    pub fn backup_store(mut self, store: Arc<dyn BackupStore>) -> Self {
        self.backup_store = Some(store);
        self
    }

    /// Load and flush records through `persistence` instead of LanceDB.
    /// Backups stay in memory unless a backup store is also given.
    pub fn persistence(mut self, persistence: Arc<dyn RecordPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Build a service whose confirmation gate applies its default policy
    pub async fn build(self) -> Result<MemoryService> {
        let (service, _) = self.assemble(false).await?;
        Ok(service)
    }

    /// Build a service plus the receiving end of its confirmation channel
    pub async fn build_with_confirmations(
        self,
    ) -> Result<(MemoryService, mpsc::Receiver<ConfirmationRequest>)> {
        let (service, requests) = self.assemble(true).await?;
        let requests = requests
            .ok_or_else(|| KeepsakeError::General("Confirmation channel missing".to_string()))?;
        Ok((service, requests))
    }

    async fn assemble(
        self,
        with_channel: bool,
    ) -> Result<(MemoryService, Option<mpsc::Receiver<ConfirmationRequest>>)> {
        let config = self.config;
        config.validate()?;

        let mut ctx = PluginContext::new(config.clone());
        let (store, default_backups): (TieredMemoryStore, Arc<dyn BackupStore>) =
            if let Some(persistence) = self.persistence {
                (
                    TieredMemoryStore::open(&config, persistence).await?,
                    Arc::new(InMemoryBackupStore::new()) as Arc<dyn BackupStore>,
                )
            } else if config.storage.persist {
                tracing::info!(
                    "Opening record storage at: {}",
                    config.storage.data_dir.display()
                );
                let codec = PayloadCodec::from_config(&config.storage)?;
                let lance = Arc::new(
                    LanceStore::open(&config.storage.data_dir)
                        .await?
                        .with_codec(codec),
                );
                ctx = ctx.with_connection(lance.connection().clone());
                let store = TieredMemoryStore::open(&config, lance.clone()).await?;
                (store, lance as Arc<dyn BackupStore>)
            } else {
                tracing::info!("Persistence disabled, records live in memory only");
                (
                    TieredMemoryStore::new(&config),
                    Arc::new(InMemoryBackupStore::new()) as Arc<dyn BackupStore>,
                )
            };
        let store = Arc::new(store);

        let vectors = match self.vectors {
            Some(vectors) => vectors,
            None => match self.registry.vector_index(&config.vector.backend, &ctx).await {
                Ok(vectors) => vectors,
                Err(e @ KeepsakeError::Plugin(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "Vector backend '{}' unavailable, using keyword relevance only: {}",
                        config.vector.backend,
                        e
                    );
                    None
                }
            },
        };

        let embedder = match (&vectors, self.embedder) {
            (None, _) => None,
            (Some(_), Some(embedder)) => Some(embedder),
            (Some(_), None) => Some(self.registry.embedder(&config.embedding.provider, &ctx)?),
        };
        if let Some(embedder) = &embedder {
            if embedder.dimension() != config.vector.dimension {
                tracing::warn!(
                    "Embedder '{}' produces {} dimensions but vector.dimension is {}",
                    embedder.name(),
                    embedder.dimension(),
                    config.vector.dimension
                );
            }
        }

        let (profile, shared_profile): (Arc<dyn ProfileProvider>, Option<Arc<SharedProfile>>) =
            match self.profile {
                Some(profile) => (profile, None),
                None => {
                    let shared = Arc::new(SharedProfile::new(
                        config.retention.base_retention,
                        config.scoring.strategy,
                    ));
                    (shared.clone() as Arc<dyn ProfileProvider>, Some(shared))
                }
            };
        let load_probe = match self.load_probe {
            Some(probe) => probe,
            None => self.registry.load_probe(&config.retention.load_probe, &ctx)?,
        };
        tracing::debug!("Using load probe '{}'", load_probe.name());

        let retention = Arc::new(RetentionPolicyController::new(
            config.retention.clone(),
            profile,
            load_probe,
        ));
        let engine = ValueEvaluationEngine::new(config.scoring.clone());
        let backups = BackupManager::new(
            self.backup_store.unwrap_or(default_backups),
            &config.backup,
        );

        let (gate, requests) = if with_channel {
            let (gate, requests) = ConfirmationGate::with_channel(config.confirmation.clone());
            (gate, Some(requests))
        } else {
            (ConfirmationGate::new(config.confirmation.clone()), None)
        };
        let gate = Arc::new(gate);

        let context = Arc::new(RwLock::new(None));
        let scheduler = Arc::new(
            EvictionScheduler::new(
                config.scheduler.clone(),
                store.clone(),
                engine.clone(),
                retention.clone(),
                backups.clone(),
                gate.clone(),
            )
            .with_vector_index(vectors.clone())
            .with_context(context.clone()),
        );

        tracing::info!(
            "Memory service ready: {} records across {} tiers, vector backend '{}'",
            store.len(),
            config.tiers.len(),
            vectors.as_ref().map(|v| v.name()).unwrap_or("none")
        );

        let service = MemoryService {
            ranker: RetrievalRanker::new(config.retrieval.clone()),
            config,
            store,
            retention,
            shared_profile,
            backups,
            gate,
            scheduler,
            vectors,
            embedder,
            context,
        };
        Ok((service, requests))
    }
}

/// Snapshot attempts before an operator delete gives up on a busy record
const DELETE_ATTEMPTS: usize = 3;

fn protected_error(id: Uuid) -> KeepsakeError {
    KeepsakeError::Memory(format!("Record {id} is protected, unprotect it before deleting"))
}

/// Tiered memory with value-driven eviction
pub struct MemoryService {
    config: Config,
    store: Arc<TieredMemoryStore>,
    ranker: RetrievalRanker,
    retention: Arc<RetentionPolicyController>,
    shared_profile: Option<Arc<SharedProfile>>,
    backups: BackupManager,
    gate: Arc<ConfirmationGate>,
    scheduler: Arc<EvictionScheduler>,
    vectors: Option<Arc<dyn VectorIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    context: Arc<RwLock<Option<ActiveContext>>>,
}

impl MemoryService {
    pub fn builder(config: Config) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<TieredMemoryStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<EvictionScheduler> {
        &self.scheduler
    }

    pub fn confirmation_gate(&self) -> &Arc<ConfirmationGate> {
        &self.gate
    }

    /// Runtime handle on base retention and strategy profile, unless the
    /// builder was given its own provider
    pub fn personality(&self) -> Option<&Arc<SharedProfile>> {
        self.shared_profile.as_ref()
    }

    /// Store a new record and index its content.
    ///
    /// With synchronous eviction, a full tier gets one targeted eviction
    /// cycle and the store is retried once; a second `CapacityExceeded` is
    /// returned to the caller.
    pub async fn store_experience(
        &self,
        content: impl Into<String>,
        metadata: RecordMetadata,
    ) -> Result<Uuid> {
        let content = content.into();
        let vector_metadata = serde_json::json!({
            "kind": metadata.kind.as_str(),
            "data_type": metadata.data_type,
        });

        let id = match self.store.store(content.clone(), metadata.clone()).await {
            Err(KeepsakeError::CapacityExceeded { tier, stats }) => {
                tracing::info!(
                    "Tier '{}' is full ({}/{}), running a targeted eviction cycle",
                    tier,
                    stats.count,
                    stats.capacity
                );
                let report = self.scheduler.run_tier_cycle(&tier, 1).await;
                tracing::debug!("Targeted cycle removed {} records", report.deleted());
                self.store.store(content.clone(), metadata).await?
            }
            other => other?,
        };

        self.index_content(id, &content, vector_metadata).await;
        Ok(id)
    }

    /// Best records for `query`, touched as accessed when configured.
    ///
    /// A failing vector index or embedder degrades to keyword relevance.
    pub async fn retrieve_relevant_memories(
        &self,
        query: &str,
        limit: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<RetrievedMemory>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let tokens = keyword_tokens(query);
        let similarities = self
            .similarities(query, self.ranker.candidate_limit(limit))
            .await;

        let mut cursor = self.store.query(filter).await;
        let mut scored = Vec::new();
        while let Some(record) = cursor.next().await {
            let similarity = similarities.get(&record.id).copied();
            if let Some(hit) = self.ranker.score(record, &tokens, similarity, now) {
                scored.push(hit);
            }
        }

        let mut results = self.ranker.rank(scored, limit);
        tracing::debug!(
            "Retrieved {} memories for query ({} vector candidates)",
            results.len(),
            similarities.len()
        );

        if self.ranker.config().touch_results {
            for result in &mut results {
                match self.store.access(result.record.id).await {
                    Ok(updated) => result.record = updated,
                    Err(e) => tracing::debug!(
                        "Could not mark {} as accessed: {}",
                        result.record.id,
                        e
                    ),
                }
            }
        }

        Ok(results)
    }

    pub async fn get_memory_stats(&self) -> StoreStats {
        self.store.stats().await
    }

    /// Current retention factors for every tier
    pub async fn retention_factors(&self) -> Vec<RetentionFactors> {
        let interactions = self.store.activity_count(Utc::now()).await;
        self.store
            .stats()
            .await
            .tiers
            .iter()
            .map(|stats| self.retention.factors(stats, interactions))
            .collect()
    }

    /// Back up and remove records neither created nor accessed within
    /// `retention_days`. Protected and pending records are skipped.
    pub async fn cleanup_old_memories(&self, retention_days: i64) -> Result<usize> {
        let Some(cutoff) = Duration::try_days(retention_days.max(0))
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            tracing::debug!(
                "Retention of {} days reaches before any stored record, nothing to clean up",
                retention_days
            );
            return Ok(0);
        };
        let filter = RecordFilter::new()
            .until(cutoff)
            .exclude_protected()
            .exclude_pending();

        let candidates: Vec<MemoryRecord> = self
            .store
            .query(&filter)
            .await
            .collect_all()
            .await
            .into_iter()
            .filter(|r| r.last_accessed_at < cutoff)
            .collect();

        let mut removed = 0;
        for record in candidates {
            let backup_id = match self.backups.snapshot(&record, BackupReason::AgeCleanup).await {
                Ok(backup_id) => backup_id,
                Err(e) => {
                    tracing::warn!("Skipping cleanup of {}: {}", record.id, e);
                    continue;
                }
            };

            match self.store.remove_if_unchanged(&record).await {
                ConditionalRemoval::Removed(_) => {
                    removed += 1;
                    self.forget_vector(record.id).await;
                }
                other => {
                    tracing::debug!("Cleanup kept {}: {:?}", record.id, other);
                    if let Err(e) = self.backups.discard(backup_id).await {
                        tracing::warn!("Failed to discard backup {}: {}", backup_id, e);
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(
                "Age cleanup removed {} records older than {} days",
                removed,
                retention_days
            );
        }
        Ok(removed)
    }

    /// Read a record and count the access
    pub async fn access(&self, id: Uuid) -> Result<MemoryRecord> {
        self.store.access(id).await
    }

    /// Read a record without counting an access
    pub async fn get(&self, id: Uuid) -> Option<MemoryRecord> {
        self.store.get(id).await
    }

    /// Records matching `filter`, newest first
    pub async fn query(&self, filter: &RecordFilter) -> Vec<MemoryRecord> {
        self.store.query(filter).await.collect_all().await
    }

    /// Operator delete: back up, then remove. Returns the backup id.
    ///
    /// The removal only goes through if the record is exactly what was backed
    /// up; a record touched in between is snapshotted again. Protected records
    /// must be unprotected first.
    pub async fn delete(&self, id: Uuid) -> Result<Uuid> {
        for _ in 0..DELETE_ATTEMPTS {
            let record = self.store.get(id).await.ok_or(KeepsakeError::NotFound(id))?;
            if record.is_protected() {
                return Err(protected_error(id));
            }
            let backup_id = self
                .backups
                .snapshot(&record, BackupReason::ManualDelete)
                .await?;

            let failure = match self.store.remove_if_unchanged(&record).await {
                ConditionalRemoval::Removed(_) => {
                    self.gate.forget(id).await;
                    self.forget_vector(id).await;
                    tracing::info!("Deleted record {} (backup {})", id, backup_id);
                    return Ok(backup_id);
                }
                ConditionalRemoval::Changed => None,
                ConditionalRemoval::Protected => Some(protected_error(id)),
                ConditionalRemoval::Gone => Some(KeepsakeError::NotFound(id)),
            };

            if let Err(discard_err) = self.backups.discard(backup_id).await {
                tracing::warn!("Failed to discard backup {}: {}", backup_id, discard_err);
            }
            if let Some(e) = failure {
                return Err(e);
            }
            tracing::debug!("Record {} changed during delete, taking a new backup", id);
        }

        Err(KeepsakeError::Memory(format!(
            "Record {id} kept changing during delete, try again"
        )))
    }

    /// Put a backed-up record back into the store and the vector index
    pub async fn restore_backup(&self, backup_id: Uuid) -> Result<Uuid> {
        let record = self.backups.restore(backup_id).await?;
        let content = record.content.clone();
        let vector_metadata = serde_json::json!({
            "kind": record.metadata.kind.as_str(),
            "data_type": record.metadata.data_type,
        });

        let id = self.store.reinstate(record).await?;
        self.index_content(id, &content, vector_metadata).await;
        tracing::info!("Restored record {} from backup {}", id, backup_id);
        Ok(id)
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupSnapshot>> {
        self.backups.list().await
    }

    pub async fn backup(&self, backup_id: Uuid) -> Result<Option<BackupSnapshot>> {
        self.backups.get(backup_id).await
    }

    /// Drop backups past their TTL
    pub async fn purge_backups(&self) -> Result<usize> {
        self.backups.purge_expired().await
    }

    pub async fn set_protected(&self, id: Uuid, protected: bool) -> Result<()> {
        self.store.set_protected(id, protected).await
    }

    pub async fn link(&self, from: Uuid, to: Uuid) -> Result<()> {
        self.store.link(from, to).await
    }

    pub async fn move_to(&self, id: Uuid, tier: &TierName) -> Result<MemoryRecord> {
        self.store.move_to(id, tier).await
    }

    /// Add `by` to a numeric attribute, returning the new value
    pub async fn increment_attribute(&self, id: Uuid, field: &str, by: f64) -> Result<f64> {
        self.store.increment_attribute(id, field, by).await
    }

    /// Replace the context used for relevance scoring; `None` clears it
    pub async fn set_active_context(&self, text: Option<&str>) {
        let Some(text) = text else {
            *self.context.write().await = None;
            return;
        };

        let similarities = self.similarities(text, self.store.len().max(1)).await;
        let context = ActiveContext::new(text).with_similarities(similarities);
        *self.context.write().await = Some(context);
    }

    pub async fn active_context(&self) -> Option<ActiveContext> {
        self.context.read().await.clone()
    }

    /// Run one eviction cycle now
    pub async fn run_eviction_cycle(&self) -> CycleReport {
        self.scheduler.run_cycle().await
    }

    /// Start the background scheduler if it is enabled
    pub fn spawn_scheduler(&self) -> Option<SchedulerHandle> {
        if !self.config.scheduler.enabled {
            tracing::info!("Background eviction disabled by configuration");
            return None;
        }
        Some(self.scheduler.clone().spawn())
    }

    /// Write pending changes to disk
    pub async fn flush(&self) -> Result<usize> {
        self.store.flush().await
    }

    async fn index_content(&self, id: Uuid, content: &str, metadata: serde_json::Value) {
        let (Some(vectors), Some(embedder)) = (&self.vectors, &self.embedder) else {
            return;
        };

        let vector = match embedder.embed(content).await {
            Ok(vector) => vector,
            Err(e) => {
                tracing::warn!("Could not embed record {}: {}", id, e);
                return;
            }
        };
        match vectors.upsert(id, vector, metadata).await {
            Ok(reference) => {
                if let Err(e) = self.store.set_vector_ref(id, Some(reference)).await {
                    tracing::debug!("Record {} vanished before indexing finished: {}", id, e);
                }
            }
            Err(e) => tracing::warn!("Could not index record {}: {}", id, e),
        }
    }

    async fn forget_vector(&self, id: Uuid) {
        if let Some(vectors) = &self.vectors {
            if let Err(e) = vectors.remove(id).await {
                tracing::warn!("Failed to remove vector for {}: {}", id, e);
            }
        }
    }

    /// Vector similarities for `text`; empty when the index cannot answer
    async fn similarities(&self, text: &str, limit: usize) -> HashMap<Uuid, f32> {
        let (Some(vectors), Some(embedder)) = (&self.vectors, &self.embedder) else {
            return HashMap::new();
        };
        if text.trim().is_empty() {
            return HashMap::new();
        }

        let query = match embedder.embed(text).await {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!("Embedding failed, using keyword relevance only: {}", e);
                return HashMap::new();
            }
        };
        match vectors.query(&query, limit).await {
            Ok(matches) => matches.into_iter().map(|m| (m.id, m.similarity)).collect(),
            Err(e) => {
                tracing::warn!("Vector query failed, using keyword relevance only: {}", e);
                HashMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryKind;
    use crate::testing::{FailingBackupStore, MockVectorIndex, test_config};

    async fn service_with(config: Config, vectors: Arc<MockVectorIndex>) -> MemoryService {
        MemoryService::builder(config)
            .vector_index(vectors)
            .build()
            .await
            .unwrap()
    }

    fn note() -> RecordMetadata {
        RecordMetadata::new(MemoryKind::Semantic)
    }

    mod storing {
        use super::*;

        #[tokio::test]
        async fn test_store_indexes_vector() {
            let vectors = Arc::new(MockVectorIndex::new());
            let service = service_with(test_config(), vectors.clone()).await;

            let id = service
                .store_experience("the kettle is in the left cupboard", note())
                .await
                .unwrap();

            assert_eq!(vectors.upsert_count(), 1);
            let record = service.get(id).await.unwrap();
            assert_eq!(record.vector_ref, Some(id.to_string()));
        }

        #[tokio::test]
        async fn test_store_survives_vector_outage() {
            let vectors = Arc::new(MockVectorIndex::new());
            vectors.set_available(false);
            let service = service_with(test_config(), vectors.clone()).await;

            let id = service.store_experience("offline note", note()).await.unwrap();

            assert!(service.get(id).await.unwrap().vector_ref.is_none());
        }

        #[tokio::test]
        async fn test_synchronous_eviction_makes_room() {
            let mut config = test_config();
            config.tiers[0].capacity = 2;
            config.tiering.synchronous_eviction = true;
            let service = MemoryService::builder(config)
                .without_vector_index()
                .build()
                .await
                .unwrap();

            service.store_experience("first note", note()).await.unwrap();
            service.store_experience("second note", note()).await.unwrap();
            let third = service.store_experience("third note", note()).await.unwrap();

            assert!(service.get(third).await.is_some());
            assert_eq!(service.store().len(), 2);
            assert_eq!(service.list_backups().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_synchronous_eviction_reports_full_tier() {
            let mut config = test_config();
            config.tiers[0].capacity = 1;
            config.tiering.synchronous_eviction = true;
            let service = MemoryService::builder(config)
                .without_vector_index()
                .build()
                .await
                .unwrap();

            service
                .store_experience("keep me", note().protected())
                .await
                .unwrap();
            let err = service
                .store_experience("no room", note())
                .await
                .unwrap_err();

            assert!(matches!(err, KeepsakeError::CapacityExceeded { .. }));
        }
    }

    mod removal {
        use super::*;

        #[tokio::test]
        async fn test_delete_backs_up_and_restore_returns() {
            let vectors = Arc::new(MockVectorIndex::new());
            let service = service_with(test_config(), vectors.clone()).await;
            let id = service.store_experience("spare key under mat", note()).await.unwrap();

            let backup_id = service.delete(id).await.unwrap();
            assert!(service.get(id).await.is_none());
            assert_eq!(vectors.len().await, 0);

            let snapshot = service.backup(backup_id).await.unwrap().unwrap();
            assert_eq!(snapshot.reason, BackupReason::ManualDelete);

            let restored = service.restore_backup(backup_id).await.unwrap();
            assert_eq!(restored, id);
            assert_eq!(service.get(id).await.unwrap().content, "spare key under mat");
            assert_eq!(vectors.len().await, 1);
        }

        #[tokio::test]
        async fn test_delete_without_backup_keeps_record() {
            let failing = Arc::new(FailingBackupStore::new());
            failing.set_failing(true);
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .backup_store(failing)
                .build()
                .await
                .unwrap();
            let id = service.store_experience("precious", note()).await.unwrap();

            let err = service.delete(id).await.unwrap_err();
            assert!(matches!(err, KeepsakeError::BackupFailure(_)));
            assert!(service.get(id).await.is_some());
        }

        #[tokio::test]
        async fn test_delete_unknown_id() {
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .build()
                .await
                .unwrap();
            let missing = Uuid::new_v4();
            assert!(matches!(
                service.delete(missing).await,
                Err(KeepsakeError::NotFound(id)) if id == missing
            ));
        }

        #[tokio::test]
        async fn test_cleanup_with_zero_days_removes_unprotected() {
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .build()
                .await
                .unwrap();
            let old = service.store_experience("old note", note()).await.unwrap();
            let kept = service
                .store_experience("pinned note", note().protected())
                .await
                .unwrap();

            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let removed = service.cleanup_old_memories(0).await.unwrap();

            assert_eq!(removed, 1);
            assert!(service.get(old).await.is_none());
            assert!(service.get(kept).await.is_some());
            let backups = service.list_backups().await.unwrap();
            assert_eq!(backups[0].reason, BackupReason::AgeCleanup);
        }

        #[tokio::test]
        async fn test_cleanup_keeps_recent_records() {
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .build()
                .await
                .unwrap();
            service.store_experience("fresh", note()).await.unwrap();

            assert_eq!(service.cleanup_old_memories(30).await.unwrap(), 0);
            assert_eq!(service.store().len(), 1);
        }

        #[tokio::test]
        async fn test_cleanup_with_huge_retention_keeps_everything() {
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .build()
                .await
                .unwrap();
            let id = service.store_experience("ancient", note()).await.unwrap();

            assert_eq!(service.cleanup_old_memories(i64::MAX).await.unwrap(), 0);
            assert_eq!(service.cleanup_old_memories(3_000_000_000_000).await.unwrap(), 0);
            assert!(service.get(id).await.is_some());
            assert!(service.list_backups().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_delete_refuses_protected_record() {
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .build()
                .await
                .unwrap();
            let id = service
                .store_experience("do not touch", note().protected())
                .await
                .unwrap();

            let err = service.delete(id).await.unwrap_err();
            assert!(err.to_string().contains("protected"), "got: {err}");
            assert!(service.get(id).await.is_some());
            assert!(service.list_backups().await.unwrap().is_empty());

            service.set_protected(id, false).await.unwrap();
            service.delete(id).await.unwrap();
            assert!(service.get(id).await.is_none());
        }

        /// Backup store that reads the record through the store while the
        /// first snapshot is being written
        #[derive(Default)]
        struct AccessDuringBackup {
            inner: InMemoryBackupStore,
            store: RwLock<Option<Arc<TieredMemoryStore>>>,
            touched: std::sync::atomic::AtomicBool,
        }

        #[async_trait::async_trait]
        impl BackupStore for AccessDuringBackup {
            async fn write_backup(&self, snapshot: &BackupSnapshot) -> Result<()> {
                self.inner.write_backup(snapshot).await?;
                if !self.touched.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    let store = self.store.read().await.clone();
                    if let Some(store) = store {
                        store.access(snapshot.original_id).await?;
                    }
                }
                Ok(())
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

            async fn purge_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<usize> {
                self.inner.purge_older_than(cutoff).await
            }
        }

        #[tokio::test]
        async fn test_delete_retries_when_record_changes_mid_backup() {
            let backups = Arc::new(AccessDuringBackup::default());
            let service = MemoryService::builder(test_config())
                .without_vector_index()
                .backup_store(backups.clone())
                .build()
                .await
                .unwrap();
            *backups.store.write().await = Some(service.store().clone());
            let id = service.store_experience("moving target", note()).await.unwrap();

            let backup_id = service.delete(id).await.unwrap();

            assert!(service.get(id).await.is_none());
            let listed = service.list_backups().await.unwrap();
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].backup_id, backup_id);
            assert_eq!(listed[0].record.access_count, 1);
        }
    }

    mod context {
        use super::*;

        #[tokio::test]
        async fn test_active_context_carries_similarities() {
            let vectors = Arc::new(MockVectorIndex::new());
            let service = service_with(test_config(), vectors.clone()).await;
            let id = service.store_experience("garden watering", note()).await.unwrap();
            vectors.pin_similarity(id, 0.8).await;

            service.set_active_context(Some("garden")).await;
            let context = service.active_context().await.unwrap();
            assert_eq!(context.similarity(&id), Some(0.8));

            service.set_active_context(None).await;
            assert!(service.active_context().await.is_none());
        }

        #[tokio::test]
        async fn test_active_context_without_index_is_keyword_only() {
            let vectors = Arc::new(MockVectorIndex::new());
            vectors.set_available(false);
            let service = service_with(test_config(), vectors).await;

            service.set_active_context(Some("garden")).await;
            let context = service.active_context().await.unwrap();
            assert!(!context.has_similarities());
            assert_eq!(context.text(), "garden");
        }
    }

    #[tokio::test]
    async fn test_unknown_vector_backend_is_a_config_problem() {
        let mut config = test_config();
        config.vector.backend = "pinecone".to_string();
        let err = match MemoryService::builder(config).build().await {
            Err(e) => e,
            Ok(_) => panic!("unknown backend should fail"),
        };
        assert!(matches!(err, KeepsakeError::Plugin(_)));
    }

    #[tokio::test]
    async fn test_quarantined_rows_show_in_stats_not_queries() {
        use crate::testing::InMemoryPersistence;

        let persistence = Arc::new(InMemoryPersistence::new());
        let good = MemoryRecord::new("survivor", note(), TierName::from(TierName::WORKING));
        persistence.upsert_records(&[good.clone()]).await.unwrap();
        let bad_id = Uuid::new_v4();
        persistence
            .plant_row(&bad_id.to_string(), TierName::WORKING, "0000", "not a record")
            .await;

        let service = MemoryService::builder(test_config())
            .without_vector_index()
            .persistence(persistence)
            .build()
            .await
            .unwrap();

        assert_eq!(service.get_memory_stats().await.dead_letters, 1);
        let ids: Vec<Uuid> = service
            .query(&RecordFilter::new())
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![good.id]);
        assert!(service.get(bad_id).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_scheduler_is_not_spawned() {
        let service = MemoryService::builder(test_config())
            .without_vector_index()
            .build()
            .await
            .unwrap();
        assert!(service.spawn_scheduler().is_none());
    }
}
