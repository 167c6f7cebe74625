//! Integration tests for the eviction cycle
//!
//! Drives `MemoryService` end to end with pinned scores so thresholds and
//! capacity cuts are predictable.

use std::sync::Arc;

use keepsake::MemoryService;
use keepsake::config::Config;
use keepsake::eviction::{DeferredReason, EvictionOutcome};
use keepsake::memory::{BackupReason, MemoryKind, RecordMetadata, TierName};
use keepsake::testing::{FailingBackupStore, test_config};
use uuid::Uuid;

/// Test fixture: service without a vector index
async fn create_service(config: Config) -> MemoryService {
    MemoryService::builder(config)
        .without_vector_index()
        .build()
        .await
        .unwrap()
}

/// Test fixture: store one working-tier note per score and pin its score
async fn fill_working(service: &MemoryService, scores: &[f32]) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(scores.len());
    for (i, score) in scores.iter().enumerate() {
        let id = service
            .store_experience(
                format!("note number {i}"),
                RecordMetadata::new(MemoryKind::Semantic),
            )
            .await
            .unwrap();
        service.store().set_score(id, *score).await.unwrap();
        ids.push(id);
    }
    ids
}

fn working() -> TierName {
    TierName::from(TierName::WORKING)
}

/// Overrides that pin the threshold at 1 - (0.5 + pressure)
fn pinned_signals(config: &mut Config, pressure: f32) {
    config.retention.overrides.base = Some(0.5);
    config.retention.overrides.load = Some(0.0);
    config.retention.overrides.activity = Some(0.0);
    config.retention.overrides.pressure = Some(pressure);
}

mod capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_one_over_capacity_removes_lowest_and_backs_it_up() {
        let config = test_config();
        let service = create_service(config).await;

        let mut scores = vec![0.95; 51];
        scores[17] = 0.05;
        let ids = fill_working(&service, &scores).await;

        let report = service.run_eviction_cycle().await;

        let stats = service.get_memory_stats().await;
        assert_eq!(stats.tier(TierName::WORKING).unwrap().count, 50);
        assert!(service.get(ids[17]).await.is_none());
        assert_eq!(report.deleted(), 1);

        let backups = service.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].original_id, ids[17]);
        assert_eq!(backups[0].reason, BackupReason::AutoEvict);
    }

    #[tokio::test]
    async fn test_unscored_overflow_removes_the_lowest_computed_score() {
        let mut config = test_config();
        // Only the capacity cut may remove anything
        config.scheduler.discretionary_floor = 0;
        config.scheduler.discretionary_fraction = 0.0;
        let service = create_service(config).await;

        let mut ids = Vec::with_capacity(51);
        for i in 0..51 {
            let mut metadata = RecordMetadata::new(MemoryKind::Semantic);
            if i % 3 == 0 {
                metadata = metadata.with_tag("errand");
            }
            let id = service
                .store_experience(format!("unscored note {i}"), metadata)
                .await
                .unwrap();
            ids.push(id);
        }

        let report = service.run_eviction_cycle().await;

        assert_eq!(service.store().tier_stats(&working()).await.unwrap().count, 50);
        assert_eq!(report.deleted(), 1);

        let removed = report
            .candidates
            .iter()
            .find(|c| matches!(c.outcome, EvictionOutcome::Deleted { .. }))
            .unwrap();
        assert!(removed.forced);
        assert!(service.get(removed.record_id).await.is_none());

        for id in ids.iter().filter(|id| **id != removed.record_id) {
            let survivor = service.get(*id).await.unwrap();
            assert!(survivor.scored_at.is_some());
            assert!(
                removed.score <= survivor.value_score,
                "removed {} scored {} but {} kept at {}",
                removed.record_id,
                removed.score,
                id,
                survivor.value_score
            );
        }

        let backups = service.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].original_id, removed.record_id);
        assert_eq!(backups[0].reason, BackupReason::AutoEvict);
        assert_eq!(backups[0].record.value_score, removed.score);
    }

    #[tokio::test]
    async fn test_tier_within_capacity_after_cycle() {
        let mut config = test_config();
        config.tiers[0].capacity = 10;
        let service = create_service(config).await;
        let scores: Vec<f32> = (0..25).map(|i| 0.5 + i as f32 * 0.01).collect();
        fill_working(&service, &scores).await;

        service.run_eviction_cycle().await;

        let count = service.store().tier_stats(&working()).await.unwrap().count;
        assert!(count <= 10, "working tier holds {count} records");
    }

    #[tokio::test]
    async fn test_protected_record_survives_maximum_pressure() {
        let mut config = test_config();
        config.tiers[0].capacity = 3;
        config.retention.overrides.base = Some(0.0);
        config.retention.overrides.load = Some(-0.1);
        config.retention.overrides.activity = Some(-0.1);
        config.retention.overrides.pressure = Some(-0.2);
        let service = create_service(config).await;

        let protected = service
            .store_experience(
                "the one note that must stay",
                RecordMetadata::new(MemoryKind::Semantic).protected(),
            )
            .await
            .unwrap();
        service.store().set_score(protected, 0.0).await.unwrap();
        fill_working(&service, &[0.2, 0.3, 0.4, 0.5, 0.6]).await;

        for _ in 0..10 {
            service.run_eviction_cycle().await;
            assert!(service.get(protected).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_stronger_pressure_never_evicts_less() {
        let scores: Vec<f32> = (1..=18).map(|i| 0.02 + i as f32 * 0.05).collect();

        let mut evicted = Vec::new();
        for pressure in [0.0, -0.2] {
            let mut config = test_config();
            config.tiers[0].capacity = 20;
            config.scheduler.discretionary_floor = 20;
            pinned_signals(&mut config, pressure);
            let service = create_service(config).await;
            fill_working(&service, &scores).await;

            evicted.push(service.run_eviction_cycle().await.deleted());
        }

        let (neutral, aggressive) = (evicted[0], evicted[1]);
        assert!(aggressive >= neutral, "aggressive {aggressive} < neutral {neutral}");
        assert!(aggressive > 0);
    }

    #[tokio::test]
    async fn test_discretionary_evictions_are_bounded() {
        let mut config = test_config();
        config.tiers[0].capacity = 40;
        config.scheduler.discretionary_floor = 3;
        pinned_signals(&mut config, 0.0);
        let service = create_service(config).await;
        fill_working(&service, &[0.1; 35]).await;

        let report = service.run_eviction_cycle().await;

        assert_eq!(report.deleted(), 3);
        assert_eq!(service.store().len(), 32);
    }
}

mod backup_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_backup_defers_then_recovers() {
        let mut config = test_config();
        config.tiers[0].capacity = 2;
        let failing = Arc::new(FailingBackupStore::new());
        failing.set_failing(true);
        let service = MemoryService::builder(config)
            .without_vector_index()
            .backup_store(failing.clone())
            .build()
            .await
            .unwrap();
        let ids = fill_working(&service, &[0.1, 0.95, 0.95]).await;

        let report = service.run_eviction_cycle().await;
        assert_eq!(service.store().len(), 3);
        assert_eq!(
            report.outcome_for(ids[0]),
            Some(EvictionOutcome::Deferred {
                reason: DeferredReason::BackupFailed
            })
        );

        failing.set_failing(false);
        let report = service.run_eviction_cycle().await;
        assert!(service.get(ids[0]).await.is_none());
        assert!(matches!(
            report.outcome_for(ids[0]),
            Some(EvictionOutcome::Deleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_evicted_record_can_be_restored() {
        let mut config = test_config();
        config.tiers[0].capacity = 1;
        let service = create_service(config).await;
        let ids = fill_working(&service, &[0.1, 0.95]).await;

        let report = service.run_eviction_cycle().await;
        let Some(EvictionOutcome::Deleted { backup_id }) = report.outcome_for(ids[0]) else {
            panic!("lowest record should be evicted");
        };

        let restored = service.restore_backup(backup_id).await.unwrap();
        assert_eq!(restored, ids[0]);
        assert_eq!(service.get(ids[0]).await.unwrap().content, "note number 0");
    }
}

mod tiering_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_access_promotes() {
        let service = create_service(test_config()).await;
        let ids = fill_working(&service, &[0.5]).await;

        let mut record = service.access(ids[0]).await.unwrap();
        for _ in 1..service.config().tiering.promotion_threshold {
            record = service.access(ids[0]).await.unwrap();
        }

        assert_eq!(record.tier.as_str(), TierName::SHORT_TERM);
        assert_eq!(record.access_count, 5);
    }

    #[tokio::test]
    async fn test_access_on_missing_record_is_not_found() {
        let service = create_service(test_config()).await;
        assert!(service.access(Uuid::new_v4()).await.is_err());
    }
}
