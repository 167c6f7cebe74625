//! Integration tests for human-in-the-loop eviction confirmation
//!
//! Signals are pinned so the threshold is exactly 0.5 and a record scored
//! 0.48 is borderline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keepsake::MemoryService;
use keepsake::config::{Config, DefaultPolicy};
use keepsake::eviction::{ConfirmationRequest, DeferredReason, EvictionOutcome, KeptReason};
use keepsake::memory::{MemoryKind, RecordMetadata};
use keepsake::testing::test_config;
use tokio::sync::mpsc;
use uuid::Uuid;

const BORDERLINE: f32 = 0.48;

fn gated_config() -> Config {
    let mut config = test_config();
    config.tiers[0].capacity = 2;
    config.retention.overrides.base = Some(0.5);
    config.retention.overrides.load = Some(0.0);
    config.retention.overrides.activity = Some(0.0);
    config.retention.overrides.pressure = Some(0.0);
    config
}

/// Test fixture: over-capacity working tier whose lowest record is borderline
async fn create_service(
    config: Config,
) -> (MemoryService, mpsc::Receiver<ConfirmationRequest>, Uuid) {
    let (service, requests) = MemoryService::builder(config)
        .without_vector_index()
        .build_with_confirmations()
        .await
        .unwrap();

    let mut borderline = None;
    for score in [BORDERLINE, 0.95, 0.95] {
        let id = service
            .store_experience(
                format!("record scored {score}"),
                RecordMetadata::new(MemoryKind::Semantic),
            )
            .await
            .unwrap();
        service.store().set_score(id, score).await.unwrap();
        borderline.get_or_insert(id);
    }
    (service, requests, borderline.unwrap())
}

/// Answer every request with `approved`, counting requests
fn spawn_decider(
    mut requests: mpsc::Receiver<ConfirmationRequest>,
    approved: bool,
) -> Arc<AtomicUsize> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            counter.fetch_add(1, Ordering::SeqCst);
            request.respond(approved);
        }
    });
    seen
}

mod decision_tests {
    use super::*;

    #[tokio::test]
    async fn test_approval_allows_deletion() {
        let (service, requests, borderline) = create_service(gated_config()).await;
        let seen = spawn_decider(requests, true);

        let report = service.run_eviction_cycle().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(service.get(borderline).await.is_none());
        assert!(matches!(
            report.outcome_for(borderline),
            Some(EvictionOutcome::Deleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_denial_keeps_record_and_cools_down() {
        let (service, requests, borderline) = create_service(gated_config()).await;
        let seen = spawn_decider(requests, false);

        let report = service.run_eviction_cycle().await;
        assert_eq!(
            report.outcome_for(borderline),
            Some(EvictionOutcome::Kept {
                reason: KeptReason::Denied
            })
        );

        service.run_eviction_cycle().await;
        assert!(service.get(borderline).await.is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1, "cooldown suppresses a second request");
    }

    #[tokio::test]
    async fn test_request_describes_the_record() {
        let (service, mut requests, borderline) = create_service(gated_config()).await;

        let cycle = tokio::spawn(async move { service.run_eviction_cycle().await });
        let request = requests.recv().await.unwrap();

        assert_eq!(request.record_id, borderline);
        assert_eq!(request.score, BORDERLINE);
        assert_eq!(request.threshold, 0.5);
        assert!(request.preview.starts_with("record scored"));
        request.approve();
        cycle.await.unwrap();
    }
}

mod pending_tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_answer_defers_then_applies() {
        let mut config = gated_config();
        config.confirmation.inline_wait_ms = 20;
        let (service, mut requests, borderline) = create_service(config).await;

        let report = service.run_eviction_cycle().await;
        assert_eq!(
            report.outcome_for(borderline),
            Some(EvictionOutcome::Deferred {
                reason: DeferredReason::ConfirmationPending
            })
        );
        assert!(service.get(borderline).await.unwrap().is_pending());
        assert_eq!(service.confirmation_gate().pending_count().await, 1);

        requests.recv().await.unwrap().approve();
        service.run_eviction_cycle().await;

        assert!(service.get(borderline).await.is_none());
        assert_eq!(service.confirmation_gate().pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_deadline_applies_default_deny() {
        let mut config = gated_config();
        config.confirmation.inline_wait_ms = 20;
        config.confirmation.deadline_secs = 1;
        config.confirmation.default_policy = DefaultPolicy::Deny;
        let (service, _requests, borderline) = create_service(config).await;

        service.run_eviction_cycle().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report = service.run_eviction_cycle().await;

        assert_eq!(
            report.outcome_for(borderline),
            Some(EvictionOutcome::Kept {
                reason: KeptReason::Denied
            })
        );
        let record = service.get(borderline).await.unwrap();
        assert!(!record.is_pending());
    }

    #[tokio::test]
    async fn test_deadline_applies_default_approve() {
        let mut config = gated_config();
        config.confirmation.inline_wait_ms = 20;
        config.confirmation.deadline_secs = 1;
        let (service, _requests, borderline) = create_service(config).await;

        service.run_eviction_cycle().await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        service.run_eviction_cycle().await;

        assert!(service.get(borderline).await.is_none());
    }
}

#[tokio::test]
async fn test_disabled_gate_never_asks() {
    let mut config = gated_config();
    config.confirmation.enabled = false;
    let (service, requests, borderline) = create_service(config).await;
    let seen = spawn_decider(requests, false);

    service.run_eviction_cycle().await;

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert!(service.get(borderline).await.is_none());
}
