//! Integration tests for LanceDB-backed services
//!
//! Every test opens a service on a temporary directory, drops it, and opens
//! a second one on the same directory.

use keepsake::MemoryService;
use keepsake::config::Config;
use keepsake::memory::{BackupReason, MemoryKind, RecordMetadata};
use keepsake::storage::RecordFilter;
use keepsake::testing::test_config;
use tempfile::TempDir;

/// Test fixture: persistent config rooted in a fresh temporary directory
fn persistent_config(dir: &TempDir) -> Config {
    let mut config = test_config();
    config.storage.persist = true;
    config.storage.data_dir = dir.path().to_path_buf();
    config
}

async fn open(config: &Config) -> MemoryService {
    MemoryService::builder(config.clone()).build().await.unwrap()
}

fn note() -> RecordMetadata {
    RecordMetadata::new(MemoryKind::Semantic)
}

mod reopen_tests {
    use super::*;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = persistent_config(&dir);

        let (kept, protected) = {
            let service = open(&config).await;
            let kept = service
                .store_experience("the wifi password is on the fridge", note().with_tag("home"))
                .await
                .unwrap();
            let protected = service
                .store_experience("grandma's recipe", note().protected())
                .await
                .unwrap();
            service.flush().await.unwrap();
            (kept, protected)
        };

        let service = open(&config).await;
        assert_eq!(service.store().len(), 2);

        let record = service.get(kept).await.unwrap();
        assert_eq!(record.content, "the wifi password is on the fridge");
        assert!(record.metadata.tags.contains("home"));
        assert!(record.verify_checksum());
        assert!(service.get(protected).await.unwrap().is_protected());
    }

    #[tokio::test]
    async fn test_unflushed_changes_are_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        let config = persistent_config(&dir);

        {
            let service = open(&config).await;
            service.store_experience("written", note()).await.unwrap();
            service.flush().await.unwrap();
            service.store_experience("never flushed", note()).await.unwrap();
        }

        let service = open(&config).await;
        let contents: Vec<String> = service
            .query(&RecordFilter::new())
            .await
            .into_iter()
            .map(|r| r.content)
            .collect();
        assert_eq!(contents, vec!["written".to_string()]);
    }

    #[tokio::test]
    async fn test_eviction_cycle_persists_removals() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = persistent_config(&dir);
        config.tiers[0].capacity = 2;

        let evicted = {
            let service = open(&config).await;
            let mut ids = Vec::new();
            for (content, score) in [("low", 0.05), ("high one", 0.95), ("high two", 0.95)] {
                let id = service.store_experience(content, note()).await.unwrap();
                service.store().set_score(id, score).await.unwrap();
                ids.push(id);
            }
            let report = service.run_eviction_cycle().await;
            assert!(report.rows_flushed > 0);
            ids[0]
        };

        let service = open(&config).await;
        assert_eq!(service.store().len(), 2);
        assert!(service.get(evicted).await.is_none());
    }
}

mod backup_tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_restores_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = persistent_config(&dir);

        let (id, backup_id) = {
            let service = open(&config).await;
            let id = service
                .store_experience("old phone number 555-0100", note())
                .await
                .unwrap();
            let backup_id = service.delete(id).await.unwrap();
            service.flush().await.unwrap();
            (id, backup_id)
        };

        let service = open(&config).await;
        assert!(service.get(id).await.is_none());

        let backups = service.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].reason, BackupReason::ManualDelete);

        assert_eq!(service.restore_backup(backup_id).await.unwrap(), id);
        assert_eq!(
            service.get(id).await.unwrap().content,
            "old phone number 555-0100"
        );
    }
}

mod vector_tests {
    use super::*;

    #[tokio::test]
    async fn test_lance_vectors_share_the_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = persistent_config(&dir);
        config.vector.backend = "lance".to_string();
        config.vector.dimension = 64;

        let id = {
            let service = open(&config).await;
            let id = service
                .store_experience("sourdough starter feeding schedule", note())
                .await
                .unwrap();
            service.flush().await.unwrap();
            id
        };

        let service = open(&config).await;
        assert!(service.get(id).await.unwrap().vector_ref.is_some());

        let results = service
            .retrieve_relevant_memories("sourdough starter", 3, &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(results[0].record.id, id);
        assert!(results[0].similarity_score.is_some());
    }
}
