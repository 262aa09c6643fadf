//! Integration tests for full maintenance cycles
//!
//! Drives `TieringService::run_maintenance` against the in-memory store and
//! checks the combined effect of cleanup, promotion, balancing and sync.

use chrono::{Duration, Utc};

use std::sync::Arc;

use strata::config::{ConfigManager, TieringConfig};
use strata::maintenance::StageOutcome;
use strata::memory::types::{MemoryRecord, Tier, TierAssignment};
use strata::storage::{AssignmentStore, InMemoryStore, MemoryStore};
use strata::testing::{FaultyStore, memory_service, seed_aged, seed_assigned};
use strata::{Interrupt, TieringService};

/// Test helper: service over `store` with a custom configuration
fn service_with(config: TieringConfig, store: Arc<InMemoryStore>) -> TieringService {
    let manager = Arc::new(ConfigManager::new(config).unwrap());
    TieringService::with_store(manager, store)
}

/// Test helper: bump an assignment's access count in place
async fn set_access_count(store: &InMemoryStore, id: &str, access_count: u32) {
    let current = store.get_assignment(id).await.unwrap().unwrap();
    let updated = TierAssignment {
        access_count,
        ..current.clone()
    };
    assert!(
        store
            .compare_and_swap(&updated, Some(current.version))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_frequently_used_archive_record_reaches_core() {
    let (store, service) = memory_service();
    seed_assigned(store.as_ref(), "m1", Tier::archive(), 8.5)
        .await
        .unwrap();
    set_access_count(&store, "m1", 100).await;

    let report = service.run_maintenance().await;
    assert!(!report.has_failures());

    let promotion = report.promotion.completed().unwrap();
    assert_eq!(promotion.promoted_count, 1);
    assert_eq!(promotion.moves[0].from, Tier::archive());
    assert_eq!(promotion.moves[0].to, Tier::core());

    // Weight raised to the core floor, so sync finds nothing to fix
    let record = store.get("m1").await.unwrap().unwrap();
    assert_eq!(record.weight, 9.0);
    assert_eq!(report.sync.completed().unwrap().synced_count, 0);

    let assignment = service.layers().get_assignment("m1").await.unwrap();
    assert_eq!(assignment.tier, Tier::core());
}

#[tokio::test]
async fn test_over_capacity_lowest_tier_evicts_weakest() {
    let mut config = TieringConfig::default();
    config
        .tiers
        .iter_mut()
        .find(|t| t.name == Tier::short_term())
        .unwrap()
        .max_records = 2;

    let store = Arc::new(InMemoryStore::new());
    let service = service_with(config, store.clone());
    for (id, weight) in [("weak", 1.5), ("mid", 2.5), ("strong", 3.5)] {
        seed_assigned(store.as_ref(), id, Tier::short_term(), weight)
            .await
            .unwrap();
    }

    let report = service.run_maintenance().await;
    let balance = report.balance.completed().unwrap();
    assert_eq!(balance.evicted_ids, vec!["weak".to_string()]);
    assert!(balance.overflow.is_empty());

    // Evicted records are purged from the record store too
    assert_eq!(report.purged_records, 1);
    assert!(store.get("weak").await.unwrap().is_none());
    assert_eq!(store.record_count(), 2);
    assert!(service.layers().find_assignment("weak").await.unwrap().is_none());
    assert_eq!(service.layers().count_by_tier(&Tier::short_term()).await.unwrap(), 2);
    assert_eq!(report.sync.completed().unwrap().synced_count, 0);
}

#[tokio::test]
async fn test_over_capacity_upper_tier_demotes_one_step() {
    let mut config = TieringConfig::default();
    config
        .tiers
        .iter_mut()
        .find(|t| t.name == Tier::core())
        .unwrap()
        .max_records = 1;

    let store = Arc::new(InMemoryStore::new());
    let service = service_with(config, store.clone());
    seed_assigned(store.as_ref(), "keep", Tier::core(), 9.8)
        .await
        .unwrap();
    seed_assigned(store.as_ref(), "drop", Tier::core(), 9.1)
        .await
        .unwrap();

    let report = service.run_maintenance().await;
    let balance = report.balance.completed().unwrap();
    assert_eq!(balance.demoted_count, 1);
    assert_eq!(balance.moves[0].memory_id, "drop");
    assert_eq!(balance.moves[0].to, Tier::archive());

    // Weight lowered to the archive ceiling; sync agrees with the new tier
    assert_eq!(store.get("drop").await.unwrap().unwrap().weight, 8.9);
    assert_eq!(
        service.layers().get_assignment("drop").await.unwrap().tier,
        Tier::archive()
    );
    assert_eq!(report.sync.completed().unwrap().synced_count, 0);
}

#[tokio::test]
async fn test_drifted_weight_is_retiered_by_sync() {
    let (store, service) = memory_service();
    seed_assigned(store.as_ref(), "m1", Tier::archive(), 8.0)
        .await
        .unwrap();
    // The pipeline raised the weight without telling the tiering layer
    store.put(&MemoryRecord::new("m1", 9.5)).await.unwrap();

    let report = service.run_maintenance().await;
    assert_eq!(report.sync.completed().unwrap().synced_count, 1);
    assert_eq!(
        service.layers().get_assignment("m1").await.unwrap().tier,
        Tier::core()
    );

    let status = service.get_system_status().await.unwrap();
    assert_eq!(status.metrics.inconsistent_count, 0);
}

#[tokio::test]
async fn test_stale_short_term_record_expires() {
    let (store, service) = memory_service();
    let long_ago = Utc::now() - Duration::days(30);
    seed_aged(store.as_ref(), "stale", Tier::short_term(), 2.0, long_ago)
        .await
        .unwrap();
    seed_assigned(store.as_ref(), "fresh", Tier::short_term(), 2.0)
        .await
        .unwrap();

    let report = service.run_maintenance().await;
    let cleanup = report.cleanup.completed().unwrap();
    assert_eq!(cleanup.expired_ids, vec!["stale".to_string()]);
    assert!(store.get("stale").await.unwrap().is_none());
    assert!(store.get("fresh").await.unwrap().is_some());
    assert!(service.layers().find_assignment("stale").await.unwrap().is_none());
    assert_eq!(store.assignment_count(), 1);
}

#[tokio::test]
async fn test_dropped_records_stay_unassigned_without_purge() {
    let mut config = TieringConfig::default();
    config.system.purge_dropped_records = false;
    config
        .tiers
        .iter_mut()
        .find(|t| t.name == Tier::short_term())
        .unwrap()
        .max_records = 1;

    let store = Arc::new(InMemoryStore::new());
    let service = service_with(config, store.clone());
    let long_ago = Utc::now() - Duration::days(30);
    seed_aged(store.as_ref(), "stale", Tier::short_term(), 2.0, long_ago)
        .await
        .unwrap();
    seed_assigned(store.as_ref(), "weak", Tier::short_term(), 1.5)
        .await
        .unwrap();
    seed_assigned(store.as_ref(), "strong", Tier::short_term(), 3.5)
        .await
        .unwrap();

    let report = service.run_maintenance().await;
    assert_eq!(report.purged_records, 0);
    assert_eq!(
        report.cleanup.completed().unwrap().expired_ids,
        vec!["stale".to_string()]
    );
    assert_eq!(
        report.balance.completed().unwrap().evicted_ids,
        vec!["weak".to_string()]
    );

    let sync = report.sync.completed().unwrap();
    assert_eq!(sync.excluded, 2);
    assert_eq!(sync.synced_count, 0);

    // Records are kept, their assignments stay gone for this cycle
    assert_eq!(store.record_count(), 3);
    assert!(service.layers().find_assignment("stale").await.unwrap().is_none());
    assert!(service.layers().find_assignment("weak").await.unwrap().is_none());
    assert_eq!(service.layers().count_by_tier(&Tier::short_term()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_repeated_maintenance_is_stable() {
    let (store, service) = memory_service();
    for (id, weight) in [("a", 9.4), ("b", 7.2), ("c", 5.0), ("d", 1.1)] {
        store.put(&MemoryRecord::new(id, weight)).await.unwrap();
    }

    let first = service.run_maintenance().await;
    assert_eq!(first.sync.completed().unwrap().synced_count, 4);

    let second = service.run_maintenance().await;
    assert_eq!(second.sync.completed().unwrap().synced_count, 0);
    assert_eq!(second.promotion.completed().unwrap().promoted_count, 0);
    assert_eq!(store.assignment_count(), 4);
}

#[tokio::test]
async fn test_failed_stage_does_not_stop_the_cycle() {
    let store = Arc::new(FaultyStore::new());
    let service = TieringService::with_store(Arc::new(ConfigManager::default()), store.clone());
    seed_assigned(store.inner(), "m1", Tier::long_term(), 5.0)
        .await
        .unwrap();

    store.fail_records(true);
    let report = service.run_maintenance().await;

    assert!(report.cleanup.completed().is_some());
    assert!(report.balance.completed().is_some());
    assert!(matches!(
        report.sync,
        StageOutcome::Failed {
            transient: true,
            ..
        }
    ));
    assert!(report.snapshot.completed().is_some());
    assert!(report.has_transient_failures());
}

#[tokio::test]
async fn test_assignment_outage_fails_every_stage_without_panicking() {
    let store = Arc::new(FaultyStore::new());
    let service = TieringService::with_store(Arc::new(ConfigManager::default()), store.clone());
    store.inner().put(&MemoryRecord::new("m1", 5.0)).await.unwrap();

    store.fail_assignments(true);
    let report = service.run_maintenance().await;

    assert!(report.cleanup.is_failed());
    assert!(report.promotion.is_failed());
    assert!(report.balance.is_failed());
    assert!(report.sync.is_failed());
    assert!(report.snapshot.is_failed());

    // Recovers on the next cycle
    store.fail_assignments(false);
    let report = service.run_maintenance().await;
    assert!(!report.has_failures());
    assert_eq!(
        service.layers().get_assignment("m1").await.unwrap().tier,
        Tier::long_term()
    );
}

#[tokio::test]
async fn test_interrupted_cycle_skips_remaining_stages() {
    let (store, service) = memory_service();
    store.put(&MemoryRecord::new("m1", 5.0)).await.unwrap();

    let interrupt = Interrupt::new();
    interrupt.trigger();
    let report = service.run_maintenance_with(&interrupt).await;

    assert!(report.interrupted);
    assert!(matches!(report.cleanup, StageOutcome::Skipped { .. }));
    assert!(matches!(report.sync, StageOutcome::Skipped { .. }));
    assert_eq!(store.assignment_count(), 0);
}

#[tokio::test]
async fn test_sync_stage_skipped_when_auto_sync_disabled() {
    let mut config = TieringConfig::default();
    config.system.auto_sync_enabled = false;

    let store = Arc::new(InMemoryStore::new());
    let service = service_with(config, store.clone());
    store.put(&MemoryRecord::new("m1", 5.0)).await.unwrap();

    let report = service.run_maintenance().await;
    assert!(matches!(report.sync, StageOutcome::Skipped { .. }));
    assert_eq!(store.assignment_count(), 0);
}

#[tokio::test]
async fn test_report_serializes_with_stage_status() {
    let (_store, service) = memory_service();
    let report = service.run_maintenance().await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["cleanup"]["status"], "completed");
    assert_eq!(json["interrupted"], false);
}
