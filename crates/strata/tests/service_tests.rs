//! Integration tests for the pipeline-facing facade
//!
//! Covers the storage, retrieval and context hooks, their pass-through
//! behaviour when the assignment store is down, and an end-to-end run over a
//! LanceDB store in a temporary directory.

use std::sync::Arc;

use strata::config::{ConfigManager, SyncPolicy, TieringConfig};
use strata::memory::types::{AccessContext, MemoryRecord, Tier};
use strata::storage::{LanceStore, MemoryStore};
use strata::testing::{FaultyStore, memory_service, seed_assigned};
use strata::tiering::{AlertLevel, QueryContext, SyncStatus};
use strata::{StrataError, TieringService};
use tempfile::tempdir;

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Test helper: service over a fault-injecting store
fn faulty_service() -> (Arc<FaultyStore>, TieringService) {
    let store = Arc::new(FaultyStore::new());
    let service = TieringService::with_store(Arc::new(ConfigManager::default()), store.clone());
    (store, service)
}

#[tokio::test]
async fn test_storage_then_retrieval_prefers_core() {
    let (store, service) = memory_service();
    for (id, weight) in [("chit-chat", 2.0), ("user-name", 9.6), ("hobby", 6.0)] {
        let record = service.enhance_storage(MemoryRecord::new(id, weight)).await;
        store.put(&record).await.unwrap();
    }

    let context = QueryContext::new("what is my name")
        .with_kind("personal_fact")
        .with_similarities(vec![0.82, 0.78, 0.60]);
    let ranked = service
        .enhance_retrieval(&ids(&["chit-chat", "user-name", "hobby"]), &context)
        .await;

    assert_eq!(ranked[0].memory_id, "user-name");
    assert_eq!(ranked[0].tier, Some(Tier::core()));
    assert_eq!(ranked.len(), 3);
}

#[tokio::test]
async fn test_hooks_pass_through_when_assignments_down() {
    let (store, service) = faulty_service();
    store.fail_assignments(true);

    let original = MemoryRecord::new("m1", 9.5);
    let stored = service.enhance_storage(original.clone()).await;
    assert_eq!(stored, original);

    let context = QueryContext::new("q").with_similarities(vec![0.4, 0.9]);
    let ranked = service.enhance_retrieval(&ids(&["a", "b"]), &context).await;
    let order: Vec<&str> = ranked.iter().map(|r| r.memory_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b"]);
    assert!(ranked.iter().all(|r| r.tier.is_none()));
}

#[tokio::test]
async fn test_route_candidates_keeps_preferred_tiers() {
    let (_store, service) = memory_service();
    for (id, weight) in [("name", 9.6), ("lunch", 2.0), ("job", 7.5), ("hobby", 5.0)] {
        service.enhance_storage(MemoryRecord::new(id, weight)).await;
    }

    let candidates = ids(&["lunch", "name", "hobby", "job"]);
    let personal = service.route_candidates(&candidates, "personal_fact").await;
    assert_eq!(personal, ids(&["name", "hobby", "job"]));

    let core_only = service.filter_by_tier(&candidates, &[Tier::core()]).await;
    assert_eq!(core_only, ids(&["name"]));
}

#[tokio::test]
async fn test_tier_filter_passes_through_when_assignments_down() {
    let (store, service) = faulty_service();
    store.fail_assignments(true);

    let candidates = ids(&["a", "b"]);
    assert_eq!(
        service.filter_by_tier(&candidates, &[Tier::core()]).await,
        candidates
    );
    assert_eq!(
        service.route_candidates(&candidates, "personal_fact").await,
        candidates
    );
}

#[tokio::test]
async fn test_access_updates_feed_promotion() {
    let (store, service) = memory_service();
    seed_assigned(store.as_ref(), "m1", Tier::long_term(), 6.5)
        .await
        .unwrap();

    for _ in 0..60 {
        service
            .update_access("m1", AccessContext::default())
            .await
            .unwrap();
    }
    let assignment = service.layers().get_assignment("m1").await.unwrap();
    assert_eq!(assignment.access_count, 60);

    let report = service.run_maintenance().await;
    assert_eq!(report.promotion.completed().unwrap().promoted_count, 1);
    assert_eq!(
        service.layers().get_assignment("m1").await.unwrap().tier,
        Tier::archive()
    );
    assert_eq!(store.get("m1").await.unwrap().unwrap().weight, 7.0);
}

#[tokio::test]
async fn test_context_building_uses_stored_annotations() {
    let (store, service) = memory_service();
    let mut records = Vec::new();
    for (id, weight) in [("a", 9.2), ("b", 3.0), ("c", 7.5)] {
        let record = service.enhance_storage(MemoryRecord::new(id, weight)).await;
        store.put(&record).await.unwrap();
        records.push(record);
    }

    let context = service
        .enhance_context_building("tell me about myself", records)
        .unwrap();
    let tiers: Vec<Tier> = context.groups.iter().map(|g| g.tier.clone()).collect();
    assert_eq!(tiers, vec![Tier::core(), Tier::archive(), Tier::short_term()]);
    assert_eq!(context.distribution[&Tier::long_term()], 0);
}

#[tokio::test]
async fn test_tier_wins_policy_clamps_weight() {
    let mut config = TieringConfig::default();
    config.sync.policy = SyncPolicy::TierWins;
    let store = Arc::new(strata::storage::InMemoryStore::new());
    let service =
        TieringService::with_store(Arc::new(ConfigManager::new(config).unwrap()), store.clone());

    seed_assigned(store.as_ref(), "m1", Tier::archive(), 8.0)
        .await
        .unwrap();
    store.put(&MemoryRecord::new("m1", 9.7)).await.unwrap();

    let report = service.synchronizer().sync_all().await.unwrap();
    assert_eq!(report.synced_count, 1);
    assert_eq!(store.get("m1").await.unwrap().unwrap().weight, 8.9);
    assert_eq!(
        service.layers().get_assignment("m1").await.unwrap().tier,
        Tier::archive()
    );
}

#[tokio::test]
async fn test_verify_then_fix_reports_drift() {
    let (store, service) = memory_service();
    seed_assigned(store.as_ref(), "m1", Tier::short_term(), 2.0)
        .await
        .unwrap();
    store.put(&MemoryRecord::new("m1", 5.5)).await.unwrap();

    let sync = service.synchronizer();
    assert!(matches!(
        sync.check("m1").await,
        Err(StrataError::ConsistencyDrift(_))
    ));

    let consistency = sync.verify_consistency().await.unwrap();
    assert_eq!(consistency.inconsistent_count, 1);
    let status = service.get_system_status().await.unwrap();
    assert_eq!(status.metrics.sync_status, SyncStatus::Drifted);

    let fixed = sync.fix_inconsistencies().await.unwrap();
    assert_eq!(fixed.fixed_count, 1);
    assert!(sync.check("m1").await.is_ok());

    let status = service.get_system_status().await.unwrap();
    assert_eq!(status.metrics.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_capacity_alerts_follow_usage() {
    let mut config = TieringConfig::default();
    config
        .tiers
        .iter_mut()
        .find(|t| t.name == Tier::core())
        .unwrap()
        .max_records = 4;
    let store = Arc::new(strata::storage::InMemoryStore::new());
    let service =
        TieringService::with_store(Arc::new(ConfigManager::new(config).unwrap()), store.clone());

    for i in 0..4 {
        service
            .enhance_storage(MemoryRecord::new(format!("c{i}"), 9.5))
            .await;
    }

    let status = service.get_system_status().await.unwrap();
    let alert = status
        .alerts
        .iter()
        .find(|a| a.tier == Tier::core())
        .unwrap();
    assert_eq!(alert.level, AlertLevel::Critical);
}

#[tokio::test]
async fn test_lance_store_end_to_end() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LanceStore::open(dir.path()).await.unwrap());
    let service = TieringService::with_store(Arc::new(ConfigManager::default()), store.clone());

    for (id, weight) in [("core", 9.3), ("archive", 8.0), ("short", 1.5)] {
        let record = service.enhance_storage(MemoryRecord::new(id, weight)).await;
        assert!(record.tier.is_some());
        store.put(&record).await.unwrap();
    }
    // An unassigned record written by someone else
    store.put(&MemoryRecord::new("late", 5.0)).await.unwrap();

    let report = service.run_maintenance().await;
    assert!(!report.has_failures());
    assert_eq!(report.sync.completed().unwrap().synced_count, 1);

    let distribution = service.layers().distribution().await.unwrap();
    let counts: Vec<usize> = distribution.iter().map(|(_, n)| *n).collect();
    assert_eq!(counts, vec![1, 1, 1, 1]);

    // Reopening sees the same assignments
    drop(service);
    drop(store);
    let reopened = Arc::new(LanceStore::open(dir.path()).await.unwrap());
    let service = TieringService::with_store(Arc::new(ConfigManager::default()), reopened);
    assert_eq!(
        service.layers().get_assignment("late").await.unwrap().tier,
        Tier::long_term()
    );
}
