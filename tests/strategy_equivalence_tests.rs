//! # Save Strategy Equivalence Tests
//!
//! Every save strategy must produce identical observable store state for
//! identical input graphs. The suites apply the same inventory (and the
//! same sequence of inventory changes) to fresh stores under each strategy
//! and compare the stores under a kind-and-reference-keyed snapshot with
//! persisted ids normalized away.

mod common;

use common::{recorded_inventory, snapshot, CannedCollector, CLOUD_SUBNET_REF2, NETWORK_GROUP_REF1};
use network_inventory_controller::model::EntityKind;
use network_inventory_controller::reconciler::SaveOptions;
use network_inventory_controller::refresher::Refresher;
use network_inventory_controller::store::{EntityStore, InMemoryStore};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn test_strategies_agree_on_initial_import() {
    let connection = Uuid::new_v4();
    let mut snapshots = Vec::new();

    for options in SaveOptions::ALL {
        let store = Arc::new(InMemoryStore::new());
        let refresher = Refresher::new(
            Arc::new(CannedCollector::recorded()),
            Arc::clone(&store) as Arc<dyn EntityStore>,
        );
        refresher.refresh(connection, options).await.unwrap();
        snapshots.push((options, snapshot(&store, connection).await));
    }

    let (reference_options, reference) = &snapshots[0];
    for (options, contents) in &snapshots[1..] {
        assert_eq!(
            contents, reference,
            "{options:?} diverged from {reference_options:?}"
        );
    }
}

#[tokio::test]
async fn test_strategies_agree_across_inventory_changes() {
    let connection = Uuid::new_v4();
    let mut snapshots = Vec::new();

    for options in SaveOptions::ALL {
        let store = Arc::new(InMemoryStore::new());
        let collector = Arc::new(CannedCollector::recorded());
        let refresher = Refresher::new(
            Arc::clone(&collector) as Arc<dyn network_inventory_controller::Collector>,
            Arc::clone(&store) as Arc<dyn EntityStore>,
        );

        // Pass 1: initial import
        refresher.refresh(connection, options).await.unwrap();

        // Pass 2: a rename, a removed subnet and a brand-new group
        let mut groups = recorded_inventory()
            .remove(&EntityKind::NetworkGroup)
            .unwrap();
        groups[0] = json!({"ID": NETWORK_GROUP_REF1, "name": "Ansible-Test-Renamed"});
        groups.push(json!({"ID": "f3b1c2d4-0000-4000-8000-000000000001", "name": "Fresh"}));
        collector.set_records(EntityKind::NetworkGroup, groups);

        let subnets: Vec<_> = recorded_inventory()
            .remove(&EntityKind::CloudSubnet)
            .unwrap()
            .into_iter()
            .filter(|record| record["ID"] != CLOUD_SUBNET_REF2)
            .collect();
        collector.set_records(EntityKind::CloudSubnet, subnets);

        refresher.refresh(connection, options).await.unwrap();
        snapshots.push((options, snapshot(&store, connection).await));
    }

    let (reference_options, reference) = &snapshots[0];
    assert_eq!(reference.len(), 5, "3 groups + 1 security group + 1 subnet");
    for (options, contents) in &snapshots[1..] {
        assert_eq!(
            contents, reference,
            "{options:?} diverged from {reference_options:?}"
        );
    }
}

#[tokio::test]
async fn test_every_strategy_is_idempotent() {
    for options in SaveOptions::ALL {
        let connection = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let refresher = Refresher::new(
            Arc::new(CannedCollector::recorded()),
            Arc::clone(&store) as Arc<dyn EntityStore>,
        );

        refresher.refresh(connection, options).await.unwrap();
        let first = snapshot(&store, connection).await;

        let result = refresher.refresh(connection, options).await.unwrap();
        let second = snapshot(&store, connection).await;

        assert_eq!(first, second, "{options:?} store contents drifted");
        assert_eq!(
            result.reconcile.total_changes(),
            0,
            "{options:?} second pass reported changes"
        );
    }
}

#[tokio::test]
async fn test_mixing_strategies_between_passes_converges() {
    // A mirror built by one strategy and refreshed by another stays stable
    let connection = Uuid::new_v4();
    let store = Arc::new(InMemoryStore::new());
    let refresher = Refresher::new(
        Arc::new(CannedCollector::recorded()),
        Arc::clone(&store) as Arc<dyn EntityStore>,
    );

    refresher
        .refresh(connection, SaveOptions::ALL[0])
        .await
        .unwrap();
    let baseline = snapshot(&store, connection).await;

    for options in &SaveOptions::ALL[1..] {
        let result = refresher.refresh(connection, *options).await.unwrap();
        assert_eq!(result.reconcile.total_changes(), 0);
        assert_eq!(snapshot(&store, connection).await, baseline);
    }
}
