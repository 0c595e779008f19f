//! # Refresher
//!
//! Orchestrates one full refresh pass for a provider connection:
//!
//! ```text
//! Fetching -> Parsing -> Building -> Reconciling -> Done
//!     \----------\----------\----------\-> Failed
//! ```
//!
//! Nothing is written to the store before the Reconciling phase, so a
//! failure in an earlier phase commits no partial graph. Once Reconciling
//! has started, failure isolation is the reconciler's: per-kind changes
//! already applied remain in place.
//!
//! The write phase runs under a per-connection async lock so two
//! concurrent refreshes of the same connection cannot interleave their
//! diff/apply cycles. Distinct connections proceed independently.

use crate::collector::{Collector, CollectorError, RawRecord};
use crate::graph::{GraphError, InventoryGraph};
use crate::metrics;
use crate::model::{ConnectionId, Entity, EntityKind};
use crate::parser::{self, ParseError};
use crate::reconciler::{self, ReconcileError, ReconcileResult, SaveOptions};
use crate::store::EntityStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Phases of a refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Fetching,
    Parsing,
    Building,
    Reconciling,
    Done,
    Failed,
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            RefreshPhase::Fetching => "fetching",
            RefreshPhase::Parsing => "parsing",
            RefreshPhase::Building => "building",
            RefreshPhase::Reconciling => "reconciling",
            RefreshPhase::Done => "done",
            RefreshPhase::Failed => "failed",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] CollectorError),

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("graph build failed: {0}")]
    Graph(#[from] GraphError),

    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

impl RefreshError {
    /// The phase the pass failed in.
    pub fn phase(&self) -> RefreshPhase {
        match self {
            RefreshError::Fetch(_) => RefreshPhase::Fetching,
            RefreshError::Parse(_) => RefreshPhase::Parsing,
            RefreshError::Graph(_) => RefreshPhase::Building,
            RefreshError::Reconcile(_) => RefreshPhase::Reconciling,
        }
    }
}

/// Summary of one completed refresh pass.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub connection_id: ConnectionId,
    pub phase: RefreshPhase,
    pub reconcile: ReconcileResult,
    /// Records dropped per kind on non-fatal parse errors.
    pub skipped: BTreeMap<EntityKind, usize>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// Registry of per-connection write locks.
#[derive(Debug, Default)]
pub struct ConnectionLocks {
    locks: Mutex<HashMap<ConnectionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionLocks {
    fn for_connection(&self, connection_id: ConnectionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| {
            // A panic while holding the registry lock leaves the map intact
            poisoned.into_inner()
        });
        Arc::clone(locks.entry(connection_id).or_default())
    }
}

/// Sequences fetch -> parse -> build -> reconcile for one connection.
#[derive(Clone)]
pub struct Refresher {
    collector: Arc<dyn Collector>,
    store: Arc<dyn EntityStore>,
    locks: Arc<ConnectionLocks>,
}

impl fmt::Debug for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresher").finish_non_exhaustive()
    }
}

impl Refresher {
    pub fn new(collector: Arc<dyn Collector>, store: Arc<dyn EntityStore>) -> Self {
        Self {
            collector,
            store,
            locks: Arc::new(ConnectionLocks::default()),
        }
    }

    /// Share a lock registry between refresher instances writing to the
    /// same store.
    pub fn with_locks(
        collector: Arc<dyn Collector>,
        store: Arc<dyn EntityStore>,
        locks: Arc<ConnectionLocks>,
    ) -> Self {
        Self {
            collector,
            store,
            locks,
        }
    }

    /// Run one refresh pass. Back-to-back passes over unchanged provider
    /// data leave the store identical after the second call.
    pub async fn refresh(
        &self,
        connection_id: ConnectionId,
        options: SaveOptions,
    ) -> Result<RefreshResult, RefreshError> {
        metrics::increment_refreshes();
        let result = self.run_pass(connection_id, options).await;
        match &result {
            Ok(summary) => {
                metrics::observe_refresh_duration(summary.duration_secs);
                info!(
                    connection = %connection_id,
                    changes = summary.reconcile.total_changes(),
                    failed = summary.reconcile.total_failed(),
                    duration_secs = summary.duration_secs,
                    "refresh complete"
                );
            }
            Err(e) => {
                metrics::increment_refresh_errors();
                error!(connection = %connection_id, phase = %e.phase(), error = %e, "refresh failed");
            }
        }
        result
    }

    async fn run_pass(
        &self,
        connection_id: ConnectionId,
        options: SaveOptions,
    ) -> Result<RefreshResult, RefreshError> {
        let started_at = Utc::now();
        let start = Instant::now();

        info!(connection = %connection_id, phase = %RefreshPhase::Fetching, "starting refresh");
        let mut raw: Vec<(EntityKind, Vec<RawRecord>)> = Vec::new();
        for kind in EntityKind::DEPENDENCY_ORDER {
            let records = self.collector.fetch(kind).await?;
            raw.push((kind, records));
        }

        info!(connection = %connection_id, phase = %RefreshPhase::Parsing, "parsing records");
        let mut entities: Vec<Entity> = Vec::new();
        let mut skipped: BTreeMap<EntityKind, usize> = BTreeMap::new();
        for (kind, records) in raw {
            for record in records {
                match parser::parse_record(kind, &record) {
                    Ok(entity) => entities.push(entity),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "skipping unparseable record");
                        *skipped.entry(kind).or_default() += 1;
                    }
                }
            }
        }

        info!(connection = %connection_id, phase = %RefreshPhase::Building, entities = entities.len(), "building inventory graph");
        let graph = InventoryGraph::build(connection_id, entities)?;

        info!(connection = %connection_id, phase = %RefreshPhase::Reconciling, "reconciling against store");
        let reconcile = {
            // Serialize the write phase per connection
            let lock = self.locks.for_connection(connection_id);
            let _guard = lock.lock().await;
            reconciler::reconcile(&graph, self.store.as_ref(), options).await?
        };

        for (kind, stats) in &reconcile.stats {
            metrics::record_entity_changes(
                kind.as_str(),
                stats.created,
                stats.updated,
                stats.deleted,
                stats.failed,
            );
        }

        Ok(RefreshResult {
            connection_id,
            phase: RefreshPhase::Done,
            reconcile,
            skipped,
            started_at,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    /// Canned collector serving fixed record listings per kind.
    struct CannedCollector {
        records: HashMap<EntityKind, Vec<RawRecord>>,
        fail_kind: Option<EntityKind>,
    }

    impl CannedCollector {
        fn new(records: HashMap<EntityKind, Vec<RawRecord>>) -> Self {
            Self {
                records,
                fail_kind: None,
            }
        }
    }

    #[async_trait]
    impl Collector for CannedCollector {
        async fn fetch(&self, kind: EntityKind) -> Result<Vec<RawRecord>, CollectorError> {
            if self.fail_kind == Some(kind) {
                return Err(CollectorError::Transport {
                    kind,
                    reason: "connection reset".to_string(),
                });
            }
            Ok(self.records.get(&kind).cloned().unwrap_or_default())
        }
    }

    fn small_inventory() -> HashMap<EntityKind, Vec<RawRecord>> {
        let mut records = HashMap::new();
        records.insert(
            EntityKind::NetworkGroup,
            vec![json!({"ID": "g-1", "name": "XLAB"})],
        );
        records.insert(
            EntityKind::SecurityGroup,
            vec![json!({"ID": "sg-1", "name": "Policy", "enterpriseID": "g-1"})],
        );
        records.insert(
            EntityKind::CloudSubnet,
            vec![json!({
                "ID": "sub-1",
                "name": "Subnet 0",
                "address": "10.10.10.0",
                "netmask": "255.255.255.0",
                "gateway": "10.10.10.1",
                "IPType": "IPV4",
                "enterpriseID": "g-1"
            })],
        );
        records
    }

    #[tokio::test]
    async fn test_refresh_builds_full_mirror() {
        let connection = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let collector = Arc::new(CannedCollector::new(small_inventory()));
        let refresher = Refresher::new(collector, Arc::clone(&store) as Arc<dyn EntityStore>);

        let result = refresher
            .refresh(connection, SaveOptions::default())
            .await
            .unwrap();

        assert_eq!(result.phase, RefreshPhase::Done);
        assert_eq!(result.reconcile.total_changes(), 3);
        assert!(result.skipped.is_empty());
        assert_eq!(store.row_count(connection).await, 3);
    }

    #[tokio::test]
    async fn test_second_refresh_changes_nothing() {
        let connection = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let collector = Arc::new(CannedCollector::new(small_inventory()));
        let refresher = Refresher::new(collector, Arc::clone(&store) as Arc<dyn EntityStore>);

        refresher
            .refresh(connection, SaveOptions::default())
            .await
            .unwrap();
        let second = refresher
            .refresh(connection, SaveOptions::default())
            .await
            .unwrap();

        assert_eq!(second.reconcile.total_changes(), 0);
        assert_eq!(store.row_count(connection).await, 3);
    }

    #[tokio::test]
    async fn test_fetch_failure_commits_nothing() {
        let connection = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let mut collector = CannedCollector::new(small_inventory());
        collector.fail_kind = Some(EntityKind::CloudSubnet);
        let refresher =
            Refresher::new(Arc::new(collector), Arc::clone(&store) as Arc<dyn EntityStore>);

        let err = refresher
            .refresh(connection, SaveOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.phase(), RefreshPhase::Fetching);
        // Fetch happens before any write; the store stays empty
        assert_eq!(store.row_count(connection).await, 0);
    }

    #[tokio::test]
    async fn test_unparseable_record_is_skipped_and_counted() {
        let connection = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let mut records = small_inventory();
        records
            .get_mut(&EntityKind::NetworkGroup)
            .unwrap()
            .push(json!({"ID": "g-2"})); // no name
        let refresher = Refresher::new(
            Arc::new(CannedCollector::new(records)),
            Arc::clone(&store) as Arc<dyn EntityStore>,
        );

        let result = refresher
            .refresh(connection, SaveOptions::default())
            .await
            .unwrap();

        assert_eq!(result.skipped.get(&EntityKind::NetworkGroup), Some(&1));
        assert_eq!(store.row_count(connection).await, 3);
    }

    #[tokio::test]
    async fn test_record_without_identity_fails_pass() {
        let connection = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        let mut records = small_inventory();
        records
            .get_mut(&EntityKind::NetworkGroup)
            .unwrap()
            .push(json!({"name": "anonymous"}));
        let refresher = Refresher::new(
            Arc::new(CannedCollector::new(records)),
            Arc::clone(&store) as Arc<dyn EntityStore>,
        );

        let err = refresher
            .refresh(connection, SaveOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), RefreshPhase::Parsing);
        assert_eq!(store.row_count(connection).await, 0);
    }
}
