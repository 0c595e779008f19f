//! Common test utilities for the refresh integration suites.
//!
//! Provides the canned collector that stands in for the provider API and
//! the recorded inventory scenario the end-to-end suites replay: two
//! network groups, one security group and two subnets under the second
//! group.

#![allow(dead_code, reason = "shared fixture module; not every suite uses every helper")]

use async_trait::async_trait;
use network_inventory_controller::collector::{Collector, CollectorError, RawRecord};
use network_inventory_controller::model::{ConnectionId, Entity, EntityKind};
use network_inventory_controller::store::{EntityStore, InMemoryStore};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

pub const NETWORK_GROUP_REF1: &str = "713d0ba0-dea8-44b4-8ac7-6cab9dc321a7";
pub const NETWORK_GROUP_REF2: &str = "e0819464-e7fc-4a37-b29a-e72da7b5956c";
pub const SECURITY_GROUP_REF: &str = "02e072ef-ca95-4164-856d-3ff177b9c13c";
pub const CLOUD_SUBNET_REF1: &str = "d60d316a-c1ac-4412-813c-9652bdbc4e41";
pub const CLOUD_SUBNET_REF2: &str = "debb9f88-f252-4c30-9a17-d6ae3865e365";
pub const DOMAIN_REF: &str = "75ad8ee8-726c-4950-94bc-6a5aab64631d";
pub const ZONE_REF1: &str = "6256954b-9dd6-43ed-94ff-9daa683ab8b0";
pub const ZONE_REF0: &str = "3b11a2d0-2082-42f1-92db-0b05264f372e";

/// The recorded provider inventory the suites replay.
pub fn recorded_inventory() -> HashMap<EntityKind, Vec<RawRecord>> {
    let mut records = HashMap::new();
    records.insert(
        EntityKind::NetworkGroup,
        vec![
            json!({"ID": NETWORK_GROUP_REF1, "name": "Ansible-Test"}),
            json!({"ID": NETWORK_GROUP_REF2, "name": "XLAB"}),
        ],
    );
    records.insert(
        EntityKind::SecurityGroup,
        vec![json!({
            "ID": SECURITY_GROUP_REF,
            "name": "Test Policy Group",
            "enterpriseID": NETWORK_GROUP_REF2
        })],
    );
    records.insert(
        EntityKind::CloudSubnet,
        vec![
            json!({
                "ID": CLOUD_SUBNET_REF1,
                "name": "Subnet 1",
                "address": "10.10.20.0",
                "netmask": "255.255.255.0",
                "gateway": "10.10.20.1",
                "IPType": "IPV4",
                "enterpriseID": NETWORK_GROUP_REF2,
                "enterpriseName": "XLAB",
                "domainID": DOMAIN_REF,
                "domainName": "BaseL3",
                "zoneID": ZONE_REF1,
                "zoneName": "Zone 1"
            }),
            json!({
                "ID": CLOUD_SUBNET_REF2,
                "name": "Subnet 0",
                "address": "10.10.10.0",
                "netmask": "255.255.255.0",
                "gateway": "10.10.10.1",
                "IPType": "IPV4",
                "enterpriseID": NETWORK_GROUP_REF2,
                "enterpriseName": "XLAB",
                "domainID": DOMAIN_REF,
                "domainName": "BaseL3",
                "zoneID": ZONE_REF0,
                "zoneName": "Zone 0"
            }),
        ],
    );
    records
}

/// Collector replaying canned record listings instead of live HTTP.
///
/// Listings can be swapped between passes to simulate provider-side
/// changes, and single kinds can be made to fail with a transport error.
pub struct CannedCollector {
    records: Mutex<HashMap<EntityKind, Vec<RawRecord>>>,
    fail_kind: Mutex<Option<EntityKind>>,
}

impl CannedCollector {
    pub fn new(records: HashMap<EntityKind, Vec<RawRecord>>) -> Self {
        Self {
            records: Mutex::new(records),
            fail_kind: Mutex::new(None),
        }
    }

    pub fn recorded() -> Self {
        Self::new(recorded_inventory())
    }

    /// Replace one kind's listing for subsequent passes.
    pub fn set_records(&self, kind: EntityKind, records: Vec<RawRecord>) {
        self.records.lock().unwrap().insert(kind, records);
    }

    /// Make fetches of one kind fail with a transport error.
    pub fn fail_on(&self, kind: Option<EntityKind>) {
        *self.fail_kind.lock().unwrap() = kind;
    }
}

#[async_trait]
impl Collector for CannedCollector {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<RawRecord>, CollectorError> {
        if *self.fail_kind.lock().unwrap() == Some(kind) {
            return Err(CollectorError::Transport {
                kind,
                reason: "connection reset by peer".to_string(),
            });
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }
}

/// A store row reduced to strategy-independent form: persisted ids are
/// replaced by the provider references of the rows they point at.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparableRow {
    pub entity: Entity,
    pub group_fk: Option<String>,
    pub parent_fk: Option<String>,
}

/// Store contents keyed by kind and provider reference.
pub async fn snapshot(
    store: &InMemoryStore,
    connection_id: ConnectionId,
) -> BTreeMap<(EntityKind, String), ComparableRow> {
    let mut id_to_ref = HashMap::new();
    for kind in EntityKind::DEPENDENCY_ORDER {
        for row in store.list(connection_id, kind).await.unwrap() {
            id_to_ref.insert(row.id, row.entity.provider_ref().to_string());
        }
    }

    let mut rows = BTreeMap::new();
    for kind in EntityKind::DEPENDENCY_ORDER {
        for row in store.list(connection_id, kind).await.unwrap() {
            rows.insert(
                (kind, row.entity.provider_ref().to_string()),
                ComparableRow {
                    entity: row.entity,
                    group_fk: row.network_group_id.map(|id| id_to_ref[&id].clone()),
                    parent_fk: row.parent_subnet_id.map(|id| id_to_ref[&id].clone()),
                },
            );
        }
    }
    rows
}
