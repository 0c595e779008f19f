//! # Inventory Graph
//!
//! The immutable, cross-referenced output of one fetch+parse pass and the
//! single input to reconciliation.
//!
//! [`InventoryGraph::build`] groups parsed entities by kind, keeps them in
//! insertion order, and verifies graph consistency: reference ids must be
//! unique per kind and every intra-graph reference (subnet → group,
//! security group → group, subnet → parent subnet) must resolve. Dangling
//! references are a data error surfaced at build time, never silently
//! nulled.

use crate::model::{CloudSubnet, ConnectionId, Entity, EntityKind, NetworkGroup, SecurityGroup};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Two fetched entities of one kind share a reference id.
    #[error("duplicate {kind} reference `{provider_ref}` in fetched inventory")]
    DuplicateReference {
        kind: EntityKind,
        provider_ref: String,
    },

    /// An entity references another that is not part of this graph.
    #[error("{kind} `{provider_ref}` references unknown {target_kind} `{target_ref}`")]
    UnresolvedReference {
        kind: EntityKind,
        provider_ref: String,
        target_kind: EntityKind,
        target_ref: String,
    },
}

/// In-memory inventory of one provider connection.
#[derive(Debug, Clone)]
pub struct InventoryGraph {
    connection_id: ConnectionId,
    network_groups: Vec<NetworkGroup>,
    security_groups: Vec<SecurityGroup>,
    cloud_subnets: Vec<CloudSubnet>,
}

impl InventoryGraph {
    /// Assemble and validate a graph from parsed entities.
    pub fn build(
        connection_id: ConnectionId,
        entities: Vec<Entity>,
    ) -> Result<InventoryGraph, GraphError> {
        let mut graph = InventoryGraph {
            connection_id,
            network_groups: Vec::new(),
            security_groups: Vec::new(),
            cloud_subnets: Vec::new(),
        };

        let mut seen: HashSet<(EntityKind, String)> = HashSet::new();
        for entity in entities {
            let key = (entity.kind(), entity.provider_ref().to_string());
            if !seen.insert(key) {
                return Err(GraphError::DuplicateReference {
                    kind: entity.kind(),
                    provider_ref: entity.provider_ref().to_string(),
                });
            }
            match entity {
                Entity::NetworkGroup(g) => graph.network_groups.push(g),
                Entity::SecurityGroup(g) => graph.security_groups.push(g),
                Entity::CloudSubnet(s) => graph.cloud_subnets.push(s),
            }
        }

        graph.check_references()?;
        Ok(graph)
    }

    /// Assemble a graph without consistency checks.
    ///
    /// The reconciler re-validates references against the store during its
    /// apply step, so an unresolved reference still fails — but there, not
    /// here. Intended for callers that assemble graphs by hand.
    pub fn from_parts(
        connection_id: ConnectionId,
        network_groups: Vec<NetworkGroup>,
        security_groups: Vec<SecurityGroup>,
        cloud_subnets: Vec<CloudSubnet>,
    ) -> InventoryGraph {
        InventoryGraph {
            connection_id,
            network_groups,
            security_groups,
            cloud_subnets,
        }
    }

    fn check_references(&self) -> Result<(), GraphError> {
        let group_refs: HashSet<&str> = self
            .network_groups
            .iter()
            .map(|g| g.provider_ref.as_str())
            .collect();
        let subnet_refs: HashSet<&str> = self
            .cloud_subnets
            .iter()
            .map(|s| s.provider_ref.as_str())
            .collect();

        let unresolved = |kind, provider_ref: &str, target_kind, target_ref: &str| {
            GraphError::UnresolvedReference {
                kind,
                provider_ref: provider_ref.to_string(),
                target_kind,
                target_ref: target_ref.to_string(),
            }
        };

        for group in &self.security_groups {
            if let Some(target) = group.network_group_ref.as_deref() {
                if !group_refs.contains(target) {
                    return Err(unresolved(
                        EntityKind::SecurityGroup,
                        &group.provider_ref,
                        EntityKind::NetworkGroup,
                        target,
                    ));
                }
            }
        }
        for subnet in &self.cloud_subnets {
            if let Some(target) = subnet.network_group_ref.as_deref() {
                if !group_refs.contains(target) {
                    return Err(unresolved(
                        EntityKind::CloudSubnet,
                        &subnet.provider_ref,
                        EntityKind::NetworkGroup,
                        target,
                    ));
                }
            }
            if let Some(target) = subnet.parent_subnet_ref.as_deref() {
                if !subnet_refs.contains(target) {
                    return Err(unresolved(
                        EntityKind::CloudSubnet,
                        &subnet.provider_ref,
                        EntityKind::CloudSubnet,
                        target,
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn network_groups(&self) -> &[NetworkGroup] {
        &self.network_groups
    }

    pub fn security_groups(&self) -> &[SecurityGroup] {
        &self.security_groups
    }

    pub fn cloud_subnets(&self) -> &[CloudSubnet] {
        &self.cloud_subnets
    }

    /// Entities of one kind, in insertion order.
    pub fn entities_of(&self, kind: EntityKind) -> Vec<Entity> {
        match kind {
            EntityKind::NetworkGroup => self
                .network_groups
                .iter()
                .cloned()
                .map(Entity::NetworkGroup)
                .collect(),
            EntityKind::SecurityGroup => self
                .security_groups
                .iter()
                .cloned()
                .map(Entity::SecurityGroup)
                .collect(),
            EntityKind::CloudSubnet => self
                .cloud_subnets
                .iter()
                .cloned()
                .map(Entity::CloudSubnet)
                .collect(),
        }
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::NetworkGroup => self.network_groups.len(),
            EntityKind::SecurityGroup => self.security_groups.len(),
            EntityKind::CloudSubnet => self.cloud_subnets.len(),
        }
    }

    pub fn total(&self) -> usize {
        self.network_groups.len() + self.security_groups.len() + self.cloud_subnets.len()
    }

    /// Security groups owned by the given network group.
    pub fn security_groups_of<'a>(
        &'a self,
        group_ref: Option<&'a str>,
    ) -> impl Iterator<Item = &'a SecurityGroup> {
        self.security_groups
            .iter()
            .filter(move |g| g.network_group_ref.as_deref() == group_ref)
    }

    /// Subnets owned by the given network group.
    pub fn cloud_subnets_of<'a>(
        &'a self,
        group_ref: Option<&'a str>,
    ) -> impl Iterator<Item = &'a CloudSubnet> {
        self.cloud_subnets
            .iter()
            .filter(move |s| s.network_group_ref.as_deref() == group_ref)
    }
}
