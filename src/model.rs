//! # Data Model
//!
//! Normalized in-memory entities for one provider connection.
//!
//! Every entity is identified by a **provider reference id** — the stable
//! identifier the remote system assigns. Reference ids are unique per entity
//! kind within a connection and are the match key between fetched entities
//! and persisted rows. They are never used as foreign keys; cross-entity
//! links are resolved to store-assigned [`PersistedId`]s at persist time.
//!
//! Entities are produced by the parser, assembled into an inventory graph,
//! and consumed by the reconciler. Nothing else mutates them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Store-assigned identifier of a persisted row.
pub type PersistedId = Uuid;

/// Identifier of the provider connection that owns an entity.
pub type ConnectionId = Uuid;

/// Free-form provider metadata attached to a subnet (enterprise, domain and
/// zone names/ids). Treated as an unordered key-value set for equality.
pub type ExtraAttributes = BTreeMap<String, String>;

/// Provider subtype discriminators, stored alongside the common fields in
/// place of a subclass hierarchy.
pub mod provider_kind {
    pub const NETWORK_GROUP: &str = "vsd.enterprise";
    pub const SECURITY_GROUP: &str = "vsd.policy_group";
    pub const CLOUD_SUBNET: &str = "vsd.subnet";
}

/// The entity kinds mirrored from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    NetworkGroup,
    SecurityGroup,
    CloudSubnet,
}

impl EntityKind {
    /// Kinds in foreign-key dependency order: groups before the kinds that
    /// reference them. Creates and updates are applied in this order.
    pub const DEPENDENCY_ORDER: [EntityKind; 3] = [
        EntityKind::NetworkGroup,
        EntityKind::SecurityGroup,
        EntityKind::CloudSubnet,
    ];

    /// Kinds in delete order: orphaned children are removed before their
    /// parents to avoid referential-integrity violations.
    pub const DELETE_ORDER: [EntityKind; 3] = [
        EntityKind::CloudSubnet,
        EntityKind::SecurityGroup,
        EntityKind::NetworkGroup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::NetworkGroup => "network_group",
            EntityKind::SecurityGroup => "security_group",
            EntityKind::CloudSubnet => "cloud_subnet",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider network group (enterprise-level container). Subnets and
/// security groups reference it; it owns nothing itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkGroup {
    pub provider_ref: String,
    pub name: String,
    pub status: String,
    pub cidr: Option<String>,
    pub enabled: Option<bool>,
    pub orchestration_stack_ref: Option<String>,
    pub provider_kind: String,
}

/// A provider security (policy) group. Belongs to at most one network group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub provider_ref: String,
    pub name: String,
    pub description: Option<String>,
    pub network_group_ref: Option<String>,
    pub cloud_network_ref: Option<String>,
    pub tenant_ref: Option<String>,
    pub orchestration_stack_ref: Option<String>,
    pub provider_kind: String,
}

/// A provider cloud subnet. Belongs to at most one network group and
/// optionally to a parent subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSubnet {
    pub provider_ref: String,
    pub name: String,
    pub cidr: Option<String>,
    pub gateway: Option<String>,
    pub network_protocol: Option<String>,
    pub dhcp_enabled: bool,
    pub dns_nameservers: Option<Vec<String>>,
    pub ipv6_address_mode: Option<String>,
    pub ipv6_router_advertisement_mode: Option<String>,
    pub network_group_ref: Option<String>,
    pub parent_subnet_ref: Option<String>,
    pub extra_attributes: ExtraAttributes,
    pub provider_kind: String,
}

/// A normalized entity of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    NetworkGroup(NetworkGroup),
    SecurityGroup(SecurityGroup),
    CloudSubnet(CloudSubnet),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::NetworkGroup(_) => EntityKind::NetworkGroup,
            Entity::SecurityGroup(_) => EntityKind::SecurityGroup,
            Entity::CloudSubnet(_) => EntityKind::CloudSubnet,
        }
    }

    pub fn provider_ref(&self) -> &str {
        match self {
            Entity::NetworkGroup(g) => &g.provider_ref,
            Entity::SecurityGroup(g) => &g.provider_ref,
            Entity::CloudSubnet(s) => &s.provider_ref,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::NetworkGroup(g) => &g.name,
            Entity::SecurityGroup(g) => &g.name,
            Entity::CloudSubnet(s) => &s.name,
        }
    }

    /// Provider reference of the owning network group, if any.
    pub fn network_group_ref(&self) -> Option<&str> {
        match self {
            Entity::NetworkGroup(_) => None,
            Entity::SecurityGroup(g) => g.network_group_ref.as_deref(),
            Entity::CloudSubnet(s) => s.network_group_ref.as_deref(),
        }
    }

    /// Provider reference of the parent subnet, if any.
    pub fn parent_subnet_ref(&self) -> Option<&str> {
        match self {
            Entity::CloudSubnet(s) => s.parent_subnet_ref.as_deref(),
            _ => None,
        }
    }

    /// Check the fields the store requires on every row.
    pub fn validate(&self) -> Result<(), EntityValidationError> {
        let missing = |field| EntityValidationError {
            kind: self.kind(),
            provider_ref: self.provider_ref().to_string(),
            field,
        };
        if self.provider_ref().is_empty() {
            return Err(missing("provider_ref"));
        }
        if self.name().is_empty() {
            return Err(missing("name"));
        }
        Ok(())
    }
}

/// A required field was absent or empty on an entity handed to the store.
#[derive(Debug, Clone, Error)]
#[error("{kind} `{provider_ref}`: missing required field `{field}`")]
pub struct EntityValidationError {
    pub kind: EntityKind,
    pub provider_ref: String,
    pub field: &'static str,
}
