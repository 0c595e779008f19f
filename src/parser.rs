//! # Parser
//!
//! Transforms raw provider records into normalized entities.
//!
//! Parsing is pure: no I/O, no store access. Each function takes one raw
//! JSON record as returned by the collector and produces a typed entity.
//! Malformed optional fields fail with a per-record [`ParseError`] that the
//! orchestrator logs and skips; a record without its identity field (`ID`)
//! escalates to a pass failure, since without it the row cannot be matched
//! against the store.
//!
//! Subnet records arrive flattened with enterprise/domain/zone context from
//! the collector's hierarchy walk; that context becomes the subnet's
//! extra-attributes map.

use crate::collector::RawRecord;
use crate::model::{
    provider_kind, CloudSubnet, Entity, EntityKind, ExtraAttributes, NetworkGroup, SecurityGroup,
};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// The record has no usable identity field. Escalates to pass failure.
    #[error("{kind} record has no `ID` field")]
    MissingIdentity { kind: EntityKind },

    /// A required non-identity field is absent. The record is skipped.
    #[error("{kind} `{provider_ref}`: missing field `{field}`")]
    MissingField {
        kind: EntityKind,
        provider_ref: String,
        field: &'static str,
    },

    /// Address/netmask pair that cannot be combined into CIDR notation.
    #[error("invalid network spec: address `{address}`, netmask `{netmask}`")]
    InvalidNetworkSpec { address: String, netmask: String },
}

impl ParseError {
    /// Whether this error aborts the whole pass instead of skipping a record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::MissingIdentity { .. })
    }
}

/// Combine a dotted address and netmask into CIDR notation.
///
/// Returns `None` when either input is absent or empty — a provider group
/// without an assigned network is a defined case, not an error. Malformed
/// input (unparseable address, non-contiguous netmask) fails with
/// [`ParseError::InvalidNetworkSpec`].
pub fn to_cidr(address: Option<&str>, netmask: Option<&str>) -> Result<Option<String>, ParseError> {
    let (address, netmask) = match (address, netmask) {
        (Some(a), Some(m)) if !a.is_empty() && !m.is_empty() => (a, m),
        _ => return Ok(None),
    };

    let invalid = || ParseError::InvalidNetworkSpec {
        address: address.to_string(),
        netmask: netmask.to_string(),
    };

    let addr: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let mask: Ipv4Addr = netmask.parse().map_err(|_| invalid())?;

    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    // A valid netmask is a run of ones followed by zeros
    if prefix != bits.count_ones() {
        return Err(invalid());
    }

    Ok(Some(format!("{addr}/{prefix}")))
}

/// Parse a raw record of the given kind.
pub fn parse_record(kind: EntityKind, record: &RawRecord) -> Result<Entity, ParseError> {
    match kind {
        EntityKind::NetworkGroup => parse_network_group(record).map(Entity::NetworkGroup),
        EntityKind::SecurityGroup => parse_security_group(record).map(Entity::SecurityGroup),
        EntityKind::CloudSubnet => parse_cloud_subnet(record).map(Entity::CloudSubnet),
    }
}

/// Parse an enterprise record into a network group.
pub fn parse_network_group(record: &RawRecord) -> Result<NetworkGroup, ParseError> {
    let provider_ref = identity(record, EntityKind::NetworkGroup)?;
    let name = required_str(record, "name", EntityKind::NetworkGroup, &provider_ref)?;

    Ok(NetworkGroup {
        provider_ref,
        name,
        // Enterprises the API lists are live containers; the provider carries
        // no status field for them
        status: "active".to_string(),
        cidr: to_cidr(str_field(record, "address"), str_field(record, "netmask"))?,
        enabled: None,
        orchestration_stack_ref: None,
        provider_kind: provider_kind::NETWORK_GROUP.to_string(),
    })
}

/// Parse a policy-group record into a security group.
pub fn parse_security_group(record: &RawRecord) -> Result<SecurityGroup, ParseError> {
    let provider_ref = identity(record, EntityKind::SecurityGroup)?;
    let name = required_str(record, "name", EntityKind::SecurityGroup, &provider_ref)?;

    Ok(SecurityGroup {
        provider_ref,
        name,
        description: opt_string(record, "description"),
        network_group_ref: opt_string(record, "enterpriseID"),
        cloud_network_ref: None,
        tenant_ref: None,
        orchestration_stack_ref: None,
        provider_kind: provider_kind::SECURITY_GROUP.to_string(),
    })
}

/// Parse a subnet record into a cloud subnet.
pub fn parse_cloud_subnet(record: &RawRecord) -> Result<CloudSubnet, ParseError> {
    let provider_ref = identity(record, EntityKind::CloudSubnet)?;
    let name = required_str(record, "name", EntityKind::CloudSubnet, &provider_ref)?;

    let mut extra_attributes = ExtraAttributes::new();
    for (attr, field) in [
        ("enterprise_name", "enterpriseName"),
        ("enterprise_id", "enterpriseID"),
        ("domain_name", "domainName"),
        ("domain_id", "domainID"),
        ("zone_name", "zoneName"),
        ("zone_id", "zoneID"),
    ] {
        if let Some(value) = str_field(record, field) {
            extra_attributes.insert(attr.to_string(), value.to_string());
        }
    }

    Ok(CloudSubnet {
        provider_ref,
        name,
        cidr: to_cidr(str_field(record, "address"), str_field(record, "netmask"))?,
        gateway: opt_string(record, "gateway"),
        network_protocol: str_field(record, "IPType").map(str::to_lowercase),
        dhcp_enabled: record
            .get("DHCPManaged")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
        dns_nameservers: None,
        ipv6_address_mode: None,
        ipv6_router_advertisement_mode: None,
        network_group_ref: opt_string(record, "enterpriseID"),
        parent_subnet_ref: None,
        extra_attributes,
        provider_kind: provider_kind::CLOUD_SUBNET.to_string(),
    })
}

fn identity(record: &RawRecord, kind: EntityKind) -> Result<String, ParseError> {
    str_field(record, "ID")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or(ParseError::MissingIdentity { kind })
}

fn required_str(
    record: &RawRecord,
    field: &'static str,
    kind: EntityKind,
    provider_ref: &str,
) -> Result<String, ParseError> {
    str_field(record, field)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ParseError::MissingField {
            kind,
            provider_ref: provider_ref.to_string(),
            field,
        })
}

fn str_field<'a>(record: &'a RawRecord, field: &str) -> Option<&'a str> {
    record.get(field).and_then(serde_json::Value::as_str)
}

fn opt_string(record: &RawRecord, field: &str) -> Option<String> {
    str_field(record, field)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
