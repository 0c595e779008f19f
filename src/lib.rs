//! Network Inventory Controller Library
//!
//! Core refresh pipeline for mirroring a cloud-network provider's topology
//! (network groups, security groups, cloud subnets) into a local entity
//! store. Tests are included in the module files and in `tests/`.

use serde::Deserialize;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod api;
pub mod backoff;
pub mod collector;
pub mod constants;
pub mod graph;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod reconciler;
pub mod refresher;
pub mod server;
pub mod store;

pub use api::NetworkApiClient;
pub use collector::{Collector, CollectorError, RawRecord};
pub use graph::InventoryGraph;
pub use model::{ConnectionId, Entity, EntityKind, PersistedId};
pub use reconciler::{ReconcileResult, SaveOptions, SaveStrategy};
pub use refresher::{RefreshError, RefreshPhase, RefreshResult, Refresher};
pub use store::{EntityStore, InMemoryStore};

/// A credential wiped from memory when dropped. Never printed.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Connection descriptor for one provider endpoint.
///
/// Threaded explicitly into the refresher; nothing reads connection
/// settings from ambient global state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Identifier partitioning this connection's rows in the store.
    #[serde(default = "uuid::Uuid::new_v4")]
    pub id: ConnectionId,
    /// Provider endpoint, e.g. `https://vsd.example.net:8443`.
    pub endpoint: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub username: String,
    /// May be left empty in the file and supplied via environment instead.
    #[serde(default)]
    pub password: Secret,
    #[serde(default = "default_organization")]
    pub organization: String,
    /// Skip TLS certificate validation. Lab setups only.
    #[serde(default)]
    pub insecure_tls: bool,
    /// How reconciliation writes its diffs.
    #[serde(default)]
    pub save: SaveOptions,
}

fn default_api_version() -> String {
    constants::DEFAULT_API_VERSION.to_string()
}

fn default_organization() -> String {
    "csp".to_string()
}
