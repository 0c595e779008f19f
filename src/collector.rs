//! # Collector
//!
//! The remote I/O boundary of a refresh pass.
//!
//! A [`Collector`] returns raw entity listings for one provider connection.
//! The core treats it as `fetch(kind) -> raw records` and assumes nothing
//! about transport; the production implementation lives in [`crate::api`],
//! and test suites substitute canned record sequences.

use crate::model::EntityKind;
use async_trait::async_trait;
use thiserror::Error;

/// One raw provider record, exactly as the API returned it.
pub type RawRecord = serde_json::Value;

#[derive(Debug, Clone, Error)]
pub enum CollectorError {
    /// Transient transport failure. Retryable with backoff.
    #[error("transport error fetching {kind} listings: {reason}")]
    Transport { kind: EntityKind, reason: String },

    /// The provider rejected our credentials. Not retryable.
    #[error("provider authentication failed: {reason}")]
    Auth { reason: String },

    /// The provider answered with a payload we cannot interpret.
    #[error("unexpected payload from `{endpoint}`: {reason}")]
    Decode { endpoint: String, reason: String },
}

impl CollectorError {
    /// Whether retrying the fetch can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectorError::Transport { .. })
    }
}

/// Fetches raw entity listings from the provider API.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<RawRecord>, CollectorError>;
}
