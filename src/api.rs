//! # Provider API Client
//!
//! `reqwest`-based [`Collector`] for a VSD-style network API.
//!
//! ## Authentication
//!
//! The client authenticates with HTTP basic auth against `/me`, which
//! returns an API key; subsequent requests use basic auth with
//! `username:api_key` plus the organization header. The key is cached for
//! the lifetime of the client and refreshed when the provider rejects it.
//!
//! ## Listings
//!
//! The provider exposes its topology hierarchically. Listing calls walk it
//! and emit flat records, enriching children with the ancestry context the
//! parser stores as subnet extra-attributes:
//!
//! - network groups: `GET /enterprises`
//! - security groups: enterprises -> domains -> `GET /domains/{id}/policygroups`
//! - cloud subnets: enterprises -> domains -> zones -> `GET /zones/{id}/subnets`
//!
//! Transient transport failures (I/O errors, HTTP 5xx) are retried with
//! Fibonacci backoff before surfacing as [`CollectorError::Transport`].

use crate::backoff::FibonacciBackoff;
use crate::collector::{Collector, CollectorError, RawRecord};
use crate::constants::{
    DEFAULT_FETCH_ATTEMPTS, DEFAULT_FETCH_BACKOFF_MAX_SECS, DEFAULT_FETCH_BACKOFF_MIN_SECS,
};
use crate::metrics;
use crate::model::EntityKind;
use crate::ConnectionConfig;
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ORGANIZATION_HEADER: &str = "X-Nuage-Organization";

/// HTTP client for one provider connection.
pub struct NetworkApiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    organization: String,
    api_key: RwLock<Option<String>>,
}

impl std::fmt::Debug for NetworkApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkApiClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

impl NetworkApiClient {
    pub fn new(config: &ConnectionConfig) -> Result<Self, CollectorError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()
            .map_err(|e| CollectorError::Auth {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: format!(
                "{}/nuage/api/{}",
                config.endpoint.trim_end_matches('/'),
                config.api_version
            ),
            username: config.username.clone(),
            password: config.password.expose().to_string(),
            organization: config.organization.clone(),
            api_key: RwLock::new(None),
        })
    }

    /// The cached API key, authenticating first if necessary.
    async fn api_key(&self) -> Result<String, CollectorError> {
        if let Some(key) = self.api_key.read().await.clone() {
            return Ok(key);
        }
        let key = self.authenticate().await?;
        *self.api_key.write().await = Some(key.clone());
        Ok(key)
    }

    /// Basic-auth handshake against `/me`; the response carries the API key
    /// used for every other request.
    async fn authenticate(&self) -> Result<String, CollectorError> {
        let url = format!("{}/me", self.base_url);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ORGANIZATION_HEADER, &self.organization)
            .send()
            .await
            .map_err(|e| CollectorError::Auth {
                reason: format!("handshake request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(CollectorError::Auth {
                reason: format!("provider answered {} to the handshake", response.status()),
            });
        }

        let body: Value = response.json().await.map_err(|e| CollectorError::Auth {
            reason: format!("handshake payload unreadable: {e}"),
        })?;
        let key = body
            .get(0)
            .and_then(|me| me.get("APIKey"))
            .and_then(Value::as_str)
            .ok_or_else(|| CollectorError::Auth {
                reason: "handshake payload carries no APIKey".to_string(),
            })?;

        info!(username = %self.username, "authenticated with provider API");
        Ok(key.to_string())
    }

    /// GET a listing endpoint with retries. An empty listing comes back as
    /// HTTP 204 with no body.
    async fn get_list(&self, kind: EntityKind, path: &str) -> Result<Vec<RawRecord>, CollectorError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut backoff =
            FibonacciBackoff::new(DEFAULT_FETCH_BACKOFF_MIN_SECS, DEFAULT_FETCH_BACKOFF_MAX_SECS);
        let mut last_reason = String::new();

        for attempt in 1..=DEFAULT_FETCH_ATTEMPTS {
            if attempt > 1 {
                metrics::increment_fetch_retries(kind.as_str());
                tokio::time::sleep(backoff.next_backoff()).await;
            }

            match self.get_list_once(&url).await {
                Ok(records) => return Ok(records),
                Err(CollectorError::Transport { reason, .. }) => {
                    warn!(kind = %kind, url = %url, attempt, reason = %reason, "listing fetch failed, retrying");
                    last_reason = reason;
                }
                Err(other) => return Err(other),
            }
        }

        Err(CollectorError::Transport {
            kind,
            reason: last_reason,
        })
    }

    async fn get_list_once(&self, url: &str) -> Result<Vec<RawRecord>, CollectorError> {
        let api_key = self.api_key().await?;
        let transport = |reason: String| CollectorError::Transport {
            // Attributed to the right kind by the caller
            kind: EntityKind::NetworkGroup,
            reason,
        };

        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&api_key))
            .header(ORGANIZATION_HEADER, &self.organization)
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            status if status.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| transport(e.to_string()))?;
                match body {
                    Value::Array(records) => Ok(records),
                    Value::Null => Ok(Vec::new()),
                    other => Err(CollectorError::Decode {
                        endpoint: url.to_string(),
                        reason: format!("expected a listing array, got {other}"),
                    }),
                }
            }
            status if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                // Expired key; force a new handshake on the next call
                *self.api_key.write().await = None;
                Err(CollectorError::Auth {
                    reason: format!("provider answered {status}"),
                })
            }
            status if status.is_server_error() => {
                Err(transport(format!("provider answered {status}")))
            }
            status => Err(CollectorError::Decode {
                endpoint: url.to_string(),
                reason: format!("provider answered {status}"),
            }),
        }
    }

    fn id_of(record: &RawRecord) -> Option<&str> {
        record.get("ID").and_then(Value::as_str)
    }

    fn name_of(record: &RawRecord) -> Option<&str> {
        record.get("name").and_then(Value::as_str)
    }

    async fn fetch_network_groups(&self) -> Result<Vec<RawRecord>, CollectorError> {
        self.get_list(EntityKind::NetworkGroup, "enterprises").await
    }

    async fn fetch_security_groups(&self) -> Result<Vec<RawRecord>, CollectorError> {
        let kind = EntityKind::SecurityGroup;

        // Collect (domain, owning enterprise) pairs, then list the policy
        // groups of all domains concurrently
        let mut targets: Vec<(String, String)> = Vec::new();
        for enterprise in self.fetch_network_groups().await? {
            let Some(enterprise_id) = Self::id_of(&enterprise) else {
                continue;
            };
            let domains = self
                .get_list(kind, &format!("enterprises/{enterprise_id}/domains"))
                .await?;
            for domain in &domains {
                if let Some(domain_id) = Self::id_of(domain) {
                    targets.push((domain_id.to_string(), enterprise_id.to_string()));
                }
            }
        }

        let listings = try_join_all(targets.iter().map(|(domain_id, _)| {
            let path = format!("domains/{domain_id}/policygroups");
            async move { self.get_list(kind, &path).await }
        }))
        .await?;

        let mut records = Vec::new();
        for ((_, enterprise_id), groups) in targets.iter().zip(listings) {
            for mut group in groups {
                if let Some(object) = group.as_object_mut() {
                    object.insert("enterpriseID".to_string(), Value::from(enterprise_id.as_str()));
                }
                records.push(group);
            }
        }

        debug!(count = records.len(), "collected policy groups");
        Ok(records)
    }

    async fn fetch_cloud_subnets(&self) -> Result<Vec<RawRecord>, CollectorError> {
        let kind = EntityKind::CloudSubnet;
        let mut records = Vec::new();

        for enterprise in self.fetch_network_groups().await? {
            let Some(enterprise_id) = Self::id_of(&enterprise) else {
                continue;
            };
            let enterprise_name = Self::name_of(&enterprise).unwrap_or_default().to_string();

            let domains = self
                .get_list(kind, &format!("enterprises/{enterprise_id}/domains"))
                .await?;
            for domain in &domains {
                let Some(domain_id) = Self::id_of(domain) else {
                    continue;
                };
                let domain_name = Self::name_of(domain).unwrap_or_default().to_string();

                let zones = self
                    .get_list(kind, &format!("domains/{domain_id}/zones"))
                    .await?;
                for zone in &zones {
                    let Some(zone_id) = Self::id_of(zone) else {
                        continue;
                    };
                    let zone_name = Self::name_of(zone).unwrap_or_default().to_string();

                    let subnets = self
                        .get_list(kind, &format!("zones/{zone_id}/subnets"))
                        .await?;
                    for mut subnet in subnets {
                        if let Some(object) = subnet.as_object_mut() {
                            object.insert("enterpriseID".to_string(), Value::from(enterprise_id));
                            object.insert(
                                "enterpriseName".to_string(),
                                Value::from(enterprise_name.clone()),
                            );
                            object.insert("domainID".to_string(), Value::from(domain_id));
                            object
                                .insert("domainName".to_string(), Value::from(domain_name.clone()));
                            object.insert("zoneID".to_string(), Value::from(zone_id));
                            object.insert("zoneName".to_string(), Value::from(zone_name.clone()));
                        }
                        records.push(subnet);
                    }
                }
            }
        }

        debug!(count = records.len(), "collected subnets");
        Ok(records)
    }
}

#[async_trait]
impl Collector for NetworkApiClient {
    async fn fetch(&self, kind: EntityKind) -> Result<Vec<RawRecord>, CollectorError> {
        match kind {
            EntityKind::NetworkGroup => self.fetch_network_groups().await,
            EntityKind::SecurityGroup => self.fetch_security_groups().await,
            EntityKind::CloudSubnet => self.fetch_cloud_subnets().await,
        }
        .map_err(|e| match e {
            // Stamp the kind the caller actually asked for
            CollectorError::Transport { reason, .. } => CollectorError::Transport { kind, reason },
            other => other,
        })
    }
}
