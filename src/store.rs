//! # Entity Store
//!
//! The persistence seam the reconciler writes through.
//!
//! The store is a generic entity store: rows are found by connection, kind
//! and provider reference id; bulk create/update/delete operations return
//! per-row outcomes so one invalid entity never aborts the rest of its
//! batch. Foreign keys between rows use store-assigned [`PersistedId`]s,
//! never provider reference ids.
//!
//! [`InMemoryStore`] is the bundled implementation, used by the test suites
//! and the demo binary. Production deployments put a relational backend
//! behind the same trait.

use crate::model::{ConnectionId, Entity, EntityKind, PersistedId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The row failed store-side validation.
    #[error("validation failed for {kind} `{provider_ref}`: missing `{field}`")]
    Validation {
        kind: EntityKind,
        provider_ref: String,
        field: &'static str,
    },

    /// A create collided with an existing row for the same reference id.
    #[error("{kind} `{provider_ref}` already persisted for this connection")]
    DuplicateRow {
        kind: EntityKind,
        provider_ref: String,
    },

    /// An update or delete addressed a row that does not exist.
    #[error("no persisted {kind} row with id {id}")]
    RowNotFound { kind: EntityKind, id: PersistedId },

    /// Backend failure (I/O, serialization, connection loss).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A row as persisted: entity fields plus resolved foreign keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntity {
    pub id: PersistedId,
    pub connection_id: ConnectionId,
    pub entity: Entity,
    /// Persisted id of the owning network group, if any.
    pub network_group_id: Option<PersistedId>,
    /// Persisted id of the parent subnet, if any.
    pub parent_subnet_id: Option<PersistedId>,
}

/// A row to be created.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub connection_id: ConnectionId,
    pub entity: Entity,
    pub network_group_id: Option<PersistedId>,
    pub parent_subnet_id: Option<PersistedId>,
}

/// Field-level changes for one persisted row.
///
/// `Replace` carries a fully materialized entity; `Patch` carries only the
/// changed fields as JSON values, so unchanged rows never need a
/// materialized object. Both converge the row to the same state.
#[derive(Debug, Clone)]
pub enum FieldDiff {
    Replace {
        entity: Entity,
        network_group_id: Option<PersistedId>,
        parent_subnet_id: Option<PersistedId>,
    },
    Patch {
        fields: BTreeMap<String, Value>,
        /// `None` leaves the foreign key untouched; `Some(v)` sets it to `v`.
        network_group_id: Option<Option<PersistedId>>,
        parent_subnet_id: Option<Option<PersistedId>>,
    },
}

/// One entry of a bulk update.
#[derive(Debug, Clone)]
pub struct EntityUpdate {
    pub id: PersistedId,
    pub diff: FieldDiff,
}

/// Generic entity store, partitioned by connection id.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find(
        &self,
        connection_id: ConnectionId,
        kind: EntityKind,
        provider_ref: &str,
    ) -> Result<Option<PersistedEntity>, StoreError>;

    /// All rows of one kind for one connection.
    async fn list(
        &self,
        connection_id: ConnectionId,
        kind: EntityKind,
    ) -> Result<Vec<PersistedEntity>, StoreError>;

    /// Create rows in bulk. The result has one entry per input row, in
    /// order; a failed row does not abort the batch.
    async fn create_many(
        &self,
        kind: EntityKind,
        rows: Vec<NewEntity>,
    ) -> Result<Vec<Result<PersistedId, StoreError>>, StoreError>;

    /// Apply field diffs in bulk, one outcome per update.
    async fn update_many(
        &self,
        kind: EntityKind,
        updates: Vec<EntityUpdate>,
    ) -> Result<Vec<Result<(), StoreError>>, StoreError>;

    /// Delete rows by persisted id. Returns the number of rows removed;
    /// absent ids are ignored.
    async fn delete_many(
        &self,
        connection_id: ConnectionId,
        kind: EntityKind,
        ids: Vec<PersistedId>,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<PersistedId, PersistedEntity>,
    /// (connection, kind, provider_ref) -> persisted id
    by_ref: HashMap<(ConnectionId, EntityKind, String), PersistedId>,
}

/// In-memory [`EntityStore`] backed by hash maps behind an async lock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total row count across kinds for one connection. Test helper.
    pub async fn row_count(&self, connection_id: ConnectionId) -> usize {
        let tables = self.tables.read().await;
        tables
            .rows
            .values()
            .filter(|row| row.connection_id == connection_id)
            .count()
    }

    fn validate(entity: &Entity) -> Result<(), StoreError> {
        entity.validate().map_err(|e| StoreError::Validation {
            kind: e.kind,
            provider_ref: e.provider_ref,
            field: e.field,
        })
    }

    fn apply_diff(row: &mut PersistedEntity, diff: FieldDiff) -> Result<(), StoreError> {
        match diff {
            FieldDiff::Replace {
                entity,
                network_group_id,
                parent_subnet_id,
            } => {
                Self::validate(&entity)?;
                row.entity = entity;
                row.network_group_id = network_group_id;
                row.parent_subnet_id = parent_subnet_id;
            }
            FieldDiff::Patch {
                fields,
                network_group_id,
                parent_subnet_id,
            } => {
                if !fields.is_empty() {
                    let mut value = serde_json::to_value(&row.entity)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    let object = value
                        .as_object_mut()
                        .ok_or_else(|| StoreError::Backend("row is not an object".to_string()))?;
                    for (field, new_value) in fields {
                        object.insert(field, new_value);
                    }
                    let entity: Entity = serde_json::from_value(value)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    Self::validate(&entity)?;
                    row.entity = entity;
                }
                if let Some(id) = network_group_id {
                    row.network_group_id = id;
                }
                if let Some(id) = parent_subnet_id {
                    row.parent_subnet_id = id;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn find(
        &self,
        connection_id: ConnectionId,
        kind: EntityKind,
        provider_ref: &str,
    ) -> Result<Option<PersistedEntity>, StoreError> {
        let tables = self.tables.read().await;
        let id = tables
            .by_ref
            .get(&(connection_id, kind, provider_ref.to_string()));
        Ok(id.and_then(|id| tables.rows.get(id)).cloned())
    }

    async fn list(
        &self,
        connection_id: ConnectionId,
        kind: EntityKind,
    ) -> Result<Vec<PersistedEntity>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<PersistedEntity> = tables
            .rows
            .values()
            .filter(|row| row.connection_id == connection_id && row.entity.kind() == kind)
            .cloned()
            .collect();
        // Stable output order for callers that index or compare listings
        rows.sort_by(|a, b| a.entity.provider_ref().cmp(b.entity.provider_ref()));
        Ok(rows)
    }

    async fn create_many(
        &self,
        kind: EntityKind,
        rows: Vec<NewEntity>,
    ) -> Result<Vec<Result<PersistedId, StoreError>>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            if let Err(e) = Self::validate(&row.entity) {
                outcomes.push(Err(e));
                continue;
            }
            let key = (
                row.connection_id,
                kind,
                row.entity.provider_ref().to_string(),
            );
            if tables.by_ref.contains_key(&key) {
                outcomes.push(Err(StoreError::DuplicateRow {
                    kind,
                    provider_ref: row.entity.provider_ref().to_string(),
                }));
                continue;
            }

            let id = Uuid::new_v4();
            tables.by_ref.insert(key, id);
            tables.rows.insert(
                id,
                PersistedEntity {
                    id,
                    connection_id: row.connection_id,
                    entity: row.entity,
                    network_group_id: row.network_group_id,
                    parent_subnet_id: row.parent_subnet_id,
                },
            );
            outcomes.push(Ok(id));
        }

        Ok(outcomes)
    }

    async fn update_many(
        &self,
        kind: EntityKind,
        updates: Vec<EntityUpdate>,
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut outcomes = Vec::with_capacity(updates.len());

        for update in updates {
            let Some(row) = tables.rows.get_mut(&update.id) else {
                outcomes.push(Err(StoreError::RowNotFound {
                    kind,
                    id: update.id,
                }));
                continue;
            };
            outcomes.push(Self::apply_diff(row, update.diff));
        }

        Ok(outcomes)
    }

    async fn delete_many(
        &self,
        connection_id: ConnectionId,
        kind: EntityKind,
        ids: Vec<PersistedId>,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let mut deleted = 0;

        for id in ids {
            let Some(row) = tables.rows.get(&id) else {
                continue;
            };
            if row.connection_id != connection_id || row.entity.kind() != kind {
                continue;
            }
            let key = (
                row.connection_id,
                kind,
                row.entity.provider_ref().to_string(),
            );
            tables.by_ref.remove(&key);
            tables.rows.remove(&id);
            deleted += 1;
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{provider_kind, NetworkGroup};
    use serde_json::json;

    fn new_group(connection_id: ConnectionId, provider_ref: &str, name: &str) -> NewEntity {
        NewEntity {
            connection_id,
            entity: Entity::NetworkGroup(NetworkGroup {
                provider_ref: provider_ref.to_string(),
                name: name.to_string(),
                status: "active".to_string(),
                cidr: None,
                enabled: None,
                orchestration_stack_ref: None,
                provider_kind: provider_kind::NETWORK_GROUP.to_string(),
            }),
            network_group_id: None,
            parent_subnet_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = InMemoryStore::new();
        let connection = Uuid::new_v4();

        let outcomes = store
            .create_many(
                EntityKind::NetworkGroup,
                vec![new_group(connection, "g-1", "XLAB")],
            )
            .await
            .unwrap();
        let id = outcomes[0].as_ref().unwrap();

        let found = store
            .find(connection, EntityKind::NetworkGroup, "g-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&found.id, id);
        assert_eq!(found.entity.name(), "XLAB");
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_without_aborting_batch() {
        let store = InMemoryStore::new();
        let connection = Uuid::new_v4();

        let outcomes = store
            .create_many(
                EntityKind::NetworkGroup,
                vec![
                    new_group(connection, "g-1", "first"),
                    new_group(connection, "g-1", "second"),
                    new_group(connection, "g-2", "third"),
                ],
            )
            .await
            .unwrap();

        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(StoreError::DuplicateRow { .. })));
        assert!(outcomes[2].is_ok());
        assert_eq!(store.row_count(connection).await, 2);
    }

    #[tokio::test]
    async fn test_invalid_row_is_isolated() {
        let store = InMemoryStore::new();
        let connection = Uuid::new_v4();

        let outcomes = store
            .create_many(
                EntityKind::NetworkGroup,
                vec![
                    new_group(connection, "g-1", ""),
                    new_group(connection, "g-2", "valid"),
                ],
            )
            .await
            .unwrap();

        assert!(matches!(
            outcomes[0],
            Err(StoreError::Validation { field: "name", .. })
        ));
        assert!(outcomes[1].is_ok());
    }

    #[tokio::test]
    async fn test_patch_updates_only_named_fields() {
        let store = InMemoryStore::new();
        let connection = Uuid::new_v4();

        let outcomes = store
            .create_many(
                EntityKind::NetworkGroup,
                vec![new_group(connection, "g-1", "before")],
            )
            .await
            .unwrap();
        let id = *outcomes[0].as_ref().unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!("after"));
        let results = store
            .update_many(
                EntityKind::NetworkGroup,
                vec![EntityUpdate {
                    id,
                    diff: FieldDiff::Patch {
                        fields,
                        network_group_id: None,
                        parent_subnet_id: None,
                    },
                }],
            )
            .await
            .unwrap();
        assert!(results[0].is_ok());

        let row = store
            .find(connection, EntityKind::NetworkGroup, "g-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.entity.name(), "after");
        assert_eq!(row.entity.provider_ref(), "g-1");
    }

    #[tokio::test]
    async fn test_delete_ignores_foreign_connection() {
        let store = InMemoryStore::new();
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();

        let outcomes = store
            .create_many(EntityKind::NetworkGroup, vec![new_group(mine, "g-1", "x")])
            .await
            .unwrap();
        let id = *outcomes[0].as_ref().unwrap();

        let deleted = store
            .delete_many(theirs, EntityKind::NetworkGroup, vec![id])
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.row_count(mine).await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_row_reports_not_found() {
        let store = InMemoryStore::new();
        let results = store
            .update_many(
                EntityKind::CloudSubnet,
                vec![EntityUpdate {
                    id: Uuid::new_v4(),
                    diff: FieldDiff::Patch {
                        fields: BTreeMap::new(),
                        network_group_id: None,
                        parent_subnet_id: None,
                    },
                }],
            )
            .await
            .unwrap();
        assert!(matches!(results[0], Err(StoreError::RowNotFound { .. })));
    }
}
