//! # Reconciler
//!
//! Core diff-and-apply logic converging persisted rows to an inventory
//! graph.
//!
//! ## Reconciliation Flow
//!
//! 1. Load existing rows for the graph's connection, per kind, indexed by
//!    provider reference id
//! 2. Delete rows absent from the graph, children before parents
//! 3. Per kind in dependency order (network groups before the kinds that
//!    reference them): create missing rows, then update rows whose fields
//!    or resolved foreign keys differ
//! 4. Resolve every owning-group / parent-subnet reference to the persisted
//!    id of the related row — provider reference ids never become foreign
//!    keys
//!
//! A row that fails store-side validation is counted and skipped; the rest
//! of its batch still applies. A reference that cannot be resolved once the
//! referenced kind's creates are done aborts the pass, leaving changes
//! applied so far in place (no cross-kind transaction).
//!
//! The apply step is parameterized by [`SaveOptions`]: direct per-row
//! saves, bulk batches with or without materialized objects, or a
//! recursive owner-to-child walk. All strategies converge the store to the
//! same state for the same graph.

use crate::graph::InventoryGraph;
use crate::model::{ConnectionId, Entity, EntityKind, PersistedId};
use crate::store::{EntityStore, EntityUpdate, FieldDiff, NewEntity, PersistedEntity, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// How a computed diff is written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStrategy {
    /// Save each changed entity individually as a live object.
    Direct,
    /// Issue bulk create/update/delete calls per kind.
    Batch,
    /// Walk owner-to-child relationships, persisting parents before their
    /// children.
    Recursive,
}

/// Strategy plus the independent object-materialization toggle.
///
/// `materialize` selects whether updates carry fully materialized entities
/// (`Replace` diffs, exercising validation-compatible paths) or field-level
/// patches computed without instantiating objects for unchanged rows. It
/// only differentiates the batch strategy; direct and recursive saves
/// always work on whole objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    pub strategy: SaveStrategy,
    pub materialize: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            strategy: SaveStrategy::Direct,
            materialize: true,
        }
    }
}

impl SaveOptions {
    /// The supported strategy/materialization combinations, the matrix the
    /// equivalence suites run against.
    pub const ALL: [SaveOptions; 4] = [
        SaveOptions {
            strategy: SaveStrategy::Direct,
            materialize: true,
        },
        SaveOptions {
            strategy: SaveStrategy::Batch,
            materialize: true,
        },
        SaveOptions {
            strategy: SaveStrategy::Batch,
            materialize: false,
        },
        SaveOptions {
            strategy: SaveStrategy::Recursive,
            materialize: true,
        },
    ];
}

/// Row counts for one kind in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl KindStats {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Per-kind outcome summary of one reconcile pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileResult {
    pub stats: BTreeMap<EntityKind, KindStats>,
}

impl ReconcileResult {
    pub fn stats_for(&self, kind: EntityKind) -> KindStats {
        self.stats.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_changes(&self) -> usize {
        self.stats.values().map(KindStats::changes).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.stats.values().map(|s| s.failed).sum()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// A reference did not resolve to a persisted row. Pass-aborting.
    #[error(
        "{kind} `{provider_ref}`: {target_kind} reference `{target_ref}` does not resolve to a persisted row"
    )]
    UnresolvedReference {
        kind: EntityKind,
        provider_ref: String,
        target_kind: EntityKind,
        target_ref: String,
    },

    /// The store failed at batch granularity.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Converge the store to the graph under the given save options.
pub async fn reconcile(
    graph: &InventoryGraph,
    store: &dyn EntityStore,
    options: SaveOptions,
) -> Result<ReconcileResult, ReconcileError> {
    let mut pass = Pass {
        graph,
        store,
        options,
        connection_id: graph.connection_id(),
        existing: HashMap::new(),
        group_ids: HashMap::new(),
        subnet_ids: HashMap::new(),
        stats: BTreeMap::new(),
    };
    pass.run().await?;
    Ok(ReconcileResult { stats: pass.stats })
}

/// Working state of one reconcile pass.
struct Pass<'a> {
    graph: &'a InventoryGraph,
    store: &'a dyn EntityStore,
    options: SaveOptions,
    connection_id: ConnectionId,
    /// Surviving persisted rows per kind, keyed by provider reference.
    existing: HashMap<EntityKind, HashMap<String, PersistedEntity>>,
    /// Network-group provider reference -> persisted id.
    group_ids: HashMap<String, PersistedId>,
    /// Subnet provider reference -> persisted id.
    subnet_ids: HashMap<String, PersistedId>,
    stats: BTreeMap<EntityKind, KindStats>,
}

impl Pass<'_> {
    async fn run(&mut self) -> Result<(), ReconcileError> {
        self.load_existing().await?;
        self.apply_deletes().await?;
        self.seed_id_maps();

        match self.options.strategy {
            SaveStrategy::Direct | SaveStrategy::Batch => {
                for kind in EntityKind::DEPENDENCY_ORDER {
                    self.apply_kind(kind).await?;
                }
            }
            SaveStrategy::Recursive => self.apply_recursive().await?,
        }
        Ok(())
    }

    async fn load_existing(&mut self) -> Result<(), ReconcileError> {
        for kind in EntityKind::DEPENDENCY_ORDER {
            let rows = self.store.list(self.connection_id, kind).await?;
            let indexed = rows
                .into_iter()
                .map(|row| (row.entity.provider_ref().to_string(), row))
                .collect();
            self.existing.insert(kind, indexed);
        }
        Ok(())
    }

    /// Remove rows absent from the graph, children before parents.
    async fn apply_deletes(&mut self) -> Result<(), ReconcileError> {
        for kind in EntityKind::DELETE_ORDER {
            let desired: HashSet<String> = self
                .graph
                .entities_of(kind)
                .iter()
                .map(|e| e.provider_ref().to_string())
                .collect();

            let rows = self.existing.entry(kind).or_default();
            let stale: Vec<String> = rows
                .keys()
                .filter(|provider_ref| !desired.contains(*provider_ref))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }

            let ids: Vec<PersistedId> = stale
                .iter()
                .filter_map(|provider_ref| rows.get(provider_ref).map(|row| row.id))
                .collect();
            let deleted = self
                .store
                .delete_many(self.connection_id, kind, ids)
                .await?;
            for provider_ref in &stale {
                rows.remove(provider_ref);
            }

            debug!(kind = %kind, deleted, "removed rows absent from fetched inventory");
            self.stats.entry(kind).or_default().deleted += deleted;
        }
        Ok(())
    }

    fn seed_id_maps(&mut self) {
        if let Some(groups) = self.existing.get(&EntityKind::NetworkGroup) {
            for (provider_ref, row) in groups {
                self.group_ids.insert(provider_ref.clone(), row.id);
            }
        }
        if let Some(subnets) = self.existing.get(&EntityKind::CloudSubnet) {
            for (provider_ref, row) in subnets {
                self.subnet_ids.insert(provider_ref.clone(), row.id);
            }
        }
    }

    /// Verify that every reference carried by this kind's entities can
    /// resolve: either to an already-persisted row or to an entity of this
    /// pass. Runs before any write for the kind.
    fn check_resolvable(&self, kind: EntityKind) -> Result<(), ReconcileError> {
        let graph_group_refs: HashSet<&str> = self
            .graph
            .network_groups()
            .iter()
            .map(|g| g.provider_ref.as_str())
            .collect();
        let graph_subnet_refs: HashSet<&str> = self
            .graph
            .cloud_subnets()
            .iter()
            .map(|s| s.provider_ref.as_str())
            .collect();

        for entity in self.graph.entities_of(kind) {
            if let Some(target) = entity.network_group_ref() {
                if !self.group_ids.contains_key(target) && !graph_group_refs.contains(target) {
                    return Err(self.unresolved(&entity, EntityKind::NetworkGroup, target));
                }
            }
            if let Some(target) = entity.parent_subnet_ref() {
                if !self.subnet_ids.contains_key(target) && !graph_subnet_refs.contains(target) {
                    return Err(self.unresolved(&entity, EntityKind::CloudSubnet, target));
                }
            }
        }
        Ok(())
    }

    fn unresolved(
        &self,
        entity: &Entity,
        target_kind: EntityKind,
        target_ref: &str,
    ) -> ReconcileError {
        ReconcileError::UnresolvedReference {
            kind: entity.kind(),
            provider_ref: entity.provider_ref().to_string(),
            target_kind,
            target_ref: target_ref.to_string(),
        }
    }

    /// Resolve an entity's references to persisted ids.
    fn resolve_refs(
        &self,
        entity: &Entity,
    ) -> Result<(Option<PersistedId>, Option<PersistedId>), ReconcileError> {
        let network_group_id = match entity.network_group_ref() {
            Some(target) => Some(
                *self
                    .group_ids
                    .get(target)
                    .ok_or_else(|| self.unresolved(entity, EntityKind::NetworkGroup, target))?,
            ),
            None => None,
        };
        let parent_subnet_id = match entity.parent_subnet_ref() {
            Some(target) => Some(
                *self
                    .subnet_ids
                    .get(target)
                    .ok_or_else(|| self.unresolved(entity, EntityKind::CloudSubnet, target))?,
            ),
            None => None,
        };
        Ok((network_group_id, parent_subnet_id))
    }

    fn record_created(&mut self, kind: EntityKind, entity: &Entity, id: PersistedId) {
        match kind {
            EntityKind::NetworkGroup => {
                self.group_ids.insert(entity.provider_ref().to_string(), id);
            }
            EntityKind::CloudSubnet => {
                self.subnet_ids
                    .insert(entity.provider_ref().to_string(), id);
            }
            EntityKind::SecurityGroup => {}
        }
        self.stats.entry(kind).or_default().created += 1;
    }

    fn record_failure(&mut self, kind: EntityKind, provider_ref: &str, error: &StoreError) {
        warn!(kind = %kind, provider_ref, %error, "entity failed to persist");
        self.stats.entry(kind).or_default().failed += 1;
    }

    /// Breadth-by-kind apply: creates, then updates, for one kind.
    async fn apply_kind(&mut self, kind: EntityKind) -> Result<(), ReconcileError> {
        self.check_resolvable(kind)?;

        let desired = self.graph.entities_of(kind);
        let existing_refs: HashSet<String> = self
            .existing
            .get(&kind)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default();

        let creates: Vec<Entity> = desired
            .iter()
            .filter(|e| !existing_refs.contains(e.provider_ref()))
            .cloned()
            .collect();
        let updates: Vec<Entity> = desired
            .into_iter()
            .filter(|e| existing_refs.contains(e.provider_ref()))
            .collect();

        // Creates go first so updates can re-point foreign keys at rows
        // created in this pass
        for layer in dependency_layers(creates) {
            match self.options.strategy {
                SaveStrategy::Batch => self.create_batch(kind, layer).await?,
                SaveStrategy::Direct | SaveStrategy::Recursive => {
                    for entity in layer {
                        self.create_one(kind, entity).await?;
                    }
                }
            }
        }

        let mut pending = Vec::new();
        for entity in updates {
            if let Some(update) = self.plan_update(kind, &entity)? {
                pending.push(update);
            }
        }
        match self.options.strategy {
            SaveStrategy::Batch => self.update_batch(kind, pending).await?,
            SaveStrategy::Direct | SaveStrategy::Recursive => {
                for update in pending {
                    self.update_batch(kind, vec![update]).await?;
                }
            }
        }

        Ok(())
    }

    /// Owner-to-child traversal: each network group is persisted before the
    /// security groups and subnets that reference it.
    async fn apply_recursive(&mut self) -> Result<(), ReconcileError> {
        for kind in EntityKind::DEPENDENCY_ORDER {
            self.check_resolvable(kind)?;
        }

        let groups: Vec<Entity> = self
            .graph
            .network_groups()
            .iter()
            .cloned()
            .map(Entity::NetworkGroup)
            .collect();
        for group in groups {
            let group_ref = group.provider_ref().to_string();
            self.persist_one(EntityKind::NetworkGroup, group).await?;

            let children: Vec<Entity> = self
                .graph
                .security_groups_of(Some(group_ref.as_str()))
                .cloned()
                .map(Entity::SecurityGroup)
                .collect();
            for child in children {
                self.persist_one(EntityKind::SecurityGroup, child).await?;
            }
        }

        // Entities without an owner, then subnets parent-first across groups
        let orphans: Vec<Entity> = self
            .graph
            .security_groups_of(None)
            .cloned()
            .map(Entity::SecurityGroup)
            .collect();
        for orphan in orphans {
            self.persist_one(EntityKind::SecurityGroup, orphan).await?;
        }

        let subnets: Vec<Entity> = self
            .graph
            .cloud_subnets()
            .iter()
            .cloned()
            .map(Entity::CloudSubnet)
            .collect();
        for layer in dependency_layers(subnets) {
            for subnet in layer {
                self.persist_one(EntityKind::CloudSubnet, subnet).await?;
            }
        }

        Ok(())
    }

    /// Create or update one entity, whichever the store state requires.
    async fn persist_one(&mut self, kind: EntityKind, entity: Entity) -> Result<(), ReconcileError> {
        let exists = self
            .existing
            .get(&kind)
            .is_some_and(|rows| rows.contains_key(entity.provider_ref()));
        if exists {
            if let Some(update) = self.plan_update(kind, &entity)? {
                self.update_batch(kind, vec![update]).await?;
            }
        } else {
            self.create_one(kind, entity).await?;
        }
        Ok(())
    }

    async fn create_one(&mut self, kind: EntityKind, entity: Entity) -> Result<(), ReconcileError> {
        let (network_group_id, parent_subnet_id) = self.resolve_refs(&entity)?;
        let row = NewEntity {
            connection_id: self.connection_id,
            entity: entity.clone(),
            network_group_id,
            parent_subnet_id,
        };
        let outcomes = self.store.create_many(kind, vec![row]).await?;
        match outcomes.into_iter().next() {
            Some(Ok(id)) => self.record_created(kind, &entity, id),
            Some(Err(e)) => self.record_failure(kind, entity.provider_ref(), &e),
            None => {}
        }
        Ok(())
    }

    async fn create_batch(
        &mut self,
        kind: EntityKind,
        entities: Vec<Entity>,
    ) -> Result<(), ReconcileError> {
        if entities.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(entities.len());
        for entity in &entities {
            let (network_group_id, parent_subnet_id) = self.resolve_refs(entity)?;
            rows.push(NewEntity {
                connection_id: self.connection_id,
                entity: entity.clone(),
                network_group_id,
                parent_subnet_id,
            });
        }
        let outcomes = self.store.create_many(kind, rows).await?;
        for (entity, outcome) in entities.iter().zip(outcomes) {
            match outcome {
                Ok(id) => self.record_created(kind, entity, id),
                Err(e) => self.record_failure(kind, entity.provider_ref(), &e),
            }
        }
        Ok(())
    }

    /// Decide whether a persisted row needs an update and build its diff.
    fn plan_update(
        &self,
        kind: EntityKind,
        desired: &Entity,
    ) -> Result<Option<EntityUpdate>, ReconcileError> {
        let Some(row) = self
            .existing
            .get(&kind)
            .and_then(|rows| rows.get(desired.provider_ref()))
        else {
            return Ok(None);
        };

        let (network_group_id, parent_subnet_id) = self.resolve_refs(desired)?;
        let fields_changed = row.entity != *desired;
        let fks_changed =
            row.network_group_id != network_group_id || row.parent_subnet_id != parent_subnet_id;
        if !fields_changed && !fks_changed {
            return Ok(None);
        }

        let diff = if self.options.materialize {
            FieldDiff::Replace {
                entity: desired.clone(),
                network_group_id,
                parent_subnet_id,
            }
        } else {
            FieldDiff::Patch {
                fields: changed_fields(&row.entity, desired)?,
                network_group_id: (row.network_group_id != network_group_id)
                    .then_some(network_group_id),
                parent_subnet_id: (row.parent_subnet_id != parent_subnet_id)
                    .then_some(parent_subnet_id),
            }
        };
        Ok(Some(EntityUpdate { id: row.id, diff }))
    }

    async fn update_batch(
        &mut self,
        kind: EntityKind,
        updates: Vec<EntityUpdate>,
    ) -> Result<(), ReconcileError> {
        if updates.is_empty() {
            return Ok(());
        }
        let ids: Vec<PersistedId> = updates.iter().map(|u| u.id).collect();
        let outcomes = self.store.update_many(kind, updates).await?;
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => self.stats.entry(kind).or_default().updated += 1,
                Err(e) => {
                    warn!(kind = %kind, %id, error = %e, "row update failed");
                    self.stats.entry(kind).or_default().failed += 1;
                }
            }
        }
        Ok(())
    }
}

/// Order entities so that intra-kind parents precede their children.
///
/// Returns layers: entities in layer N only reference entities persisted
/// before layer N. Cyclic leftovers end up in a final layer of their own;
/// reference resolution fails on them downstream.
fn dependency_layers(entities: Vec<Entity>) -> Vec<Vec<Entity>> {
    let mut remaining = entities;
    let mut layers = Vec::new();
    let mut placed: HashSet<String> = HashSet::new();

    while !remaining.is_empty() {
        let in_batch: HashSet<String> = remaining
            .iter()
            .map(|e| e.provider_ref().to_string())
            .collect();
        let (ready, rest): (Vec<Entity>, Vec<Entity>) =
            remaining.into_iter().partition(|entity| {
                entity.parent_subnet_ref().is_none_or(|parent| {
                    placed.contains(parent) || !in_batch.contains(parent)
                })
            });
        if ready.is_empty() {
            // Cycle: give up on ordering, let resolution report it
            layers.push(rest);
            break;
        }
        placed.extend(ready.iter().map(|e| e.provider_ref().to_string()));
        layers.push(ready);
        remaining = rest;
    }
    layers
}

/// Top-level fields whose values differ between two entities, as JSON.
fn changed_fields(current: &Entity, desired: &Entity) -> Result<BTreeMap<String, Value>, ReconcileError> {
    let current = serde_json::to_value(current)
        .map_err(|e| ReconcileError::Store(StoreError::Backend(e.to_string())))?;
    let desired = serde_json::to_value(desired)
        .map_err(|e| ReconcileError::Store(StoreError::Backend(e.to_string())))?;
    let (Value::Object(current), Value::Object(desired)) = (current, desired) else {
        return Err(ReconcileError::Store(StoreError::Backend(
            "entity did not serialize to an object".to_string(),
        )));
    };

    let mut fields = BTreeMap::new();
    for (key, new_value) in desired {
        if current.get(&key) != Some(&new_value) {
            fields.insert(key, new_value);
        }
    }
    Ok(fields)
}
