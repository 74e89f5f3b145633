// src/canonical/mod.rs
//
// Read and relationship-write contract over canonical entities. Every path
// resolves merge pointers first, so callers only ever see live survivors.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::anyhow;
use log::{debug, info};
use serde_json::json;

use crate::error::{EngineError, EngineResult, StoreError};
use crate::models::{
    display_alias, Alias, AuditEntry, AuditOperation, CanonicalEntity, EntityId, EntityIdentifier,
    Identifier, Relationship, RelationshipKind,
};
use crate::store::{SharedStore, Store, StoreResult, UnitOfWork};
use crate::utils::constants::MAX_MERGE_CHAIN_HOPS;

/// Follows `merged_into` to the live end of the chain. None if `id` is unknown.
pub async fn resolve_root(store: &dyn Store, id: &EntityId) -> StoreResult<Option<CanonicalEntity>> {
    let mut current = match store.get_entity(id).await? {
        Some(entity) => entity,
        None => return Ok(None),
    };
    let mut hops = 0;
    while let Some(next) = current.merged_into.clone() {
        hops += 1;
        if hops > MAX_MERGE_CHAIN_HOPS {
            return Err(StoreError::Backend(anyhow!(
                "merge chain from {} exceeds {} hops; stored pointers are corrupt",
                id,
                MAX_MERGE_CHAIN_HOPS
            )));
        }
        current = store.get_entity(&next).await?.ok_or_else(|| {
            StoreError::Backend(anyhow!("merge pointer of {} names missing entity {}", current.id, next))
        })?;
    }
    Ok(Some(current))
}

/// The root followed by every entity whose pointer chain ends at it.
pub async fn cluster_members(store: &dyn Store, root: &EntityId) -> StoreResult<Vec<EntityId>> {
    let mut members = vec![root.clone()];
    let mut seen: HashSet<EntityId> = HashSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(next) = queue.pop_front() {
        for member in store.direct_members(&next).await? {
            if seen.insert(member.clone()) {
                members.push(member.clone());
                queue.push_back(member);
            }
        }
    }
    Ok(members)
}

/// Live roots at the other end of any relationship touching `members`.
pub async fn linked_roots(
    store: &dyn Store,
    members: &[EntityId],
) -> StoreResult<Vec<(RelationshipKind, CanonicalEntity)>> {
    let relationships = store.relationships_for(members).await?;
    let mut out: Vec<(RelationshipKind, CanonicalEntity)> = Vec::new();
    let mut resolved: HashMap<EntityId, Option<CanonicalEntity>> = HashMap::new();
    for rel in relationships {
        let other = if members.contains(&rel.from_entity) {
            &rel.to_entity
        } else {
            &rel.from_entity
        };
        if members.contains(other) {
            continue;
        }
        if !resolved.contains_key(other) {
            let root = resolve_root(store, other).await?;
            resolved.insert(other.clone(), root);
        }
        if let Some(Some(root)) = resolved.get(other) {
            if !out.iter().any(|(k, e)| *k == rel.kind && e.id == root.id) {
                out.push((rel.kind, root.clone()));
            }
        }
    }
    Ok(out)
}

/// Sums observations of the same normalized alias across cluster members.
pub fn aggregate_aliases(aliases: Vec<Alias>, root: &EntityId) -> Vec<Alias> {
    let mut by_normalized: HashMap<String, (Alias, u32)> = HashMap::new();
    for alias in aliases {
        match by_normalized.get_mut(&alias.normalized) {
            Some((kept, best_count)) => {
                kept.observed_count += alias.observed_count;
                if alias.first_seen_at < kept.first_seen_at {
                    kept.first_seen_at = alias.first_seen_at;
                }
                if alias.observed_count > *best_count {
                    *best_count = alias.observed_count;
                    kept.label = alias.label;
                }
            }
            None => {
                let count = alias.observed_count;
                let mut kept = alias;
                kept.entity_id = root.clone();
                by_normalized.insert(kept.normalized.clone(), (kept, count));
            }
        }
    }
    let mut merged: Vec<Alias> = by_normalized.into_values().map(|(a, _)| a).collect();
    merged.sort_by(|a, b| {
        b.observed_count
            .cmp(&a.observed_count)
            .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
    });
    merged
}

/// A canonical entity as consumers see it: the survivor plus everything its
/// absorbed members carry.
#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub requested: EntityId,
    pub entity: CanonicalEntity,
    /// Root first.
    pub members: Vec<EntityId>,
    pub identifiers: Vec<EntityIdentifier>,
    pub aliases: Vec<Alias>,
    pub display_name: String,
    pub relationships: Vec<Relationship>,
}

impl ResolvedEntity {
    pub fn was_redirected(&self) -> bool {
        self.requested != self.entity.id
    }

    pub fn identifier_values(&self) -> Vec<&Identifier> {
        let mut values: Vec<&Identifier> = self.identifiers.iter().map(|i| &i.identifier).collect();
        values.sort();
        values.dedup();
        values
    }
}

pub struct CanonicalReader {
    store: SharedStore,
}

impl CanonicalReader {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, id: &EntityId) -> EngineResult<ResolvedEntity> {
        let store = self.store.as_ref();
        let root = resolve_root(store, id)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(id.clone()))?;
        let members = cluster_members(store, &root.id).await?;
        let identifiers = store.identifiers_for(&members).await?;
        let aliases = aggregate_aliases(store.aliases_for(&members).await?, &root.id);
        let display_name = display_alias(&aliases)
            .map(|a| a.label.clone())
            .unwrap_or_else(|| root.display_name.clone());

        let mut relationships = store.relationships_for(&members).await?;
        let mut seen = HashSet::new();
        relationships.retain(|r| seen.insert(r.id.clone()));
        relationships.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        debug!(
            "Resolved {} -> {} ({} members, {} relationships)",
            id,
            root.id,
            members.len(),
            relationships.len()
        );
        Ok(ResolvedEntity {
            requested: id.clone(),
            entity: root,
            members,
            identifiers,
            aliases,
            display_name,
            relationships,
        })
    }

    /// Live entities holding `identifier`, one per cluster.
    pub async fn find_by_identifier(&self, identifier: &Identifier) -> StoreResult<Vec<CanonicalEntity>> {
        let store = self.store.as_ref();
        let mut roots: Vec<CanonicalEntity> = Vec::new();
        for holder in store.identifier_holders(identifier).await? {
            if let Some(root) = resolve_root(store, &holder.entity_id).await? {
                if !roots.iter().any(|r| r.id == root.id) {
                    roots.push(root);
                }
            }
        }
        roots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(roots)
    }

    /// Attaches a new relationship between the survivors of `from` and `to`.
    pub async fn create_relationship(
        &self,
        kind: RelationshipKind,
        from: &EntityId,
        to: &EntityId,
        role: Option<String>,
        source_system: Option<String>,
        actor: &str,
    ) -> EngineResult<Relationship> {
        let store = self.store.as_ref();
        let from_root = resolve_root(store, from)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(from.clone()))?;
        let to_root = resolve_root(store, to)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(to.clone()))?;

        let (from_kind, to_kind) = kind.endpoint_kinds();
        if from_root.kind != from_kind {
            return Err(EngineError::KindMismatch {
                left: from_root.kind,
                right: from_kind,
            });
        }
        if to_root.kind != to_kind {
            return Err(EngineError::KindMismatch {
                left: to_root.kind,
                right: to_kind,
            });
        }

        let relationship = Relationship::new(kind, from_root.id.clone(), to_root.id.clone(), role, source_system);
        let mut unit = UnitOfWork::new();
        unit.audit(
            AuditEntry::new(from_root.kind, from_root.id.as_str(), AuditOperation::RelationshipAdded, actor)
                .after(json!({
                    "relationship_id": relationship.id,
                    "kind": kind.as_str(),
                    "from": relationship.from_entity,
                    "to": relationship.to_entity,
                    "role": relationship.role,
                }))
                .at(unit.at),
        );
        unit.relationships.push(relationship.clone());
        store.apply(unit).await?;
        info!(
            "Linked {} {} -> {} ({})",
            kind.as_str(),
            relationship.from_entity,
            relationship.to_entity,
            if from_root.id != *from || to_root.id != *to { "resolved through merge pointers" } else { "direct" }
        );
        Ok(relationship)
    }
}
