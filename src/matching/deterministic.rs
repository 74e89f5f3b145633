// src/matching/deterministic.rs
//
// Exact identifier lookup. An identifier held by more than one live entity is
// unreliable (a shop phone, a shelter email) and is excluded from matching.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::canonical::resolve_root;
use crate::models::{CanonicalEntity, EntityId, EntityKind, Identifier};
use crate::store::{Store, StoreResult};

/// An identifier whose holders resolve to several live entities.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictingIdentifier {
    pub identifier: Identifier,
    /// Distinct live roots of the record's kind, oldest first.
    pub holders: Vec<EntityId>,
}

/// Exact-match evidence for one live root.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicHit {
    pub root: CanonicalEntity,
    pub matched: Vec<Identifier>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeterministicResult {
    /// One entry per matched root, oldest root first.
    pub hits: Vec<DeterministicHit>,
    pub conflicting: Vec<ConflictingIdentifier>,
}

impl DeterministicResult {
    /// Reliable identifiers pointing at different entities.
    pub fn is_ambiguous(&self) -> bool {
        self.hits.len() > 1
    }
}

pub async fn find_deterministic(
    store: &dyn Store,
    kind: EntityKind,
    identifiers: &[Identifier],
) -> StoreResult<DeterministicResult> {
    let mut by_root: BTreeMap<EntityId, DeterministicHit> = BTreeMap::new();
    let mut conflicting = Vec::new();

    for identifier in identifiers {
        let holders = store.identifier_holders(identifier).await?;
        if holders.is_empty() {
            continue;
        }

        let mut roots: Vec<CanonicalEntity> = Vec::new();
        for holder in &holders {
            if let Some(root) = resolve_root(store, &holder.entity_id).await? {
                if root.kind == kind && !roots.iter().any(|r| r.id == root.id) {
                    roots.push(root);
                }
            }
        }
        roots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        match roots.len() {
            0 => {}
            1 => {
                let root = roots.remove(0);
                by_root
                    .entry(root.id.clone())
                    .or_insert_with(|| DeterministicHit {
                        root,
                        matched: Vec::new(),
                    })
                    .matched
                    .push(identifier.clone());
            }
            n => {
                warn!(
                    "⚠️ Identifier {} is held by {} live {} entities; excluded from exact matching",
                    identifier, n, kind
                );
                conflicting.push(ConflictingIdentifier {
                    identifier: identifier.clone(),
                    holders: roots.into_iter().map(|r| r.id).collect(),
                });
            }
        }
    }

    let mut hits: Vec<DeterministicHit> = by_root.into_values().collect();
    hits.sort_by(|a, b| {
        a.root
            .created_at
            .cmp(&b.root.created_at)
            .then_with(|| a.root.id.cmp(&b.root.id))
    });
    debug!(
        "Deterministic lookup of {} identifier(s): {} hit(s), {} conflicting",
        identifiers.len(),
        hits.len(),
        conflicting.len()
    );
    Ok(DeterministicResult { hits, conflicting })
}
