// src/matching/fuzzy.rs
//
// Candidate pool and per-candidate signals. The pool is only ever built from
// entities that share something with the record (a linked entity, a held
// identifier, an alias token), never from a scan of every entity of the kind.

use std::collections::HashSet;

use log::debug;

use crate::canonical::{cluster_members, linked_roots, resolve_root};
use crate::extraction::{normalize_label, ExtractedRecord};
use crate::geocoding::haversine_meters;
use crate::matching::deterministic::DeterministicResult;
use crate::matching::similarity::best_similarity;
use crate::models::{CanonicalEntity, EntityDetails, EntityId, EntityKind, Identifier, RelationshipKind};
use crate::store::{Store, StoreResult};
use crate::utils::constants::{MIN_BLOCKING_TOKEN_LENGTH, PLACE_PROXIMITY_METERS};

/// Tokens too common in labels to narrow a search.
const BLOCKING_STOPWORDS: [&str; 24] = [
    "and", "the", "of", "street", "road", "avenue", "drive", "lane", "court", "place", "way",
    "boulevard", "circle", "north", "south", "east", "west", "unit", "ca", "usa", "kitty", "cat",
    "baby", "mama",
];

/// What a record brings beyond its own fields.
#[derive(Debug, Clone, Default)]
pub struct RecordContext {
    /// Live roots the record is linked to through its related blocks.
    pub related: Vec<(RelationshipKind, CanonicalEntity)>,
    /// Geocoded position, places only.
    pub coordinates: Option<(f64, f64)>,
}

/// Everything about one candidate root the scorer looks at.
#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub root: CanonicalEntity,
    pub members: Vec<EntityId>,
    pub identifiers: Vec<Identifier>,
    /// Normalized aliases of every member plus the root's display name.
    pub labels: Vec<String>,
    pub linked: Vec<(RelationshipKind, CanonicalEntity)>,
}

impl CandidateProfile {
    pub async fn load(store: &dyn Store, root: CanonicalEntity) -> StoreResult<Self> {
        let members = cluster_members(store, &root.id).await?;
        let mut identifiers: Vec<Identifier> = store
            .identifiers_for(&members)
            .await?
            .into_iter()
            .map(|row| row.identifier)
            .collect();
        identifiers.sort();
        identifiers.dedup();

        let mut labels: Vec<String> = store
            .aliases_for(&members)
            .await?
            .into_iter()
            .map(|a| a.normalized)
            .collect();
        labels.push(normalize_label(root.kind, &root.display_name));
        labels.retain(|l| !l.is_empty());
        labels.sort();
        labels.dedup();

        let linked = linked_roots(store, &members).await?;
        Ok(Self {
            root,
            members,
            identifiers,
            labels,
            linked,
        })
    }

    pub fn holds(&self, identifier: &Identifier) -> bool {
        self.identifiers.contains(identifier)
    }

    fn is_linked_to(&self, id: &EntityId) -> bool {
        self.linked.iter().any(|(_, e)| &e.id == id)
    }

    fn coordinates(&self) -> Option<(f64, f64)> {
        match &self.root.details {
            EntityDetails::Place {
                latitude: Some(lat),
                longitude: Some(lon),
                ..
            } => Some((*lat, *lon)),
            _ => None,
        }
    }
}

/// Contextual and name evidence for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FuzzyEvidence {
    pub name_similarity: f64,
    pub shared_address: bool,
    pub shared_relationship: bool,
}

pub fn evidence_for(record: &ExtractedRecord, context: &RecordContext, profile: &CandidateProfile) -> FuzzyEvidence {
    let name_similarity = record
        .normalized_name
        .as_deref()
        .map(|name| best_similarity(name, profile.labels.iter().map(String::as_str)))
        .unwrap_or(0.0);

    let mut evidence = FuzzyEvidence {
        name_similarity,
        ..Default::default()
    };
    for (_, related) in &context.related {
        if profile.is_linked_to(&related.id) {
            if related.kind == EntityKind::Place {
                evidence.shared_address = true;
            } else {
                evidence.shared_relationship = true;
            }
        }
    }
    if record.kind == EntityKind::Place {
        if let (Some((lat, lon)), Some((c_lat, c_lon))) = (context.coordinates, profile.coordinates()) {
            if haversine_meters(lat, lon, c_lat, c_lon) <= PLACE_PROXIMITY_METERS {
                evidence.shared_address = true;
            }
        }
    }
    evidence
}

/// Distinct live roots of `record.kind` worth scoring, at most `limit`.
/// Deterministic hits come first so the limit never drops them.
pub async fn candidate_pool(
    store: &dyn Store,
    record: &ExtractedRecord,
    context: &RecordContext,
    deterministic: &DeterministicResult,
    limit: usize,
) -> StoreResult<Vec<CanonicalEntity>> {
    let kind = record.kind;
    let mut pool: Vec<CanonicalEntity> = Vec::new();
    let mut seen: HashSet<EntityId> = HashSet::new();

    let mut push = |pool: &mut Vec<CanonicalEntity>, root: CanonicalEntity| {
        if root.kind == kind && root.is_live() && seen.insert(root.id.clone()) {
            pool.push(root);
        }
    };

    for hit in &deterministic.hits {
        push(&mut pool, hit.root.clone());
    }

    // Same-kind entities linked to the record's linked entities.
    for (_, related) in &context.related {
        if pool.len() >= limit {
            break;
        }
        let members = cluster_members(store, &related.id).await?;
        for (_, linked) in linked_roots(store, &members).await? {
            push(&mut pool, linked);
        }
    }

    for conflict in &deterministic.conflicting {
        for holder in &conflict.holders {
            if let Some(root) = resolve_root(store, holder).await? {
                push(&mut pool, root);
            }
        }
    }

    if let Some(name) = record.normalized_name.as_deref() {
        for token in blocking_tokens(name) {
            if pool.len() >= limit {
                break;
            }
            let remaining = limit.saturating_sub(pool.len()).max(1);
            for id in store.entities_with_alias_token(kind, token, remaining).await? {
                if let Some(root) = resolve_root(store, &id).await? {
                    push(&mut pool, root);
                }
            }
        }
    }

    pool.truncate(limit);
    debug!(
        "Candidate pool for {} record: {} root(s) (limit {})",
        kind,
        pool.len(),
        limit
    );
    Ok(pool)
}

/// Distinct, sufficiently distinctive tokens of a normalized label.
pub fn blocking_tokens(normalized: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| t.len() >= MIN_BLOCKING_TOKEN_LENGTH && !BLOCKING_STOPWORDS.contains(t))
        .collect();
    // Longer tokens are rarer.
    tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    tokens.dedup();
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relationship;
    use crate::store::{AliasObservation, MemoryStore, UnitOfWork};

    fn entity(kind: EntityKind, name: &str) -> CanonicalEntity {
        CanonicalEntity::new(kind, name, EntityDetails::empty(kind))
    }

    fn record(kind: EntityKind, name: &str) -> ExtractedRecord {
        let mut record = crate::extraction::extract_fields(
            &serde_json::json!({ "name": name }),
            kind,
            &crate::config::FieldMap {
                name: Some("name".into()),
                ..Default::default()
            },
        );
        record.identifiers.clear();
        record
    }

    #[test]
    fn test_blocking_tokens_skip_noise() {
        assert_eq!(blocking_tokens("123 main street santa rosa ca"), vec!["santa", "main", "rosa", "123"]);
        assert_eq!(blocking_tokens("j smith"), vec!["smith"]);
        assert!(blocking_tokens("").is_empty());
    }

    #[tokio::test]
    async fn test_pool_collects_linked_and_token_candidates() {
        let store = MemoryStore::new();
        let home = entity(EntityKind::Place, "1 Oak Ln");
        let resident = entity(EntityKind::Person, "Susan Smith");
        let namesake = entity(EntityKind::Person, "Robert Smith");
        let stranger = entity(EntityKind::Person, "Ann Lee");
        let (home_id, resident_id, namesake_id) = (home.id.clone(), resident.id.clone(), namesake.id.clone());

        let mut unit = UnitOfWork::new();
        unit.new_entities = vec![home.clone(), resident, namesake, stranger.clone()];
        unit.relationships.push(Relationship::new(
            RelationshipKind::PersonPlace,
            resident_id.clone(),
            home_id.clone(),
            Some("resident".into()),
            None,
        ));
        for (id, label) in [(&namesake_id, "Robert Smith"), (&stranger.id, "Ann Lee")] {
            unit.aliases.push(AliasObservation {
                entity_id: id.clone(),
                label: label.into(),
                normalized: label.to_lowercase(),
            });
        }
        store.apply(unit).await.unwrap();

        let record = record(EntityKind::Person, "Susana Smyth");
        let context = RecordContext {
            related: vec![(RelationshipKind::PersonPlace, home.clone())],
            coordinates: None,
        };
        let pool = candidate_pool(&store, &record, &context, &DeterministicResult::default(), 10)
            .await
            .unwrap();
        let ids: Vec<&EntityId> = pool.iter().map(|e| &e.id).collect();
        assert!(ids.contains(&&resident_id));
        assert!(!ids.contains(&&stranger.id));

        let profile = CandidateProfile::load(&store, pool[0].clone()).await.unwrap();
        let evidence = evidence_for(&record, &context, &profile);
        assert!(evidence.shared_address);
        assert!(!evidence.shared_relationship);
        assert!(evidence.name_similarity > 0.85);
    }

    #[tokio::test]
    async fn test_nearby_places_share_an_address() {
        let store = MemoryStore::new();
        let mut existing = entity(EntityKind::Place, "123 Main St");
        existing.details = EntityDetails::Place {
            formatted_address: Some("123 Main St".into()),
            unit: None,
            latitude: Some(38.44040),
            longitude: Some(-122.71410),
        };
        let profile = CandidateProfile::load(&store, existing).await.unwrap();
        let record = record(EntityKind::Place, "123 Main Street");
        let near = RecordContext {
            related: Vec::new(),
            coordinates: Some((38.44045, -122.71412)),
        };
        assert!(evidence_for(&record, &near, &profile).shared_address);
        let far = RecordContext {
            related: Vec::new(),
            coordinates: Some((38.45, -122.71)),
        };
        assert!(!evidence_for(&record, &far, &profile).shared_address);
    }
}
