// src/pipeline/linking.rs
//
// Turns an extracted record into writes on a unit of work: geocoding and the
// place key, lookup of linked entities, entity creation and enrichment.

use std::sync::Arc;

use log::{debug, warn};

use crate::audit;
use crate::canonical::{cluster_members, linked_roots};
use crate::config::relationship_direction;
use crate::error::{EngineError, EngineResult};
use crate::extraction::{geocode_key, ExtractedRecord, ExtractedRelated};
use crate::geocoding::CachedGeocoder;
use crate::matching::{find_deterministic, RecordContext};
use crate::models::{
    CanonicalEntity, EntityDetails, EntityIdentifier, EntityKind, Identifier, IdentifierKind,
    Relationship,
};
use crate::store::{AliasObservation, EntityUpdate, SharedStore, UnitOfWork};

pub struct RecordLinker {
    store: SharedStore,
    geocoder: Option<Arc<CachedGeocoder>>,
    source_system: String,
    actor: String,
}

impl RecordLinker {
    pub fn new(
        store: SharedStore,
        geocoder: Option<Arc<CachedGeocoder>>,
        source_system: &str,
        actor: &str,
    ) -> Self {
        Self {
            store,
            geocoder,
            source_system: source_system.to_string(),
            actor: actor.to_string(),
        }
    }

    /// Geocodes place blocks and derives their place key. Returns the reason
    /// the record must go to review, if geocoding failed for good.
    pub async fn prepare(&self, record: &mut ExtractedRecord) -> Option<String> {
        let mut blocked = self.prepare_place(record).await;
        for related in &mut record.related {
            if let Some(reason) = self.prepare_place(&mut related.record).await {
                blocked.get_or_insert(reason);
            }
        }
        blocked
    }

    async fn prepare_place(&self, record: &mut ExtractedRecord) -> Option<String> {
        if record.kind != EntityKind::Place {
            return None;
        }
        let address = record.address.clone()?;
        let mut blocked = None;
        let mut key_address = address.clone();

        if let Some(geocoder) = &self.geocoder {
            match geocoder.geocode(&address).await {
                Ok(Some(result)) => {
                    key_address = result.formatted_address.clone();
                    record.details.fill_from(&EntityDetails::Place {
                        formatted_address: Some(result.formatted_address),
                        unit: None,
                        latitude: Some(result.latitude),
                        longitude: Some(result.longitude),
                    });
                }
                Ok(None) => debug!("No geocoder match for '{}'", address),
                Err(err @ EngineError::GeocodingFailed { .. }) => {
                    blocked = Some(err.to_string());
                }
                Err(err) => {
                    warn!("⚠️ Geocoding '{}' failed: {}", address, err);
                    blocked = Some(err.to_string());
                }
            }
        }

        let key = Identifier::new(
            IdentifierKind::ExternalGeocodeKey,
            geocode_key(&key_address, record.unit.as_deref()),
        );
        if !record.identifiers.contains(&key) {
            record.identifiers.push(key);
            record.identifiers.sort();
        }
        blocked
    }

    /// Live roots for each related block, without writing anything. A block
    /// resolves only when its identifiers point at exactly one entity.
    pub async fn lookup_related(&self, record: &ExtractedRecord) -> EngineResult<Vec<Option<CanonicalEntity>>> {
        let store = self.store.as_ref();
        let mut out = Vec::with_capacity(record.related.len());
        for related in &record.related {
            let found = find_deterministic(store, related.record.kind, &related.record.identifiers).await?;
            if found.hits.len() == 1 {
                out.push(found.hits.into_iter().next().map(|h| h.root));
            } else {
                if found.is_ambiguous() {
                    debug!(
                        "Related {} block matches {} entities; not linking",
                        related.record.kind,
                        found.hits.len()
                    );
                }
                out.push(None);
            }
        }
        Ok(out)
    }

    pub fn context(record: &ExtractedRecord, related: &[Option<CanonicalEntity>]) -> RecordContext {
        let coordinates = match &record.details {
            EntityDetails::Place {
                latitude: Some(lat),
                longitude: Some(lon),
                ..
            } => Some((*lat, *lon)),
            _ => None,
        };
        RecordContext {
            related: record
                .related
                .iter()
                .zip(related)
                .filter_map(|(block, root)| root.clone().map(|r| (block.relationship, r)))
                .collect(),
            coordinates,
        }
    }

    /// Adds a new entity built from `record` to the unit.
    pub fn create_from(&self, record: &ExtractedRecord, unit: &mut UnitOfWork) -> CanonicalEntity {
        let display_name = record
            .name
            .clone()
            .or_else(|| record.identifiers.first().map(|i| i.value.clone()))
            .unwrap_or_else(|| format!("unnamed {}", record.kind));
        let mut entity = CanonicalEntity::new(record.kind, display_name, record.details.clone());
        entity.created_at = unit.at;
        entity.updated_at = unit.at;
        unit.audit(audit::created(&entity, Some(&self.source_system), &self.actor, unit.at));
        unit.new_entities.push(entity.clone());
        entity
    }

    /// Records the identifiers, label and details of `record` on `entity`.
    /// Values the entity's cluster already has are skipped.
    pub async fn attach_to(
        &self,
        entity: &CanonicalEntity,
        record: &ExtractedRecord,
        unit: &mut UnitOfWork,
    ) -> EngineResult<()> {
        let store = self.store.as_ref();
        let is_new = unit.staged_entity(&entity.id).is_some();
        let (held, labels) = if is_new {
            (Vec::new(), Vec::new())
        } else {
            let members = cluster_members(store, &entity.id).await?;
            let held: Vec<Identifier> = store
                .identifiers_for(&members)
                .await?
                .into_iter()
                .map(|row| row.identifier)
                .collect();
            let labels: Vec<String> = store
                .aliases_for(&members)
                .await?
                .into_iter()
                .map(|a| a.normalized)
                .collect();
            (held, labels)
        };

        for identifier in &record.identifiers {
            let pending = unit
                .identifiers
                .iter()
                .any(|row| row.entity_id == entity.id && &row.identifier == identifier);
            if held.contains(identifier) || pending {
                continue;
            }
            unit.identifiers.push(EntityIdentifier {
                entity_id: entity.id.clone(),
                identifier: identifier.clone(),
                source_system: Some(self.source_system.clone()),
                created_at: unit.at,
            });
            unit.audit(audit::identifier_added(
                entity.kind,
                &entity.id,
                identifier,
                Some(&self.source_system),
                &self.actor,
                unit.at,
            ));
        }

        if let (Some(label), Some(normalized)) = (&record.name, &record.normalized_name) {
            if !labels.contains(normalized) {
                unit.audit(audit::alias_added(entity.kind, &entity.id, label, &self.actor, unit.at));
            }
            unit.aliases.push(AliasObservation {
                entity_id: entity.id.clone(),
                label: label.clone(),
                normalized: normalized.clone(),
            });
        }

        if !is_new {
            let mut details = entity.details.clone();
            if details.fill_from(&record.details) {
                unit.audit(audit::enriched(&entity.id, &entity.details, &details, &self.actor, unit.at));
                unit.entity_updates.push(EntityUpdate {
                    entity_id: entity.id.clone(),
                    display_name: entity.display_name.clone(),
                    details,
                });
            }
        }
        Ok(())
    }

    /// Links `entity` to each related block, creating missing entities for
    /// blocks that allow it. Existing links are not duplicated.
    pub async fn link_related(
        &self,
        entity: &CanonicalEntity,
        record: &ExtractedRecord,
        resolved: &[Option<CanonicalEntity>],
        unit: &mut UnitOfWork,
    ) -> EngineResult<usize> {
        let store = self.store.as_ref();
        let existing = if unit.staged_entity(&entity.id).is_some() {
            Vec::new()
        } else {
            let members = cluster_members(store, &entity.id).await?;
            linked_roots(store, &members).await?
        };

        let mut linked = 0;
        for (block, root) in record.related.iter().zip(resolved) {
            let other = match root {
                Some(root) => {
                    self.attach_to(root, &block.record, unit).await?;
                    root.clone()
                }
                None if self.can_create(block) => {
                    let created = self.create_from(&block.record, unit);
                    self.attach_to(&created, &block.record, unit).await?;
                    created
                }
                None => continue,
            };
            if existing.iter().any(|(k, e)| *k == block.relationship && e.id == other.id) {
                continue;
            }
            let Some(record_is_from) = relationship_direction(block.relationship, entity.kind, other.kind) else {
                warn!(
                    "⚠️ Relationship {} cannot join {} and {}; skipped",
                    block.relationship.as_str(),
                    entity.kind,
                    other.kind
                );
                continue;
            };
            let (from, to) = if record_is_from {
                (entity.id.clone(), other.id.clone())
            } else {
                (other.id.clone(), entity.id.clone())
            };
            let mut relationship =
                Relationship::new(block.relationship, from, to, block.role.clone(), Some(self.source_system.clone()));
            relationship.created_at = unit.at;
            unit.audit(audit::relationship_added(entity.kind, &entity.id, &relationship, &self.actor, unit.at));
            unit.relationships.push(relationship);
            linked += 1;
        }
        Ok(linked)
    }

    /// Name-only blocks are never created; they would duplicate on every row.
    fn can_create(&self, block: &ExtractedRelated) -> bool {
        block.create_if_missing && block.record.has_identifiers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMap;
    use crate::extraction::extract_fields;
    use crate::models::RelationshipKind;
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    fn place_fields() -> FieldMap {
        FieldMap {
            address: Some("address".into()),
            unit: Some("unit".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_place_key_without_geocoder_uses_address_text() {
        let store = Arc::new(MemoryStore::new());
        let linker = RecordLinker::new(store, None, "intake", "tester");
        let mut a = extract_fields(&json!({"address": "12 Oak St", "unit": "Apt 4"}), EntityKind::Place, &place_fields());
        let mut b = extract_fields(&json!({"address": "12 OAK STREET", "unit": "#4"}), EntityKind::Place, &place_fields());
        assert!(linker.prepare(&mut a).await.is_none());
        assert!(linker.prepare(&mut b).await.is_none());
        let key = |r: &ExtractedRecord| r.identifiers_of(IdentifierKind::ExternalGeocodeKey).next().cloned();
        assert_eq!(key(&a).unwrap().value, "12 oak street|unit 4");
        assert_eq!(key(&a), key(&b));
    }

    #[tokio::test]
    async fn test_attach_skips_held_values_and_enriches_details() {
        let store = Arc::new(MemoryStore::new());
        let linker = RecordLinker::new(store.clone(), None, "intake", "tester");
        let fields = FieldMap {
            phone: vec!["phone".into()],
            first_name: Some("first".into()),
            last_name: Some("last".into()),
            ..Default::default()
        };
        let record = extract_fields(&json!({"phone": "7075551234", "first": "Susan"}), EntityKind::Person, &fields);

        let mut unit = UnitOfWork::new();
        let entity = linker.create_from(&record, &mut unit);
        linker.attach_to(&entity, &record, &mut unit).await.unwrap();
        assert_eq!(unit.identifiers.len(), 1);
        store.apply(unit).await.unwrap();

        let richer = extract_fields(
            &json!({"phone": "707-555-1234", "first": "Susan", "last": "Smith"}),
            EntityKind::Person,
            &fields,
        );
        let mut unit = UnitOfWork::new();
        linker.attach_to(&entity, &richer, &mut unit).await.unwrap();
        assert!(unit.identifiers.is_empty());
        assert_eq!(unit.entity_updates.len(), 1);
        let ops: Vec<_> = unit.audit.iter().map(|e| e.operation).collect();
        assert_eq!(
            ops,
            vec![crate::models::AuditOperation::AliasAdded, crate::models::AuditOperation::Enriched]
        );
    }

    #[tokio::test]
    async fn test_link_related_creates_owner_once() {
        let store = Arc::new(MemoryStore::new());
        let linker = RecordLinker::new(store.clone(), None, "clinic", "tester");
        let cat = CanonicalEntity::new(EntityKind::Cat, "Tom", EntityDetails::empty(EntityKind::Cat));
        let mut seed = UnitOfWork::new();
        seed.new_entities.push(cat.clone());
        store.apply(seed).await.unwrap();

        let owner = extract_fields(&json!({"owner_phone": "7075551234"}), EntityKind::Person, &FieldMap {
            phone: vec!["owner_phone".into()],
            ..Default::default()
        });
        let mut record = extract_fields(&json!({}), EntityKind::Cat, &FieldMap::default());
        record.related.push(ExtractedRelated {
            relationship: RelationshipKind::PersonCat,
            role: Some("owner".into()),
            create_if_missing: true,
            record: owner,
        });

        let resolved = linker.lookup_related(&record).await.unwrap();
        assert_eq!(resolved, vec![None]);
        let mut unit = UnitOfWork::new();
        assert_eq!(linker.link_related(&cat, &record, &resolved, &mut unit).await.unwrap(), 1);
        assert_eq!(unit.new_entities.len(), 1);
        let rel = &unit.relationships[0];
        assert_eq!(rel.from_entity, unit.new_entities[0].id);
        assert_eq!(rel.to_entity, cat.id);
        store.apply(unit).await.unwrap();

        // Second sighting finds the owner and the existing link.
        let resolved = linker.lookup_related(&record).await.unwrap();
        assert!(resolved[0].is_some());
        let mut unit = UnitOfWork::new();
        assert_eq!(linker.link_related(&cat, &record, &resolved, &mut unit).await.unwrap(), 0);
        assert!(unit.new_entities.is_empty());
    }
}
