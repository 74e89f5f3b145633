// src/matching/mod.rs
//
// Deterministic lookup, candidate pool, scoring and classification for one
// extracted record. Nothing here writes; the pipeline turns a verdict into a
// unit of work.

pub mod decision;
pub mod deterministic;
pub mod fuzzy;
pub mod scoring;
pub mod similarity;

use log::debug;

use crate::config::KindSettings;
use crate::extraction::ExtractedRecord;
use crate::models::{Identifier, IdentifierKind, MatchCandidate, MatchSignals, MatchType};
use crate::store::{Store, StoreResult};

pub use decision::{decide, rank_candidates, Verdict};
pub use deterministic::{find_deterministic, ConflictingIdentifier, DeterministicHit, DeterministicResult};
pub use fuzzy::{candidate_pool, CandidateProfile, RecordContext};
pub use similarity::token_set_similarity;

/// Ranked candidates for one record, with the identifiers that were dropped
/// from exact matching.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub candidates: Vec<MatchCandidate>,
    pub conflicting: Vec<ConflictingIdentifier>,
}

pub async fn evaluate(
    store: &dyn Store,
    settings: &KindSettings,
    trust: f64,
    record: &ExtractedRecord,
    context: &RecordContext,
) -> StoreResult<Evaluation> {
    let deterministic = find_deterministic(store, record.kind, &record.identifiers).await?;
    let pool = candidate_pool(store, record, context, &deterministic, settings.candidate_pool_limit).await?;

    let mut exact_candidates = Vec::new();
    let mut fuzzy_candidates = Vec::new();
    for root in pool {
        let profile = CandidateProfile::load(store, root).await?;
        let hit = deterministic.hits.iter().find(|h| h.root.id == profile.root.id);
        let evidence = fuzzy::evidence_for(record, context, &profile);

        let mut signals = MatchSignals {
            name_similarity: evidence.name_similarity,
            shared_address: evidence.shared_address,
            shared_relationship: evidence.shared_relationship,
            ..Default::default()
        };
        if let Some(hit) = hit {
            for identifier in &hit.matched {
                match identifier.kind {
                    IdentifierKind::Phone => signals.phone_match = 1.0,
                    IdentifierKind::Email => signals.email_match = 1.0,
                    IdentifierKind::Microchip => signals.microchip_match = true,
                    IdentifierKind::ExternalGeocodeKey => signals.geocode_key_match = true,
                }
            }
        }
        for conflict in &deterministic.conflicting {
            if !profile.holds(&conflict.identifier) {
                continue;
            }
            signals.conflicting_identifiers.push(conflict.identifier.clone());
            let weak = settings.conflict_signal_factor;
            match conflict.identifier.kind {
                IdentifierKind::Phone => signals.phone_match = signals.phone_match.max(weak),
                IdentifierKind::Email => signals.email_match = signals.email_match.max(weak),
                IdentifierKind::Microchip | IdentifierKind::ExternalGeocodeKey => {}
            }
        }

        let is_exact = hit.is_some();
        signals.identifier_conflict = if is_exact && deterministic.is_ambiguous() {
            Some(format!(
                "record identifiers match {} different entities",
                deterministic.hits.len()
            ))
        } else {
            scoring::conflict_reason(
                record.kind,
                settings,
                &record.identifiers,
                &profile.identifiers,
                &signals,
                is_exact,
                record.normalized_name.is_some(),
            )
        };

        let candidate = MatchCandidate {
            entity_id: profile.root.id.clone(),
            kind: profile.root.kind,
            match_type: match_type(hit.map(|h| h.matched.as_slice()), &signals),
            score: scoring::score(settings, &signals, is_exact, trust),
            signals,
            entity_created_at: profile.root.created_at,
        };
        if is_exact {
            exact_candidates.push(candidate);
        } else {
            fuzzy_candidates.push(candidate);
        }
    }

    rank_candidates(&mut fuzzy_candidates);
    fuzzy_candidates.truncate(settings.max_fuzzy_candidates);
    let mut candidates = exact_candidates;
    candidates.append(&mut fuzzy_candidates);
    rank_candidates(&mut candidates);

    debug!(
        "Evaluated {} record: {} candidate(s), top score {:.3}",
        record.kind,
        candidates.len(),
        candidates.first().map(|c| c.score).unwrap_or(0.0)
    );
    Ok(Evaluation {
        candidates,
        conflicting: deterministic.conflicting,
    })
}

/// Label for the strongest rule behind a candidate.
fn match_type(matched: Option<&[Identifier]>, signals: &MatchSignals) -> MatchType {
    if let Some(matched) = matched {
        let has = |kind: IdentifierKind| matched.iter().any(|i| i.kind == kind);
        if has(IdentifierKind::Microchip) {
            return MatchType::DeterministicMicrochip;
        }
        if has(IdentifierKind::ExternalGeocodeKey) {
            return MatchType::DeterministicGeocodeKey;
        }
        if has(IdentifierKind::Email) {
            return MatchType::DeterministicEmail;
        }
        return MatchType::DeterministicPhone;
    }
    if signals.name_similarity > 0.0 {
        MatchType::FuzzyName
    } else if signals.shared_address {
        MatchType::SharedAddress
    } else {
        MatchType::SharedRelationship
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMap;
    use crate::extraction::extract_fields;
    use crate::models::{CanonicalEntity, EntityDetails, EntityIdentifier, EntityKind};
    use crate::store::{AliasObservation, MemoryStore, UnitOfWork};
    use chrono::Utc;
    use serde_json::json;

    fn person_fields() -> FieldMap {
        FieldMap {
            name: Some("name".into()),
            phone: vec!["phone".into()],
            email: Some("email".into()),
            ..Default::default()
        }
    }

    async fn seed_person(store: &MemoryStore, name: &str, identifiers: &[Identifier]) -> CanonicalEntity {
        let entity = CanonicalEntity::new(EntityKind::Person, name, EntityDetails::empty(EntityKind::Person));
        let mut unit = UnitOfWork::new();
        unit.new_entities.push(entity.clone());
        unit.aliases.push(AliasObservation {
            entity_id: entity.id.clone(),
            label: name.into(),
            normalized: crate::extraction::normalize_name(name),
        });
        for identifier in identifiers {
            unit.identifiers.push(EntityIdentifier {
                entity_id: entity.id.clone(),
                identifier: identifier.clone(),
                source_system: None,
                created_at: Utc::now(),
            });
        }
        store.apply(unit).await.unwrap();
        entity
    }

    #[tokio::test]
    async fn test_shared_phone_with_dissimilar_names_never_auto_merges() {
        let store = MemoryStore::new();
        let shop = Identifier::new(IdentifierKind::Phone, "7075550000");
        seed_person(&store, "Susan Smith", &[shop.clone()]).await;
        seed_person(&store, "Robert Jones", &[shop.clone()]).await;

        let record = extract_fields(&json!({"name": "Maria Garcia", "phone": "707-555-0000"}), EntityKind::Person, &person_fields());
        let settings = KindSettings::default_for(EntityKind::Person);
        let eval = evaluate(&store, &settings, 1.0, &record, &RecordContext::default()).await.unwrap();

        assert_eq!(eval.conflicting.len(), 1);
        assert_eq!(eval.candidates.len(), 2);
        assert!(eval.candidates.iter().all(|c| c.has_conflict()));
        assert!(eval.candidates.iter().all(|c| c.score < settings.review_threshold));
        assert_eq!(decide(&eval.candidates, &settings, true, None), Verdict::NewEntity);
    }

    #[tokio::test]
    async fn test_exact_phone_match_is_pinned() {
        let store = MemoryStore::new();
        let phone = Identifier::new(IdentifierKind::Phone, "7075551234");
        let existing = seed_person(&store, "Susan Smith", &[phone]).await;

        let record = extract_fields(&json!({"name": "Susan Smith", "phone": "707-555-1234"}), EntityKind::Person, &person_fields());
        let settings = KindSettings::default_for(EntityKind::Person);
        let eval = evaluate(&store, &settings, 0.8, &record, &RecordContext::default()).await.unwrap();

        let top = &eval.candidates[0];
        assert_eq!(top.entity_id, existing.id);
        assert_eq!(top.score, 1.0);
        assert_eq!(top.match_type, MatchType::DeterministicPhone);
        assert!(!top.has_conflict());
    }

    #[tokio::test]
    async fn test_identifiers_pointing_at_different_entities_are_flagged() {
        let store = MemoryStore::new();
        let email = Identifier::new(IdentifierKind::Email, "susan@example.org");
        let phone = Identifier::new(IdentifierKind::Phone, "7075551234");
        seed_person(&store, "Susan Smith", &[email]).await;
        seed_person(&store, "Susan Smith", &[phone]).await;

        let record = extract_fields(
            &json!({"name": "Susan Smith", "phone": "7075551234", "email": "susan@example.org"}),
            EntityKind::Person,
            &person_fields(),
        );
        let settings = KindSettings::default_for(EntityKind::Person);
        let eval = evaluate(&store, &settings, 1.0, &record, &RecordContext::default()).await.unwrap();

        assert_eq!(eval.candidates.len(), 2);
        assert!(eval.candidates.iter().all(|c| c.score == 1.0 && c.has_conflict()));
        assert!(matches!(decide(&eval.candidates, &settings, true, None), Verdict::ReviewNeeded { .. }));
    }
}
