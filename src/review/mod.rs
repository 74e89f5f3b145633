pub mod queue;
pub mod trust;

pub use queue::{ResolveOutcome, ReviewQueue};
pub use trust::{current_weight, plan_trust_adjustment, TrustFeedback};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::error::EngineError;
    use crate::merge::MergeExecutor;
    use crate::models::{
        AuditOperation, CanonicalEntity, EntityDetails, EntityId, EntityKind, MatchCandidate, MatchSignals,
        MatchType, Resolution, ReviewEntryId, ReviewQueueEntry, ReviewStatus, ReviewSubject, StagedRecord,
    };
    use crate::pipeline::tests::{config, staged};
    use crate::pipeline::{RecordOutcome, RecordProcessor};
    use crate::store::{MemoryStore, Store, UnitOfWork};

    struct Fixture {
        store: Arc<MemoryStore>,
        processor: Arc<RecordProcessor>,
        queue: ReviewQueue,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(RecordProcessor::new(store.clone(), config(), None));
        let queue = ReviewQueue::new(store.clone(), processor.clone(), config());
        Fixture { store, processor, queue }
    }

    /// Susan becomes an entity; Susana at the same address lands on the queue.
    async fn queued_susana(f: &Fixture) -> (EntityId, StagedRecord, ReviewEntryId) {
        let susan = staged(&f.store, "volunteers", "1", json!({"name": "Susan Smith", "address": "12 Oak St"})).await;
        let susana = staged(&f.store, "volunteers", "2", json!({"name": "Susana Smyth", "address": "12 Oak Street"})).await;
        let RecordOutcome::NewEntity { entity } = f.processor.process(&susan).await.unwrap().outcome else {
            panic!("expected a new entity");
        };
        let RecordOutcome::QueuedForReview { entry } = f.processor.process(&susana).await.unwrap().outcome else {
            panic!("expected a review entry");
        };
        (entity, susana, entry)
    }

    async fn seed_people(store: &MemoryStore, names: &[&str]) -> Vec<EntityId> {
        let entities: Vec<CanonicalEntity> = names
            .iter()
            .map(|n| CanonicalEntity::new(EntityKind::Person, *n, EntityDetails::empty(EntityKind::Person)))
            .collect();
        let ids = entities.iter().map(|e| e.id.clone()).collect();
        let mut unit = UnitOfWork::new();
        unit.new_entities = entities;
        store.apply(unit).await.unwrap();
        ids
    }

    async fn queue_pair(store: &MemoryStore, duplicate: &EntityId, candidate: &EntityId) -> ReviewEntryId {
        let target = store.get_entity(candidate).await.unwrap().unwrap();
        let entry = ReviewQueueEntry::new(
            EntityKind::Person,
            ReviewSubject::Entity(duplicate.clone()),
            Some("clinic".into()),
            None,
            vec![MatchCandidate {
                entity_id: target.id.clone(),
                kind: EntityKind::Person,
                match_type: MatchType::Manual,
                signals: MatchSignals::default(),
                score: 0.9,
                entity_created_at: target.created_at,
            }],
            Some("tied".into()),
        );
        let id = entry.id.clone();
        let mut unit = UnitOfWork::new();
        unit.review_entries.push(entry);
        store.apply(unit).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_confirm_places_record_on_candidate_and_raises_trust() {
        let f = fixture();
        let (susan, susana, entry_id) = queued_susana(&f).await;

        let outcome = f
            .queue
            .resolve(&entry_id, Resolution::ConfirmMerge { candidate: susan.clone() }, "alice")
            .await
            .unwrap();
        assert_eq!(outcome.placed_on, Some(susan.clone()));
        assert_eq!(outcome.entry.status, ReviewStatus::Confirmed);
        assert_eq!(outcome.entry.resolved_by.as_deref(), Some("alice"));
        let (before, after) = outcome.trust.unwrap();
        assert!((after - before - 0.02).abs() < 1e-9);

        // The record now sits on Susan; no new person or place appeared.
        assert_eq!(f.store.live_entities(EntityKind::Person).await.len(), 1);
        assert_eq!(f.store.live_entities(EntityKind::Place).await.len(), 1);
        let aliases = f.store.aliases_for(&[susan.clone()]).await.unwrap();
        assert!(aliases.iter().any(|a| a.label == "Susana Smyth"));

        let decision = f.store.active_decision(&susana.id).await.unwrap().unwrap();
        assert_eq!(decision.entity_id, Some(susan));
        assert!(decision.resolved_at.is_some());
        assert!(f.queue.pending_entries(None, 10).await.unwrap().is_empty());

        let ops: Vec<AuditOperation> = f.store.audit_log().await.iter().map(|e| e.operation).collect();
        assert!(ops.contains(&AuditOperation::ReviewResolved));
        assert!(ops.contains(&AuditOperation::TrustAdjusted));

        let again = f
            .queue
            .resolve(&entry_id, Resolution::Reject { link_to: None }, "bob")
            .await
            .unwrap_err();
        assert!(matches!(again, EngineError::ReviewAlreadyResolved(_)));
    }

    #[tokio::test]
    async fn test_reject_creates_entity_and_lowers_trust() {
        let f = fixture();
        let (susan, _, entry_id) = queued_susana(&f).await;

        let outcome = f
            .queue
            .resolve(&entry_id, Resolution::Reject { link_to: None }, "alice")
            .await
            .unwrap();
        let placed = outcome.placed_on.unwrap();
        assert_ne!(placed, susan);
        assert_eq!(outcome.entry.status, ReviewStatus::Rejected);
        assert_eq!(f.store.live_entities(EntityKind::Person).await.len(), 2);
        // Both people now live at the one place.
        assert_eq!(f.store.live_entities(EntityKind::Place).await.len(), 1);
        let relationships = f.store.relationships_for(&[placed]).await.unwrap();
        assert_eq!(relationships.len(), 1);

        let weight = f.store.trust_weight(EntityKind::Person, "volunteers").await.unwrap().unwrap();
        assert!((weight - 0.98).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reject_with_link_checks_kind() {
        let f = fixture();
        let (_, _, entry_id) = queued_susana(&f).await;
        let place = f.store.live_entities(EntityKind::Place).await.remove(0);

        let err = f
            .queue
            .resolve(&entry_id, Resolution::Reject { link_to: Some(place.id) }, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::KindMismatch { .. }));
        assert!(f.queue.get(&entry_id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_defer_keeps_entry_pending_with_note() {
        let f = fixture();
        let (_, _, entry_id) = queued_susana(&f).await;

        let outcome = f
            .queue
            .resolve(&entry_id, Resolution::Defer { note: Some("call the clinic".into()) }, "alice")
            .await
            .unwrap();
        assert!(outcome.entry.is_pending());
        assert!(outcome.trust.is_none());
        let stored = f.queue.get(&entry_id).await.unwrap();
        assert_eq!(stored.notes, vec!["alice: call the clinic".to_string()]);
        assert!(f.store.trust_weight(EntityKind::Person, "volunteers").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_confirm_rejects_entity_outside_candidates() {
        let f = fixture();
        let (_, _, entry_id) = queued_susana(&f).await;
        let stranger = seed_people(&f.store, &["Robert Jones"]).await.remove(0);

        let err = f
            .queue
            .resolve(&entry_id, Resolution::ConfirmMerge { candidate: stranger }, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResolution(_)));
        assert!(f.queue.get(&entry_id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_entity_pair_confirm_merges_duplicate() {
        let f = fixture();
        let ids = seed_people(&f.store, &["Sue Smith", "Susan Smith"]).await;
        let entry_id = queue_pair(&f.store, &ids[0], &ids[1]).await;

        let outcome = f
            .queue
            .resolve(&entry_id, Resolution::ConfirmMerge { candidate: ids[1].clone() }, "alice")
            .await
            .unwrap();
        assert_eq!(outcome.placed_on, Some(ids[1].clone()));
        let absorbed = f.store.get_entity(&ids[0]).await.unwrap().unwrap();
        assert_eq!(absorbed.merged_into, Some(ids[1].clone()));
    }

    #[tokio::test]
    async fn test_entity_pair_cycle_stays_pending() {
        let f = fixture();
        let ids = seed_people(&f.store, &["Sue Smith", "Susan Smith"]).await;
        let entry_id = queue_pair(&f.store, &ids[0], &ids[1]).await;
        // Someone merged the candidate into the duplicate in the meantime.
        MergeExecutor::new(f.store.clone())
            .merge_entities(&ids[1], &ids[0], "bob", None)
            .await
            .unwrap();

        let err = f
            .queue
            .resolve(&entry_id, Resolution::ConfirmMerge { candidate: ids[1].clone() }, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));

        let entry = f.queue.get(&entry_id).await.unwrap();
        assert!(entry.is_pending());
        assert!(entry.notes[0].starts_with("merge refused"));
        assert!(f.store.get_entity(&ids[0]).await.unwrap().unwrap().merged_into.is_none());
        assert!(f.store.trust_weight(EntityKind::Person, "clinic").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entity_pair_reject_cannot_link() {
        let f = fixture();
        let ids = seed_people(&f.store, &["Sue Smith", "Susan Smith"]).await;
        let entry_id = queue_pair(&f.store, &ids[0], &ids[1]).await;

        let err = f
            .queue
            .resolve(&entry_id, Resolution::Reject { link_to: Some(ids[1].clone()) }, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResolution(_)));

        let outcome = f
            .queue
            .resolve(&entry_id, Resolution::Reject { link_to: None }, "alice")
            .await
            .unwrap();
        assert_eq!(outcome.entry.status, ReviewStatus::Rejected);
        assert!(f.store.get_entity(&ids[0]).await.unwrap().unwrap().merged_into.is_none());
    }

    fn aged_entry(kind: EntityKind, score: f64, hours_ago: i64) -> ReviewQueueEntry {
        let created_at = chrono::Utc::now() - chrono::Duration::hours(hours_ago);
        let mut entry = ReviewQueueEntry::new(
            kind,
            ReviewSubject::Entity(EntityId::new()),
            None,
            None,
            vec![MatchCandidate {
                entity_id: EntityId::new(),
                kind,
                match_type: MatchType::FuzzyName,
                signals: MatchSignals::default(),
                score,
                entity_created_at: created_at,
            }],
            None,
        );
        entry.created_at = created_at;
        entry
    }

    #[tokio::test]
    async fn test_pending_entries_best_score_then_oldest() {
        let f = fixture();
        let low = aged_entry(EntityKind::Person, 0.70, 5);
        let high_newer = aged_entry(EntityKind::Person, 0.90, 1);
        let high_older = aged_entry(EntityKind::Person, 0.90, 3);
        let place = aged_entry(EntityKind::Place, 0.95, 2);
        let mut resolved = aged_entry(EntityKind::Person, 0.99, 9);
        resolved.status = ReviewStatus::Rejected;

        let mut unit = UnitOfWork::new();
        unit.review_entries = vec![
            low.clone(),
            high_newer.clone(),
            resolved,
            place.clone(),
            high_older.clone(),
        ];
        f.store.apply(unit).await.unwrap();

        let ids = |entries: Vec<ReviewQueueEntry>| entries.into_iter().map(|e| e.id).collect::<Vec<_>>();
        let people = f.queue.pending_entries(Some(EntityKind::Person), 10).await.unwrap();
        assert_eq!(ids(people), vec![high_older.id.clone(), high_newer.id.clone(), low.id.clone()]);

        let all = f.queue.pending_entries(None, 2).await.unwrap();
        assert_eq!(ids(all), vec![place.id, high_older.id]);
    }
}
