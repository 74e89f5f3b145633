pub mod batch;
pub mod linking;
pub mod record;

pub use batch::{BatchRunner, BatchSettings, CancellationFlag};
pub use linking::RecordLinker;
pub use record::{place_record, ProcessedRecord, RecordOutcome, RecordProcessor};

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::MatchingConfig;
    use crate::error::GeocodeError;
    use crate::geocoding::{CachedGeocoder, GeocodeResult, Geocoder, GeocoderSettings};
    use crate::models::{
        CanonicalEntity, DecisionOutcome, EntityDetails, EntityIdentifier, EntityKind, Identifier,
        IdentifierKind, StagedRecord,
    };
    use crate::store::{MemoryStore, Store, UnitOfWork};
    use crate::utils::progress_bars::ProgressConfig;
    use crate::utils::source_filter::SourceFilterConfig;

    pub(crate) const CONFIG: &str = r#"
[[sources]]
source_system = "clinic"
entity_kind = "person"

[sources.fields]
name = "name"
phone = ["phone"]
email = "email"

[[sources]]
source_system = "volunteers"
entity_kind = "person"

[sources.fields]
name = "name"

[[sources.related]]
entity_kind = "place"
relationship = "person_place"
role = "resident"
create_if_missing = true

[sources.related.fields]
address = "address"

[[sources]]
source_system = "chips"
entity_kind = "cat"

[sources.fields]
name = "cat_name"
microchip = "chip"

[[sources]]
source_system = "intake"
entity_kind = "place"

[sources.fields]
address = "address"
unit = "unit"

[[sources]]
source_system = "web_form"
entity_kind = "person"
can_create_entities = false

[sources.fields]
name = "name"
email = "email"
"#;

    pub(crate) fn config() -> Arc<MatchingConfig> {
        Arc::new(MatchingConfig::from_toml(CONFIG).unwrap())
    }

    fn processor(store: &Arc<MemoryStore>) -> RecordProcessor {
        RecordProcessor::new(store.clone(), config(), None)
    }

    pub(crate) async fn staged(store: &MemoryStore, source: &str, row: &str, payload: serde_json::Value) -> StagedRecord {
        let record = StagedRecord::new(source, "rows", row, payload);
        store.stage(record.clone()).await;
        record
    }

    #[tokio::test]
    async fn test_exact_phone_auto_merges_at_full_confidence() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        let first = staged(&store, "clinic", "1", json!({"name": "Susan Smith", "phone": "707-555-1234"})).await;
        let second = staged(&store, "clinic", "2", json!({"name": "Susan Smith", "phone": "(707) 555-1234"})).await;

        let created = processor.process(&first).await.unwrap();
        let RecordOutcome::NewEntity { entity } = created.outcome else {
            panic!("expected a new entity");
        };
        let merged = processor.process(&second).await.unwrap();
        assert_eq!(merged.outcome, RecordOutcome::AutoMerged { entity: entity.clone() });

        let decision = store.active_decision(&second.id).await.unwrap().unwrap();
        assert_eq!(decision.outcome, DecisionOutcome::AutoMerge);
        assert_eq!(decision.score, 1.0);
        assert_eq!(store.live_entities(EntityKind::Person).await.len(), 1);
    }

    #[tokio::test]
    async fn test_similar_name_at_shared_address_goes_to_review() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        let susan = staged(&store, "volunteers", "1", json!({"name": "Susan Smith", "address": "12 Oak St"})).await;
        let susana = staged(&store, "volunteers", "2", json!({"name": "Susana Smyth", "address": "12 Oak Street"})).await;

        assert!(matches!(processor.process(&susan).await.unwrap().outcome, RecordOutcome::NewEntity { .. }));
        let outcome = processor.process(&susana).await.unwrap().outcome;
        let RecordOutcome::QueuedForReview { entry } = outcome else {
            panic!("expected a review entry");
        };

        let entry = store.get_review_entry(&entry).await.unwrap().unwrap();
        let settings = config().kind(EntityKind::Person).clone();
        assert!(entry.top_score >= settings.review_threshold);
        assert!(entry.top_score < settings.auto_merge_threshold);
        assert!(entry.candidates[0].signals.shared_address);
        // Nothing was created for the queued record.
        assert_eq!(store.live_entities(EntityKind::Person).await.len(), 1);
        assert_eq!(store.live_entities(EntityKind::Place).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_microchip_creates_cat() {
        let store = Arc::new(MemoryStore::new());
        let record = staged(&store, "chips", "1", json!({"cat_name": "Tom", "chip": "985112012345678"})).await;
        let outcome = processor(&store).process(&record).await.unwrap().outcome;
        assert!(matches!(outcome, RecordOutcome::NewEntity { .. }));
        assert_eq!(store.live_entities(EntityKind::Cat).await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_address_and_unit_merges_place() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        let a = staged(&store, "intake", "1", json!({"address": "12 Oak St", "unit": "Apt 4"})).await;
        let b = staged(&store, "intake", "2", json!({"address": "12 OAK STREET", "unit": "#4"})).await;
        let c = staged(&store, "intake", "3", json!({"address": "12 Oak St", "unit": "Apt 5"})).await;

        let RecordOutcome::NewEntity { entity } = processor.process(&a).await.unwrap().outcome else {
            panic!("expected new place");
        };
        assert_eq!(
            processor.process(&b).await.unwrap().outcome,
            RecordOutcome::AutoMerged { entity }
        );
        // A different unit is a different place.
        assert!(!matches!(
            processor.process(&c).await.unwrap().outcome,
            RecordOutcome::AutoMerged { .. }
        ));
    }

    #[tokio::test]
    async fn test_reprocessing_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        let record = staged(&store, "clinic", "1", json!({"name": "Susan Smith", "phone": "7075551234"})).await;
        processor.process(&record).await.unwrap();
        let applied = store.applied_units();
        let audit_len = store.audit_log().await.len();

        let again = processor.process(&record).await.unwrap();
        assert_eq!(again.outcome, RecordOutcome::AlreadyDecided);
        assert_eq!(store.applied_units(), applied);
        assert_eq!(store.audit_log().await.len(), audit_len);
    }

    #[tokio::test]
    async fn test_shared_phone_never_merges_different_people() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        let shop = Identifier::new(IdentifierKind::Phone, "7075550000");
        let mut unit = UnitOfWork::new();
        for name in ["Susan Smith", "Robert Jones"] {
            let entity = CanonicalEntity::new(EntityKind::Person, name, EntityDetails::empty(EntityKind::Person));
            unit.identifiers.push(EntityIdentifier {
                entity_id: entity.id.clone(),
                identifier: shop.clone(),
                source_system: None,
                created_at: unit.at,
            });
            unit.new_entities.push(entity);
        }
        store.apply(unit).await.unwrap();
        let maria = staged(&store, "clinic", "3", json!({"name": "Maria Garcia", "phone": "707-555-0000"})).await;
        let processed = processor.process(&maria).await.unwrap();
        assert!(!matches!(processed.outcome, RecordOutcome::AutoMerged { .. }));
        assert_eq!(processed.conflicting_identifiers, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_record_pending() {
        let store = Arc::new(MemoryStore::new());
        let processor = processor(&store);
        let record = staged(&store, "clinic", "1", json!({"name": "Susan Smith", "phone": "7075551234"})).await;
        store.fail_next_applies(1);
        let err = processor.process(&record).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.entities().await.is_empty());
        assert_eq!(store.pending_records("clinic", 10).await.unwrap().len(), 1);

        processor.process(&record).await.unwrap();
        assert!(store.pending_records("clinic", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enrich_only_source_queues_unknown_people() {
        let store = Arc::new(MemoryStore::new());
        let record = staged(&store, "web_form", "1", json!({"name": "New Person", "email": "new@example.org"})).await;
        let outcome = processor(&store).process(&record).await.unwrap().outcome;
        assert!(matches!(outcome, RecordOutcome::QueuedForReview { .. }));
        assert!(store.entities().await.is_empty());
    }

    struct DownGeocoder;

    #[async_trait]
    impl Geocoder for DownGeocoder {
        async fn geocode(&self, _address: &str) -> Result<Option<GeocodeResult>, GeocodeError> {
            Err(GeocodeError::Permanent("REQUEST_DENIED".into()))
        }
    }

    #[tokio::test]
    async fn test_geocoding_failure_sends_place_to_review() {
        let store = Arc::new(MemoryStore::new());
        let geocoder = CachedGeocoder::new(store.clone(), Arc::new(DownGeocoder), GeocoderSettings::default());
        let processor = RecordProcessor::new(store.clone(), config(), Some(Arc::new(geocoder)));
        let record = staged(&store, "intake", "1", json!({"address": "12 Oak St"})).await;

        let outcome = processor.process(&record).await.unwrap().outcome;
        let RecordOutcome::QueuedForReview { entry } = outcome else {
            panic!("expected a review entry");
        };
        let entry = store.get_review_entry(&entry).await.unwrap().unwrap();
        assert!(entry.reason.unwrap().contains("geocoding failed"));
    }

    fn runner(store: &Arc<MemoryStore>) -> BatchRunner {
        let progress = ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        };
        let settings = BatchSettings {
            batch_size: 10,
            max_concurrent_sources: 2,
            lease_ttl: Duration::from_secs(60),
        };
        BatchRunner::new(store.clone(), config(), Arc::new(processor(store)), settings, progress)
    }

    #[tokio::test]
    async fn test_batch_run_counts_outcomes_per_source() {
        let store = Arc::new(MemoryStore::new());
        staged(&store, "clinic", "1", json!({"name": "Susan Smith", "phone": "707-555-1234"})).await;
        staged(&store, "clinic", "2", json!({"name": "Susan Smith", "phone": "7075551234"})).await;
        staged(&store, "chips", "1", json!({"cat_name": "Tom", "chip": "985112012345678"})).await;
        staged(&store, "unmapped", "1", json!({"name": "x"})).await;

        let summaries = runner(&store)
            .run(&SourceFilterConfig::default(), &CancellationFlag::new())
            .await
            .unwrap();
        assert_eq!(summaries.len(), 2);
        let chips = &summaries[0];
        assert_eq!((chips.source_system.as_str(), chips.new_entity), ("chips", 1));
        let clinic = &summaries[1];
        assert_eq!(clinic.processed, 2);
        assert_eq!(clinic.new_entity + clinic.auto_merged, 2);
        assert_eq!(clinic.auto_merged, 1);
        assert_eq!(clinic.errored, 0);

        // Second run finds nothing left for the mapped sources.
        let again = runner(&store)
            .run(&SourceFilterConfig::default(), &CancellationFlag::new())
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_filter_cancellation_and_lease() {
        let store = Arc::new(MemoryStore::new());
        staged(&store, "clinic", "1", json!({"name": "Susan Smith", "phone": "7075551234"})).await;
        staged(&store, "chips", "1", json!({"cat_name": "Tom", "chip": "985112012345678"})).await;

        let only_chips = SourceFilterConfig::from_list("chips");
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let summaries = runner(&store).run(&only_chips, &cancel).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].retry_pending, 1);
        assert_eq!(summaries[0].processed, 0);
        assert!(store.decisions().await.is_empty());

        assert!(store
            .try_acquire_source_lease("clinic", "someone-else", Duration::from_secs(60))
            .await
            .unwrap());
        let blocked = runner(&store)
            .run_source("clinic", &CancellationFlag::new(), None)
            .await
            .unwrap();
        assert!(blocked.lease_unavailable);
        assert_eq!(store.pending_records("clinic", 10).await.unwrap().len(), 1);
    }

    const APPOINTMENTS_ONLY: &str = r#"
[[sources]]
source_system = "clinic"
source_table = "appointments"
entity_kind = "person"

[sources.fields]
name = "name"
phone = ["phone"]
"#;

    #[tokio::test]
    async fn test_unrecoverable_record_is_queued_and_source_moves_on() {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(MatchingConfig::from_toml(APPOINTMENTS_ONLY).unwrap());
        let mut unmapped = StagedRecord::new("clinic", "owners", "1", json!({"name": "Susan Smith"}));
        unmapped.ingested_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        store.stage(unmapped.clone()).await;
        let good = StagedRecord::new("clinic", "appointments", "2", json!({"name": "Ann Lee", "phone": "7075559876"}));
        store.stage(good.clone()).await;

        let settings = BatchSettings {
            batch_size: 1,
            max_concurrent_sources: 1,
            lease_ttl: Duration::from_secs(60),
        };
        let processor = Arc::new(RecordProcessor::new(store.clone(), config.clone(), None));
        let runner = BatchRunner::new(store.clone(), config, processor, settings, ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        });

        let first = runner.run_source("clinic", &CancellationFlag::new(), None).await.unwrap();
        assert_eq!((first.errored, first.queued_for_review, first.retry_pending), (1, 1, 0));
        let decision = store.active_decision(&unmapped.id).await.unwrap().unwrap();
        assert_eq!(decision.outcome, DecisionOutcome::ReviewNeeded);
        let entry = store
            .get_review_entry(decision.review_entry_id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(entry.reason.unwrap().contains("no source mapping for clinic/owners"));
        assert!(entry.source_system.is_none());

        let second = runner.run_source("clinic", &CancellationFlag::new(), None).await.unwrap();
        assert_eq!(second.new_entity, 1);
        assert!(store.active_decision(&good.id).await.unwrap().is_some());
    }

    /// Hands the source's lease to another holder the first time it is asked
    /// for a geocode.
    struct LeaseStealingGeocoder {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl Geocoder for LeaseStealingGeocoder {
        async fn geocode(&self, _address: &str) -> Result<Option<GeocodeResult>, GeocodeError> {
            let stolen = self
                .store
                .try_acquire_source_lease("intake", "other-worker", Duration::from_secs(60))
                .await
                .unwrap();
            assert!(stolen);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_lost_lease_stops_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let geocoder = CachedGeocoder::new(
            store.clone(),
            Arc::new(LeaseStealingGeocoder { store: store.clone() }),
            GeocoderSettings::default(),
        );
        let processor = Arc::new(RecordProcessor::new(store.clone(), config(), Some(Arc::new(geocoder))));
        let mut first = StagedRecord::new("intake", "rows", "1", json!({"address": "12 Oak St"}));
        first.ingested_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        store.stage(first.clone()).await;
        staged(&store, "intake", "2", json!({"address": "40 Elm Ave"})).await;

        // A zero ttl lets the other worker take the lease while ours is in use.
        let settings = BatchSettings {
            batch_size: 10,
            max_concurrent_sources: 1,
            lease_ttl: Duration::ZERO,
        };
        let runner = BatchRunner::new(store.clone(), config(), processor, settings, ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        });
        let summary = runner.run_source("intake", &CancellationFlag::new(), None).await.unwrap();

        assert!(summary.lease_lost);
        assert_eq!((summary.processed, summary.retry_pending), (1, 1));
        assert!(store.active_decision(&first.id).await.unwrap().is_some());
        assert_eq!(store.pending_records("intake", 10).await.unwrap().len(), 1);
        // The other worker still holds it.
        assert!(!store
            .try_acquire_source_lease("intake", "third-worker", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
