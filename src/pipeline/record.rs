// src/pipeline/record.rs
//
// One staged record, start to finish: extract, prepare, match, decide, and
// commit everything the decision implies as a single unit of work.

use std::sync::Arc;

use log::{debug, info};

use crate::audit;
use crate::config::{MatchingConfig, SourceConfig};
use crate::error::{EngineError, EngineResult};
use crate::extraction::{extract, ExtractedRecord};
use crate::geocoding::CachedGeocoder;
use crate::matching::{decide, evaluate, Evaluation, Verdict};
use crate::models::{
    CanonicalEntity, DecisionId, DecisionOutcome, EntityId, EntityKind, MatchCandidate, MatchDecision,
    ReviewEntryId, ReviewQueueEntry, ReviewSubject, StagedRecord,
};
use crate::pipeline::linking::RecordLinker;
use crate::store::{SharedStore, UnitOfWork};
use crate::utils::constants::SYSTEM_ACTOR;

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    AutoMerged { entity: EntityId },
    NewEntity { entity: EntityId },
    QueuedForReview { entry: ReviewEntryId },
    /// The record already has an active decision.
    AlreadyDecided,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecord {
    pub outcome: RecordOutcome,
    pub conflicting_identifiers: usize,
    pub extraction_issues: usize,
}

pub struct RecordProcessor {
    store: SharedStore,
    config: Arc<MatchingConfig>,
    geocoder: Option<Arc<CachedGeocoder>>,
}

impl RecordProcessor {
    pub fn new(store: SharedStore, config: Arc<MatchingConfig>, geocoder: Option<Arc<CachedGeocoder>>) -> Self {
        Self { store, config, geocoder }
    }

    pub fn linker(&self, source_system: &str, actor: &str) -> RecordLinker {
        RecordLinker::new(self.store.clone(), self.geocoder.clone(), source_system, actor)
    }

    fn source_for(&self, record: &StagedRecord) -> EngineResult<&SourceConfig> {
        self.config
            .source(&record.source_system, &record.source_table)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "no source mapping for {}/{}",
                    record.source_system, record.source_table
                ))
            })
    }

    /// Extracts and prepares `record` the same way batch processing does, for
    /// callers that place a record themselves (review resolution).
    pub async fn prepared(&self, record: &StagedRecord, actor: &str) -> EngineResult<(ExtractedRecord, Option<String>)> {
        let source = self.source_for(record)?;
        let mut extracted = extract(record, source);
        let blocked = self.linker(&record.source_system, actor).prepare(&mut extracted).await;
        Ok((extracted, blocked))
    }

    /// Puts a record that failed for a reason retrying will not fix on the
    /// queue, with the error as the reason, so it stops blocking its source.
    /// The entry carries no source system: there was no scored match to feed
    /// back into trust.
    pub async fn queue_failed(&self, record: &StagedRecord, error: &EngineError) -> EngineResult<ReviewEntryId> {
        let kind = self.kind_hint(record);
        let reason = format!("processing failed: {}", error);
        let mut unit = UnitOfWork::new();
        let decision_id = DecisionId::new();
        let mut entry = ReviewQueueEntry::new(
            kind,
            ReviewSubject::StagedRecord(record.id.clone()),
            None,
            Some(decision_id.clone()),
            Vec::new(),
            Some(reason.clone()),
        );
        entry.created_at = unit.at;
        let entry_id = entry.id.clone();
        unit.review_entries.push(entry);

        let decision = MatchDecision {
            id: decision_id,
            staged_record_id: record.id.clone(),
            source_system: record.source_system.clone(),
            kind,
            outcome: DecisionOutcome::ReviewNeeded,
            entity_id: None,
            review_entry_id: Some(entry_id.clone()),
            score: 0.0,
            winning_candidate: None,
            reason: Some(reason),
            decided_at: unit.at,
            resolved_at: None,
            reopened_at: None,
        };
        unit.audit(audit::decision_made(&decision, SYSTEM_ACTOR));
        unit.decisions.push(decision);
        self.store.apply(unit).await?;
        info!(
            "📋 {}:{} failed and was queued for review as {}",
            record.source_system, record.source_row_id, entry_id
        );
        Ok(entry_id)
    }

    /// The mapped kind of `record`, else the kind of any mapping for its system.
    fn kind_hint(&self, record: &StagedRecord) -> EntityKind {
        self.config
            .source(&record.source_system, &record.source_table)
            .or_else(|| self.config.sources.iter().find(|s| s.source_system == record.source_system))
            .map(|s| s.entity_kind)
            .unwrap_or(EntityKind::Person)
    }

    pub async fn process(&self, record: &StagedRecord) -> EngineResult<ProcessedRecord> {
        let store = self.store.as_ref();
        if store.active_decision(&record.id).await?.is_some() {
            debug!("Record {} already decided; skipping", record.id);
            return Ok(ProcessedRecord {
                outcome: RecordOutcome::AlreadyDecided,
                conflicting_identifiers: 0,
                extraction_issues: 0,
            });
        }

        let source = self.source_for(record)?;
        let linker = self.linker(&record.source_system, SYSTEM_ACTOR);
        let mut extracted = extract(record, source);
        let mut blocked = linker.prepare(&mut extracted).await;
        if !extracted.has_identifiers() && extracted.normalized_name.is_none() {
            blocked.get_or_insert_with(|| "record has no usable identifiers or name".to_string());
        }

        let related = linker.lookup_related(&extracted).await?;
        let context = RecordLinker::context(&extracted, &related);
        let settings = self.config.kind(extracted.kind);
        let trust = store
            .trust_weight(extracted.kind, &record.source_system)
            .await?
            .unwrap_or(self.config.trust.default_weight);

        let evaluation = evaluate(store, settings, trust, &extracted, &context).await?;
        let verdict = decide(
            &evaluation.candidates,
            settings,
            source.can_create_entities,
            blocked.as_deref(),
        );

        let mut unit = UnitOfWork::new();
        let outcome = match verdict {
            Verdict::AutoMerge { winner, tied } => {
                let target = store
                    .get_entity(&winner.entity_id)
                    .await?
                    .ok_or_else(|| EngineError::EntityNotFound(winner.entity_id.clone()))?;
                linker.attach_to(&target, &extracted, &mut unit).await?;
                linker.link_related(&target, &extracted, &related, &mut unit).await?;
                self.queue_tied(&winner, &tied, record, &mut unit).await?;
                push_decision(
                    &mut unit,
                    record,
                    &extracted,
                    DecisionOutcome::AutoMerge,
                    Some(target.id.clone()),
                    None,
                    Some(winner),
                    None,
                );
                RecordOutcome::AutoMerged { entity: target.id }
            }
            Verdict::NewEntity => {
                let entity = linker.create_from(&extracted, &mut unit);
                linker.attach_to(&entity, &extracted, &mut unit).await?;
                linker.link_related(&entity, &extracted, &related, &mut unit).await?;
                push_decision(
                    &mut unit,
                    record,
                    &extracted,
                    DecisionOutcome::NewEntity,
                    Some(entity.id.clone()),
                    None,
                    evaluation.candidates.first().cloned(),
                    None,
                );
                RecordOutcome::NewEntity { entity: entity.id }
            }
            Verdict::ReviewNeeded { reason } => {
                let entry = self.queue_record(record, &extracted, &evaluation, &reason, &mut unit);
                RecordOutcome::QueuedForReview { entry }
            }
        };

        store.apply(unit).await?;
        match &outcome {
            RecordOutcome::AutoMerged { entity } => info!(
                "🔗 {} {}:{} auto-merged into {}",
                extracted.kind, record.source_system, record.source_row_id, entity
            ),
            RecordOutcome::NewEntity { entity } => debug!(
                "✨ {} {}:{} became new entity {}",
                extracted.kind, record.source_system, record.source_row_id, entity
            ),
            RecordOutcome::QueuedForReview { entry } => debug!(
                "📋 {} {}:{} queued for review ({})",
                extracted.kind, record.source_system, record.source_row_id, entry
            ),
            RecordOutcome::AlreadyDecided => {}
        }
        Ok(ProcessedRecord {
            outcome,
            conflicting_identifiers: evaluation.conflicting.len(),
            extraction_issues: extracted.issue_count(),
        })
    }

    fn queue_record(
        &self,
        record: &StagedRecord,
        extracted: &ExtractedRecord,
        evaluation: &Evaluation,
        reason: &str,
        unit: &mut UnitOfWork,
    ) -> ReviewEntryId {
        let decision_id = DecisionId::new();
        let mut entry = ReviewQueueEntry::new(
            extracted.kind,
            ReviewSubject::StagedRecord(record.id.clone()),
            Some(record.source_system.clone()),
            Some(decision_id.clone()),
            evaluation.candidates.clone(),
            Some(reason.to_string()),
        );
        entry.created_at = unit.at;
        let entry_id = entry.id.clone();
        unit.review_entries.push(entry);

        let mut decision = build_decision(
            unit,
            record,
            extracted,
            DecisionOutcome::ReviewNeeded,
            None,
            Some(entry_id.clone()),
            evaluation.candidates.first().cloned(),
            Some(reason.to_string()),
        );
        decision.id = decision_id;
        decision.resolved_at = None;
        unit.audit(audit::decision_made(&decision, SYSTEM_ACTOR));
        unit.decisions.push(decision);
        entry_id
    }

    /// Entities tied with the winner look like duplicates of it. Each is put
    /// on the queue as an entity-pair entry unless one is already pending.
    async fn queue_tied(
        &self,
        winner: &MatchCandidate,
        tied: &[MatchCandidate],
        record: &StagedRecord,
        unit: &mut UnitOfWork,
    ) -> EngineResult<()> {
        for duplicate in tied {
            let subject = ReviewSubject::Entity(duplicate.entity_id.clone());
            let queued_here = unit.review_entries.iter().any(|e| e.subject == subject);
            if queued_here || !self.store.pending_review_for_subject(&subject).await?.is_empty() {
                continue;
            }
            let mut entry = ReviewQueueEntry::new(
                duplicate.kind,
                subject,
                Some(record.source_system.clone()),
                None,
                vec![winner.clone()],
                Some(format!(
                    "tied at {:.2} with {} while matching {}:{}",
                    duplicate.score, winner.entity_id, record.source_system, record.source_row_id
                )),
            );
            entry.created_at = unit.at;
            unit.review_entries.push(entry);
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn build_decision(
    unit: &UnitOfWork,
    record: &StagedRecord,
    extracted: &ExtractedRecord,
    outcome: DecisionOutcome,
    entity_id: Option<EntityId>,
    review_entry_id: Option<ReviewEntryId>,
    winning_candidate: Option<MatchCandidate>,
    reason: Option<String>,
) -> MatchDecision {
    MatchDecision {
        id: DecisionId::new(),
        staged_record_id: record.id.clone(),
        source_system: record.source_system.clone(),
        kind: extracted.kind,
        outcome,
        entity_id,
        review_entry_id,
        score: winning_candidate.as_ref().map(|c| c.score).unwrap_or(0.0),
        winning_candidate,
        reason,
        decided_at: unit.at,
        resolved_at: Some(unit.at),
        reopened_at: None,
    }
}

#[allow(clippy::too_many_arguments)]
fn push_decision(
    unit: &mut UnitOfWork,
    record: &StagedRecord,
    extracted: &ExtractedRecord,
    outcome: DecisionOutcome,
    entity_id: Option<EntityId>,
    review_entry_id: Option<ReviewEntryId>,
    winning_candidate: Option<MatchCandidate>,
    reason: Option<String>,
) {
    let decision = build_decision(
        unit,
        record,
        extracted,
        outcome,
        entity_id,
        review_entry_id,
        winning_candidate,
        reason,
    );
    unit.audit(audit::decision_made(&decision, SYSTEM_ACTOR));
    unit.decisions.push(decision);
}

/// Places a record a reviewer has decided on: attaches it to `target`, or
/// creates a new entity for it.
pub async fn place_record(
    linker: &RecordLinker,
    extracted: &ExtractedRecord,
    target: Option<&CanonicalEntity>,
    unit: &mut UnitOfWork,
) -> EngineResult<CanonicalEntity> {
    let related = linker.lookup_related(extracted).await?;
    let entity = match target {
        Some(target) => target.clone(),
        None => linker.create_from(extracted, unit),
    };
    linker.attach_to(&entity, extracted, unit).await?;
    linker.link_related(&entity, extracted, &related, unit).await?;
    Ok(entity)
}
