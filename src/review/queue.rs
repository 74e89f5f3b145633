// src/review/queue.rs
//
// Reads and resolves review queue entries. Every resolution is one unit of
// work: the placement or merge, the decision it closes, the entry update,
// the trust change and their audit rows commit together.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::audit;
use crate::canonical::resolve_root;
use crate::config::MatchingConfig;
use crate::error::{EngineError, EngineResult};
use crate::merge::{plan_merge, MergeOutcome};
use crate::models::{
    CanonicalEntity, EntityId, EntityKind, Resolution, ReviewEntryId, ReviewQueueEntry, ReviewStatus,
    ReviewSubject, StagedRecordId,
};
use crate::pipeline::{place_record, RecordProcessor};
use crate::review::trust::{plan_trust_adjustment, TrustFeedback};
use crate::store::{DecisionResolution, SharedStore, Store, UnitOfWork};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutcome {
    pub entry: ReviewQueueEntry,
    /// Entity the record was placed on, or the surviving root of a merge.
    pub placed_on: Option<EntityId>,
    /// (before, after) when the resolution moved a trust weight.
    pub trust: Option<(f64, f64)>,
}

pub struct ReviewQueue {
    store: SharedStore,
    processor: Arc<RecordProcessor>,
    config: Arc<MatchingConfig>,
}

impl ReviewQueue {
    pub fn new(store: SharedStore, processor: Arc<RecordProcessor>, config: Arc<MatchingConfig>) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    /// Pending entries, best score first, oldest first among equals.
    pub async fn pending_entries(&self, kind: Option<EntityKind>, limit: usize) -> EngineResult<Vec<ReviewQueueEntry>> {
        Ok(self.store.pending_review_entries(kind, limit).await?)
    }

    pub async fn get(&self, id: &ReviewEntryId) -> EngineResult<ReviewQueueEntry> {
        self.store
            .get_review_entry(id)
            .await?
            .ok_or_else(|| EngineError::ReviewEntryNotFound(id.clone()))
    }

    pub async fn resolve(
        &self,
        entry_id: &ReviewEntryId,
        resolution: Resolution,
        reviewer: &str,
    ) -> EngineResult<ResolveOutcome> {
        let mut entry = self.get(entry_id).await?;
        if !entry.is_pending() {
            return Err(EngineError::ReviewAlreadyResolved(entry.id));
        }

        let subject = entry.subject.clone();
        let mut unit = UnitOfWork::new();
        let (status, placed_on) = match &resolution {
            Resolution::Defer { note } => {
                let note = note.clone().unwrap_or_else(|| "deferred".to_string());
                unit.audit(audit::review_resolved(&entry, &resolution, None, reviewer, unit.at));
                entry.notes.push(format!("{}: {}", reviewer, note));
                unit.review_entries.push(entry.clone());
                self.store.apply(unit).await?;
                debug!("Deferred review entry {}", entry.id);
                return Ok(ResolveOutcome {
                    entry,
                    placed_on: None,
                    trust: None,
                });
            }
            Resolution::ConfirmMerge { candidate } => {
                if !entry.candidates.iter().any(|c| &c.entity_id == candidate) {
                    return Err(EngineError::InvalidResolution(format!(
                        "{} is not a candidate of review entry {}",
                        candidate, entry.id
                    )));
                }
                let target = self.live_target(candidate, entry.kind).await?;
                let placed = match &subject {
                    ReviewSubject::StagedRecord(staged) => {
                        self.place_staged(&entry, staged, Some(&target), reviewer, &mut unit).await?
                    }
                    ReviewSubject::Entity(duplicate) => {
                        match self.merge_duplicate(&mut entry, duplicate, &target, reviewer, &mut unit).await {
                            Ok(root) => root,
                            Err(err @ EngineError::CycleDetected { .. }) => {
                                self.keep_pending(entry, &err).await?;
                                return Err(err);
                            }
                            Err(err) => return Err(err),
                        }
                    }
                };
                (ReviewStatus::Confirmed, placed)
            }
            Resolution::Reject { link_to } => {
                let placed = match &subject {
                    ReviewSubject::StagedRecord(staged) => {
                        let target = match link_to {
                            Some(id) => Some(self.live_target(id, entry.kind).await?),
                            None => None,
                        };
                        self.place_staged(&entry, staged, target.as_ref(), reviewer, &mut unit).await?
                    }
                    ReviewSubject::Entity(duplicate) => {
                        if link_to.is_some() {
                            return Err(EngineError::InvalidResolution(format!(
                                "entity entry {} cannot be linked elsewhere; merge the entities instead",
                                entry.id
                            )));
                        }
                        duplicate.clone()
                    }
                };
                (ReviewStatus::Rejected, placed)
            }
        };

        let trust = match &entry.source_system {
            Some(source) => {
                let feedback = match status {
                    ReviewStatus::Confirmed => TrustFeedback::Confirmed,
                    _ => TrustFeedback::Rejected,
                };
                let change = plan_trust_adjustment(
                    self.store.as_ref(),
                    &self.config.trust,
                    entry.kind,
                    source,
                    feedback,
                    reviewer,
                    &mut unit,
                )
                .await?;
                Some(change)
            }
            None => None,
        };

        unit.audit(audit::review_resolved(&entry, &resolution, Some(&placed_on), reviewer, unit.at));
        entry.status = status;
        entry.resolved_at = Some(unit.at);
        entry.resolved_by = Some(reviewer.to_string());
        unit.review_entries.push(entry.clone());
        self.store.apply(unit).await?;

        info!(
            "✅ Review entry {} {} by {} (placed on {})",
            entry.id,
            entry.status.as_str(),
            reviewer,
            placed_on
        );
        Ok(ResolveOutcome {
            entry,
            placed_on: Some(placed_on),
            trust,
        })
    }

    /// Live root of `id`, which must be of `kind`.
    async fn live_target(&self, id: &EntityId, kind: EntityKind) -> EngineResult<CanonicalEntity> {
        let root = resolve_root(self.store.as_ref(), id)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(id.clone()))?;
        if root.kind != kind {
            return Err(EngineError::KindMismatch {
                left: kind,
                right: root.kind,
            });
        }
        Ok(root)
    }

    /// Puts the staged record on `target` (or a new entity) and closes its
    /// review decision.
    async fn place_staged(
        &self,
        entry: &ReviewQueueEntry,
        staged: &StagedRecordId,
        target: Option<&CanonicalEntity>,
        reviewer: &str,
        unit: &mut UnitOfWork,
    ) -> EngineResult<EntityId> {
        let record = self
            .store
            .get_staged_record(staged)
            .await?
            .ok_or_else(|| EngineError::InvalidResolution(format!("staged record {} no longer exists", staged)))?;
        let (extracted, blocked) = self.processor.prepared(&record, reviewer).await?;
        if let Some(reason) = blocked {
            debug!("Placing {} despite: {}", record.id, reason);
        }
        let linker = self.processor.linker(&record.source_system, reviewer);
        let entity = place_record(&linker, &extracted, target, unit).await?;
        if let Some(decision_id) = &entry.decision_id {
            unit.decision_resolutions.push(DecisionResolution {
                decision_id: decision_id.clone(),
                entity_id: Some(entity.id.clone()),
            });
        }
        Ok(entity.id)
    }

    async fn merge_duplicate(
        &self,
        entry: &mut ReviewQueueEntry,
        duplicate: &EntityId,
        target: &CanonicalEntity,
        reviewer: &str,
        unit: &mut UnitOfWork,
    ) -> EngineResult<EntityId> {
        let reason = format!("confirmed on review entry {}", entry.id);
        match plan_merge(self.store.as_ref(), duplicate, &target.id, reviewer, Some(&reason), unit).await? {
            MergeOutcome::Merged(event) => Ok(event.target_entity),
            MergeOutcome::AlreadyMerged { root } => {
                entry.notes.push(format!("{}: already merged into {}", reviewer, root));
                Ok(root)
            }
        }
    }

    async fn keep_pending(&self, mut entry: ReviewQueueEntry, err: &EngineError) -> EngineResult<()> {
        warn!("⚠️ Review entry {} stays pending: {}", entry.id, err);
        entry.notes.push(format!("merge refused: {}", err));
        let mut unit = UnitOfWork::new();
        unit.review_entries.push(entry);
        self.store.apply(unit).await?;
        Ok(())
    }
}
