// src/merge/executor.rs
//
// Pointer merges. A merge only ever sets `merged_into` on the absorbed root
// and flattens that root's dependents onto the survivor; relationship rows are
// never touched, so an unmerge is a pointer reset plus a dependent restore.

use anyhow::anyhow;
use log::{info, warn};
use serde_json::json;

use crate::canonical::resolve_root;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AuditEntry, AuditOperation, CanonicalEntity, DecisionId, DecisionOutcome, EntityId,
    MatchCandidate, MatchSignals, MatchType, MergeEvent, MergeEventId, ReviewQueueEntry,
    ReviewSubject,
};
use crate::store::{PointerWrite, SharedStore, Store, UnitOfWork};
use crate::utils::constants::MAX_MERGE_CHAIN_HOPS;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(MergeEvent),
    /// Both sides already resolve to `root`. Nothing was written.
    AlreadyMerged { root: EntityId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnmergeOutcome {
    pub event: MergeEvent,
    /// Flattened dependents moved back under the restored entity.
    pub restored: Vec<EntityId>,
    /// Decisions that placed records into the cluster after the merge, either
    /// automatically or on review, re-opened for re-processing.
    pub reopened: Vec<DecisionId>,
}

async fn load(store: &dyn Store, id: &EntityId) -> EngineResult<CanonicalEntity> {
    store
        .get_entity(id)
        .await?
        .ok_or_else(|| EngineError::EntityNotFound(id.clone()))
}

async fn load_root(store: &dyn Store, id: &EntityId) -> EngineResult<CanonicalEntity> {
    resolve_root(store, id)
        .await?
        .ok_or_else(|| EngineError::EntityNotFound(id.clone()))
}

/// True if following `target`'s pointers reaches `source`.
async fn chain_reaches(store: &dyn Store, target: &CanonicalEntity, source: &EntityId) -> EngineResult<bool> {
    if &target.id == source {
        return Ok(true);
    }
    let mut next = target.merged_into.clone();
    let mut hops = 0;
    while let Some(id) = next {
        if &id == source {
            return Ok(true);
        }
        hops += 1;
        if hops > MAX_MERGE_CHAIN_HOPS {
            return Err(EngineError::Internal(anyhow!(
                "merge chain from {} exceeds {} hops",
                target.id,
                MAX_MERGE_CHAIN_HOPS
            )));
        }
        next = load(store, &id).await?.merged_into;
    }
    Ok(false)
}

/// Adds the writes for merging `source` into `target` to `unit`. Nothing is
/// applied, so callers can commit the merge together with their own changes.
pub async fn plan_merge(
    store: &dyn Store,
    source: &EntityId,
    target: &EntityId,
    actor: &str,
    reason: Option<&str>,
    unit: &mut UnitOfWork,
) -> EngineResult<MergeOutcome> {
    let source_entity = load(store, source).await?;
    let target_entity = load(store, target).await?;
    if source_entity.kind != target_entity.kind {
        return Err(EngineError::KindMismatch {
            left: source_entity.kind,
            right: target_entity.kind,
        });
    }
    if chain_reaches(store, &target_entity, source).await? {
        return Err(EngineError::CycleDetected {
            source_id: source.clone(),
            target: target.clone(),
        });
    }

    let root_source = load_root(store, source).await?;
    let root_target = load_root(store, target).await?;
    if root_source.id == root_target.id {
        return Ok(MergeOutcome::AlreadyMerged { root: root_target.id });
    }

    let repointed = store.direct_members(&root_source.id).await?;
    unit.pointer_writes.push(PointerWrite {
        entity_id: root_source.id.clone(),
        expected: None,
        new: Some(root_target.id.clone()),
    });
    for dependent in &repointed {
        unit.pointer_writes.push(PointerWrite {
            entity_id: dependent.clone(),
            expected: Some(root_source.id.clone()),
            new: Some(root_target.id.clone()),
        });
    }

    let event = MergeEvent {
        id: MergeEventId::new(),
        kind: root_source.kind,
        source_entity: root_source.id.clone(),
        target_entity: root_target.id.clone(),
        repointed: repointed.clone(),
        actor: actor.to_string(),
        reason: reason.map(str::to_string),
        merged_at: unit.at,
        unmerged_at: None,
    };
    unit.audit(
        AuditEntry::new(root_source.kind, root_source.id.as_str(), AuditOperation::Merge, actor)
            .before(json!({
                "merged_into": null,
                "requested_source": source,
                "requested_target": target,
            }))
            .after(json!({
                "merged_into": root_target.id,
                "merge_event_id": event.id,
                "repointed": repointed,
                "reason": reason,
            }))
            .at(unit.at),
    );
    unit.merge_events.push(event.clone());
    Ok(MergeOutcome::Merged(event))
}

/// Adds the writes that reverse the merge which absorbed `entity`.
pub async fn plan_unmerge(
    store: &dyn Store,
    entity: &EntityId,
    actor: &str,
    reason: Option<&str>,
    unit: &mut UnitOfWork,
) -> EngineResult<UnmergeOutcome> {
    let absorbed = load(store, entity).await?;
    let current = match &absorbed.merged_into {
        Some(current) => current.clone(),
        None => return Err(EngineError::NotMerged(entity.clone())),
    };
    let event = store.active_merge_event(entity).await?.ok_or_else(|| {
        EngineError::Internal(anyhow!("{} is merged but has no open merge event", entity))
    })?;

    unit.pointer_writes.push(PointerWrite {
        entity_id: entity.clone(),
        expected: Some(current.clone()),
        new: None,
    });
    unit.closed_merge_events.push(event.id.clone());

    // Dependents that left with ours and still sit in the cluster we are leaving.
    let mut restored = Vec::new();
    for dependent in &event.repointed {
        match store.get_entity(dependent).await? {
            Some(d) if d.merged_into.as_ref() == Some(&current) => {
                unit.pointer_writes.push(PointerWrite {
                    entity_id: dependent.clone(),
                    expected: Some(current.clone()),
                    new: Some(entity.clone()),
                });
                restored.push(dependent.clone());
            }
            _ => {}
        }
    }

    let mut affected = vec![event.target_entity.clone(), entity.clone()];
    affected.extend(event.repointed.iter().cloned());
    let reopened: Vec<DecisionId> = store
        .decisions_targeting(&affected, event.merged_at)
        .await?
        .into_iter()
        .filter(|d| match d.outcome {
            DecisionOutcome::AutoMerge => true,
            DecisionOutcome::ReviewNeeded => d.resolved_at.is_some(),
            DecisionOutcome::NewEntity => false,
        })
        .map(|d| {
            unit.audit(
                AuditEntry::new(d.kind, d.staged_record_id.as_str(), AuditOperation::DecisionReopened, actor)
                    .before(json!({"decision_id": d.id, "entity_id": d.entity_id}))
                    .after(json!({"reopened_by_unmerge_of": entity}))
                    .at(unit.at),
            );
            d.id
        })
        .collect();
    unit.decision_reopens.extend(reopened.iter().cloned());

    unit.audit(
        AuditEntry::new(absorbed.kind, entity.as_str(), AuditOperation::Unmerge, actor)
            .before(json!({"merged_into": current, "merge_event_id": event.id}))
            .after(json!({
                "merged_into": null,
                "restored": restored,
                "reopened_decisions": reopened,
                "reason": reason,
            }))
            .at(unit.at),
    );
    Ok(UnmergeOutcome {
        event,
        restored,
        reopened,
    })
}

pub struct MergeExecutor {
    store: SharedStore,
}

impl MergeExecutor {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Merges `source` into `target`. A merge that would close a cycle is
    /// refused and surfaced on the review queue for the pair.
    pub async fn merge_entities(
        &self,
        source: &EntityId,
        target: &EntityId,
        actor: &str,
        reason: Option<&str>,
    ) -> EngineResult<MergeOutcome> {
        let store = self.store.as_ref();
        let mut unit = UnitOfWork::new();
        match plan_merge(store, source, target, actor, reason, &mut unit).await {
            Ok(MergeOutcome::Merged(event)) => {
                store.apply(unit).await?;
                info!(
                    "🔗 Merged {} {} into {} ({} dependent(s) flattened)",
                    event.kind,
                    event.source_entity,
                    event.target_entity,
                    event.repointed.len()
                );
                Ok(MergeOutcome::Merged(event))
            }
            Ok(already) => {
                info!("{} and {} already share a root; nothing to merge", source, target);
                Ok(already)
            }
            Err(err @ EngineError::CycleDetected { .. }) => {
                warn!("⚠️ Refused merge of {} into {}: {}", source, target, err);
                self.queue_refused_merge(source, target, &err.to_string()).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn unmerge_entity(
        &self,
        entity: &EntityId,
        actor: &str,
        reason: Option<&str>,
    ) -> EngineResult<UnmergeOutcome> {
        let store = self.store.as_ref();
        let mut unit = UnitOfWork::new();
        let outcome = plan_unmerge(store, entity, actor, reason, &mut unit).await?;
        store.apply(unit).await?;
        info!(
            "✂️ Unmerged {} from {} ({} dependent(s) restored, {} decision(s) re-opened)",
            entity,
            outcome.event.target_entity,
            outcome.restored.len(),
            outcome.reopened.len()
        );
        Ok(outcome)
    }

    async fn queue_refused_merge(&self, source: &EntityId, target: &EntityId, why: &str) -> EngineResult<()> {
        let store = self.store.as_ref();
        let subject = ReviewSubject::Entity(source.clone());
        if !store.pending_review_for_subject(&subject).await?.is_empty() {
            return Ok(());
        }
        let target_entity = load(store, target).await?;
        let candidate = MatchCandidate {
            entity_id: target_entity.id.clone(),
            kind: target_entity.kind,
            match_type: MatchType::Manual,
            signals: MatchSignals::default(),
            score: 0.0,
            entity_created_at: target_entity.created_at,
        };
        let entry = ReviewQueueEntry::new(
            target_entity.kind,
            subject,
            None,
            None,
            vec![candidate],
            Some(format!("merge refused: {}", why)),
        );
        let mut unit = UnitOfWork::new();
        unit.review_entries.push(entry);
        store.apply(unit).await?;
        Ok(())
    }
}
