// src/audit/mod.rs
//
// Constructors for the entries each mutation writes, and the read side of
// the append-only log. Entries are only ever added through a UnitOfWork.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::canonical::{cluster_members, resolve_root};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    AuditEntry, AuditOperation, CanonicalEntity, EntityDetails, EntityId, EntityKind, Identifier,
    MatchDecision, Relationship, Resolution, ReviewQueueEntry,
};
use crate::store::SharedStore;

pub fn created(entity: &CanonicalEntity, source_system: Option<&str>, actor: &str, at: DateTime<Utc>) -> AuditEntry {
    AuditEntry::new(entity.kind, entity.id.as_str(), AuditOperation::Create, actor)
        .after(json!({
            "display_name": entity.display_name,
            "details": entity.details,
            "source_system": source_system,
        }))
        .at(at)
}

pub fn identifier_added(
    kind: EntityKind,
    entity_id: &EntityId,
    identifier: &Identifier,
    source_system: Option<&str>,
    actor: &str,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::new(kind, entity_id.as_str(), AuditOperation::IdentifierAdded, actor)
        .after(json!({
            "kind": identifier.kind.as_str(),
            "value": identifier.value,
            "source_system": source_system,
        }))
        .at(at)
}

pub fn alias_added(kind: EntityKind, entity_id: &EntityId, label: &str, actor: &str, at: DateTime<Utc>) -> AuditEntry {
    AuditEntry::new(kind, entity_id.as_str(), AuditOperation::AliasAdded, actor)
        .after(json!({ "label": label }))
        .at(at)
}

pub fn enriched(
    entity_id: &EntityId,
    before: &EntityDetails,
    after: &EntityDetails,
    actor: &str,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::new(after.kind(), entity_id.as_str(), AuditOperation::Enriched, actor)
        .before(json!(before))
        .after(json!(after))
        .at(at)
}

pub fn relationship_added(
    kind: EntityKind,
    subject: &EntityId,
    relationship: &Relationship,
    actor: &str,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::new(kind, subject.as_str(), AuditOperation::RelationshipAdded, actor)
        .after(json!({
            "relationship_id": relationship.id,
            "kind": relationship.kind.as_str(),
            "from": relationship.from_entity,
            "to": relationship.to_entity,
            "role": relationship.role,
        }))
        .at(at)
}

/// Keyed by staged record, the decision's own subject.
pub fn decision_made(decision: &MatchDecision, actor: &str) -> AuditEntry {
    AuditEntry::new(
        decision.kind,
        decision.staged_record_id.as_str(),
        AuditOperation::DecisionMade,
        actor,
    )
    .after(json!({
        "decision_id": decision.id,
        "outcome": decision.outcome.as_str(),
        "entity_id": decision.entity_id,
        "review_entry_id": decision.review_entry_id,
        "score": decision.score,
        "match_type": decision.winning_candidate.as_ref().map(|c| c.match_type.as_str()),
        "reason": decision.reason,
    }))
    .at(decision.decided_at)
}

pub fn review_resolved(
    entry: &ReviewQueueEntry,
    resolution: &Resolution,
    placed_on: Option<&EntityId>,
    actor: &str,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::new(entry.kind, entry.id.as_str(), AuditOperation::ReviewResolved, actor)
        .before(json!({
            "status": entry.status.as_str(),
            "subject": entry.subject,
            "top_score": entry.top_score,
        }))
        .after(json!({
            "resolution": resolution,
            "entity_id": placed_on,
        }))
        .at(at)
}

pub fn trust_adjusted(
    kind: EntityKind,
    source_system: &str,
    before: f64,
    after: f64,
    actor: &str,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry::new(kind, format!("trust:{}:{}", kind, source_system), AuditOperation::TrustAdjusted, actor)
        .before(json!({ "weight": before }))
        .after(json!({ "weight": after }))
        .at(at)
}

pub struct AuditLog {
    store: SharedStore,
}

impl AuditLog {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Entries written about this exact entity, oldest first.
    pub async fn entity_history(&self, entity: &EntityId) -> EngineResult<Vec<AuditEntry>> {
        if self.store.get_entity(entity).await?.is_none() {
            return Err(EngineError::EntityNotFound(entity.clone()));
        }
        let mut entries = self.store.audit_entries_for(entity.as_str()).await?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Entries for every member of the entity's current cluster, oldest first.
    pub async fn cluster_history(&self, entity: &EntityId) -> EngineResult<Vec<AuditEntry>> {
        let store = self.store.as_ref();
        let root = resolve_root(store, entity)
            .await?
            .ok_or_else(|| EngineError::EntityNotFound(entity.clone()))?;
        let mut entries = Vec::new();
        for member in cluster_members(store, &root.id).await? {
            entries.extend(store.audit_entries_for(member.as_str()).await?);
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Entries about a staged record: its decisions and re-openings.
    pub async fn record_history(&self, subject_id: &str) -> EngineResult<Vec<AuditEntry>> {
        let mut entries = self.store.audit_entries_for(subject_id).await?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }
}
