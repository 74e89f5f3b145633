// src/store/postgres.rs

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use postgres_types::ToSql;
use serde_json::Value as JsonValue;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Row, Transaction};

use super::pool::PgPool;
use super::{CachedGeocode, Store, StoreResult, UnitOfWork};
use crate::error::StoreError;
use crate::geocoding::GeocodeResult;
use crate::models::{
    Alias, AuditEntry, AuditEntryId, AuditOperation, CanonicalEntity, DecisionId, DecisionOutcome,
    EntityDetails, EntityId, EntityIdentifier, EntityKind, Identifier, IdentifierKind,
    MatchCandidate, MatchDecision, MergeEvent, MergeEventId, Relationship, RelationshipId,
    RelationshipKind, ReviewEntryId, ReviewQueueEntry, ReviewStatus, ReviewSubject, StagedRecord,
    StagedRecordId,
};

const ENTITY_COLUMNS: &str = "id, kind, display_name, details, merged_into, created_at, updated_at";
const DECISION_COLUMNS: &str = "id, staged_record_id, source_system, kind, outcome, entity_id, \
     review_entry_id, score, winning_candidate, reason, decided_at, resolved_at, reopened_at";
const REVIEW_COLUMNS: &str = "id, kind, subject_type, subject_id, source_system, decision_id, \
     candidates, top_score, reason, status, notes, created_at, resolved_at, resolved_by";
const MERGE_EVENT_COLUMNS: &str =
    "id, kind, source_entity, target_entity, repointed, actor, reason, merged_at, unmerged_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the bundled schema migration. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for migration")?;
        conn.batch_execute(include_str!("../../migrations/001_schema.sql"))
            .await
            .context("Failed to apply resolution schema")?;
        Ok(())
    }
}

//------------------------------------------------------------------------------
// ROW MAPPING
//------------------------------------------------------------------------------

fn parse_kind(raw: &str) -> Result<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| anyhow!("unknown entity kind '{}'", raw))
}

fn parse_identifier_kind(raw: &str) -> Result<IdentifierKind> {
    IdentifierKind::parse(raw).ok_or_else(|| anyhow!("unknown identifier kind '{}'", raw))
}

fn staged_from_row(row: &Row) -> Result<StagedRecord> {
    Ok(StagedRecord {
        id: StagedRecordId(row.try_get("id")?),
        source_system: row.try_get("source_system")?,
        source_table: row.try_get("source_table")?,
        source_row_id: row.try_get("source_row_id")?,
        payload: row.try_get("payload")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn entity_from_row(row: &Row) -> Result<CanonicalEntity> {
    let kind: String = row.try_get("kind")?;
    let details: JsonValue = row.try_get("details")?;
    let merged_into: Option<String> = row.try_get("merged_into")?;
    Ok(CanonicalEntity {
        id: EntityId(row.try_get("id")?),
        kind: parse_kind(&kind)?,
        display_name: row.try_get("display_name")?,
        details: serde_json::from_value::<EntityDetails>(details)
            .context("Failed to decode entity details")?,
        merged_into: merged_into.map(EntityId),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn identifier_from_row(row: &Row) -> Result<EntityIdentifier> {
    let kind: String = row.try_get("kind")?;
    Ok(EntityIdentifier {
        entity_id: EntityId(row.try_get("entity_id")?),
        identifier: Identifier::new(parse_identifier_kind(&kind)?, row.try_get::<_, String>("value")?),
        source_system: row.try_get("source_system")?,
        created_at: row.try_get("created_at")?,
    })
}

fn alias_from_row(row: &Row) -> Result<Alias> {
    let count: i32 = row.try_get("observed_count")?;
    Ok(Alias {
        entity_id: EntityId(row.try_get("entity_id")?),
        label: row.try_get("label")?,
        normalized: row.try_get("normalized")?,
        observed_count: count.max(0) as u32,
        first_seen_at: row.try_get("first_seen_at")?,
    })
}

fn relationship_from_row(row: &Row) -> Result<Relationship> {
    let kind: String = row.try_get("kind")?;
    Ok(Relationship {
        id: RelationshipId(row.try_get("id")?),
        kind: RelationshipKind::parse(&kind)
            .ok_or_else(|| anyhow!("unknown relationship kind '{}'", kind))?,
        from_entity: EntityId(row.try_get("from_entity")?),
        to_entity: EntityId(row.try_get("to_entity")?),
        role: row.try_get("role")?,
        source_system: row.try_get("source_system")?,
        created_at: row.try_get("created_at")?,
    })
}

fn merge_event_from_row(row: &Row) -> Result<MergeEvent> {
    let kind: String = row.try_get("kind")?;
    let repointed: Vec<String> = row.try_get("repointed")?;
    Ok(MergeEvent {
        id: MergeEventId(row.try_get("id")?),
        kind: parse_kind(&kind)?,
        source_entity: EntityId(row.try_get("source_entity")?),
        target_entity: EntityId(row.try_get("target_entity")?),
        repointed: repointed.into_iter().map(EntityId).collect(),
        actor: row.try_get("actor")?,
        reason: row.try_get("reason")?,
        merged_at: row.try_get("merged_at")?,
        unmerged_at: row.try_get("unmerged_at")?,
    })
}

fn decision_from_row(row: &Row) -> Result<MatchDecision> {
    let kind: String = row.try_get("kind")?;
    let outcome: String = row.try_get("outcome")?;
    let winning: Option<JsonValue> = row.try_get("winning_candidate")?;
    let entity_id: Option<String> = row.try_get("entity_id")?;
    let review_entry_id: Option<String> = row.try_get("review_entry_id")?;
    Ok(MatchDecision {
        id: DecisionId(row.try_get("id")?),
        staged_record_id: StagedRecordId(row.try_get("staged_record_id")?),
        source_system: row.try_get("source_system")?,
        kind: parse_kind(&kind)?,
        outcome: DecisionOutcome::parse(&outcome)
            .ok_or_else(|| anyhow!("unknown decision outcome '{}'", outcome))?,
        entity_id: entity_id.map(EntityId),
        review_entry_id: review_entry_id.map(ReviewEntryId),
        score: row.try_get("score")?,
        winning_candidate: winning
            .map(serde_json::from_value::<MatchCandidate>)
            .transpose()
            .context("Failed to decode winning candidate")?,
        reason: row.try_get("reason")?,
        decided_at: row.try_get("decided_at")?,
        resolved_at: row.try_get("resolved_at")?,
        reopened_at: row.try_get("reopened_at")?,
    })
}

fn review_from_row(row: &Row) -> Result<ReviewQueueEntry> {
    let kind: String = row.try_get("kind")?;
    let subject_type: String = row.try_get("subject_type")?;
    let subject_id: String = row.try_get("subject_id")?;
    let status: String = row.try_get("status")?;
    let candidates: JsonValue = row.try_get("candidates")?;
    let notes: JsonValue = row.try_get("notes")?;
    let decision_id: Option<String> = row.try_get("decision_id")?;
    Ok(ReviewQueueEntry {
        id: ReviewEntryId(row.try_get("id")?),
        kind: parse_kind(&kind)?,
        subject: ReviewSubject::from_parts(&subject_type, &subject_id)
            .ok_or_else(|| anyhow!("unknown review subject type '{}'", subject_type))?,
        source_system: row.try_get("source_system")?,
        decision_id: decision_id.map(DecisionId),
        candidates: serde_json::from_value(candidates)
            .context("Failed to decode review candidates")?,
        top_score: row.try_get("top_score")?,
        reason: row.try_get("reason")?,
        status: ReviewStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown review status '{}'", status))?,
        notes: serde_json::from_value(notes).context("Failed to decode review notes")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
    })
}

fn audit_from_row(row: &Row) -> Result<AuditEntry> {
    let kind: String = row.try_get("entity_kind")?;
    let operation: String = row.try_get("operation")?;
    Ok(AuditEntry {
        id: AuditEntryId(row.try_get("id")?),
        entity_kind: parse_kind(&kind)?,
        subject_id: row.try_get("subject_id")?,
        operation: AuditOperation::parse(&operation)
            .ok_or_else(|| anyhow!("unknown audit operation '{}'", operation))?,
        actor: row.try_get("actor")?,
        before: row.try_get("before_value")?,
        after: row.try_get("after_value")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_rows<T>(rows: &[Row], f: fn(&Row) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(f).collect()
}

fn id_strs(ids: &[EntityId]) -> Vec<&str> {
    ids.iter().map(EntityId::as_str).collect()
}

/// Unique-key violations mean a concurrent writer got there first.
fn write_error(e: tokio_postgres::Error, what: &str) -> StoreError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        StoreError::Conflict(format!("{}: {}", what, e))
    } else {
        StoreError::Backend(anyhow::Error::new(e).context(what.to_string()))
    }
}

//------------------------------------------------------------------------------
// UNIT OF WORK
//------------------------------------------------------------------------------

async fn write_unit(tx: &Transaction<'_>, unit: &UnitOfWork) -> StoreResult<()> {
    let at = unit.at;

    for entity in &unit.new_entities {
        let details = serde_json::to_value(&entity.details).context("Failed to encode details")?;
        tx.execute(
            "INSERT INTO resolution.entities
                 (id, kind, display_name, details, merged_into, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &entity.id.as_str(),
                &entity.kind.as_str(),
                &entity.display_name,
                &details,
                &entity.merged_into.as_ref().map(EntityId::as_str),
                &entity.created_at,
                &entity.updated_at,
            ],
        )
        .await
        .map_err(|e| write_error(e, "insert entity"))?;
    }

    for update in &unit.entity_updates {
        let details = serde_json::to_value(&update.details).context("Failed to encode details")?;
        let n = tx
            .execute(
                "UPDATE resolution.entities SET display_name = $2, details = $3, updated_at = $4
                 WHERE id = $1",
                &[&update.entity_id.as_str(), &update.display_name, &details, &at],
            )
            .await
            .map_err(|e| write_error(e, "update entity"))?;
        if n == 0 {
            return Err(StoreError::Conflict(format!(
                "entity {} not found for update",
                update.entity_id
            )));
        }
    }

    if !unit.pointer_writes.is_empty() {
        // Every row involved is locked, in id order.
        let mut locked: Vec<&str> = unit
            .pointer_writes
            .iter()
            .flat_map(|w| std::iter::once(w.entity_id.as_str()).chain(w.new.as_ref().map(EntityId::as_str)))
            .collect();
        locked.sort_unstable();
        locked.dedup();
        tx.query(
            "SELECT id FROM resolution.entities WHERE id = ANY($1) ORDER BY id FOR UPDATE",
            &[&locked],
        )
        .await
        .map_err(|e| write_error(e, "lock merge pointers"))?;
    }

    for write in &unit.pointer_writes {
        let n = tx
            .execute(
                "UPDATE resolution.entities SET merged_into = $2::text, updated_at = $3
                 WHERE id = $1 AND merged_into IS NOT DISTINCT FROM $4::text
                   AND ($2::text IS NULL OR EXISTS (
                       SELECT 1 FROM resolution.entities t
                       WHERE t.id = $2::text AND t.merged_into IS NULL AND t.id <> $1))",
                &[
                    &write.entity_id.as_str(),
                    &write.new.as_ref().map(EntityId::as_str),
                    &at,
                    &write.expected.as_ref().map(EntityId::as_str),
                ],
            )
            .await
            .map_err(|e| write_error(e, "write merge pointer"))?;
        if n == 0 {
            return Err(StoreError::Conflict(format!(
                "merge pointer of {} changed concurrently or its target is no longer a root",
                write.entity_id
            )));
        }
    }

    for write in unit.pointer_writes.iter().filter(|w| w.new.is_some()) {
        let row = tx
            .query_one(
                "SELECT count(*) FROM resolution.entities WHERE merged_into = $1",
                &[&write.entity_id.as_str()],
            )
            .await
            .map_err(|e| write_error(e, "count dependents"))?;
        let dependents: i64 = row.get(0);
        if dependents > 0 {
            return Err(StoreError::Conflict(format!(
                "{} was absorbed but still has {} dependent(s)",
                write.entity_id, dependents
            )));
        }
    }

    for row in &unit.identifiers {
        tx.execute(
            "INSERT INTO resolution.entity_identifiers (entity_id, kind, value, source_system, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (entity_id, kind, value) DO NOTHING",
            &[
                &row.entity_id.as_str(),
                &row.identifier.kind.as_str(),
                &row.identifier.value,
                &row.source_system,
                &row.created_at,
            ],
        )
        .await
        .map_err(|e| write_error(e, "insert identifier"))?;
    }

    for obs in &unit.aliases {
        tx.execute(
            "INSERT INTO resolution.entity_aliases AS a
                 (entity_id, normalized, label, observed_count, first_seen_at)
             VALUES ($1, $2, $3, 1, $4)
             ON CONFLICT (entity_id, normalized)
             DO UPDATE SET observed_count = a.observed_count + 1",
            &[&obs.entity_id.as_str(), &obs.normalized, &obs.label, &at],
        )
        .await
        .map_err(|e| write_error(e, "upsert alias"))?;
    }

    for rel in &unit.relationships {
        tx.execute(
            "INSERT INTO resolution.relationships
                 (id, kind, from_entity, to_entity, role, source_system, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &rel.id.as_str(),
                &rel.kind.as_str(),
                &rel.from_entity.as_str(),
                &rel.to_entity.as_str(),
                &rel.role,
                &rel.source_system,
                &rel.created_at,
            ],
        )
        .await
        .map_err(|e| write_error(e, "insert relationship"))?;
    }

    for event in &unit.merge_events {
        let repointed = id_strs(&event.repointed);
        tx.execute(
            "INSERT INTO resolution.merge_events
                 (id, kind, source_entity, target_entity, repointed, actor, reason, merged_at, unmerged_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &event.id.as_str(),
                &event.kind.as_str(),
                &event.source_entity.as_str(),
                &event.target_entity.as_str(),
                &repointed,
                &event.actor,
                &event.reason,
                &event.merged_at,
                &event.unmerged_at,
            ],
        )
        .await
        .map_err(|e| write_error(e, "insert merge event"))?;
    }

    for event_id in &unit.closed_merge_events {
        let n = tx
            .execute(
                "UPDATE resolution.merge_events SET unmerged_at = $2
                 WHERE id = $1 AND unmerged_at IS NULL",
                &[&event_id.as_str(), &at],
            )
            .await
            .map_err(|e| write_error(e, "close merge event"))?;
        if n == 0 {
            return Err(StoreError::Conflict(format!(
                "merge event {} is not open",
                event_id
            )));
        }
    }

    for d in &unit.decisions {
        let winning = d
            .winning_candidate
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("Failed to encode winning candidate")?;
        tx.execute(
            "INSERT INTO resolution.match_decisions
                 (id, staged_record_id, source_system, kind, outcome, entity_id, review_entry_id,
                  score, winning_candidate, reason, decided_at, resolved_at, reopened_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            &[
                &d.id.as_str(),
                &d.staged_record_id.as_str(),
                &d.source_system,
                &d.kind.as_str(),
                &d.outcome.as_str(),
                &d.entity_id.as_ref().map(EntityId::as_str),
                &d.review_entry_id.as_ref().map(ReviewEntryId::as_str),
                &d.score,
                &winning,
                &d.reason,
                &d.decided_at,
                &d.resolved_at,
                &d.reopened_at,
            ],
        )
        .await
        .map_err(|e| write_error(e, "insert match decision"))?;
    }

    for id in &unit.decision_reopens {
        tx.execute(
            "UPDATE resolution.match_decisions SET reopened_at = $2
             WHERE id = $1 AND reopened_at IS NULL",
            &[&id.as_str(), &at],
        )
        .await
        .map_err(|e| write_error(e, "reopen decision"))?;
    }

    for r in &unit.decision_resolutions {
        let n = tx
            .execute(
                "UPDATE resolution.match_decisions SET entity_id = $2, resolved_at = $3 WHERE id = $1",
                &[
                    &r.decision_id.as_str(),
                    &r.entity_id.as_ref().map(EntityId::as_str),
                    &at,
                ],
            )
            .await
            .map_err(|e| write_error(e, "resolve decision"))?;
        if n == 0 {
            return Err(StoreError::Conflict(format!(
                "decision {} not found",
                r.decision_id
            )));
        }
    }

    for entry in &unit.review_entries {
        let candidates =
            serde_json::to_value(&entry.candidates).context("Failed to encode candidates")?;
        let notes = serde_json::to_value(&entry.notes).context("Failed to encode notes")?;
        tx.execute(
            "INSERT INTO resolution.review_queue
                 (id, kind, subject_type, subject_id, source_system, decision_id, candidates,
                  top_score, reason, status, notes, created_at, resolved_at, resolved_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (id) DO UPDATE SET
                 candidates = EXCLUDED.candidates,
                 top_score = EXCLUDED.top_score,
                 reason = EXCLUDED.reason,
                 status = EXCLUDED.status,
                 notes = EXCLUDED.notes,
                 resolved_at = EXCLUDED.resolved_at,
                 resolved_by = EXCLUDED.resolved_by",
            &[
                &entry.id.as_str(),
                &entry.kind.as_str(),
                &entry.subject.type_str(),
                &entry.subject.id_str(),
                &entry.source_system,
                &entry.decision_id.as_ref().map(DecisionId::as_str),
                &candidates,
                &entry.top_score,
                &entry.reason,
                &entry.status.as_str(),
                &notes,
                &entry.created_at,
                &entry.resolved_at,
                &entry.resolved_by,
            ],
        )
        .await
        .map_err(|e| write_error(e, "upsert review entry"))?;
    }

    for t in &unit.trust_updates {
        tx.execute(
            "INSERT INTO resolution.source_trust (entity_kind, source_system, weight, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (entity_kind, source_system)
             DO UPDATE SET weight = EXCLUDED.weight, updated_at = EXCLUDED.updated_at",
            &[&t.kind.as_str(), &t.source_system, &t.weight, &at],
        )
        .await
        .map_err(|e| write_error(e, "upsert source trust"))?;
    }

    for a in &unit.audit {
        tx.execute(
            "INSERT INTO resolution.audit_log
                 (id, entity_kind, subject_id, operation, actor, before_value, after_value, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &a.id.as_str(),
                &a.entity_kind.as_str(),
                &a.subject_id,
                &a.operation.as_str(),
                &a.actor,
                &a.before,
                &a.after,
                &a.created_at,
            ],
        )
        .await
        .map_err(|e| write_error(e, "append audit entry"))?;
    }

    Ok(())
}

//------------------------------------------------------------------------------
// STORE
//------------------------------------------------------------------------------

#[async_trait]
impl Store for PgStore {
    async fn pending_sources(&self) -> StoreResult<Vec<String>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT DISTINCT s.source_system
                 FROM resolution.staged_records s
                 WHERE NOT EXISTS (
                     SELECT 1 FROM resolution.match_decisions d
                     WHERE d.staged_record_id = s.id AND d.reopened_at IS NULL)
                 ORDER BY 1",
                &[],
            )
            .await
            .context("Failed to list pending sources")?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read source_system")?)
    }

    async fn pending_records(
        &self,
        source_system: &str,
        limit: usize,
    ) -> StoreResult<Vec<StagedRecord>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT s.id, s.source_system, s.source_table, s.source_row_id, s.payload, s.ingested_at
                 FROM resolution.staged_records s
                 WHERE s.source_system = $1
                   AND NOT EXISTS (
                     SELECT 1 FROM resolution.match_decisions d
                     WHERE d.staged_record_id = s.id AND d.reopened_at IS NULL)
                 ORDER BY s.ingested_at, s.id
                 LIMIT $2",
                &[&source_system, &(limit as i64)],
            )
            .await
            .context("Failed to load pending staged records")?;
        Ok(map_rows(&rows, staged_from_row)?)
    }

    async fn get_staged_record(&self, id: &StagedRecordId) -> StoreResult<Option<StagedRecord>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                "SELECT id, source_system, source_table, source_row_id, payload, ingested_at
                 FROM resolution.staged_records WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .context("Failed to load staged record")?;
        Ok(row.as_ref().map(staged_from_row).transpose()?)
    }

    async fn get_entity(&self, id: &EntityId) -> StoreResult<Option<CanonicalEntity>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM resolution.entities WHERE id = $1", ENTITY_COLUMNS),
                &[&id.as_str()],
            )
            .await
            .context("Failed to load entity")?;
        Ok(row.as_ref().map(entity_from_row).transpose()?)
    }

    async fn direct_members(&self, root: &EntityId) -> StoreResult<Vec<EntityId>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT id FROM resolution.entities WHERE merged_into = $1 ORDER BY id",
                &[&root.as_str()],
            )
            .await
            .context("Failed to load cluster members")?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<_, String>(0).map(EntityId))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read member id")?)
    }

    async fn identifier_holders(
        &self,
        identifier: &Identifier,
    ) -> StoreResult<Vec<EntityIdentifier>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT entity_id, kind, value, source_system, created_at
                 FROM resolution.entity_identifiers WHERE kind = $1 AND value = $2",
                &[&identifier.kind.as_str(), &identifier.value],
            )
            .await
            .context("Failed to look up identifier")?;
        Ok(map_rows(&rows, identifier_from_row)?)
    }

    async fn identifiers_for(&self, ids: &[EntityId]) -> StoreResult<Vec<EntityIdentifier>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT entity_id, kind, value, source_system, created_at
                 FROM resolution.entity_identifiers WHERE entity_id = ANY($1)",
                &[&id_strs(ids)],
            )
            .await
            .context("Failed to load identifiers")?;
        Ok(map_rows(&rows, identifier_from_row)?)
    }

    async fn aliases_for(&self, ids: &[EntityId]) -> StoreResult<Vec<Alias>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT entity_id, label, normalized, observed_count, first_seen_at
                 FROM resolution.entity_aliases WHERE entity_id = ANY($1)",
                &[&id_strs(ids)],
            )
            .await
            .context("Failed to load aliases")?;
        Ok(map_rows(&rows, alias_from_row)?)
    }

    async fn entities_with_alias_token(
        &self,
        kind: EntityKind,
        token: &str,
        limit: usize,
    ) -> StoreResult<Vec<EntityId>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT DISTINCT a.entity_id
                 FROM resolution.entity_aliases a
                 JOIN resolution.entities e ON e.id = a.entity_id
                 WHERE e.kind = $1 AND string_to_array(a.normalized, ' ') @> ARRAY[$2::text]
                 LIMIT $3",
                &[&kind.as_str(), &token, &(limit as i64)],
            )
            .await
            .context("Failed to block candidates by alias token")?;
        Ok(rows
            .iter()
            .map(|r| r.try_get::<_, String>(0).map(EntityId))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read entity id")?)
    }

    async fn relationships_for(&self, ids: &[EntityId]) -> StoreResult<Vec<Relationship>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT id, kind, from_entity, to_entity, role, source_system, created_at
                 FROM resolution.relationships
                 WHERE from_entity = ANY($1) OR to_entity = ANY($1)
                 ORDER BY created_at",
                &[&id_strs(ids)],
            )
            .await
            .context("Failed to load relationships")?;
        Ok(map_rows(&rows, relationship_from_row)?)
    }

    async fn shared_identifiers(
        &self,
        kind: Option<IdentifierKind>,
        limit: usize,
    ) -> StoreResult<Vec<(Identifier, Vec<EntityId>)>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT kind, value, array_agg(DISTINCT entity_id) AS holders
                 FROM resolution.entity_identifiers
                 WHERE ($1::text IS NULL OR kind = $1)
                 GROUP BY kind, value
                 HAVING COUNT(DISTINCT entity_id) > 1
                 ORDER BY COUNT(DISTINCT entity_id) DESC, kind, value
                 LIMIT $2",
                &[&kind.map(|k| k.as_str()), &(limit as i64)],
            )
            .await
            .context("Failed to list shared identifiers")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: String = row.try_get("kind").context("Failed to read kind")?;
            let value: String = row.try_get("value").context("Failed to read value")?;
            let holders: Vec<String> = row.try_get("holders").context("Failed to read holders")?;
            out.push((
                Identifier::new(parse_identifier_kind(&kind)?, value),
                holders.into_iter().map(EntityId).collect(),
            ));
        }
        Ok(out)
    }

    async fn active_merge_event(&self, source: &EntityId) -> StoreResult<Option<MergeEvent>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM resolution.merge_events
                     WHERE source_entity = $1 AND unmerged_at IS NULL
                     ORDER BY merged_at DESC LIMIT 1",
                    MERGE_EVENT_COLUMNS
                ),
                &[&source.as_str()],
            )
            .await
            .context("Failed to load merge event")?;
        Ok(row.as_ref().map(merge_event_from_row).transpose()?)
    }

    async fn merge_events_involving(&self, id: &EntityId) -> StoreResult<Vec<MergeEvent>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM resolution.merge_events
                     WHERE source_entity = $1 OR target_entity = $1 OR $1 = ANY(repointed)
                     ORDER BY merged_at",
                    MERGE_EVENT_COLUMNS
                ),
                &[&id.as_str()],
            )
            .await
            .context("Failed to load merge history")?;
        Ok(map_rows(&rows, merge_event_from_row)?)
    }

    async fn active_decision(
        &self,
        staged: &StagedRecordId,
    ) -> StoreResult<Option<MatchDecision>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM resolution.match_decisions
                     WHERE staged_record_id = $1 AND reopened_at IS NULL",
                    DECISION_COLUMNS
                ),
                &[&staged.as_str()],
            )
            .await
            .context("Failed to load active decision")?;
        Ok(row.as_ref().map(decision_from_row).transpose()?)
    }

    async fn get_decision(&self, id: &DecisionId) -> StoreResult<Option<MatchDecision>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM resolution.match_decisions WHERE id = $1", DECISION_COLUMNS),
                &[&id.as_str()],
            )
            .await
            .context("Failed to load decision")?;
        Ok(row.as_ref().map(decision_from_row).transpose()?)
    }

    async fn decisions_targeting(
        &self,
        ids: &[EntityId],
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchDecision>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM resolution.match_decisions
                     WHERE entity_id = ANY($1) AND COALESCE(resolved_at, decided_at) >= $2
                       AND reopened_at IS NULL
                     ORDER BY COALESCE(resolved_at, decided_at)",
                    DECISION_COLUMNS
                ),
                &[&id_strs(ids), &since],
            )
            .await
            .context("Failed to load decisions for entities")?;
        Ok(map_rows(&rows, decision_from_row)?)
    }

    async fn get_review_entry(&self, id: &ReviewEntryId) -> StoreResult<Option<ReviewQueueEntry>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM resolution.review_queue WHERE id = $1", REVIEW_COLUMNS),
                &[&id.as_str()],
            )
            .await
            .context("Failed to load review entry")?;
        Ok(row.as_ref().map(review_from_row).transpose()?)
    }

    async fn pending_review_entries(
        &self,
        kind: Option<EntityKind>,
        limit: usize,
    ) -> StoreResult<Vec<ReviewQueueEntry>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let kind_str = kind.map(|k| k.as_str());
        let limit = limit as i64;
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let mut query = format!(
            "SELECT {} FROM resolution.review_queue WHERE status = 'pending'",
            REVIEW_COLUMNS
        );
        if let Some(kind) = &kind_str {
            params.push(kind);
            query.push_str(&format!(" AND kind = ${}", params.len()));
        }
        params.push(&limit);
        query.push_str(&format!(
            " ORDER BY top_score DESC, created_at ASC, id LIMIT ${}",
            params.len()
        ));
        let rows = conn
            .query(query.as_str(), &params)
            .await
            .context("Failed to load review queue")?;
        Ok(map_rows(&rows, review_from_row)?)
    }

    async fn pending_review_for_subject(
        &self,
        subject: &ReviewSubject,
    ) -> StoreResult<Vec<ReviewQueueEntry>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM resolution.review_queue
                     WHERE status = 'pending' AND subject_type = $1 AND subject_id = $2",
                    REVIEW_COLUMNS
                ),
                &[&subject.type_str(), &subject.id_str()],
            )
            .await
            .context("Failed to load review entries for subject")?;
        Ok(map_rows(&rows, review_from_row)?)
    }

    async fn trust_weight(
        &self,
        kind: EntityKind,
        source_system: &str,
    ) -> StoreResult<Option<f64>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                "SELECT weight FROM resolution.source_trust
                 WHERE entity_kind = $1 AND source_system = $2",
                &[&kind.as_str(), &source_system],
            )
            .await
            .context("Failed to load source trust")?;
        Ok(row
            .map(|r| r.try_get::<_, f64>(0))
            .transpose()
            .context("Failed to read trust weight")?)
    }

    async fn audit_entries_for(&self, subject_id: &str) -> StoreResult<Vec<AuditEntry>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT id, entity_kind, subject_id, operation, actor, before_value, after_value, created_at
                 FROM resolution.audit_log WHERE subject_id = $1 ORDER BY created_at, id",
                &[&subject_id],
            )
            .await
            .context("Failed to load audit history")?;
        Ok(map_rows(&rows, audit_from_row)?)
    }

    async fn cached_geocode(&self, cache_key: &str) -> StoreResult<Option<CachedGeocode>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                "SELECT cache_key, normalized_address, result, cached_at
                 FROM resolution.geocode_cache WHERE cache_key = $1",
                &[&cache_key],
            )
            .await
            .context("Failed to read geocode cache")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let result: Option<JsonValue> = row.try_get("result").context("Failed to read result")?;
        Ok(Some(CachedGeocode {
            cache_key: row.try_get("cache_key").context("Failed to read cache_key")?,
            normalized_address: row
                .try_get("normalized_address")
                .context("Failed to read normalized_address")?,
            result: result
                .map(serde_json::from_value::<GeocodeResult>)
                .transpose()
                .context("Failed to decode cached geocode")?,
            cached_at: row.try_get("cached_at").context("Failed to read cached_at")?,
        }))
    }

    async fn put_cached_geocode(&self, entry: CachedGeocode) -> StoreResult<()> {
        let result = entry
            .result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("Failed to encode geocode result")?;
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        conn.execute(
            "INSERT INTO resolution.geocode_cache (cache_key, normalized_address, result, cached_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (cache_key) DO UPDATE
             SET result = EXCLUDED.result, cached_at = EXCLUDED.cached_at",
            &[&entry.cache_key, &entry.normalized_address, &result, &entry.cached_at],
        )
        .await
        .context("Failed to write geocode cache")?;
        Ok(())
    }

    async fn try_acquire_source_lease(
        &self,
        source_system: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "INSERT INTO resolution.source_leases AS l (source_system, holder, expires_at)
                 VALUES ($1, $2, now() + make_interval(secs => $3))
                 ON CONFLICT (source_system) DO UPDATE
                 SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                 WHERE l.holder = EXCLUDED.holder OR l.expires_at < now()
                 RETURNING l.holder",
                &[&source_system, &holder, &ttl.as_secs_f64()],
            )
            .await
            .context("Failed to acquire source lease")?;
        debug!(
            "Lease on {} for {}: {}",
            source_system,
            holder,
            if rows.is_empty() { "busy" } else { "acquired" }
        );
        Ok(!rows.is_empty())
    }

    async fn release_source_lease(&self, source_system: &str, holder: &str) -> StoreResult<()> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        conn.execute(
            "DELETE FROM resolution.source_leases WHERE source_system = $1 AND holder = $2",
            &[&source_system, &holder],
        )
        .await
        .context("Failed to release source lease")?;
        Ok(())
    }

    async fn apply(&self, unit: UnitOfWork) -> StoreResult<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for unit of work")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction")?;

        match write_unit(&tx, &unit).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| write_error(e, "commit unit of work"))?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback after failed unit of work also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}
