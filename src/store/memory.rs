// src/store/memory.rs
//
// In-process store for tests and dry runs. A unit is validated in full
// before any of it is written, all under one lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::Mutex;

use super::{CachedGeocode, Store, StoreResult, UnitOfWork};
use crate::error::StoreError;
use crate::models::{
    Alias, AuditEntry, CanonicalEntity, DecisionId, EntityId, EntityIdentifier, EntityKind,
    Identifier, IdentifierKind, MatchDecision, MergeEvent, Relationship, ReviewEntryId,
    ReviewQueueEntry, ReviewSubject, StagedRecord, StagedRecordId,
};

#[derive(Default)]
struct State {
    staged: Vec<StagedRecord>,
    entities: HashMap<EntityId, CanonicalEntity>,
    identifiers: Vec<EntityIdentifier>,
    aliases: Vec<Alias>,
    relationships: Vec<Relationship>,
    merge_events: Vec<MergeEvent>,
    decisions: Vec<MatchDecision>,
    review: HashMap<ReviewEntryId, ReviewQueueEntry>,
    trust: HashMap<(EntityKind, String), f64>,
    audit: Vec<AuditEntry>,
    geocode_cache: HashMap<String, CachedGeocode>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

impl State {
    fn has_active_decision(&self, staged: &StagedRecordId) -> bool {
        self.decisions
            .iter()
            .any(|d| &d.staged_record_id == staged && d.is_active())
    }

    /// Pointer of `id` as of the writes already checked in `overlay`. `None`
    /// if the entity does not exist.
    fn pointer_of<'a>(
        &'a self,
        unit: &'a UnitOfWork,
        overlay: &HashMap<&'a EntityId, Option<&'a EntityId>>,
        id: &EntityId,
    ) -> Option<Option<&'a EntityId>> {
        if let Some(pointer) = overlay.get(id) {
            return Some(*pointer);
        }
        self.entities
            .get(id)
            .or_else(|| unit.staged_entity(id))
            .map(|e| e.merged_into.as_ref())
    }

    fn validate(&self, unit: &UnitOfWork) -> Result<(), StoreError> {
        let mut new_ids = HashSet::new();
        for entity in &unit.new_entities {
            if self.entities.contains_key(&entity.id) || !new_ids.insert(&entity.id) {
                return Err(StoreError::Conflict(format!("entity {} already exists", entity.id)));
            }
        }

        let exists = |id: &EntityId| self.entities.contains_key(id) || new_ids.contains(id);

        for update in &unit.entity_updates {
            if !exists(&update.entity_id) {
                return Err(StoreError::Conflict(format!(
                    "entity {} not found for update",
                    update.entity_id
                )));
            }
        }

        // Pointer writes are checked in order, each against the ones before it.
        let mut overlay: HashMap<&EntityId, Option<&EntityId>> = HashMap::new();
        for write in &unit.pointer_writes {
            let current = self.pointer_of(unit, &overlay, &write.entity_id).ok_or_else(|| {
                StoreError::Conflict(format!("entity {} not found for pointer write", write.entity_id))
            })?;
            if current != write.expected.as_ref() {
                return Err(StoreError::Conflict(format!(
                    "merge pointer of {} changed concurrently",
                    write.entity_id
                )));
            }
            if let Some(target) = &write.new {
                if target == &write.entity_id {
                    return Err(StoreError::Conflict(format!("{} cannot point at itself", target)));
                }
                match self.pointer_of(unit, &overlay, target) {
                    None => return Err(StoreError::Conflict(format!("merge target {} not found", target))),
                    Some(Some(_)) => {
                        return Err(StoreError::Conflict(format!(
                            "merge target {} is no longer a root",
                            target
                        )))
                    }
                    Some(None) => {}
                }
            }
            overlay.insert(&write.entity_id, write.new.as_ref());
        }

        // An absorbed entity keeps no dependents of its own.
        for (absorbed, pointer) in &overlay {
            if pointer.is_none() {
                continue;
            }
            let orphaned = self
                .entities
                .values()
                .chain(unit.new_entities.iter())
                .map(|e| overlay.get(&e.id).copied().unwrap_or(e.merged_into.as_ref()))
                .any(|p| p == Some(*absorbed));
            if orphaned {
                return Err(StoreError::Conflict(format!(
                    "{} was absorbed but still has dependents",
                    absorbed
                )));
            }
        }

        let mut deciding = HashSet::new();
        for decision in &unit.decisions {
            if self.has_active_decision(&decision.staged_record_id)
                || !deciding.insert(&decision.staged_record_id)
            {
                return Err(StoreError::Conflict(format!(
                    "staged record {} already has an active decision",
                    decision.staged_record_id
                )));
            }
        }

        let decision_known = |id: &DecisionId| {
            self.decisions.iter().any(|d| &d.id == id) || unit.decisions.iter().any(|d| &d.id == id)
        };
        for id in &unit.decision_reopens {
            if !decision_known(id) {
                return Err(StoreError::Conflict(format!("decision {} not found", id)));
            }
        }
        for resolution in &unit.decision_resolutions {
            if !decision_known(&resolution.decision_id) {
                return Err(StoreError::Conflict(format!(
                    "decision {} not found",
                    resolution.decision_id
                )));
            }
        }

        for event_id in &unit.closed_merge_events {
            let open = self
                .merge_events
                .iter()
                .any(|e| &e.id == event_id && e.unmerged_at.is_none());
            if !open {
                return Err(StoreError::Conflict(format!(
                    "merge event {} is not open",
                    event_id
                )));
            }
        }
        Ok(())
    }

    fn write(&mut self, unit: UnitOfWork) {
        let at = unit.at;

        for entity in unit.new_entities {
            self.entities.insert(entity.id.clone(), entity);
        }
        for update in unit.entity_updates {
            if let Some(entity) = self.entities.get_mut(&update.entity_id) {
                entity.display_name = update.display_name;
                entity.details = update.details;
                entity.updated_at = at;
            }
        }
        for write in unit.pointer_writes {
            if let Some(entity) = self.entities.get_mut(&write.entity_id) {
                entity.merged_into = write.new;
                entity.updated_at = at;
            }
        }
        for row in unit.identifiers {
            let duplicate = self
                .identifiers
                .iter()
                .any(|i| i.entity_id == row.entity_id && i.identifier == row.identifier);
            if !duplicate {
                self.identifiers.push(row);
            }
        }
        for obs in unit.aliases {
            match self
                .aliases
                .iter_mut()
                .find(|a| a.entity_id == obs.entity_id && a.normalized == obs.normalized)
            {
                Some(alias) => alias.observed_count += 1,
                None => self.aliases.push(Alias {
                    entity_id: obs.entity_id,
                    label: obs.label,
                    normalized: obs.normalized,
                    observed_count: 1,
                    first_seen_at: at,
                }),
            }
        }
        self.relationships.extend(unit.relationships);
        self.merge_events.extend(unit.merge_events);
        for event_id in unit.closed_merge_events {
            if let Some(event) = self.merge_events.iter_mut().find(|e| e.id == event_id) {
                event.unmerged_at = Some(at);
            }
        }
        self.decisions.extend(unit.decisions);
        for id in unit.decision_reopens {
            if let Some(d) = self.decisions.iter_mut().find(|d| d.id == id) {
                d.reopened_at = Some(at);
            }
        }
        for resolution in unit.decision_resolutions {
            if let Some(d) = self
                .decisions
                .iter_mut()
                .find(|d| d.id == resolution.decision_id)
            {
                d.entity_id = resolution.entity_id;
                d.resolved_at = Some(at);
            }
        }
        for entry in unit.review_entries {
            self.review.insert(entry.id.clone(), entry);
        }
        for update in unit.trust_updates {
            self.trust
                .insert((update.kind, update.source_system), update.weight);
        }
        self.audit.extend(unit.audit);
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    failures_armed: AtomicUsize,
    applied_units: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            failures_armed: AtomicUsize::new(0),
            applied_units: AtomicUsize::new(0),
        }
    }

    /// Appends a record to the staging area.
    pub async fn stage(&self, record: StagedRecord) {
        self.state.lock().await.staged.push(record);
    }

    /// Makes the next `n` calls to `apply` fail with a backend error.
    pub fn fail_next_applies(&self, n: usize) {
        self.failures_armed.store(n, Ordering::SeqCst);
    }

    pub fn applied_units(&self) -> usize {
        self.applied_units.load(Ordering::SeqCst)
    }

    pub async fn entities(&self) -> Vec<CanonicalEntity> {
        let state = self.state.lock().await;
        let mut entities: Vec<_> = state.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entities
    }

    pub async fn live_entities(&self, kind: EntityKind) -> Vec<CanonicalEntity> {
        self.entities()
            .await
            .into_iter()
            .filter(|e| e.kind == kind && e.is_live())
            .collect()
    }

    pub async fn decisions(&self) -> Vec<MatchDecision> {
        self.state.lock().await.decisions.clone()
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    pub async fn review_entries(&self) -> Vec<ReviewQueueEntry> {
        self.state.lock().await.review.values().cloned().collect()
    }

    pub async fn geocode_cache_len(&self) -> usize {
        self.state.lock().await.geocode_cache.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn pending_sources(&self) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        let mut sources: Vec<String> = state
            .staged
            .iter()
            .filter(|r| !state.has_active_decision(&r.id))
            .map(|r| r.source_system.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sources.sort();
        Ok(sources)
    }

    async fn pending_records(
        &self,
        source_system: &str,
        limit: usize,
    ) -> StoreResult<Vec<StagedRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<StagedRecord> = state
            .staged
            .iter()
            .filter(|r| r.source_system == source_system && !state.has_active_decision(&r.id))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then_with(|| a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn get_staged_record(&self, id: &StagedRecordId) -> StoreResult<Option<StagedRecord>> {
        let state = self.state.lock().await;
        Ok(state.staged.iter().find(|r| &r.id == id).cloned())
    }

    async fn get_entity(&self, id: &EntityId) -> StoreResult<Option<CanonicalEntity>> {
        Ok(self.state.lock().await.entities.get(id).cloned())
    }

    async fn direct_members(&self, root: &EntityId) -> StoreResult<Vec<EntityId>> {
        let state = self.state.lock().await;
        let mut members: Vec<EntityId> = state
            .entities
            .values()
            .filter(|e| e.merged_into.as_ref() == Some(root))
            .map(|e| e.id.clone())
            .collect();
        members.sort();
        Ok(members)
    }

    async fn identifier_holders(
        &self,
        identifier: &Identifier,
    ) -> StoreResult<Vec<EntityIdentifier>> {
        let state = self.state.lock().await;
        Ok(state
            .identifiers
            .iter()
            .filter(|i| &i.identifier == identifier)
            .cloned()
            .collect())
    }

    async fn identifiers_for(&self, ids: &[EntityId]) -> StoreResult<Vec<EntityIdentifier>> {
        let state = self.state.lock().await;
        Ok(state
            .identifiers
            .iter()
            .filter(|i| ids.contains(&i.entity_id))
            .cloned()
            .collect())
    }

    async fn aliases_for(&self, ids: &[EntityId]) -> StoreResult<Vec<Alias>> {
        let state = self.state.lock().await;
        Ok(state
            .aliases
            .iter()
            .filter(|a| ids.contains(&a.entity_id))
            .cloned()
            .collect())
    }

    async fn entities_with_alias_token(
        &self,
        kind: EntityKind,
        token: &str,
        limit: usize,
    ) -> StoreResult<Vec<EntityId>> {
        let state = self.state.lock().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for alias in &state.aliases {
            if out.len() >= limit {
                break;
            }
            let kind_matches = state
                .entities
                .get(&alias.entity_id)
                .map(|e| e.kind == kind)
                .unwrap_or(false);
            if kind_matches
                && alias.normalized.split_whitespace().any(|t| t == token)
                && seen.insert(alias.entity_id.clone())
            {
                out.push(alias.entity_id.clone());
            }
        }
        Ok(out)
    }

    async fn relationships_for(&self, ids: &[EntityId]) -> StoreResult<Vec<Relationship>> {
        let state = self.state.lock().await;
        Ok(state
            .relationships
            .iter()
            .filter(|r| ids.contains(&r.from_entity) || ids.contains(&r.to_entity))
            .cloned()
            .collect())
    }

    async fn shared_identifiers(
        &self,
        kind: Option<IdentifierKind>,
        limit: usize,
    ) -> StoreResult<Vec<(Identifier, Vec<EntityId>)>> {
        let state = self.state.lock().await;
        let mut holders: HashMap<&Identifier, Vec<EntityId>> = HashMap::new();
        for row in &state.identifiers {
            if kind.map(|k| k == row.identifier.kind).unwrap_or(true) {
                let entry = holders.entry(&row.identifier).or_default();
                if !entry.contains(&row.entity_id) {
                    entry.push(row.entity_id.clone());
                }
            }
        }
        let mut shared: Vec<(Identifier, Vec<EntityId>)> = holders
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(identifier, ids)| (identifier.clone(), ids))
            .collect();
        shared.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
        shared.truncate(limit);
        Ok(shared)
    }

    async fn active_merge_event(&self, source: &EntityId) -> StoreResult<Option<MergeEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .merge_events
            .iter()
            .rev()
            .find(|e| &e.source_entity == source && e.unmerged_at.is_none())
            .cloned())
    }

    async fn merge_events_involving(&self, id: &EntityId) -> StoreResult<Vec<MergeEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .merge_events
            .iter()
            .filter(|e| &e.source_entity == id || &e.target_entity == id || e.repointed.contains(id))
            .cloned()
            .collect())
    }

    async fn active_decision(
        &self,
        staged: &StagedRecordId,
    ) -> StoreResult<Option<MatchDecision>> {
        let state = self.state.lock().await;
        Ok(state
            .decisions
            .iter()
            .find(|d| &d.staged_record_id == staged && d.is_active())
            .cloned())
    }

    async fn get_decision(&self, id: &DecisionId) -> StoreResult<Option<MatchDecision>> {
        let state = self.state.lock().await;
        Ok(state.decisions.iter().find(|d| &d.id == id).cloned())
    }

    async fn decisions_targeting(
        &self,
        ids: &[EntityId],
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchDecision>> {
        let state = self.state.lock().await;
        Ok(state
            .decisions
            .iter()
            .filter(|d| {
                d.is_active()
                    && d.resolved_at.unwrap_or(d.decided_at) >= since
                    && d.entity_id.as_ref().map(|e| ids.contains(e)).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_review_entry(&self, id: &ReviewEntryId) -> StoreResult<Option<ReviewQueueEntry>> {
        Ok(self.state.lock().await.review.get(id).cloned())
    }

    async fn pending_review_entries(
        &self,
        kind: Option<EntityKind>,
        limit: usize,
    ) -> StoreResult<Vec<ReviewQueueEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<ReviewQueueEntry> = state
            .review
            .values()
            .filter(|e| e.is_pending() && kind.map(|k| k == e.kind).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.top_score
                .partial_cmp(&a.top_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn pending_review_for_subject(
        &self,
        subject: &ReviewSubject,
    ) -> StoreResult<Vec<ReviewQueueEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .review
            .values()
            .filter(|e| e.is_pending() && &e.subject == subject)
            .cloned()
            .collect())
    }

    async fn trust_weight(
        &self,
        kind: EntityKind,
        source_system: &str,
    ) -> StoreResult<Option<f64>> {
        let state = self.state.lock().await;
        Ok(state.trust.get(&(kind, source_system.to_string())).copied())
    }

    async fn audit_entries_for(&self, subject_id: &str) -> StoreResult<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|a| a.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn cached_geocode(&self, cache_key: &str) -> StoreResult<Option<CachedGeocode>> {
        Ok(self.state.lock().await.geocode_cache.get(cache_key).cloned())
    }

    async fn put_cached_geocode(&self, entry: CachedGeocode) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .geocode_cache
            .insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn try_acquire_source_lease(
        &self,
        source_system: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let ttl = chrono::Duration::from_std(ttl).context("lease ttl out of range")?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some((current, expires_at)) = state.leases.get(source_system) {
            if current != holder && *expires_at > now {
                debug!("Lease on {} held by {} until {}", source_system, current, expires_at);
                return Ok(false);
            }
        }
        state
            .leases
            .insert(source_system.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_source_lease(&self, source_system: &str, holder: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(source_system)
            .map(|(current, _)| current == holder)
            .unwrap_or(false)
        {
            state.leases.remove(source_system);
        }
        Ok(())
    }

    async fn apply(&self, unit: UnitOfWork) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let armed = self.failures_armed.load(Ordering::SeqCst);
        if armed > 0 {
            self.failures_armed.store(armed - 1, Ordering::SeqCst);
            return Err(StoreError::Backend(anyhow!("injected storage failure")));
        }
        state.validate(&unit)?;
        state.write(unit);
        self.applied_units.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditOperation, DecisionOutcome, EntityDetails};
    use crate::store::{AliasObservation, PointerWrite};

    fn person(name: &str) -> CanonicalEntity {
        CanonicalEntity::new(EntityKind::Person, name, EntityDetails::empty(EntityKind::Person))
    }

    fn decision_for(staged: &StagedRecordId) -> MatchDecision {
        MatchDecision {
            id: DecisionId::new(),
            staged_record_id: staged.clone(),
            source_system: "clinic".into(),
            kind: EntityKind::Person,
            outcome: DecisionOutcome::NewEntity,
            entity_id: None,
            review_entry_id: None,
            score: 0.0,
            winning_candidate: None,
            reason: None,
            decided_at: Utc::now(),
            resolved_at: None,
            reopened_at: None,
        }
    }

    #[tokio::test]
    async fn test_stale_pointer_rejects_whole_unit() {
        let store = MemoryStore::new();
        let a = person("Ann");
        let b = person("Bob");
        let mut seed = UnitOfWork::new();
        seed.new_entities = vec![a.clone(), b.clone()];
        store.apply(seed).await.unwrap();

        let c = person("Cal");
        let mut unit = UnitOfWork::new();
        unit.new_entities.push(c.clone());
        unit.pointer_writes.push(PointerWrite {
            entity_id: a.id.clone(),
            expected: Some(b.id.clone()),
            new: Some(c.id.clone()),
        });
        unit.audit(AuditEntry::new(EntityKind::Person, a.id.as_str(), AuditOperation::Merge, "test"));

        let err = store.apply(unit).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get_entity(&c.id).await.unwrap().is_none());
        assert!(store.audit_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_active_decision_is_a_conflict() {
        let store = MemoryStore::new();
        let staged = StagedRecordId::new();
        let mut first = UnitOfWork::new();
        first.decisions.push(decision_for(&staged));
        store.apply(first).await.unwrap();

        let mut second = UnitOfWork::new();
        second.decisions.push(decision_for(&staged));
        assert!(matches!(
            store.apply(second).await,
            Err(StoreError::Conflict(_))
        ));

        let existing = store.active_decision(&staged).await.unwrap().unwrap();
        let mut reopen = UnitOfWork::new();
        reopen.decision_reopens.push(existing.id.clone());
        store.apply(reopen).await.unwrap();
        assert!(store.active_decision(&staged).await.unwrap().is_none());

        let mut third = UnitOfWork::new();
        third.decisions.push(decision_for(&staged));
        store.apply(third).await.unwrap();
        assert_eq!(store.decisions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_alias_observations_accumulate() {
        let store = MemoryStore::new();
        let a = person("Susan Smith");
        let mut unit = UnitOfWork::new();
        unit.new_entities.push(a.clone());
        for _ in 0..3 {
            unit.aliases.push(AliasObservation {
                entity_id: a.id.clone(),
                label: "Susan Smith".into(),
                normalized: "susan smith".into(),
            });
        }
        store.apply(unit).await.unwrap();

        let aliases = store.aliases_for(&[a.id.clone()]).await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].observed_count, 3);
        let hits = store
            .entities_with_alias_token(EntityKind::Person, "smith", 10)
            .await
            .unwrap();
        assert_eq!(hits, vec![a.id.clone()]);
        assert!(store
            .entities_with_alias_token(EntityKind::Cat, "smith", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_source_lease_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_source_lease("clinic", "w1", ttl).await.unwrap());
        assert!(!store.try_acquire_source_lease("clinic", "w2", ttl).await.unwrap());
        assert!(store.try_acquire_source_lease("intake", "w2", ttl).await.unwrap());

        store.release_source_lease("clinic", "w2").await.unwrap();
        assert!(!store.try_acquire_source_lease("clinic", "w2", ttl).await.unwrap());

        store.release_source_lease("clinic", "w1").await.unwrap();
        assert!(store.try_acquire_source_lease("clinic", "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_next_applies(1);
        let mut unit = UnitOfWork::new();
        unit.new_entities.push(person("Ann"));
        assert!(matches!(store.apply(unit.clone()).await, Err(StoreError::Backend(_))));
        assert!(store.entities().await.is_empty());
        store.apply(unit).await.unwrap();
        assert_eq!(store.entities().await.len(), 1);
    }
}
