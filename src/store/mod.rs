// src/store/mod.rs
//
// Persistence seam for the engine. Reads are fine-grained; every mutation goes
// through `apply`, which commits a whole `UnitOfWork` or nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::geocoding::GeocodeResult;
use crate::models::{
    Alias, AuditEntry, CanonicalEntity, DecisionId, EntityDetails, EntityId, EntityIdentifier,
    EntityKind, Identifier, IdentifierKind, MatchDecision, MergeEvent, MergeEventId, Relationship,
    ReviewEntryId, ReviewQueueEntry, ReviewSubject, StagedRecord, StagedRecordId,
};

pub mod memory;
pub mod pool;
pub mod postgres;

pub use memory::MemoryStore;
pub use pool::{DbSettings, PgPool};
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;
pub type SharedStore = Arc<dyn Store>;

/// A cached geocoder answer. `result == None` records a confirmed "no match".
#[derive(Debug, Clone, PartialEq)]
pub struct CachedGeocode {
    pub cache_key: String,
    pub normalized_address: String,
    pub result: Option<GeocodeResult>,
    pub cached_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- staged records ---------------------------------------------------

    /// Source systems with at least one staged record lacking an active decision.
    async fn pending_sources(&self) -> StoreResult<Vec<String>>;

    /// Oldest-first staged records of one source that have no active decision.
    async fn pending_records(&self, source_system: &str, limit: usize)
        -> StoreResult<Vec<StagedRecord>>;

    async fn get_staged_record(&self, id: &StagedRecordId) -> StoreResult<Option<StagedRecord>>;

    // --- canonical entities -------------------------------------------------

    async fn get_entity(&self, id: &EntityId) -> StoreResult<Option<CanonicalEntity>>;

    /// Entities whose `merged_into` is exactly `root`.
    async fn direct_members(&self, root: &EntityId) -> StoreResult<Vec<EntityId>>;

    async fn identifier_holders(&self, identifier: &Identifier)
        -> StoreResult<Vec<EntityIdentifier>>;

    async fn identifiers_for(&self, ids: &[EntityId]) -> StoreResult<Vec<EntityIdentifier>>;

    async fn aliases_for(&self, ids: &[EntityId]) -> StoreResult<Vec<Alias>>;

    /// Entities of `kind` that carry an alias containing `token` as a whole word.
    async fn entities_with_alias_token(
        &self,
        kind: EntityKind,
        token: &str,
        limit: usize,
    ) -> StoreResult<Vec<EntityId>>;

    /// Relationship rows touching any of `ids` on either end.
    async fn relationships_for(&self, ids: &[EntityId]) -> StoreResult<Vec<Relationship>>;

    /// Identifier values held by more than one entity, for operator reports.
    async fn shared_identifiers(
        &self,
        kind: Option<IdentifierKind>,
        limit: usize,
    ) -> StoreResult<Vec<(Identifier, Vec<EntityId>)>>;

    // --- merges -------------------------------------------------------------

    /// The open merge event that set `source`'s pointer, if any.
    async fn active_merge_event(&self, source: &EntityId) -> StoreResult<Option<MergeEvent>>;

    async fn merge_events_involving(&self, id: &EntityId) -> StoreResult<Vec<MergeEvent>>;

    // --- decisions ------------------------------------------------------------

    async fn active_decision(&self, staged: &StagedRecordId) -> StoreResult<Option<MatchDecision>>;

    async fn get_decision(&self, id: &DecisionId) -> StoreResult<Option<MatchDecision>>;

    /// Active decisions linked to any of `ids` and placed (resolved, or made
    /// when never pending) at or after `since`.
    async fn decisions_targeting(
        &self,
        ids: &[EntityId],
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<MatchDecision>>;

    // --- review queue -----------------------------------------------------------

    async fn get_review_entry(&self, id: &ReviewEntryId) -> StoreResult<Option<ReviewQueueEntry>>;

    /// Pending entries, best score first, then oldest first.
    async fn pending_review_entries(
        &self,
        kind: Option<EntityKind>,
        limit: usize,
    ) -> StoreResult<Vec<ReviewQueueEntry>>;

    async fn pending_review_for_subject(
        &self,
        subject: &ReviewSubject,
    ) -> StoreResult<Vec<ReviewQueueEntry>>;

    // --- trust, audit, caches -----------------------------------------------------

    async fn trust_weight(&self, kind: EntityKind, source_system: &str)
        -> StoreResult<Option<f64>>;

    /// Audit trail for one subject, oldest first.
    async fn audit_entries_for(&self, subject_id: &str) -> StoreResult<Vec<AuditEntry>>;

    async fn cached_geocode(&self, cache_key: &str) -> StoreResult<Option<CachedGeocode>>;

    async fn put_cached_geocode(&self, entry: CachedGeocode) -> StoreResult<()>;

    // --- source leases --------------------------------------------------------------

    /// Takes the per-source processing lease. Returns false when another holder
    /// has an unexpired lease.
    async fn try_acquire_source_lease(
        &self,
        source_system: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    async fn release_source_lease(&self, source_system: &str, holder: &str) -> StoreResult<()>;

    // --- writes -----------------------------------------------------------------------

    /// Commits every change in `unit` atomically.
    async fn apply(&self, unit: UnitOfWork) -> StoreResult<()>;
}

//------------------------------------------------------------------------------
// UNIT OF WORK
//------------------------------------------------------------------------------

/// Compare-and-set write of a merge pointer. Writes in a unit apply in order;
/// `new` must be a root when its write applies, and an entity left absorbed
/// by the unit may not keep dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct PointerWrite {
    pub entity_id: EntityId,
    pub expected: Option<EntityId>,
    pub new: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub entity_id: EntityId,
    pub display_name: String,
    pub details: EntityDetails,
}

/// One more sighting of a label. The store bumps the count of an existing
/// (entity, normalized) alias or inserts it with a count of one.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasObservation {
    pub entity_id: EntityId,
    pub label: String,
    pub normalized: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResolution {
    pub decision_id: DecisionId,
    pub entity_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrustUpdate {
    pub kind: EntityKind,
    pub source_system: String,
    pub weight: f64,
}

/// Everything one logical operation writes.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub at: DateTime<Utc>,
    pub new_entities: Vec<CanonicalEntity>,
    pub entity_updates: Vec<EntityUpdate>,
    pub pointer_writes: Vec<PointerWrite>,
    /// Inserted unless the (entity, kind, value) row already exists.
    pub identifiers: Vec<EntityIdentifier>,
    pub aliases: Vec<AliasObservation>,
    pub relationships: Vec<Relationship>,
    pub merge_events: Vec<MergeEvent>,
    pub closed_merge_events: Vec<MergeEventId>,
    /// Rejected with `StoreError::Conflict` if the staged record already has
    /// an active decision.
    pub decisions: Vec<MatchDecision>,
    pub decision_reopens: Vec<DecisionId>,
    pub decision_resolutions: Vec<DecisionResolution>,
    /// Inserted or replaced by id.
    pub review_entries: Vec<ReviewQueueEntry>,
    pub trust_updates: Vec<TrustUpdate>,
    pub audit: Vec<AuditEntry>,
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            at: Utc::now(),
            new_entities: Vec::new(),
            entity_updates: Vec::new(),
            pointer_writes: Vec::new(),
            identifiers: Vec::new(),
            aliases: Vec::new(),
            relationships: Vec::new(),
            merge_events: Vec::new(),
            closed_merge_events: Vec::new(),
            decisions: Vec::new(),
            decision_reopens: Vec::new(),
            decision_resolutions: Vec::new(),
            review_entries: Vec::new(),
            trust_updates: Vec::new(),
            audit: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_entities.is_empty()
            && self.entity_updates.is_empty()
            && self.pointer_writes.is_empty()
            && self.identifiers.is_empty()
            && self.aliases.is_empty()
            && self.relationships.is_empty()
            && self.merge_events.is_empty()
            && self.closed_merge_events.is_empty()
            && self.decisions.is_empty()
            && self.decision_reopens.is_empty()
            && self.decision_resolutions.is_empty()
            && self.review_entries.is_empty()
            && self.trust_updates.is_empty()
            && self.audit.is_empty()
    }

    /// Looks up an entity created earlier in this same unit.
    pub fn staged_entity(&self, id: &EntityId) -> Option<&CanonicalEntity> {
        self.new_entities.iter().find(|e| &e.id == id)
    }

    pub fn audit(&mut self, entry: AuditEntry) {
        self.audit.push(entry);
    }
}
