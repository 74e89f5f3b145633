// src/models/matching.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::core::{DecisionId, EntityId, EntityKind, Identifier, ReviewEntryId, StagedRecordId};

/// Which rule proposed a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    DeterministicEmail,
    DeterministicPhone,
    DeterministicMicrochip,
    DeterministicGeocodeKey,
    FuzzyName,
    SharedAddress,
    SharedRelationship,
    /// Proposed by an operator rather than a matching rule.
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeterministicEmail => "deterministic_email",
            Self::DeterministicPhone => "deterministic_phone",
            Self::DeterministicMicrochip => "deterministic_microchip",
            Self::DeterministicGeocodeKey => "deterministic_geocode_key",
            Self::FuzzyName => "fuzzy_name",
            Self::SharedAddress => "shared_address",
            Self::SharedRelationship => "shared_relationship",
            Self::Manual => "manual",
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            Self::DeterministicEmail
                | Self::DeterministicPhone
                | Self::DeterministicMicrochip
                | Self::DeterministicGeocodeKey
        )
    }
}

/// The evidence behind a candidate, kept with the decision for later review.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchSignals {
    pub phone_match: f64,
    pub email_match: f64,
    pub microchip_match: bool,
    pub geocode_key_match: bool,
    pub name_similarity: f64,
    pub shared_address: bool,
    pub shared_relationship: bool,
    /// Identifiers dropped from deterministic matching because several live
    /// entities hold them.
    pub conflicting_identifiers: Vec<Identifier>,
    /// Set when something about this candidate forbids an automatic merge.
    pub identifier_conflict: Option<String>,
}

impl MatchSignals {
    pub fn has_deterministic_evidence(&self) -> bool {
        self.phone_match >= 1.0
            || self.email_match >= 1.0
            || self.microchip_match
            || self.geocode_key_match
    }
}

/// A proposed pairing between a record (or entity) and a canonical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub match_type: MatchType,
    pub signals: MatchSignals,
    /// Final confidence in [0, 1]
    pub score: f64,
    pub entity_created_at: DateTime<Utc>,
}

impl MatchCandidate {
    pub fn has_conflict(&self) -> bool {
        self.signals.identifier_conflict.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    AutoMerge,
    NewEntity,
    ReviewNeeded,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoMerge => "auto_merge",
            Self::NewEntity => "new_entity",
            Self::ReviewNeeded => "review_needed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_merge" => Some(Self::AutoMerge),
            "new_entity" => Some(Self::NewEntity),
            "review_needed" => Some(Self::ReviewNeeded),
            _ => None,
        }
    }
}

/// Durable outcome for one staged record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub id: DecisionId,
    pub staged_record_id: StagedRecordId,
    pub source_system: String,
    pub kind: EntityKind,
    pub outcome: DecisionOutcome,
    /// Target for auto_merge, the created entity for new_entity, and the
    /// reviewer's choice once a review_needed decision is resolved.
    pub entity_id: Option<EntityId>,
    pub review_entry_id: Option<ReviewEntryId>,
    pub score: f64,
    pub winning_candidate: Option<MatchCandidate>,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// A reopened decision no longer blocks re-processing of its record.
    pub reopened_at: Option<DateTime<Utc>>,
}

impl MatchDecision {
    pub fn is_active(&self) -> bool {
        self.reopened_at.is_none()
    }
}
