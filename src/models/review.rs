// src/models/review.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::core::{DecisionId, EntityId, EntityKind, ReviewEntryId, StagedRecordId};
use super::matching::MatchCandidate;

/// What a queue entry asks a reviewer to place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ReviewSubject {
    StagedRecord(StagedRecordId),
    /// An existing entity that looks like a pre-existing duplicate.
    Entity(EntityId),
}

impl ReviewSubject {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::StagedRecord(_) => "staged_record",
            Self::Entity(_) => "entity",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            Self::StagedRecord(id) => id.as_str(),
            Self::Entity(id) => id.as_str(),
        }
    }

    pub fn from_parts(subject_type: &str, id: &str) -> Option<Self> {
        match subject_type {
            "staged_record" => Some(Self::StagedRecord(StagedRecordId::from(id))),
            "entity" => Some(Self::Entity(EntityId::from(id))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueEntry {
    pub id: ReviewEntryId,
    pub kind: EntityKind,
    pub subject: ReviewSubject,
    pub source_system: Option<String>,
    pub decision_id: Option<DecisionId>,
    /// Ordered by score, best first.
    pub candidates: Vec<MatchCandidate>,
    pub top_score: f64,
    pub reason: Option<String>,
    pub status: ReviewStatus,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl ReviewQueueEntry {
    pub fn new(
        kind: EntityKind,
        subject: ReviewSubject,
        source_system: Option<String>,
        decision_id: Option<DecisionId>,
        mut candidates: Vec<MatchCandidate>,
        reason: Option<String>,
    ) -> Self {
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity_created_at.cmp(&b.entity_created_at))
        });
        let top_score = candidates.first().map(|c| c.score).unwrap_or(0.0);
        Self {
            id: ReviewEntryId::new(),
            kind,
            subject,
            source_system,
            decision_id,
            candidates,
            top_score,
            reason,
            status: ReviewStatus::Pending,
            notes: Vec::new(),
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReviewStatus::Pending
    }
}

/// A reviewer's action on a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    ConfirmMerge { candidate: EntityId },
    /// Not a match. The record becomes its own entity, or is linked to
    /// `link_to` when the reviewer knows the right one.
    Reject { link_to: Option<EntityId> },
    Defer { note: Option<String> },
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmMerge { .. } => "confirm_merge",
            Self::Reject { .. } => "reject",
            Self::Defer { .. } => "defer",
        }
    }
}
