// src/models/audit.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::core::{AuditEntryId, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    Merge,
    Unmerge,
    IdentifierAdded,
    Enriched,
    DecisionMade,
    DecisionReopened,
    AliasAdded,
    RelationshipAdded,
    ReviewResolved,
    TrustAdjusted,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Merge => "merge",
            Self::Unmerge => "unmerge",
            Self::IdentifierAdded => "identifier_added",
            Self::Enriched => "enriched",
            Self::DecisionMade => "decision_made",
            Self::DecisionReopened => "decision_reopened",
            Self::AliasAdded => "alias_added",
            Self::RelationshipAdded => "relationship_added",
            Self::ReviewResolved => "review_resolved",
            Self::TrustAdjusted => "trust_adjusted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "merge" => Some(Self::Merge),
            "unmerge" => Some(Self::Unmerge),
            "identifier_added" => Some(Self::IdentifierAdded),
            "enriched" => Some(Self::Enriched),
            "decision_made" => Some(Self::DecisionMade),
            "decision_reopened" => Some(Self::DecisionReopened),
            "alias_added" => Some(Self::AliasAdded),
            "relationship_added" => Some(Self::RelationshipAdded),
            "review_resolved" => Some(Self::ReviewResolved),
            "trust_adjusted" => Some(Self::TrustAdjusted),
            _ => None,
        }
    }
}

/// Append-only trace of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub entity_kind: EntityKind,
    /// Entity id for entity operations; staged record or queue entry id otherwise.
    pub subject_id: String,
    pub operation: AuditOperation,
    pub actor: String,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        entity_kind: EntityKind,
        subject_id: impl Into<String>,
        operation: AuditOperation,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: AuditEntryId::new(),
            entity_kind,
            subject_id: subject_id.into(),
            operation,
            actor: actor.into(),
            before: None,
            after: None,
            created_at: Utc::now(),
        }
    }

    pub fn before(mut self, value: JsonValue) -> Self {
        self.before = Some(value);
        self
    }

    pub fn after(mut self, value: JsonValue) -> Self {
        self.after = Some(value);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}
