// src/models/core.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------
// Newtypes so entity ids, staged record ids and queue ids can't be mixed up.

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

typed_id!(
    /// Stable identifier of a canonical person, place or cat
    EntityId
);
typed_id!(
    /// Identifier of an immutable staged (as-ingested) record
    StagedRecordId
);
typed_id!(DecisionId);
typed_id!(ReviewEntryId);
typed_id!(RelationshipId);
typed_id!(MergeEventId);
typed_id!(AuditEntryId);

//------------------------------------------------------------------------------
// KINDS
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Place,
    Cat,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Person, EntityKind::Place, EntityKind::Cat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Place => "place",
            Self::Cat => "cat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "person" | "people" => Some(Self::Person),
            "place" | "location" => Some(Self::Place),
            "cat" | "cats" => Some(Self::Cat),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of strong, exactly comparable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Email,
    Phone,
    Microchip,
    ExternalGeocodeKey,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Microchip => "microchip",
            Self::ExternalGeocodeKey => "external_geocode_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "email" => Some(Self::Email),
            "phone" => Some(Self::Phone),
            "microchip" | "chip" => Some(Self::Microchip),
            "external_geocode_key" | "geocode_key" => Some(Self::ExternalGeocodeKey),
            _ => None,
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized (kind, value) pair. Values are always stored post-normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// An identifier row attached to a canonical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityIdentifier {
    pub entity_id: EntityId,
    pub identifier: Identifier,
    pub source_system: Option<String>,
    pub created_at: DateTime<Utc>,
}

//------------------------------------------------------------------------------
// CANONICAL ENTITIES
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlteredStatus {
    Altered,
    Intact,
    #[default]
    Unknown,
}

impl AlteredStatus {
    /// Reads the loose vocabulary clinic and intake exports use.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "altered" | "spayed" | "neutered" | "fixed" | "yes" | "y" | "true" => {
                Some(Self::Altered)
            }
            "intact" | "unaltered" | "no" | "false" | "not fixed" => Some(Self::Intact),
            "unknown" | "" | "?" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Entity-kind-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityDetails {
    Person {
        first_name: Option<String>,
        last_name: Option<String>,
    },
    Place {
        formatted_address: Option<String>,
        unit: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
    },
    Cat {
        altered_status: AlteredStatus,
        sex: Option<String>,
        primary_color: Option<String>,
    },
}

impl EntityDetails {
    pub fn empty(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Person => Self::Person {
                first_name: None,
                last_name: None,
            },
            EntityKind::Place => Self::Place {
                formatted_address: None,
                unit: None,
                latitude: None,
                longitude: None,
            },
            EntityKind::Cat => Self::Cat {
                altered_status: AlteredStatus::Unknown,
                sex: None,
                primary_color: None,
            },
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Person { .. } => EntityKind::Person,
            Self::Place { .. } => EntityKind::Place,
            Self::Cat { .. } => EntityKind::Cat,
        }
    }

    /// Fills the fields that are empty here from `other`. Known values are never
    /// overwritten, except that an altered cat stays altered.
    /// Returns true if anything changed.
    pub fn fill_from(&mut self, other: &EntityDetails) -> bool {
        fn fill<T: Clone + PartialEq>(slot: &mut Option<T>, value: &Option<T>) -> bool {
            if slot.is_none() && value.is_some() {
                *slot = value.clone();
                true
            } else {
                false
            }
        }

        match (self, other) {
            (
                Self::Person {
                    first_name,
                    last_name,
                },
                Self::Person {
                    first_name: f2,
                    last_name: l2,
                },
            ) => {
                let a = fill(first_name, f2);
                let b = fill(last_name, l2);
                a || b
            }
            (
                Self::Place {
                    formatted_address,
                    unit,
                    latitude,
                    longitude,
                },
                Self::Place {
                    formatted_address: a2,
                    unit: u2,
                    latitude: lat2,
                    longitude: lon2,
                },
            ) => {
                let a = fill(formatted_address, a2);
                let b = fill(unit, u2);
                let c = fill(latitude, lat2);
                let d = fill(longitude, lon2);
                a || b || c || d
            }
            (
                Self::Cat {
                    altered_status,
                    sex,
                    primary_color,
                },
                Self::Cat {
                    altered_status: s2,
                    sex: sex2,
                    primary_color: c2,
                },
            ) => {
                let mut changed = false;
                // Alteration is one-way.
                if *altered_status != AlteredStatus::Altered
                    && *s2 != AlteredStatus::Unknown
                    && *altered_status != *s2
                {
                    *altered_status = *s2;
                    changed = true;
                }
                changed |= fill(sex, sex2);
                changed |= fill(primary_color, c2);
                changed
            }
            _ => false,
        }
    }
}

/// The single authoritative record for a real-world person, place or cat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub display_name: String,
    pub details: EntityDetails,
    /// Set when this entity has been absorbed into a survivor of the same kind.
    pub merged_into: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEntity {
    pub fn new(kind: EntityKind, display_name: impl Into<String>, details: EntityDetails) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            kind,
            display_name: display_name.into(),
            details,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }
}

/// An alternate label observed for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub entity_id: EntityId,
    pub label: String,
    pub normalized: String,
    pub observed_count: u32,
    pub first_seen_at: DateTime<Utc>,
}

/// Picks the display alias: most frequently observed, earliest seen on ties.
pub fn display_alias(aliases: &[Alias]) -> Option<&Alias> {
    aliases.iter().max_by(|a, b| {
        a.observed_count
            .cmp(&b.observed_count)
            .then_with(|| b.first_seen_at.cmp(&a.first_seen_at))
    })
}

//------------------------------------------------------------------------------
// STAGED RECORDS
//------------------------------------------------------------------------------

/// One row exactly as ingested from an external source. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub id: StagedRecordId,
    pub source_system: String,
    pub source_table: String,
    pub source_row_id: String,
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

impl StagedRecord {
    pub fn new(
        source_system: impl Into<String>,
        source_table: impl Into<String>,
        source_row_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: StagedRecordId::new(),
            source_system: source_system.into(),
            source_table: source_table.into(),
            source_row_id: source_row_id.into(),
            payload,
            ingested_at: Utc::now(),
        }
    }
}

//------------------------------------------------------------------------------
// RELATIONSHIPS
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Owner or caretaker of a cat
    PersonCat,
    /// Resident, trapper or contact at a place
    PersonPlace,
    /// Colony membership
    CatPlace,
    /// Clinic appointment linking a cat and the person who brought it
    Appointment,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersonCat => "person_cat",
            Self::PersonPlace => "person_place",
            Self::CatPlace => "cat_place",
            Self::Appointment => "appointment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "person_cat" => Some(Self::PersonCat),
            "person_place" => Some(Self::PersonPlace),
            "cat_place" => Some(Self::CatPlace),
            "appointment" => Some(Self::Appointment),
            _ => None,
        }
    }

    /// (from, to) entity kinds.
    pub fn endpoint_kinds(&self) -> (EntityKind, EntityKind) {
        match self {
            Self::PersonCat => (EntityKind::Person, EntityKind::Cat),
            Self::PersonPlace => (EntityKind::Person, EntityKind::Place),
            Self::CatPlace => (EntityKind::Cat, EntityKind::Place),
            Self::Appointment => (EntityKind::Cat, EntityKind::Person),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub kind: RelationshipKind,
    pub from_entity: EntityId,
    pub to_entity: EntityId,
    pub role: Option<String>,
    pub source_system: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        kind: RelationshipKind,
        from_entity: EntityId,
        to_entity: EntityId,
        role: Option<String>,
        source_system: Option<String>,
    ) -> Self {
        Self {
            id: RelationshipId::new(),
            kind,
            from_entity,
            to_entity,
            role,
            source_system,
            created_at: Utc::now(),
        }
    }

    pub fn other_end(&self, entity: &EntityId) -> Option<&EntityId> {
        if &self.from_entity == entity {
            Some(&self.to_entity)
        } else if &self.to_entity == entity {
            Some(&self.from_entity)
        } else {
            None
        }
    }
}

//------------------------------------------------------------------------------
// MERGE EVENTS
//------------------------------------------------------------------------------

/// A pointer merge, kept so it can be reversed exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub id: MergeEventId,
    pub kind: EntityKind,
    /// Root of the absorbed cluster (the entity whose pointer was set)
    pub source_entity: EntityId,
    /// Root of the survivor cluster
    pub target_entity: EntityId,
    /// Entities that pointed at `source_entity` and were flattened onto `target_entity`
    pub repointed: Vec<EntityId>,
    pub actor: String,
    pub reason: Option<String>,
    pub merged_at: DateTime<Utc>,
    pub unmerged_at: Option<DateTime<Utc>>,
}
