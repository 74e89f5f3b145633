// src/config/mod.rs
//
// Matching weights, thresholds and per-source field maps. Loaded from TOML so
// operators can retune a kind or onboard a source without a rebuild.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{EntityKind, RelationshipKind};

pub const DEFAULT_CONFIG_PATH: &str = "matching_config.toml";

/// Per-signal weights of the confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub phone: f64,
    pub email: f64,
    pub name_similarity: f64,
    pub shared_address: f64,
    pub shared_relationship: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            phone: 0.0,
            email: 0.0,
            name_similarity: 0.5,
            shared_address: 0.25,
            shared_relationship: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindSettings {
    pub weights: Weights,
    pub auto_merge_threshold: f64,
    pub review_threshold: f64,
    /// Fraction of a weight still credited to an identifier that several live
    /// entities share.
    pub conflict_signal_factor: f64,
    /// Identifier-only matches whose names score below this are held for review.
    pub min_identifier_name_similarity: f64,
    pub max_fuzzy_candidates: usize,
    pub candidate_pool_limit: usize,
}

impl Default for KindSettings {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            auto_merge_threshold: 0.95,
            review_threshold: 0.6,
            conflict_signal_factor: 0.3,
            min_identifier_name_similarity: 0.6,
            max_fuzzy_candidates: 5,
            candidate_pool_limit: 200,
        }
    }
}

impl KindSettings {
    pub fn default_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Person => Self {
                weights: Weights {
                    phone: 0.45,
                    email: 0.45,
                    name_similarity: 0.55,
                    shared_address: 0.25,
                    shared_relationship: 0.20,
                },
                auto_merge_threshold: 0.95,
                review_threshold: 0.60,
                ..Self::default()
            },
            EntityKind::Cat => Self {
                weights: Weights {
                    phone: 0.0,
                    email: 0.0,
                    name_similarity: 0.45,
                    shared_address: 0.20,
                    shared_relationship: 0.35,
                },
                auto_merge_threshold: 0.95,
                review_threshold: 0.65,
                ..Self::default()
            },
            EntityKind::Place => Self {
                weights: Weights {
                    phone: 0.0,
                    email: 0.0,
                    name_similarity: 0.60,
                    shared_address: 0.30,
                    shared_relationship: 0.10,
                },
                auto_merge_threshold: 0.95,
                review_threshold: 0.70,
                ..Self::default()
            },
        }
    }

    fn validate(&self, kind: EntityKind) -> EngineResult<()> {
        let unit_range = |name: &str, v: f64| -> EngineResult<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(EngineError::Config(format!(
                    "{}.{} must be within [0, 1], got {}",
                    kind, name, v
                )))
            }
        };
        unit_range("auto_merge_threshold", self.auto_merge_threshold)?;
        unit_range("review_threshold", self.review_threshold)?;
        unit_range("conflict_signal_factor", self.conflict_signal_factor)?;
        unit_range("min_identifier_name_similarity", self.min_identifier_name_similarity)?;
        if self.review_threshold > self.auto_merge_threshold {
            return Err(EngineError::Config(format!(
                "{}.review_threshold ({}) exceeds auto_merge_threshold ({})",
                kind, self.review_threshold, self.auto_merge_threshold
            )));
        }
        let w = &self.weights;
        for (name, v) in [
            ("phone", w.phone),
            ("email", w.email),
            ("name_similarity", w.name_similarity),
            ("shared_address", w.shared_address),
            ("shared_relationship", w.shared_relationship),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(EngineError::Config(format!(
                    "{}.weights.{} must be a non-negative number, got {}",
                    kind, name, v
                )));
            }
        }
        if self.max_fuzzy_candidates == 0 || self.candidate_pool_limit == 0 {
            return Err(EngineError::Config(format!(
                "{}: max_fuzzy_candidates and candidate_pool_limit must be positive",
                kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindsConfig {
    #[serde(default = "person_defaults")]
    pub person: KindSettings,
    #[serde(default = "place_defaults")]
    pub place: KindSettings,
    #[serde(default = "cat_defaults")]
    pub cat: KindSettings,
}

fn person_defaults() -> KindSettings {
    KindSettings::default_for(EntityKind::Person)
}

fn place_defaults() -> KindSettings {
    KindSettings::default_for(EntityKind::Place)
}

fn cat_defaults() -> KindSettings {
    KindSettings::default_for(EntityKind::Cat)
}

impl Default for KindsConfig {
    fn default() -> Self {
        Self {
            person: person_defaults(),
            place: place_defaults(),
            cat: cat_defaults(),
        }
    }
}

/// Which payload keys hold which fields. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub email: Option<String>,
    /// Several phone columns are common (home, cell, work).
    pub phone: Vec<String>,
    pub microchip: Option<String>,
    pub geocode_key: Option<String>,
    /// Full name or label; used when first/last are not split.
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub address: Option<String>,
    pub unit: Option<String>,
    pub altered_status: Option<String>,
    pub sex: Option<String>,
    pub color: Option<String>,
}

/// A linked entity described inside the same row (e.g. a cat row's owner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedFieldMap {
    pub entity_kind: EntityKind,
    pub relationship: RelationshipKind,
    #[serde(default)]
    pub role: Option<String>,
    /// Create the linked entity when no existing one matches its identifiers.
    #[serde(default)]
    pub create_if_missing: bool,
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_system: String,
    /// `*` matches every table of the source system.
    #[serde(default = "any_table")]
    pub source_table: String,
    pub entity_kind: EntityKind,
    /// Sources that may only enrich existing entities send would-be new
    /// entities to review instead.
    #[serde(default = "default_true")]
    pub can_create_entities: bool,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub related: Vec<RelatedFieldMap>,
}

fn any_table() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

/// Bounds for the review feedback loop on per-source trust weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    pub default_weight: f64,
    pub step: f64,
    pub floor: f64,
    pub ceiling: f64,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            default_weight: 1.0,
            step: 0.02,
            floor: 0.5,
            ceiling: 1.2,
        }
    }
}

impl TrustSettings {
    pub fn clamp(&self, weight: f64) -> f64 {
        weight.clamp(self.floor, self.ceiling)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default)]
    pub kinds: KindsConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub trust: TrustSettings,
}

impl MatchingConfig {
    /// Loads from `MATCHING_CONFIG_PATH` (default `matching_config.toml`).
    /// A missing file yields the built-in defaults, which configure no sources.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("MATCHING_CONFIG_PATH")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if path.exists() {
            Self::load(path)
        } else {
            warn!(
                "⚠️ Matching config {} not found, using built-in defaults (no sources configured)",
                path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read matching config {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid matching config {}", path.display()))?;
        info!(
            "Loaded matching config from {} ({} sources)",
            path.display(),
            config.sources.len()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        for kind in EntityKind::ALL {
            self.kind(kind).validate(kind)?;
        }

        let t = &self.trust;
        if !(t.floor > 0.0 && t.floor <= t.default_weight && t.default_weight <= t.ceiling) {
            return Err(EngineError::Config(format!(
                "trust bounds must satisfy 0 < floor <= default_weight <= ceiling (got {} / {} / {})",
                t.floor, t.default_weight, t.ceiling
            )));
        }
        if !(t.step >= 0.0 && t.step.is_finite()) {
            return Err(EngineError::Config(format!("trust.step must be non-negative, got {}", t.step)));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.source_system.trim().is_empty() {
                return Err(EngineError::Config("source_system must not be empty".into()));
            }
            if !seen.insert((source.source_system.as_str(), source.source_table.as_str())) {
                return Err(EngineError::Config(format!(
                    "duplicate source mapping for {}/{}",
                    source.source_system, source.source_table
                )));
            }
            for related in &source.related {
                if relationship_direction(related.relationship, source.entity_kind, related.entity_kind)
                    .is_none()
                {
                    return Err(EngineError::Config(format!(
                        "{}/{}: relationship {} does not connect a {} record to a {}",
                        source.source_system,
                        source.source_table,
                        related.relationship.as_str(),
                        source.entity_kind,
                        related.entity_kind
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self, kind: EntityKind) -> &KindSettings {
        match kind {
            EntityKind::Person => &self.kinds.person,
            EntityKind::Place => &self.kinds.place,
            EntityKind::Cat => &self.kinds.cat,
        }
    }

    /// Exact (system, table) mapping first, then the system's `*` mapping.
    pub fn source(&self, source_system: &str, source_table: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.source_system == source_system && s.source_table == source_table)
            .or_else(|| {
                self.sources
                    .iter()
                    .find(|s| s.source_system == source_system && s.source_table == "*")
            })
    }

    pub fn configured_systems(&self) -> Vec<String> {
        let mut systems: Vec<String> = self
            .sources
            .iter()
            .map(|s| s.source_system.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        systems.sort();
        systems
    }
}

/// Whether the record is the `from` end (`true`) or the `to` end (`false`)
/// of `relationship` when linked to a `related` entity. None if the
/// relationship cannot join those kinds.
pub fn relationship_direction(
    relationship: RelationshipKind,
    record: EntityKind,
    related: EntityKind,
) -> Option<bool> {
    let (from, to) = relationship.endpoint_kinds();
    if from == record && to == related {
        Some(true)
    } else if from == related && to == record {
        Some(false)
    } else {
        None
    }
}
