// src/error.rs

use std::time::Duration;

use thiserror::Error;

use crate::models::{EntityId, EntityKind, ReviewEntryId};

/// Failures a storage backend reports back to the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The unit of work was rejected because state it depended on changed
    /// (a merge pointer moved, a decision already exists, a unique key is taken).
    /// Nothing was written.
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors callers of the engine need to branch on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("merging {source_id} into {target} would create a cycle")]
    CycleDetected {
        source_id: EntityId,
        target: EntityId,
    },

    #[error("cannot merge a {left} into a {right}")]
    KindMismatch { left: EntityKind, right: EntityKind },

    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("entity {0} is not merged into anything")]
    NotMerged(EntityId),

    #[error("review entry {0} not found")]
    ReviewEntryNotFound(ReviewEntryId),

    #[error("review entry {0} is already resolved")]
    ReviewAlreadyResolved(ReviewEntryId),

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("geocoding failed after {attempts} attempt(s): {message}")]
    GeocodingFailed { attempts: u32, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Storage conflicts and backend failures leave the record for the next run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Errors from an external geocoding service.
#[derive(Debug, Error)]
pub enum GeocodeError {
    /// Worth retrying: timeouts, 5xx, rate limiting.
    #[error("transient geocoder error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Retrying will not help: bad request, denied key, malformed response.
    #[error("geocoder error: {0}")]
    Permanent(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
