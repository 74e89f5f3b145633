// src/utils/constants.rs

/// Two places geocoded within this distance are treated as sharing an address.
/// Tight enough to separate neighbouring parcels on a residential street.
pub const PLACE_PROXIMITY_METERS: f64 = 30.0;

/// Upper bound on merge-pointer hops followed while resolving a root.
/// Flattened chains are one hop; anything longer means stored pointers are corrupt.
pub const MAX_MERGE_CHAIN_HOPS: usize = 32;

/// Alias tokens shorter than this are not used for candidate blocking.
pub const MIN_BLOCKING_TOKEN_LENGTH: usize = 2;

/// Actor recorded on audit entries written by batch processing.
pub const SYSTEM_ACTOR: &str = "system:resolver";

/// Score differences below this count as ties.
pub const SCORE_EPSILON: f64 = 1e-9;
