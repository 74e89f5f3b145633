pub mod audit;
pub mod core;
pub mod matching;
pub mod review;
pub mod stats_models;

pub use self::audit::{AuditEntry, AuditOperation};
pub use self::core::*;
pub use self::matching::{DecisionOutcome, MatchCandidate, MatchDecision, MatchSignals, MatchType};
pub use self::review::{Resolution, ReviewQueueEntry, ReviewStatus, ReviewSubject};
pub use self::stats_models::{BatchSummary, RunTotals};
