// src/models/stats_models.rs

use serde::{Deserialize, Serialize};

/// Per-source counts returned by a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub source_system: String,
    pub processed: usize,
    pub auto_merged: usize,
    pub new_entity: usize,
    pub queued_for_review: usize,
    pub errored: usize,
    /// Records that already had an active decision.
    pub skipped_existing: usize,
    /// Records left for the next run: retryable failures, cancellation or a lost lease.
    pub retry_pending: usize,
    pub conflicting_identifiers: usize,
    pub extraction_issues: usize,
    /// Another batch held this source's lease; nothing was processed.
    pub lease_unavailable: bool,
    /// The lease could not be renewed mid-batch; the rest was left pending.
    pub lease_lost: bool,
    pub duration_secs: f64,
}

impl BatchSummary {
    pub fn new(source_system: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            ..Default::default()
        }
    }
}

/// Totals across all sources in one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub sources: usize,
    pub processed: usize,
    pub auto_merged: usize,
    pub new_entity: usize,
    pub queued_for_review: usize,
    pub errored: usize,
    pub skipped_existing: usize,
    pub retry_pending: usize,
}

impl RunTotals {
    pub fn from_summaries(summaries: &[BatchSummary]) -> Self {
        summaries.iter().fold(
            Self {
                sources: summaries.len(),
                ..Default::default()
            },
            |mut acc, s| {
                acc.processed += s.processed;
                acc.auto_merged += s.auto_merged;
                acc.new_entity += s.new_entity;
                acc.queued_for_review += s.queued_for_review;
                acc.errored += s.errored;
                acc.skipped_existing += s.skipped_existing;
                acc.retry_pending += s.retry_pending;
                acc
            },
        )
    }
}
