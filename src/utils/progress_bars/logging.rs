// src/utils/progress_bars/logging.rs - Logging helpers for per-source batches
use log::{info, warn};
use std::time::Instant;

use crate::models::BatchSummary;

#[derive(Clone)]
pub struct BatchLogger {
    source_system: String,
    start_time: Instant,
}

impl BatchLogger {
    pub fn new(source_system: &str) -> Self {
        Self {
            source_system: source_system.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn log_start(&self, pending: usize, batch_size: usize) {
        info!(
            "[{}] 🚀 Starting batch: {} pending record(s) (batch size: {})",
            self.source_system, pending, batch_size
        );
    }

    pub fn log_lease_unavailable(&self) {
        warn!(
            "[{}] ⏭️  Another batch holds this source's lease; skipping",
            self.source_system
        );
    }

    pub fn log_record_error(&self, row: &str, error: &dyn std::fmt::Display, retryable: bool) {
        warn!(
            "[{}] ⚠️  Record {} failed ({}): {}",
            self.source_system,
            row,
            if retryable { "will retry next run" } else { "queued for review" },
            error
        );
    }

    pub fn log_lease_lost(&self, remaining: usize) {
        warn!(
            "[{}] ⏭️  Lease could not be renewed; stopping with {} record(s) left pending",
            self.source_system, remaining
        );
    }

    pub fn log_cancelled(&self, remaining: usize) {
        warn!(
            "[{}] 🛑 Cancelled at record boundary; {} record(s) left pending",
            self.source_system, remaining
        );
    }

    pub fn log_completion(&self, summary: &BatchSummary) {
        info!(
            "[{}] 🎉 COMPLETED in {:.2}s: {} processed → {} auto-merged, {} new, {} queued for review",
            self.source_system,
            self.elapsed_secs(),
            summary.processed,
            summary.auto_merged,
            summary.new_entity,
            summary.queued_for_review
        );
        if summary.skipped_existing > 0 {
            info!(
                "[{}] ⏭️  {} record(s) already decided",
                self.source_system, summary.skipped_existing
            );
        }
        if summary.conflicting_identifiers > 0 || summary.extraction_issues > 0 {
            info!(
                "[{}] 📊 {} conflicting identifier(s), {} extraction issue(s)",
                self.source_system, summary.conflicting_identifiers, summary.extraction_issues
            );
        }
        if summary.errored > 0 || summary.retry_pending > 0 {
            warn!(
                "[{}] ⚠️  {} errored, {} left for retry",
                self.source_system, summary.errored, summary.retry_pending
            );
        }
    }
}
