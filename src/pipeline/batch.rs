// src/pipeline/batch.rs - Per-source batches, run concurrently across sources
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indicatif::MultiProgress;
use log::{error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::error::EngineResult;
use crate::models::{BatchSummary, RunTotals};
use crate::pipeline::record::{RecordOutcome, RecordProcessor};
use crate::store::SharedStore;
use crate::utils::env::env_parse;
use crate::utils::get_memory_usage;
use crate::utils::progress_bars::{BatchLogger, ProgressConfig};
use crate::utils::source_filter::SourceFilterConfig;

/// Checked between records; a set flag stops every batch at the next record.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    /// Most records taken from one source per run.
    pub batch_size: usize,
    pub max_concurrent_sources: usize,
    pub lease_ttl: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_concurrent_sources: num_cpus::get().max(1),
            lease_ttl: Duration::from_secs(900),
        }
    }
}

impl BatchSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("BATCH_SIZE", defaults.batch_size).max(1),
            max_concurrent_sources: env_parse("MAX_CONCURRENT_SOURCES", defaults.max_concurrent_sources).max(1),
            lease_ttl: Duration::from_secs(env_parse("LEASE_TTL_SECS", defaults.lease_ttl.as_secs())),
        }
    }
}

#[derive(Clone)]
pub struct BatchRunner {
    store: SharedStore,
    config: Arc<MatchingConfig>,
    processor: Arc<RecordProcessor>,
    settings: BatchSettings,
    progress: ProgressConfig,
    holder: String,
}

impl BatchRunner {
    pub fn new(
        store: SharedStore,
        config: Arc<MatchingConfig>,
        processor: Arc<RecordProcessor>,
        settings: BatchSettings,
        progress: ProgressConfig,
    ) -> Self {
        Self {
            store,
            config,
            processor,
            settings,
            progress,
            holder: format!("resolver-{}", Uuid::new_v4()),
        }
    }

    /// Runs one bounded batch for every pending, configured source that
    /// passes `filter`. Records left untouched stay pending for the next run.
    pub async fn run(&self, filter: &SourceFilterConfig, cancel: &CancellationFlag) -> EngineResult<Vec<BatchSummary>> {
        let configured = self.config.configured_systems();
        let mut sources = Vec::new();
        for source in self.store.pending_sources().await? {
            if configured.contains(&source) {
                sources.push(source);
            } else {
                warn!("⚠️ Source {} has pending records but no mapping; skipped", source);
            }
        }
        let sources = filter.apply(sources);
        info!(
            "📋 {} source(s) with pending records; up to {} concurrently",
            sources.len(),
            self.settings.max_concurrent_sources
        );

        let multi = self.progress.create_multi_progress();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_sources));
        let mut tasks: Vec<JoinHandle<EngineResult<BatchSummary>>> = Vec::new();
        for source in sources {
            let runner = self.clone();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let multi = multi.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(anyhow::Error::from)?;
                runner.run_source(&source, &cancel, multi.as_ref()).await
            }));
        }

        let mut summaries = Vec::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => error!("❌ Source batch failed: {}", e),
                Err(e) => error!("❌ Source batch task panicked or was cancelled: {}", e),
            }
        }
        summaries.sort_by(|a, b| a.source_system.cmp(&b.source_system));

        let totals = RunTotals::from_summaries(&summaries);
        info!(
            "🎉 Run complete: {} source(s), {} processed, {} auto-merged, {} new, {} review, {} errored",
            totals.sources,
            totals.processed,
            totals.auto_merged,
            totals.new_entity,
            totals.queued_for_review,
            totals.errored
        );
        if self.progress.should_show_memory() {
            info!("💾 Memory in use: {} MB", get_memory_usage().await);
        }
        Ok(summaries)
    }

    /// One batch for one source under its lease.
    pub async fn run_source(
        &self,
        source_system: &str,
        cancel: &CancellationFlag,
        multi: Option<&MultiProgress>,
    ) -> EngineResult<BatchSummary> {
        let logger = BatchLogger::new(source_system);
        let mut summary = BatchSummary::new(source_system);
        let acquired = self
            .store
            .try_acquire_source_lease(source_system, &self.holder, self.settings.lease_ttl)
            .await?;
        if !acquired {
            logger.log_lease_unavailable();
            summary.lease_unavailable = true;
            return Ok(summary);
        }

        let result = self.process_source(source_system, cancel, multi, &logger, &mut summary).await;
        if let Err(e) = self.store.release_source_lease(source_system, &self.holder).await {
            warn!("[{}] ⚠️ Failed to release lease: {}", source_system, e);
        }
        result?;

        summary.duration_secs = logger.elapsed_secs();
        logger.log_completion(&summary);
        Ok(summary)
    }

    async fn process_source(
        &self,
        source_system: &str,
        cancel: &CancellationFlag,
        multi: Option<&MultiProgress>,
        logger: &BatchLogger,
        summary: &mut BatchSummary,
    ) -> EngineResult<()> {
        let records = self
            .store
            .pending_records(source_system, self.settings.batch_size)
            .await?;
        logger.log_start(records.len(), self.settings.batch_size);
        let bar = self.progress.source_bar(multi, source_system, records.len() as u64);

        for (i, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                let remaining = records.len() - i;
                summary.retry_pending += remaining;
                logger.log_cancelled(remaining);
                break;
            }
            // The lease is renewed before every record.
            let renewed = self
                .store
                .try_acquire_source_lease(source_system, &self.holder, self.settings.lease_ttl)
                .await;
            if !matches!(renewed, Ok(true)) {
                let remaining = records.len() - i;
                summary.retry_pending += remaining;
                summary.lease_lost = true;
                logger.log_lease_lost(remaining);
                break;
            }
            match self.processor.process(record).await {
                Ok(processed) => {
                    summary.conflicting_identifiers += processed.conflicting_identifiers;
                    summary.extraction_issues += processed.extraction_issues;
                    match processed.outcome {
                        RecordOutcome::AutoMerged { .. } => summary.auto_merged += 1,
                        RecordOutcome::NewEntity { .. } => summary.new_entity += 1,
                        RecordOutcome::QueuedForReview { .. } => summary.queued_for_review += 1,
                        RecordOutcome::AlreadyDecided => summary.skipped_existing += 1,
                    }
                    if processed.outcome != RecordOutcome::AlreadyDecided {
                        summary.processed += 1;
                    }
                }
                Err(e) if e.is_retryable() => {
                    summary.processed += 1;
                    summary.errored += 1;
                    summary.retry_pending += 1;
                    logger.log_record_error(&record.source_row_id, &e, true);
                }
                Err(e) => {
                    summary.processed += 1;
                    summary.errored += 1;
                    logger.log_record_error(&record.source_row_id, &e, false);
                    match self.processor.queue_failed(record, &e).await {
                        Ok(_) => summary.queued_for_review += 1,
                        Err(queue_err) => {
                            summary.retry_pending += 1;
                            logger.log_record_error(&record.source_row_id, &queue_err, queue_err.is_retryable());
                        }
                    }
                }
            }
            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }
        if let Some(bar) = bar {
            bar.finish_with_message("done");
        }
        Ok(())
    }
}
