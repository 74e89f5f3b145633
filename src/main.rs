use anyhow::{Context, Result};
use dedupe_lib::config::MatchingConfig;
use dedupe_lib::geocoding::GeocoderSettings;
use dedupe_lib::pipeline::{BatchRunner, BatchSettings, CancellationFlag, RecordProcessor};
use dedupe_lib::store::{DbSettings, PgStore, SharedStore};
use dedupe_lib::utils::env::{env_bool, load_env};
use dedupe_lib::utils::get_memory_usage;
use dedupe_lib::utils::progress_bars::ProgressConfig;
use dedupe_lib::utils::source_filter::SourceFilterConfig;
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting entity resolution batch run");
    load_env();
    let start = Instant::now();

    let source_filter = SourceFilterConfig::from_env();
    source_filter.log_config();

    let progress_config = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, memory={}",
        progress_config.enabled, progress_config.show_memory
    );

    let config = Arc::new(MatchingConfig::from_env().context("Failed to load matching config")?);
    if config.sources.is_empty() {
        warn!("⚠️ No sources configured; nothing will be resolved");
    }

    let pg = Arc::new(
        PgStore::connect(&DbSettings::from_env())
            .await
            .context("Failed to connect to database")?,
    );
    if env_bool("RUN_MIGRATIONS", true) {
        pg.migrate().await.context("Failed to apply schema")?;
    }
    let store: SharedStore = pg.clone();

    let geocoder = GeocoderSettings::from_env()
        .build(store.clone())
        .context("Failed to set up geocoder")?
        .map(Arc::new);

    let processor = Arc::new(RecordProcessor::new(store.clone(), config.clone(), geocoder));
    let settings = BatchSettings::from_env();
    info!(
        "Batch settings: size={}, concurrent sources={}, lease ttl={}s",
        settings.batch_size,
        settings.max_concurrent_sources,
        settings.lease_ttl.as_secs()
    );
    let runner = BatchRunner::new(store, config, processor, settings, progress_config);

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received; stopping after the current records");
            on_signal.cancel();
        }
    });

    let summaries = runner
        .run(&source_filter, &cancel)
        .await
        .context("Batch run failed")?;

    for summary in &summaries {
        info!(
            "  {}: processed={} auto_merged={} new={} review={} errored={} skipped={} retry_pending={} conflicts={}",
            summary.source_system,
            summary.processed,
            summary.auto_merged,
            summary.new_entity,
            summary.queued_for_review,
            summary.errored,
            summary.skipped_existing,
            summary.retry_pending,
            summary.conflicting_identifiers
        );
    }

    let (total, idle, in_use) = pg.pool_status();
    info!(
        "Finished in {:.2?}; memory {} MB; DB pool {}/{} in use ({} idle)",
        start.elapsed(),
        get_memory_usage().await,
        in_use,
        total,
        idle
    );
    Ok(())
}
