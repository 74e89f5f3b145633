// src/bin/review_queue.rs
//
// Operator CLI over the review queue, manual merges and the audit trail.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;

use dedupe_lib::audit::AuditLog;
use dedupe_lib::canonical::CanonicalReader;
use dedupe_lib::config::MatchingConfig;
use dedupe_lib::geocoding::GeocoderSettings;
use dedupe_lib::merge::{MergeExecutor, MergeOutcome};
use dedupe_lib::models::{AuditEntry, EntityId, EntityKind, IdentifierKind, Resolution, ReviewEntryId};
use dedupe_lib::pipeline::RecordProcessor;
use dedupe_lib::review::{ResolveOutcome, ReviewQueue};
use dedupe_lib::store::{DbSettings, PgStore, SharedStore};
use dedupe_lib::utils::env::load_env;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name recorded on audit entries
    #[arg(long, env = "REVIEWER", default_value = "operator")]
    reviewer: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pending entries, best score first
    List {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// One entry with its candidates
    Show { entry: String },
    /// Place the record on (or merge the entity into) a candidate
    Confirm { entry: String, candidate: String },
    /// Not a match; optionally link the record to a known entity instead
    Reject {
        entry: String,
        #[arg(long)]
        link_to: Option<String>,
    },
    /// Leave pending with a note
    Defer {
        entry: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Merge one entity into another
    Merge {
        source: String,
        target: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reverse the merge that absorbed an entity
    Unmerge {
        entity: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Canonical view of an entity
    Entity { id: String },
    /// Audit trail of an entity, or of its whole cluster
    History {
        entity: String,
        #[arg(long)]
        cluster: bool,
    },
    /// Identifier values held by more than one entity
    Conflicts {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn parse_kind(raw: &str) -> Result<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| anyhow!("unknown entity kind '{}'", raw))
}

fn parse_identifier_kind(raw: &str) -> Result<IdentifierKind> {
    IdentifierKind::parse(raw).ok_or_else(|| anyhow!("unknown identifier kind '{}'", raw))
}

fn print_outcome(outcome: &ResolveOutcome) {
    println!("Entry {} is now {}", outcome.entry.id, outcome.entry.status.as_str());
    if let Some(entity) = &outcome.placed_on {
        println!("  placed on {}", entity);
    }
    if let Some((before, after)) = outcome.trust {
        println!("  trust {:.3} -> {:.3}", before, after);
    }
}

fn print_history(entries: &[AuditEntry]) {
    for entry in entries {
        println!(
            "{}  {:<18} {:<10} {} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.operation.as_str(),
            entry.actor,
            entry.subject_id,
            entry
                .after
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let config = Arc::new(MatchingConfig::from_env().context("Failed to load matching config")?);
    let store: SharedStore = Arc::new(
        PgStore::connect(&DbSettings::from_env())
            .await
            .context("Failed to connect to database")?,
    );
    let geocoder = GeocoderSettings::from_env()
        .build(store.clone())
        .context("Failed to set up geocoder")?
        .map(Arc::new);
    let processor = Arc::new(RecordProcessor::new(store.clone(), config.clone(), geocoder));
    let queue = ReviewQueue::new(store.clone(), processor, config);
    let reviewer = cli.reviewer.as_str();

    match cli.command {
        Command::List { kind, limit } => {
            let kind = kind.as_deref().map(parse_kind).transpose()?;
            let entries = queue.pending_entries(kind, limit).await?;
            println!("{} pending entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            for entry in entries {
                println!(
                    "{}  {:<6} {:.3}  {} {}  {}",
                    entry.id,
                    entry.kind.as_str(),
                    entry.top_score,
                    entry.subject.type_str(),
                    entry.subject.id_str(),
                    entry.reason.as_deref().unwrap_or("")
                );
            }
        }
        Command::Show { entry } => {
            let entry = queue.get(&ReviewEntryId::from(entry.as_str())).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Confirm { entry, candidate } => {
            let resolution = Resolution::ConfirmMerge {
                candidate: EntityId::from(candidate.as_str()),
            };
            let outcome = queue.resolve(&ReviewEntryId::from(entry.as_str()), resolution, reviewer).await?;
            print_outcome(&outcome);
        }
        Command::Reject { entry, link_to } => {
            let resolution = Resolution::Reject {
                link_to: link_to.as_deref().map(EntityId::from),
            };
            let outcome = queue.resolve(&ReviewEntryId::from(entry.as_str()), resolution, reviewer).await?;
            print_outcome(&outcome);
        }
        Command::Defer { entry, note } => {
            let outcome = queue
                .resolve(&ReviewEntryId::from(entry.as_str()), Resolution::Defer { note }, reviewer)
                .await?;
            print_outcome(&outcome);
        }
        Command::Merge { source, target, reason } => {
            let executor = MergeExecutor::new(store.clone());
            let outcome = executor
                .merge_entities(
                    &EntityId::from(source.as_str()),
                    &EntityId::from(target.as_str()),
                    reviewer,
                    reason.as_deref(),
                )
                .await?;
            match outcome {
                MergeOutcome::Merged(event) => println!(
                    "Merged {} into {} ({} dependent(s) flattened)",
                    event.source_entity,
                    event.target_entity,
                    event.repointed.len()
                ),
                MergeOutcome::AlreadyMerged { root } => println!("Already merged under {}", root),
            }
        }
        Command::Unmerge { entity, reason } => {
            let executor = MergeExecutor::new(store.clone());
            let outcome = executor
                .unmerge_entity(&EntityId::from(entity.as_str()), reviewer, reason.as_deref())
                .await?;
            println!(
                "Unmerged {} from {}; restored {:?}; re-opened {} decision(s)",
                entity,
                outcome.event.target_entity,
                outcome.restored,
                outcome.reopened.len()
            );
        }
        Command::Entity { id } => {
            let resolved = CanonicalReader::new(store.clone())
                .resolve(&EntityId::from(id.as_str()))
                .await?;
            if resolved.was_redirected() {
                println!("{} was merged into {}", resolved.requested, resolved.entity.id);
            }
            println!("{} {} \"{}\"", resolved.entity.kind, resolved.entity.id, resolved.display_name);
            println!("  members: {}", resolved.members.len());
            for identifier in resolved.identifier_values() {
                println!("  {}", identifier);
            }
            for alias in &resolved.aliases {
                println!("  alias \"{}\" x{}", alias.label, alias.observed_count);
            }
            for rel in &resolved.relationships {
                println!(
                    "  {} {} -> {} {}",
                    rel.kind.as_str(),
                    rel.from_entity,
                    rel.to_entity,
                    rel.role.as_deref().unwrap_or("")
                );
            }
        }
        Command::History { entity, cluster } => {
            let log = AuditLog::new(store.clone());
            let id = EntityId::from(entity.as_str());
            let entries = if cluster {
                log.cluster_history(&id).await?
            } else {
                log.entity_history(&id).await?
            };
            print_history(&entries);
        }
        Command::Conflicts { kind, limit } => {
            let kind = kind.as_deref().map(parse_identifier_kind).transpose()?;
            let shared = store.shared_identifiers(kind, limit).await?;
            info!("{} shared identifier value(s)", shared.len());
            for (identifier, holders) in shared {
                let holders: Vec<String> = holders.iter().map(|h| h.to_string()).collect();
                println!("{}  held by {}", identifier, holders.join(", "));
            }
        }
    }
    Ok(())
}
