use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use tracing::{info, warn};

mod config;
mod lifecycle;
mod names;
mod store;

use config::{Command, Config};
use lifecycle::{run_archive_cycle, Archiver, StalenessPolicy};
use names::{EntityKind, NameCache, ResolveOutcome};
use store::HistoryStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    config.validate()?;

    match config.command.clone() {
        Command::Archive {
            watch,
            interval_secs,
            sequential,
        } => {
            let archiver = Archiver::new(
                HistoryStore::open(&config.history_file),
                StalenessPolicy::with_live_minutes(config.live_stale_minutes),
            );
            let units = config.archive_units();
            info!(
                "Archiving {} source(s) from {} into {}",
                config.sources.len(),
                config.data_dir.display(),
                archiver.history().path().display()
            );

            if watch {
                lifecycle::watch(archiver, units, std::time::Duration::from_secs(interval_secs))
                    .await;
            } else {
                let summary = if sequential {
                    archiver.archive_all(&units, Utc::now())
                } else {
                    run_archive_cycle(&archiver, &units).await
                };
                summary.log();
                if summary.failures > 0 {
                    anyhow::bail!("{} unit(s) failed to archive", summary.failures);
                }
            }
        }

        Command::HistoryStats => {
            let stats = HistoryStore::open(&config.history_file)
                .stats()
                .context("Failed to read history store")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::HistoryPrune { days } => {
            let now = Utc::now();
            let cutoff = Duration::try_days(days)
                .and_then(|age| now.checked_sub_signed(age))
                .with_context(|| format!("{} day(s) is out of range", days))?;
            let removed = HistoryStore::open(&config.history_file)
                .prune_older_than(cutoff, now)
                .context("Failed to prune history store")?;
            info!("Removed {} history entr(ies) older than {} day(s)", removed, days);
        }

        Command::Resolve {
            league,
            source,
            names,
        } => {
            let mut cache = load_cache(&config)?;
            let kind = if league {
                EntityKind::League
            } else {
                EntityKind::Team
            };
            let now = Utc::now();
            let mut changed = false;
            let registry = cache.registry_mut(kind);
            for raw in &names {
                match registry.resolve(raw, source.as_deref(), now) {
                    Some(res) => {
                        if res.outcome != ResolveOutcome::Known {
                            info!(
                                "{} '{}' → '{}' ({:?}, score {:.3})",
                                kind, raw, res.canonical, res.outcome, res.score
                            );
                        }
                        changed = true;
                        println!("{}\t{}", raw, res.canonical);
                    }
                    None => warn!("Skipping empty {} name {:?}", kind, raw),
                }
            }
            if changed {
                cache
                    .save(&config.name_cache_file, now)
                    .context("Failed to save name cache")?;
            }
        }

        Command::Dedupe => {
            let mut cache = load_cache(&config)?;
            if cache.teams.is_empty() && cache.leagues.is_empty() {
                info!("Name cache is empty; nothing to deduplicate");
            }
            let report = cache.deduplicate();
            info!(
                "Teams: {} → {} ({} merged); leagues: {} → {} ({} merged)",
                report.teams.entities_before,
                report.teams.entities_after,
                report.teams.duplicates_merged,
                report.leagues.entities_before,
                report.leagues.entities_after,
                report.leagues.duplicates_merged
            );
            if report.teams.duplicates_merged + report.leagues.duplicates_merged > 0 {
                cache
                    .save(&config.name_cache_file, Utc::now())
                    .context("Failed to save name cache")?;
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::CacheReport { top } => {
            let cache = load_cache(&config)?;
            println!("{}", serde_json::to_string_pretty(&cache.report(top))?);
        }
    }

    Ok(())
}

fn load_cache(config: &Config) -> Result<NameCache> {
    NameCache::load(&config.name_cache_file, config.similarity_threshold).with_context(|| {
        format!(
            "Failed to load name cache {}",
            config.name_cache_file.display()
        )
    })
}
