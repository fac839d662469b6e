use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::lifecycle::ArchiveUnit;

/// Match lifecycle archiver and team/league name reconciler
#[derive(Parser, Debug, Clone)]
#[command(name = "odds-keeper", version, about)]
pub struct Config {
    /// Directory holding the per-source active collection files
    #[arg(long, env = "ODDS_DATA_DIR", default_value = "data", global = true)]
    pub data_dir: PathBuf,

    /// Shared history store for retired matches
    #[arg(
        long,
        env = "HISTORY_FILE",
        default_value = "data/match_history.json",
        global = true
    )]
    pub history_file: PathBuf,

    /// Team/league name cache
    #[arg(
        long,
        env = "NAME_CACHE_FILE",
        default_value = "data/name_cache.json",
        global = true
    )]
    pub name_cache_file: PathBuf,

    /// Bookmaker sources to archive (comma separated)
    #[arg(
        long,
        env = "ODDS_SOURCES",
        value_delimiter = ',',
        default_value = "1xbet,bet365,fanduel,oddsportal,oddsmagnet",
        global = true
    )]
    pub sources: Vec<String>,

    /// Live matches not refreshed for this many minutes are retired
    #[arg(long, env = "LIVE_STALE_MINUTES", default_value = "30", global = true)]
    pub live_stale_minutes: i64,

    /// Minimum closeness (0.0–1.0) for two names to count as the same entity
    #[arg(long, env = "SIMILARITY_THRESHOLD", default_value = "0.90", global = true)]
    pub similarity_threshold: f64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Move finished and stale matches from active collections into history
    Archive {
        /// Keep running on an interval until Ctrl-C
        #[arg(long)]
        watch: bool,

        /// Seconds between runs in watch mode
        #[arg(long, env = "ARCHIVE_INTERVAL_SECS", default_value = "300")]
        interval_secs: u64,

        /// Archive one unit at a time instead of concurrently
        #[arg(long, conflicts_with = "watch")]
        sequential: bool,
    },

    /// Print history store counts as JSON
    HistoryStats,

    /// Drop history entries retired more than N days ago
    HistoryPrune {
        #[arg(long)]
        days: i64,
    },

    /// Resolve raw names to canonical names, learning new variants
    Resolve {
        /// Treat the names as leagues instead of teams
        #[arg(long)]
        league: bool,

        /// Feed the names came from
        #[arg(long)]
        source: Option<String>,

        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Merge canonical entries that denote the same team/league
    Dedupe,

    /// Print name cache summary as JSON
    CacheReport {
        /// Number of most-used entities to list
        #[arg(long, default_value = "20")]
        top: usize,
    },
}

/// Upper bound for the live heartbeat window (one year).
const MAX_LIVE_STALE_MINUTES: i64 = 525_600;
/// Upper bound for history pruning (a century).
const MAX_PRUNE_DAYS: i64 = 36_500;

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.is_empty() {
            anyhow::bail!("at least one source is required");
        }
        for source in &self.sources {
            if source.is_empty()
                || !source
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                anyhow::bail!("invalid source name '{}': use letters, digits, '_' or '-'", source);
            }
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.to_ascii_lowercase()) {
                anyhow::bail!("source '{}' is listed more than once", source);
            }
        }
        if !(1..=MAX_LIVE_STALE_MINUTES).contains(&self.live_stale_minutes) {
            anyhow::bail!(
                "live_stale_minutes must be between 1 and {}",
                MAX_LIVE_STALE_MINUTES
            );
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            anyhow::bail!("similarity_threshold must be in (0.0, 1.0]");
        }
        match &self.command {
            Command::Archive {
                watch: true,
                interval_secs: 0,
                ..
            } => anyhow::bail!("interval_secs must be positive in watch mode"),
            Command::HistoryPrune { days } if !(0..=MAX_PRUNE_DAYS).contains(days) => {
                anyhow::bail!("days must be between 0 and {}", MAX_PRUNE_DAYS)
            }
            _ => {}
        }
        Ok(())
    }

    pub fn archive_units(&self) -> Vec<ArchiveUnit> {
        ArchiveUnit::for_sources(&self.data_dir, &self.sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["odds-keeper"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&["archive"]);
        assert_eq!(cfg.sources.len(), 5);
        assert_eq!(cfg.live_stale_minutes, 30);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.archive_units().len(), 10);
    }

    #[test]
    fn test_sources_are_comma_separated() {
        let cfg = parse(&["--sources", "bet365,fanduel", "archive"]);
        assert_eq!(cfg.sources, ["bet365", "fanduel"]);
    }

    #[test]
    fn test_rejects_path_like_source() {
        let cfg = parse(&["--sources", "../etc", "history-stats"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_threshold_and_window() {
        assert!(parse(&["--similarity-threshold", "0", "dedupe"]).validate().is_err());
        assert!(parse(&["--similarity-threshold", "1.5", "dedupe"]).validate().is_err());
        assert!(parse(&["--live-stale-minutes", "0", "archive"]).validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_sources() {
        let cfg = parse(&["--sources", "bet365,fanduel,bet365", "archive"]);
        assert!(cfg.validate().is_err());
        let cfg = parse(&["--sources", "bet365,BET365", "archive"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        assert!(parse(&["--live-stale-minutes", "9223372036854775807", "archive"])
            .validate()
            .is_err());
        assert!(parse(&["history-prune", "--days", "9223372036854775807"])
            .validate()
            .is_err());
        assert!(parse(&["history-prune", "--days=-1"]).validate().is_err());
        assert!(parse(&["history-prune", "--days", "30"]).validate().is_ok());
    }

    #[test]
    fn test_watch_needs_interval() {
        let cfg = parse(&["archive", "--watch", "--interval-secs", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sequential_excludes_watch() {
        let cfg = parse(&["archive", "--sequential"]);
        assert!(matches!(cfg.command, Command::Archive { sequential: true, .. }));
        assert!(Config::try_parse_from(["odds-keeper", "archive", "--sequential", "--watch"]).is_err());
    }

    #[test]
    fn test_resolve_args() {
        let cfg = parse(&["resolve", "--league", "--source", "bet365", "EPL", "Serie A"]);
        match cfg.command {
            Command::Resolve {
                league,
                source,
                names,
            } => {
                assert!(league);
                assert_eq!(source.as_deref(), Some("bet365"));
                assert_eq!(names, ["EPL", "Serie A"]);
            }
            other => panic!("Expected Resolve, got {:?}", other),
        }
    }
}
