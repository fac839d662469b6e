pub mod archiver;
pub mod classifier;

pub use archiver::{ArchiveUnit, Archiver, RunSummary, UnitOutcome};
pub use classifier::StalenessPolicy;

use chrono::Utc;
use std::time::Duration;
use tracing::{error, info};

/// Archive every unit concurrently on the blocking pool.
///
/// Active-file rewrites proceed in parallel since each unit owns its own
/// file; appends to the shared history are serialized by the store's lock.
/// All units are classified against the same `now`.
pub async fn run_archive_cycle(archiver: &Archiver, units: &[ArchiveUnit]) -> RunSummary {
    let now = Utc::now();

    let tasks: Vec<_> = units
        .iter()
        .cloned()
        .map(|unit| {
            let archiver = archiver.clone();
            async move {
                let label = unit.label();
                let joined = tokio::task::spawn_blocking(move || {
                    let res = archiver.archive_unit(&unit, now);
                    (unit, res)
                })
                .await;
                (label, joined)
            }
        })
        .collect();

    let results = futures_util::future::join_all(tasks).await;

    let mut summary = RunSummary::default();
    for (label, joined) in results {
        match joined {
            Ok((unit, res)) => summary.record(&unit, res),
            Err(e) => {
                error!("Archive task for {} panicked: {}", label, e);
                summary.failures += 1;
                summary
                    .per_unit
                    .insert(label, UnitOutcome::Failed(format!("task failed: {e}")));
            }
        }
    }
    summary
}

/// Run archive cycles on a fixed interval until Ctrl-C.
pub async fn watch(archiver: Archiver, units: Vec<ArchiveUnit>, every: Duration) {
    info!(
        "Archiver watching {} unit(s) every {:?}",
        units.len(),
        every
    );
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_archive_cycle(&archiver, &units).await.log();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping archiver");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::MatchKind;
    use crate::store::HistoryStore;
    use serde_json::json;
    use std::fs;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cycle_appends_every_source() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(
            HistoryStore::open(dir.path().join("match_history.json")),
            StalenessPolicy::default(),
        );
        let sources: Vec<String> = ["1xbet", "bet365", "fanduel", "oddsportal", "oddsmagnet"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let units = ArchiveUnit::for_sources(dir.path(), &sources);

        for unit in &units {
            let matches: Vec<_> = (0..3)
                .map(|i| match unit.kind {
                    MatchKind::Pregame => json!({"id": i, "start_time": "2001-01-01"}),
                    MatchKind::Live => json!({"id": i, "status": "completed"}),
                })
                .collect();
            fs::write(&unit.path, json!({"matches": matches}).to_string()).unwrap();
        }

        let summary = run_archive_cycle(&archiver, &units).await;
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.total_retired, 30);
        assert_eq!(summary.per_unit.len(), 10);

        let stats = archiver.history().stats().unwrap();
        assert_eq!(stats.total_matches, 30);
        assert_eq!(stats.by_source.len(), 5);

        let again = run_archive_cycle(&archiver, &units).await;
        assert_eq!(again.total_retired, 0);
    }

    #[tokio::test]
    async fn test_cycle_reports_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = Archiver::new(
            HistoryStore::open(dir.path().join("match_history.json")),
            StalenessPolicy::default(),
        );
        let units = ArchiveUnit::for_sources(dir.path(), &["bet365".to_string()]);
        fs::write(&units[1].path, "[1, 2]").unwrap();

        let summary = run_archive_cycle(&archiver, &units).await;
        assert_eq!(summary.failures, 1);
        assert!(matches!(summary.per_unit["bet365/live"], UnitOutcome::Failed(_)));
        assert_eq!(summary.per_unit["bet365/pregame"], UnitOutcome::Retired(0));
    }
}
