use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::classifier::{classify, Disposition, StalenessPolicy};
use crate::store::models::{ActiveCollection, Match, MatchKind};
use crate::store::{read_json, write_json_atomic, HistoryStore, StoreError};

/// One active collection file: a bookmaker feed of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveUnit {
    pub source: String,
    pub kind: MatchKind,
    pub path: PathBuf,
}

impl ArchiveUnit {
    /// `<data_dir>/<source>_<kind>_matches.json`
    pub fn in_dir(data_dir: &Path, source: &str, kind: MatchKind) -> Self {
        ArchiveUnit {
            source: source.to_string(),
            kind,
            path: data_dir.join(format!("{}_{}_matches.json", source, kind)),
        }
    }

    /// Every kind for every source, in source order.
    pub fn for_sources(data_dir: &Path, sources: &[String]) -> Vec<Self> {
        sources
            .iter()
            .flat_map(|s| MatchKind::ALL.map(|k| ArchiveUnit::in_dir(data_dir, s, k)))
            .collect()
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.source, self.kind)
    }
}

/// Result of archiving one unit, as reported in the run summary
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Retired(usize),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub per_unit: BTreeMap<String, UnitOutcome>,
    pub total_retired: usize,
    pub failures: usize,
}

impl RunSummary {
    pub fn record(&mut self, unit: &ArchiveUnit, result: Result<usize, StoreError>) {
        let outcome = match result {
            Ok(n) => {
                self.total_retired += n;
                UnitOutcome::Retired(n)
            }
            Err(e) => {
                if e.is_integrity() {
                    error!("{} left untouched, fix the file by hand: {}", unit.label(), e);
                } else {
                    error!("Archiving {} failed: {}", unit.label(), e);
                }
                self.failures += 1;
                UnitOutcome::Failed(e.to_string())
            }
        };
        self.per_unit.insert(unit.label(), outcome);
    }

    pub fn log(&self) {
        for (label, outcome) in &self.per_unit {
            match outcome {
                UnitOutcome::Retired(0) => debug!("  {}: nothing to retire", label),
                UnitOutcome::Retired(n) => info!("  {}: retired {}", label, n),
                UnitOutcome::Failed(e) => error!("  {}: FAILED ({})", label, e),
            }
        }
        info!(
            "Archive run: {} match(es) retired across {} unit(s), {} failure(s)",
            self.total_retired,
            self.per_unit.len(),
            self.failures
        );
    }
}

/// Moves finished or stale matches from active collections into history.
#[derive(Clone)]
pub struct Archiver {
    history: HistoryStore,
    policy: StalenessPolicy,
}

impl Archiver {
    pub fn new(history: HistoryStore, policy: StalenessPolicy) -> Self {
        Archiver { history, policy }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Archive one unit and return how many matches were retired.
    ///
    /// A missing active file is zero work. A present but malformed file is a
    /// data-integrity error. Neither file is touched when nothing retires.
    pub fn archive_unit(&self, unit: &ArchiveUnit, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let Some(doc) = read_json::<serde_json::Value>(&unit.path)? else {
            debug!("{}: no active file at {}", unit.label(), unit.path.display());
            return Ok(0);
        };
        let mut collection = ActiveCollection::from_value(&unit.path, doc)?;
        debug!("{}: checking {} match(es)", unit.label(), collection.matches().len());

        let (active, retired) = partition(collection.take_matches(), unit.kind, now, &self.policy);
        if retired.is_empty() {
            return Ok(0);
        }
        let count = retired.len();

        // History first: if the active rewrite then fails, the next run
        // re-archives the same records instead of losing them.
        self.history.append(&unit.source, unit.kind, retired, now)?;

        let remaining = active.len();
        collection.set_matches(active);
        write_json_atomic(&unit.path, &collection.into_value(now))?;

        info!(
            "{}: retired {} match(es), {} still active",
            unit.label(),
            count,
            remaining
        );
        Ok(count)
    }

    /// Sequentially archive every unit. One unit failing does not stop the rest.
    pub fn archive_all(&self, units: &[ArchiveUnit], now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::default();
        for unit in units {
            summary.record(unit, self.archive_unit(unit, now));
        }
        summary
    }
}

/// Split matches into (kept, retired); retired ones come back stamped.
fn partition(
    matches: Vec<Match>,
    kind: MatchKind,
    now: DateTime<Utc>,
    policy: &StalenessPolicy,
) -> (Vec<Match>, Vec<Match>) {
    let mut active = Vec::with_capacity(matches.len());
    let mut retired = Vec::new();
    for mut m in matches {
        match classify(&m, kind, now, policy) {
            Disposition::Keep => active.push(m),
            Disposition::Retire(reason) => {
                m.stamp_retired(now, reason);
                retired.push(m);
            }
        }
    }
    (active, retired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Value};
    use std::fs;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Archiver) {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::open(dir.path().join("match_history.json"));
        (dir, Archiver::new(history, StalenessPolicy::default()))
    }

    fn write(path: &Path, v: Value) {
        fs::write(path, serde_json::to_string_pretty(&v).unwrap()).unwrap();
    }

    fn modified(path: &Path) -> std::time::SystemTime {
        fs::metadata(path).unwrap().modified().unwrap()
    }

    fn read(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_unit_paths() {
        let units = ArchiveUnit::for_sources(Path::new("data"), &["1xbet".into(), "bet365".into()]);
        let labels: Vec<String> = units.iter().map(ArchiveUnit::label).collect();
        assert_eq!(labels, ["1xbet/pregame", "1xbet/live", "bet365/pregame", "bet365/live"]);
        assert_eq!(units[1].path, Path::new("data/1xbet_live_matches.json"));
    }

    #[test]
    fn test_pregame_scenario_past_and_future() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "oddsmagnet", MatchKind::Pregame);
        write(
            &unit.path,
            json!({"matches": [
                {"id": "A", "start_time": "2020-01-01T00:00:00"},
                {"id": "B", "start_time": "2999-01-01T00:00:00"}
            ]}),
        );

        assert_eq!(archiver.archive_unit(&unit, now()).unwrap(), 1);

        let active = read(&unit.path);
        assert_eq!(active["matches"].as_array().unwrap().len(), 1);
        assert_eq!(active["matches"][0]["id"], "B");
        assert_eq!(active["metadata"]["total_matches"], 1);
        assert!(active["metadata"]["last_cleaned"].is_string());

        let history = read(archiver.history().path());
        let moved = &history["matches"]["oddsmagnet"]["pregame"];
        assert_eq!(moved.as_array().unwrap().len(), 1);
        assert_eq!(moved[0]["id"], "A");
        assert_eq!(moved[0]["reason"], "past_start_time");
        assert!(moved[0]["moved_to_history_at"].is_string());
        assert_eq!(history["metadata"]["total_matches"], 1);
    }

    #[test]
    fn test_second_run_retires_nothing_and_leaves_files_alone() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "bet365", MatchKind::Live);
        write(
            &unit.path,
            json!({"matches": [
                {"id": 1, "status": "Finished"},
                {"id": 2, "status": "live", "last_updated": (now() - Duration::minutes(31)).to_rfc3339()},
                {"id": 3, "status": "live", "last_updated": (now() - Duration::minutes(29)).to_rfc3339()},
                {"id": 4, "status": "live"},
            ]}),
        );

        assert_eq!(archiver.archive_unit(&unit, now()).unwrap(), 2);
        let active_after_first = fs::read_to_string(&unit.path).unwrap();
        let history_after_first = fs::read_to_string(archiver.history().path()).unwrap();
        let active_mtime = modified(&unit.path);
        let history_mtime = modified(archiver.history().path());

        // Still inside match 3's window, but late enough that any rewrite
        // would carry a different last_cleaned stamp.
        let later = now() + Duration::seconds(30);
        assert_eq!(archiver.archive_unit(&unit, later).unwrap(), 0);
        assert_eq!(fs::read_to_string(&unit.path).unwrap(), active_after_first);
        assert_eq!(
            fs::read_to_string(archiver.history().path()).unwrap(),
            history_after_first
        );
        assert_eq!(modified(&unit.path), active_mtime);
        assert_eq!(modified(archiver.history().path()), history_mtime);

        let history = read(archiver.history().path());
        let live = history["matches"]["bet365"]["live"].as_array().unwrap().clone();
        let reasons: Vec<&str> = live.iter().map(|m| m["reason"].as_str().unwrap()).collect();
        assert_eq!(reasons, ["completed", "stale_live"]);
    }

    #[test]
    fn test_n_minus_k_remaining() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "fanduel", MatchKind::Pregame);
        let matches: Vec<Value> = (0..10)
            .map(|i| {
                let start = if i % 3 == 0 { "2019-06-01" } else { "2030-06-01" };
                json!({"id": i, "start_time": start, "odds": {"home": 1.9}})
            })
            .collect();
        write(&unit.path, json!({"matches": matches}));

        let k = archiver.archive_unit(&unit, now()).unwrap();
        assert_eq!(k, 4);
        assert_eq!(read(&unit.path)["matches"].as_array().unwrap().len(), 6);
        assert_eq!(archiver.history().stats().unwrap().total_matches, 4);
    }

    #[test]
    fn test_nested_data_matches_layout() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "1xbet", MatchKind::Live);
        write(
            &unit.path,
            json!({"data": {"matches": [{"id": "x", "status": "ended"}, {"id": "y"}]}}),
        );

        assert_eq!(archiver.archive_unit(&unit, now()).unwrap(), 1);
        let active = read(&unit.path);
        assert_eq!(active["data"]["matches"], json!([{"id": "y"}]));
        assert_eq!(active["metadata"]["total_matches"], 1);
    }

    #[test]
    fn test_missing_active_file_is_noop() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "bet365", MatchKind::Pregame);
        assert_eq!(archiver.archive_unit(&unit, now()).unwrap(), 0);
        assert!(!unit.path.exists());
        assert!(!archiver.history().path().exists());
    }

    #[test]
    fn test_malformed_active_file_is_surfaced() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "bet365", MatchKind::Pregame);
        fs::write(&unit.path, "{\"matches\": [").unwrap();

        let err = archiver.archive_unit(&unit, now()).unwrap_err();
        assert!(err.is_integrity());
        assert!(!archiver.history().path().exists());
    }

    #[test]
    fn test_corrupt_records_do_not_cause_retirement() {
        let (dir, archiver) = setup();
        let unit = ArchiveUnit::in_dir(dir.path(), "oddsportal", MatchKind::Pregame);
        write(
            &unit.path,
            json!({"matches": [
                {"id": 1, "start_time": "not a date"},
                {"id": 2, "start_time": null},
                {"id": 3},
            ]}),
        );
        let before = fs::read_to_string(&unit.path).unwrap();
        let mtime = modified(&unit.path);

        assert_eq!(archiver.archive_unit(&unit, now()).unwrap(), 0);
        assert_eq!(fs::read_to_string(&unit.path).unwrap(), before);
        assert_eq!(modified(&unit.path), mtime);
        assert!(!archiver.history().path().exists());
    }

    #[test]
    fn test_archive_all_isolates_failures() {
        let (dir, archiver) = setup();
        let units = ArchiveUnit::for_sources(dir.path(), &["good".into(), "bad".into()]);
        write(
            &units[0].path,
            json!({"matches": [{"id": "A", "start_time": "2020-01-01"}]}),
        );
        fs::write(&units[2].path, "not json at all").unwrap();

        let summary = archiver.archive_all(&units, now());
        assert_eq!(summary.total_retired, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.per_unit["good/pregame"], UnitOutcome::Retired(1));
        assert_eq!(summary.per_unit["good/live"], UnitOutcome::Retired(0));
        assert!(matches!(summary.per_unit["bad/pregame"], UnitOutcome::Failed(_)));
        assert_eq!(summary.per_unit["bad/live"], UnitOutcome::Retired(0));
    }
}
