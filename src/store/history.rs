use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::models::{Field, HistoryFile, Match, MatchKind};
use super::{read_json_object, write_json_atomic, StoreError};

/// Handle to the shared history file.
///
/// Clones share one mutex, so every load-modify-save cycle on the file is
/// serialized across all archiver invocations in the process.
#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<HistoryInner>,
}

struct HistoryInner {
    path: PathBuf,
    lock: Mutex<()>,
}

/// Summary of what the history file holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total_matches: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    /// source → kind → count
    pub by_source: BTreeMap<String, BTreeMap<MatchKind, usize>>,
    /// reason code → count ("unknown" when the stamp is missing)
    pub by_reason: BTreeMap<String, usize>,
}

impl HistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        HistoryStore {
            inner: Arc::new(HistoryInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is the file, not the unit value; a panic in another
        // holder leaves nothing half-updated in memory.
        self.inner
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, now: DateTime<Utc>) -> Result<HistoryFile, StoreError> {
        Ok(read_json_object(self.path())?.unwrap_or_else(|| HistoryFile::new(now)))
    }

    fn save(&self, history: &mut HistoryFile, now: DateTime<Utc>) -> Result<(), StoreError> {
        history.refresh_metadata(now);
        write_json_atomic(self.path(), history)
    }

    /// Append already-stamped matches to the `source × kind` partition.
    /// Returns the number appended; an empty batch never touches the file.
    pub fn append(
        &self,
        source: &str,
        kind: MatchKind,
        retired: Vec<Match>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if retired.is_empty() {
            return Ok(0);
        }
        let count = retired.len();

        let _guard = self.lock();
        let mut history = self.load(now)?;
        history.partition_mut(source, kind).extend(retired);
        self.save(&mut history, now)?;

        debug!(
            "History: +{} {}/{} (total {})",
            count, source, kind, history.metadata.total_matches
        );
        Ok(count)
    }

    pub fn stats(&self) -> Result<HistoryStats, StoreError> {
        let _guard = self.lock();
        let Some(history) = read_json_object::<HistoryFile>(self.path())? else {
            return Ok(HistoryStats::default());
        };

        let mut stats = HistoryStats {
            total_matches: history.total(),
            created_at: history.metadata.created_at,
            last_updated: history.metadata.last_updated,
            ..Default::default()
        };
        for (source, partition) in &history.matches {
            let per_kind = stats.by_source.entry(source.clone()).or_default();
            for kind in MatchKind::ALL {
                let matches = partition.kind(kind);
                per_kind.insert(kind, matches.len());
                for m in matches {
                    let reason = m
                        .reason()
                        .map(|r| r.as_str().to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    *stats.by_reason.entry(reason).or_default() += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Drop archived matches retired before `cutoff`. Records without a
    /// readable `moved_to_history_at` are kept. The file is rewritten only
    /// when something was removed.
    pub fn prune_older_than(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock();
        let Some(mut history) = read_json_object::<HistoryFile>(self.path())? else {
            return Ok(0);
        };

        let before = history.total();
        for partition in history.matches.values_mut() {
            for kind in MatchKind::ALL {
                partition.kind_mut(kind).retain(|m| match m.moved_to_history_at() {
                    Field::Valid(at) => at >= cutoff,
                    Field::Invalid(_) | Field::Absent => true,
                });
            }
        }
        history.matches.retain(|_, p| !p.is_empty());

        let removed = before - history.total();
        if removed > 0 {
            self.save(&mut history, now)?;
            info!(
                "Pruned {} history entries retired before {}",
                removed,
                cutoff.to_rfc3339()
            );
        }
        Ok(removed)
    }
}
