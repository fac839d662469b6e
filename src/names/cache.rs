use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::info;

use super::registry::{CanonicalEntity, DedupeReport, NameRegistry, RegistryReport};
use crate::store::models::lenient_timestamp;
use crate::store::{read_json_object, write_json_atomic, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Team,
    League,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Team => "team",
            EntityKind::League => "league",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheMetadata {
    #[serde(default, deserialize_with = "lenient_timestamp")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    total_teams: usize,
    #[serde(default)]
    total_leagues: usize,
}

/// On-disk layout of the name cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    metadata: CacheMetadata,
    #[serde(default)]
    teams: BTreeMap<String, CanonicalEntity>,
    #[serde(default)]
    leagues: BTreeMap<String, CanonicalEntity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheDedupeReport {
    pub teams: DedupeReport,
    pub leagues: DedupeReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    pub last_updated: Option<DateTime<Utc>>,
    pub teams: RegistryReport,
    pub leagues: RegistryReport,
}

/// Team and league registries, loaded from and saved to one JSON file.
#[derive(Debug, Clone, Default)]
pub struct NameCache {
    pub teams: NameRegistry,
    pub leagues: NameRegistry,
    last_updated: Option<DateTime<Utc>>,
}

impl NameCache {
    pub fn new(threshold: f64) -> Self {
        NameCache {
            teams: NameRegistry::new(threshold),
            leagues: NameRegistry::new(threshold),
            last_updated: None,
        }
    }

    /// Missing file → empty cache. Malformed file → data-integrity error.
    pub fn load(path: &Path, threshold: f64) -> Result<Self, StoreError> {
        let Some(file) = read_json_object::<CacheFile>(path)? else {
            info!("No name cache at {}; starting empty", path.display());
            return Ok(NameCache::new(threshold));
        };

        let cache = NameCache {
            teams: NameRegistry::from_entities(file.teams, threshold),
            leagues: NameRegistry::from_entities(file.leagues, threshold),
            last_updated: file.metadata.last_updated,
        };
        info!(
            "Loaded name cache: {} teams, {} leagues",
            cache.teams.len(),
            cache.leagues.len()
        );
        Ok(cache)
    }

    pub fn save(&mut self, path: &Path, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.last_updated = Some(now);
        let file = CacheFile {
            metadata: CacheMetadata {
                last_updated: Some(now),
                total_teams: self.teams.len(),
                total_leagues: self.leagues.len(),
            },
            teams: self.teams.entities().clone(),
            leagues: self.leagues.entities().clone(),
        };
        write_json_atomic(path, &file)
    }

    pub fn registry_mut(&mut self, kind: EntityKind) -> &mut NameRegistry {
        match kind {
            EntityKind::Team => &mut self.teams,
            EntityKind::League => &mut self.leagues,
        }
    }

    pub fn deduplicate(&mut self) -> CacheDedupeReport {
        CacheDedupeReport {
            teams: self.teams.deduplicate(),
            leagues: self.leagues.deduplicate(),
        }
    }

    pub fn report(&self, top: usize) -> CacheReport {
        CacheReport {
            last_updated: self.last_updated,
            teams: self.teams.report(top),
            leagues: self.leagues.report(top),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::registry::{ResolveOutcome, DEFAULT_SIMILARITY_THRESHOLD};
    use chrono::TimeZone;
    use std::fs;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_cache_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NameCache::load(&dir.path().join("names.json"), 0.9).unwrap();
        assert!(cache.teams.is_empty());
        assert!(cache.leagues.is_empty());
    }

    #[test]
    fn test_malformed_cache_is_integrity_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        fs::write(&path, r#"{"teams": ["not", "a", "map"]}"#).unwrap();
        let err = NameCache::load(&path, 0.9).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_array_cache_is_integrity_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");
        fs::write(&path, "[]").unwrap();
        let err = NameCache::load(&path, 0.9).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_save_and_reload_keeps_aliases_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.json");

        let mut cache = NameCache::new(DEFAULT_SIMILARITY_THRESHOLD);
        cache.teams.resolve("Manchester City", Some("bet365"), now());
        cache.teams.resolve("Man City", Some("fanduel"), now());
        cache
            .registry_mut(EntityKind::League)
            .resolve("Premier League", None, now());
        cache.save(&path, now()).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["metadata"]["total_teams"], 1);
        assert_eq!(raw["metadata"]["total_leagues"], 1);
        assert_eq!(raw["teams"]["Manchester City"]["usage_count"], 2);

        let mut reloaded = NameCache::load(&path, DEFAULT_SIMILARITY_THRESHOLD).unwrap();
        let res = reloaded.teams.resolve("MAN CITY", None, now()).unwrap();
        assert_eq!(res.canonical, "Manchester City");
        assert_eq!(res.outcome, ResolveOutcome::Known);

        let report = reloaded.report(5);
        assert_eq!(report.last_updated, Some(now()));
        assert_eq!(report.teams.total_entities, 1);
        assert_eq!(report.teams.top[0].alias_count, 2);
        assert_eq!(report.teams.top[0].sources, ["bet365", "fanduel"]);
    }

    #[test]
    fn test_deduplicate_both_namespaces() {
        let mut cache = NameCache::new(DEFAULT_SIMILARITY_THRESHOLD);
        // Created separately under a strict threshold, then merged.
        let mut strict = NameRegistry::new(0.999);
        strict.resolve("Bundesliga", None, now());
        strict.resolve("Bundesliaga", None, now());
        cache.leagues = NameRegistry::from_entities(strict.entities().clone(), DEFAULT_SIMILARITY_THRESHOLD);
        cache.teams.resolve("Chelsea", None, now());

        let report = cache.deduplicate();
        assert_eq!(report.leagues.duplicates_merged, 1);
        assert_eq!(report.leagues.entities_after, 1);
        assert_eq!(report.teams.duplicates_merged, 0);

        assert_eq!(cache.deduplicate().leagues.duplicates_merged, 0);
    }
}
