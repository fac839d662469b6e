use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::StoreError;

/// Keys a scraper may use for the scheduled kick-off.
const START_TIME_KEYS: &[&str] = &["start_time", "commence_time", "startTime"];
/// Keys a scraper may use for its last refresh of a live match.
const LAST_UPDATED_KEYS: &[&str] = &["last_updated", "lastUpdated", "updated_at"];

/// Epoch values above this are milliseconds, not seconds.
const EPOCH_MILLIS_CUTOFF: f64 = 1e12;

/// Result of reading an optional, loosely-typed field off a scraped record.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    /// Present and understood
    Valid(T),
    /// Present but could not be interpreted (raw text kept for logging)
    Invalid(String),
    /// Missing or null
    Absent,
}

/// Which active collection a match lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Pregame,
    Live,
}

impl MatchKind {
    pub const ALL: [MatchKind; 2] = [MatchKind::Pregame, MatchKind::Live];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchKind::Pregame => "pregame",
            MatchKind::Live => "live",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a match was moved to history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Pregame match whose start time has passed
    PastStartTime,
    /// Live match with a terminal status
    Completed,
    /// Live match not refreshed within the staleness window
    StaleLive,
}

impl RetireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetireReason::PastStartTime => "past_start_time",
            RetireReason::Completed => "completed",
            RetireReason::StaleLive => "stale_live",
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scraped match. The underlying JSON object is kept whole so
/// source-specific fields (teams, odds, league) survive a rewrite untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Match(Map<String, Value>);

impl Match {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Match(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Source-scoped id, rendered as text whether the feed used a string or a number.
    pub fn id(&self) -> Option<String> {
        match self.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn start_time(&self) -> Field<DateTime<Utc>> {
        self.timestamp_field(START_TIME_KEYS)
    }

    pub fn last_updated(&self) -> Field<DateTime<Utc>> {
        self.timestamp_field(LAST_UPDATED_KEYS)
    }

    pub fn moved_to_history_at(&self) -> Field<DateTime<Utc>> {
        self.timestamp_field(&["moved_to_history_at"])
    }

    pub fn status(&self) -> Field<String> {
        match self.get("status") {
            None => Field::Absent,
            Some(Value::String(s)) => Field::Valid(s.trim().to_string()),
            Some(other) => Field::Invalid(other.to_string()),
        }
    }

    pub fn reason(&self) -> Option<RetireReason> {
        self.get("reason")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Mark the record as archived. Called exactly once, on the way into history.
    pub fn stamp_retired(&mut self, now: DateTime<Utc>, reason: RetireReason) {
        self.0.insert(
            "moved_to_history_at".to_string(),
            Value::String(now.to_rfc3339()),
        );
        self.0
            .insert("reason".to_string(), Value::String(reason.as_str().to_string()));
    }

    fn timestamp_field(&self, keys: &[&str]) -> Field<DateTime<Utc>> {
        let Some(value) = keys.iter().find_map(|k| self.get(k)) else {
            return Field::Absent;
        };
        match parse_timestamp(value) {
            Some(ts) => Field::Valid(ts),
            None => Field::Invalid(value.to_string()),
        }
    }
}

/// Interpret a JSON value as a UTC timestamp: ISO-8601 text (with or without
/// an offset, or date-only) or a numeric epoch in seconds or milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // Naive forms are taken as UTC; a bare trailing Z is the same thing.
    let naive = s.strip_suffix('Z').unwrap_or(s);
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    // Numeric text only counts as an epoch when it is long enough to be one;
    // otherwise "2024" would land in 1970.
    if s.len() >= 9 && s.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return s.parse::<f64>().ok().and_then(from_epoch);
    }
    None
}

/// `deserialize_with` helper for bookkeeping stamps: anything
/// `parse_timestamp` understands, otherwise `None`.
pub fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_timestamp))
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value > EPOCH_MILLIS_CUTOFF {
        return DateTime::from_timestamp_millis(value as i64);
    }
    let secs = value.trunc() as i64;
    let nanos = (value.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Where a feed keeps its `matches` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// `{ "matches": [...] }`
    TopLevel,
    /// `{ "data": { "matches": [...] } }`
    Nested,
}

/// One per-source active collection file, decoded just far enough to reach
/// the matches. Everything else in the document is carried through as-is.
#[derive(Debug, Clone)]
pub struct ActiveCollection {
    root: Map<String, Value>,
    layout: Layout,
    matches: Vec<Match>,
}

impl ActiveCollection {
    pub fn from_value(path: &Path, value: Value) -> Result<Self, StoreError> {
        let Value::Object(mut root) = value else {
            return Err(StoreError::integrity(path, "document root is not an object"));
        };

        let layout = if matches!(root.get("matches"), Some(Value::Array(_))) {
            Layout::TopLevel
        } else if matches!(
            root.get("data").and_then(|d| d.get("matches")),
            Some(Value::Array(_))
        ) {
            Layout::Nested
        } else {
            return Err(StoreError::integrity(path, "no matches array"));
        };

        let raw = match layout {
            Layout::TopLevel => root.remove("matches"),
            Layout::Nested => root
                .get_mut("data")
                .and_then(Value::as_object_mut)
                .and_then(|data| data.remove("matches")),
        };
        let Some(Value::Array(items)) = raw else {
            return Err(StoreError::integrity(path, "no matches array"));
        };

        let mut matches = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(m) => matches.push(Match::from_map(m)),
                other => {
                    return Err(StoreError::integrity(
                        path,
                        format!("matches[{i}] is not an object: {other}"),
                    ))
                }
            }
        }

        Ok(ActiveCollection {
            root,
            layout,
            matches,
        })
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn take_matches(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.matches)
    }

    pub fn set_matches(&mut self, matches: Vec<Match>) {
        self.matches = matches;
    }

    /// Reassemble the document, refreshing `metadata.total_matches` and
    /// `metadata.last_cleaned`.
    pub fn into_value(self, cleaned_at: DateTime<Utc>) -> Value {
        let ActiveCollection {
            mut root,
            layout,
            matches,
        } = self;
        let total = matches.len();
        let array = Value::Array(matches.into_iter().map(|m| Value::Object(m.0)).collect());

        match layout {
            Layout::TopLevel => {
                root.insert("matches".to_string(), array);
            }
            Layout::Nested => {
                if let Some(Value::Object(data)) = root.get_mut("data") {
                    data.insert("matches".to_string(), array);
                }
            }
        }

        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        if let Value::Object(meta) = metadata {
            meta.insert("total_matches".to_string(), Value::from(total));
            meta.insert(
                "last_cleaned".to_string(),
                Value::String(cleaned_at.to_rfc3339()),
            );
        }

        Value::Object(root)
    }
}

/// Retired matches for one source, split by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPartition {
    #[serde(default)]
    pub pregame: Vec<Match>,
    #[serde(default)]
    pub live: Vec<Match>,
    /// Keys written by other tools, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryPartition {
    pub fn kind(&self, kind: MatchKind) -> &Vec<Match> {
        match kind {
            MatchKind::Pregame => &self.pregame,
            MatchKind::Live => &self.live,
        }
    }

    pub fn kind_mut(&mut self, kind: MatchKind) -> &mut Vec<Match> {
        match kind {
            MatchKind::Pregame => &mut self.pregame,
            MatchKind::Live => &mut self.live,
        }
    }

    pub fn len(&self) -> usize {
        self.pregame.len() + self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pregame.is_empty() && self.live.is_empty() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryMetadata {
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Derived: sum of every partition length at save time
    #[serde(default)]
    pub total_matches: usize,
}

/// The shared archive of retired matches, keyed by source then kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFile {
    #[serde(default)]
    pub metadata: HistoryMetadata,
    #[serde(default)]
    pub matches: BTreeMap<String, HistoryPartition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryFile {
    pub fn new(now: DateTime<Utc>) -> Self {
        HistoryFile {
            metadata: HistoryMetadata {
                created_at: Some(now),
                last_updated: Some(now),
                total_matches: 0,
            },
            matches: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn partition_mut(&mut self, source: &str, kind: MatchKind) -> &mut Vec<Match> {
        self.matches
            .entry(source.to_string())
            .or_default()
            .kind_mut(kind)
    }

    pub fn total(&self) -> usize {
        self.matches.values().map(HistoryPartition::len).sum()
    }

    /// Recompute the derived metadata. Must run before every save.
    pub fn refresh_metadata(&mut self, now: DateTime<Utc>) {
        self.metadata.created_at.get_or_insert(now);
        self.metadata.last_updated = Some(now);
        self.metadata.total_matches = self.total();
    }
}
