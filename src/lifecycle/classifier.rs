use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::store::models::{Field, Match, MatchKind, RetireReason};

/// Statuses that mean a live match is over, compared case-insensitively.
pub const TERMINAL_STATUSES: &[&str] = &["completed", "finished", "ended", "final"];

/// Default heartbeat window for live matches.
pub const DEFAULT_LIVE_STALE_MINUTES: i64 = 30;

/// Decision made by the classifier for one match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stay in the active collection
    Keep,
    /// Move to history with the given reason
    Retire(RetireReason),
}

#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    /// A live match not refreshed for longer than this is retired
    pub live_stale_after: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        StalenessPolicy {
            live_stale_after: Duration::minutes(DEFAULT_LIVE_STALE_MINUTES),
        }
    }
}

impl StalenessPolicy {
    /// Out-of-range windows fall back to the default.
    pub fn with_live_minutes(minutes: i64) -> Self {
        match Duration::try_minutes(minutes) {
            Some(live_stale_after) => StalenessPolicy { live_stale_after },
            None => StalenessPolicy::default(),
        }
    }
}

/// A pregame match is stale once `now` is strictly past its start time.
/// Missing or unparsable start times keep the match.
pub fn is_stale_pregame(m: &Match, now: DateTime<Utc>) -> bool {
    match m.start_time() {
        Field::Valid(start) => now > start,
        Field::Invalid(raw) => {
            debug!("Unparsable start time {} on match {:?}; keeping", raw, m.id());
            false
        }
        Field::Absent => false,
    }
}

/// True when the status is terminal. Absent or non-text statuses are not.
pub fn has_terminal_status(m: &Match) -> bool {
    match m.status() {
        Field::Valid(status) => TERMINAL_STATUSES
            .iter()
            .any(|t| status.eq_ignore_ascii_case(t)),
        Field::Invalid(raw) => {
            debug!("Non-text status {} on match {:?}; ignoring", raw, m.id());
            false
        }
        Field::Absent => false,
    }
}

/// True when the last refresh is more than `stale_after` before `now`.
/// Without a usable timestamp the match is treated as still live.
pub fn is_heartbeat_expired(m: &Match, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match m.last_updated() {
        Field::Valid(updated) => now - updated > stale_after,
        Field::Invalid(raw) => {
            debug!("Unparsable last_updated {} on match {:?}; keeping", raw, m.id());
            false
        }
        Field::Absent => false,
    }
}

pub fn is_completed_or_stale_live(m: &Match, now: DateTime<Utc>, stale_after: Duration) -> bool {
    has_terminal_status(m) || is_heartbeat_expired(m, now, stale_after)
}

/// Evaluate one match from a `kind` collection.
pub fn classify(
    m: &Match,
    kind: MatchKind,
    now: DateTime<Utc>,
    policy: &StalenessPolicy,
) -> Disposition {
    match kind {
        MatchKind::Pregame if is_stale_pregame(m, now) => {
            Disposition::Retire(RetireReason::PastStartTime)
        }
        MatchKind::Live if is_completed_or_stale_live(m, now, policy.live_stale_after) => {
            // A finished match is reported as completed even if also stale.
            if has_terminal_status(m) {
                Disposition::Retire(RetireReason::Completed)
            } else {
                Disposition::Retire(RetireReason::StaleLive)
            }
        }
        _ => Disposition::Keep,
    }
}
