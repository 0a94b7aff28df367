use std::cmp::Reverse;

use schema::HOUR_MS;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    DEFAULT_DAY_UTC_OFFSET_MINUTES, DerivationConfigError, SubjectStats, TransitState, local_day,
    validate_utc_offset,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtRiskThresholds {
    pub transit_threshold_ms: i64,
    pub inactivity_threshold_ms: i64,
    /// Laps on the current local day after which an idle subject counts as done.
    pub daily_lap_target: u32,
    pub day_utc_offset_minutes: i32,
}

impl Default for AtRiskThresholds {
    fn default() -> Self {
        Self {
            transit_threshold_ms: 5 * HOUR_MS,
            inactivity_threshold_ms: 5 * HOUR_MS,
            daily_lap_target: 1,
            day_utc_offset_minutes: DEFAULT_DAY_UTC_OFFSET_MINUTES,
        }
    }
}

impl AtRiskThresholds {
    pub fn validate(&self) -> Result<(), DerivationConfigError> {
        validate_utc_offset(self.day_utc_offset_minutes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtRiskReason {
    /// Descent started and nothing has been scanned since for too long.
    OverdueInTransit,
    /// Scanned today, not done for the day, and silent for too long.
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtRiskSubject {
    pub subject_id: Uuid,
    pub reason: AtRiskReason,
    pub transit_state: TransitState,
    pub last_event_at: i64,
    pub elapsed_ms: i64,
    /// Elapsed time beyond the threshold that triggered the flag.
    pub overdue_ms: i64,
    pub laps_completed: u32,
}

/// Flags overdue subjects, most overdue first, ties broken by subject id.
///
/// The comparison against each threshold is strict: a subject exactly at the
/// threshold is not yet flagged.
pub fn detect_at_risk<'a>(
    stats: impl IntoIterator<Item = &'a SubjectStats>,
    thresholds: &AtRiskThresholds,
    now_ms: i64,
) -> Vec<AtRiskSubject> {
    let today = local_day(now_ms, thresholds.day_utc_offset_minutes);
    let mut flagged: Vec<AtRiskSubject> = stats
        .into_iter()
        .filter_map(|subject| evaluate(subject, thresholds, now_ms, today))
        .collect();
    flagged.sort_by_key(|entry| (Reverse(entry.overdue_ms), entry.subject_id));
    flagged
}

fn evaluate(
    stats: &SubjectStats,
    thresholds: &AtRiskThresholds,
    now_ms: i64,
    today: i64,
) -> Option<AtRiskSubject> {
    if !stats.has_started() {
        return None;
    }
    let last_event_at = stats.last_event_at?;
    let elapsed_ms = now_ms.saturating_sub(last_event_at);

    let transit = (stats.transit_state == TransitState::Descending
        && elapsed_ms > thresholds.transit_threshold_ms)
        .then(|| {
            (
                AtRiskReason::OverdueInTransit,
                elapsed_ms - thresholds.transit_threshold_ms,
            )
        });

    // A subject whose last scan fell on an earlier local day has not started today.
    let started_today = local_day(last_event_at, thresholds.day_utc_offset_minutes) == today;
    let finished_for_day = stats.transit_state == TransitState::Idle
        && stats.laps_on_day(today) >= thresholds.daily_lap_target;
    let inactive = (started_today
        && !finished_for_day
        && elapsed_ms > thresholds.inactivity_threshold_ms)
        .then(
        || {
            (
                AtRiskReason::Inactive,
                elapsed_ms - thresholds.inactivity_threshold_ms,
            )
        },
    );

    let (reason, overdue_ms) = match (transit, inactive) {
        (Some(t), Some(i)) if i.1 > t.1 => i,
        (Some(t), _) => t,
        (None, Some(i)) => i,
        (None, None) => return None,
    };
    Some(AtRiskSubject {
        subject_id: stats.subject_id,
        reason,
        transit_state: stats.transit_state,
        last_event_at,
        elapsed_ms,
        overdue_ms,
        laps_completed: stats.laps_completed,
    })
}
