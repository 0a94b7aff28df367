//! Lap ("Jatra") derivation over a subject's scan history.
//!
//! Everything here is a pure function of its inputs: the same ordered events
//! and config always yield the same [`SubjectStats`]. Callers recompute rather
//! than patch, so the event log stays the only source of truth.

pub mod at_risk;

use std::collections::BTreeMap;

use schema::{CheckpointId, CheckpointRole, CheckpointRoute, HOUR_MS, MINUTE_MS, ScanEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use at_risk::{AtRiskReason, AtRiskSubject, AtRiskThresholds, detect_at_risk};

pub const DAY_MS: i64 = 24 * HOUR_MS;
/// India Standard Time, where the route is walked.
pub const DEFAULT_DAY_UTC_OFFSET_MINUTES: i32 = 330;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationConfigError {
    #[error("min lap duration must be positive")]
    NonPositiveMinLap,
    #[error("min lap duration {min_ms}ms exceeds max lap duration {max_ms}ms")]
    LapBoundsInverted { min_ms: i64, max_ms: i64 },
    #[error("completion lookback must be positive")]
    NonPositiveLookback,
    #[error("utc offset {0} minutes is outside +-14h")]
    UtcOffsetOutOfRange(i32),
}

#[derive(Debug, Clone)]
pub struct DerivationConfig {
    pub route: CheckpointRoute,
    pub min_lap_ms: i64,
    pub max_lap_ms: i64,
    /// A completion only closes a descent that started at most this long before it.
    pub completion_lookback_ms: i64,
    pub day_utc_offset_minutes: i32,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            route: CheckpointRoute::default(),
            min_lap_ms: 15 * MINUTE_MS,
            max_lap_ms: 180 * MINUTE_MS,
            completion_lookback_ms: 6 * HOUR_MS,
            day_utc_offset_minutes: DEFAULT_DAY_UTC_OFFSET_MINUTES,
        }
    }
}

impl DerivationConfig {
    pub fn validate(&self) -> Result<(), DerivationConfigError> {
        if self.min_lap_ms <= 0 {
            return Err(DerivationConfigError::NonPositiveMinLap);
        }
        if self.min_lap_ms > self.max_lap_ms {
            return Err(DerivationConfigError::LapBoundsInverted {
                min_ms: self.min_lap_ms,
                max_ms: self.max_lap_ms,
            });
        }
        if self.completion_lookback_ms <= 0 {
            return Err(DerivationConfigError::NonPositiveLookback);
        }
        validate_utc_offset(self.day_utc_offset_minutes)
    }
}

pub(crate) fn validate_utc_offset(minutes: i32) -> Result<(), DerivationConfigError> {
    if minutes.abs() > 14 * 60 {
        return Err(DerivationConfigError::UtcOffsetOutOfRange(minutes));
    }
    Ok(())
}

/// Days since the epoch in the walkers' local time.
pub fn local_day(timestamp_ms: i64, utc_offset_minutes: i32) -> i64 {
    timestamp_ms
        .saturating_add(i64::from(utc_offset_minutes) * MINUTE_MS)
        .div_euclid(DAY_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitState {
    NotStarted,
    Descending,
    Idle,
}

impl TransitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Descending => "descending",
            Self::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapRecord {
    pub subject_id: Uuid,
    pub lap_number: u32,
    pub start_event_id: Uuid,
    pub end_event_id: Uuid,
    pub started_at: i64,
    pub completed_at: i64,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TooFast,
    TooSlow,
    CompletionWithoutStart,
    /// A descent start was followed by another descent start before any completion.
    DescentSuperseded,
}

/// Advisory only; never blocks counting beyond what the lap rules already decide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub event_id: Uuid,
    pub occurred_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lap_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectStats {
    pub subject_id: Uuid,
    pub laps_completed: u32,
    pub transit_state: TransitState,
    pub laps: Vec<LapRecord>,
    pub anomalies: Vec<Anomaly>,
    pub first_event_at: Option<i64>,
    pub last_event_at: Option<i64>,
    pub last_checkpoint_id: Option<CheckpointId>,
    /// Completed laps keyed by [`local_day`] of the completion scan.
    pub laps_by_local_day: BTreeMap<i64, u32>,
}

impl SubjectStats {
    pub fn empty(subject_id: Uuid) -> Self {
        Self {
            subject_id,
            laps_completed: 0,
            transit_state: TransitState::NotStarted,
            laps: Vec::new(),
            anomalies: Vec::new(),
            first_event_at: None,
            last_event_at: None,
            last_checkpoint_id: None,
            laps_by_local_day: BTreeMap::new(),
        }
    }

    pub fn laps_on_day(&self, day: i64) -> u32 {
        self.laps_by_local_day.get(&day).copied().unwrap_or(0)
    }

    pub fn has_started(&self) -> bool {
        self.transit_state != TransitState::NotStarted
    }
}

/// Derives stats from one subject's events.
///
/// Events are expected in log order (ascending `occurred_at`, insertion
/// order on ties); they are stable-sorted by `occurred_at` again here so a
/// caller merging several sources cannot break determinism. Events for other
/// subjects are ignored.
pub fn derive_subject_stats(
    subject_id: Uuid,
    events: &[ScanEvent],
    config: &DerivationConfig,
) -> SubjectStats {
    let mut ordered: Vec<&ScanEvent> = events
        .iter()
        .filter(|event| event.subject_id == subject_id)
        .collect();
    ordered.sort_by_key(|event| event.occurred_at);

    let mut stats = SubjectStats::empty(subject_id);
    let mut descent: Option<&ScanEvent> = None;

    for event in ordered.iter().copied() {
        match config.route.role(event.checkpoint_id) {
            Some(CheckpointRole::DescentStart) => {
                if let Some(previous) = descent.replace(event) {
                    stats.anomalies.push(Anomaly {
                        kind: AnomalyKind::DescentSuperseded,
                        event_id: previous.id,
                        occurred_at: previous.occurred_at,
                        lap_number: None,
                    });
                }
            }
            Some(CheckpointRole::LapCompletion) => match descent.take() {
                Some(start)
                    if event.occurred_at - start.occurred_at <= config.completion_lookback_ms =>
                {
                    close_lap(&mut stats, start, event, config);
                }
                _ => stats.anomalies.push(Anomaly {
                    kind: AnomalyKind::CompletionWithoutStart,
                    event_id: event.id,
                    occurred_at: event.occurred_at,
                    lap_number: None,
                }),
            },
            Some(CheckpointRole::Waypoint) | None => {}
        }
    }

    if let (Some(first), Some(last)) = (ordered.first(), ordered.last()) {
        stats.first_event_at = Some(first.occurred_at);
        stats.last_event_at = Some(last.occurred_at);
        stats.last_checkpoint_id = Some(last.checkpoint_id);
        stats.transit_state = if descent.is_some() {
            TransitState::Descending
        } else {
            TransitState::Idle
        };
    }
    stats
}

fn close_lap(
    stats: &mut SubjectStats,
    start: &ScanEvent,
    end: &ScanEvent,
    config: &DerivationConfig,
) {
    let duration_ms = end.occurred_at - start.occurred_at;
    let lap_number = stats.laps_completed + 1;
    stats.laps_completed = lap_number;
    stats.laps.push(LapRecord {
        subject_id: stats.subject_id,
        lap_number,
        start_event_id: start.id,
        end_event_id: end.id,
        started_at: start.occurred_at,
        completed_at: end.occurred_at,
        duration_minutes: duration_ms / MINUTE_MS,
    });
    *stats
        .laps_by_local_day
        .entry(local_day(end.occurred_at, config.day_utc_offset_minutes))
        .or_insert(0) += 1;

    let kind = if duration_ms < config.min_lap_ms {
        Some(AnomalyKind::TooFast)
    } else if duration_ms > config.max_lap_ms {
        Some(AnomalyKind::TooSlow)
    } else {
        None
    };
    if let Some(kind) = kind {
        stats.anomalies.push(Anomaly {
            kind,
            event_id: end.id,
            occurred_at: end.occurred_at,
            lap_number: Some(lap_number),
        });
    }
}
