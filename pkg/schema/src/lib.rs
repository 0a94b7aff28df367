use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type CheckpointId = i16;

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const MAX_DEVICE_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Core domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// One badge scan at one checkpoint. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    /// Client-generated UUIDv4; retries of the same capture reuse it.
    pub id: Uuid,
    pub subject_id: Uuid,
    pub checkpoint_id: CheckpointId,
    pub origin_device_id: String,
    /// Epoch-millis on the capturing device's clock.
    pub occurred_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_hint: Option<GeoPoint>,
}

impl ScanEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            subject_id: self.subject_id,
            checkpoint_id: self.checkpoint_id,
        }
    }
}

/// The `(subject, checkpoint)` pair the duplicate window is evaluated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub subject_id: Uuid,
    pub checkpoint_id: CheckpointId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub mobile: Option<String>,
    pub emergency_contact: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalInfo {
    pub blood_group: Option<String>,
    pub age: Option<u16>,
}

/// A registered pilgrim. Owned by the registry; events only reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: Uuid,
    pub display_name: String,
    pub badge_number: u32,
    pub qr_token: String,
    #[serde(default)]
    pub contact_info: ContactInfo,
    #[serde(default)]
    pub medical_info: MedicalInfo,
    #[serde(default)]
    pub photo_uri: Option<String>,
}

/// Stable subject id for a badge, so re-importing the roster keeps references valid.
pub fn subject_id_for_badge(badge_number: u32) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("palitana-yatra-{badge_number}").as_bytes(),
    )
}

pub fn qr_token_for_badge(badge_number: u32) -> String {
    format!("PALITANA_YATRA_{badge_number}")
}

// ---------------------------------------------------------------------------
// Checkpoint route
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointRole {
    DescentStart,
    LapCompletion,
    Waypoint,
}

impl CheckpointRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DescentStart => "descent_start",
            Self::LapCompletion => "lap_completion",
            Self::Waypoint => "waypoint",
        }
    }
}

/// Which physical checkpoints play which role in a lap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRoute {
    roles: BTreeMap<CheckpointId, CheckpointRole>,
}

impl Default for CheckpointRoute {
    fn default() -> Self {
        Self::new(&[1], &[2], &[3])
    }
}

impl CheckpointRoute {
    /// Later lists win when a checkpoint is named twice, so completion beats descent.
    pub fn new(
        descent_start: &[CheckpointId],
        lap_completion: &[CheckpointId],
        waypoints: &[CheckpointId],
    ) -> Self {
        let mut roles = BTreeMap::new();
        for id in waypoints {
            roles.insert(*id, CheckpointRole::Waypoint);
        }
        for id in descent_start {
            roles.insert(*id, CheckpointRole::DescentStart);
        }
        for id in lap_completion {
            roles.insert(*id, CheckpointRole::LapCompletion);
        }
        Self { roles }
    }

    pub fn role(&self, checkpoint_id: CheckpointId) -> Option<CheckpointRole> {
        self.roles.get(&checkpoint_id).copied()
    }

    pub fn is_known(&self, checkpoint_id: CheckpointId) -> bool {
        self.roles.contains_key(&checkpoint_id)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = (CheckpointId, CheckpointRole)> + '_ {
        self.roles.iter().map(|(id, role)| (*id, *role))
    }

    pub fn summary(&self) -> String {
        self.checkpoints()
            .map(|(id, role)| format!("{id}={}", role.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ---------------------------------------------------------------------------
// Wire submission + validation
// ---------------------------------------------------------------------------

/// Untrusted scan payload as it arrives from a device or script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSubmission {
    #[serde(alias = "client_event_id")]
    pub id: Option<Uuid>,
    pub subject_id: Option<Uuid>,
    pub checkpoint_id: Option<i64>,
    pub origin_device_id: Option<String>,
    pub occurred_at: Option<i64>,
    pub location_hint: Option<GeoPoint>,
}

impl From<&ScanEvent> for ScanSubmission {
    fn from(event: &ScanEvent) -> Self {
        Self {
            id: Some(event.id),
            subject_id: Some(event.subject_id),
            checkpoint_id: Some(i64::from(event.checkpoint_id)),
            origin_device_id: Some(event.origin_device_id.clone()),
            occurred_at: Some(event.occurred_at),
            location_hint: event.location_hint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("value out of range: {0}")]
    InvalidRange(&'static str),
    #[error("unknown reference: {0}")]
    UnknownReference(&'static str),
}

/// Bounds applied at the ingestion boundary.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub route: CheckpointRoute,
    /// How far ahead of the validator's clock an `occurred_at` may be.
    pub max_future_skew_ms: i64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            route: CheckpointRoute::default(),
            max_future_skew_ms: 10 * MINUTE_MS,
        }
    }
}

pub fn validate_submission(
    submission: &ScanSubmission,
    rules: &ValidationRules,
    now_ms: i64,
) -> Result<ScanEvent, ValidationError> {
    let id = submission.id.ok_or(ValidationError::MissingField("id"))?;
    let subject_id = submission
        .subject_id
        .ok_or(ValidationError::MissingField("subject_id"))?;
    let checkpoint_raw = submission
        .checkpoint_id
        .ok_or(ValidationError::MissingField("checkpoint_id"))?;
    let checkpoint_id = CheckpointId::try_from(checkpoint_raw)
        .map_err(|_| ValidationError::InvalidRange("checkpoint_id"))?;
    let origin_device_id = submission
        .origin_device_id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let occurred_at = submission
        .occurred_at
        .ok_or(ValidationError::MissingField("occurred_at"))?;

    let event = ScanEvent {
        id,
        subject_id,
        checkpoint_id,
        origin_device_id,
        occurred_at,
        location_hint: submission.location_hint,
    };
    validate_scan_event(&event, rules, now_ms)?;
    Ok(event)
}

pub fn validate_scan_event(
    event: &ScanEvent,
    rules: &ValidationRules,
    now_ms: i64,
) -> Result<(), ValidationError> {
    if event.id.is_nil() {
        return Err(ValidationError::MissingField("id"));
    }
    if event.subject_id.is_nil() {
        return Err(ValidationError::MissingField("subject_id"));
    }
    if event.origin_device_id.trim().is_empty() {
        return Err(ValidationError::MissingField("origin_device_id"));
    }
    if event.origin_device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ValidationError::InvalidRange("origin_device_id"));
    }
    if !rules.route.is_known(event.checkpoint_id) {
        return Err(ValidationError::UnknownReference("checkpoint_id"));
    }
    if event.occurred_at <= 0 {
        return Err(ValidationError::InvalidRange("occurred_at"));
    }
    if event.occurred_at > now_ms.saturating_add(rules.max_future_skew_ms) {
        return Err(ValidationError::InvalidRange("occurred_at"));
    }
    if let Some(point) = event.location_hint {
        if !point.lat.is_finite() || !(-90.0..=90.0).contains(&point.lat) {
            return Err(ValidationError::InvalidRange("location_hint.lat"));
        }
        if !point.lng.is_finite() || !(-180.0..=180.0).contains(&point.lng) {
            return Err(ValidationError::InvalidRange("location_hint.lng"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        unix_timestamp_millis()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as i64)
        .unwrap_or(0)
}

/// Helper to create a `ScanEvent` with a fresh id and no location.
/// Used throughout tests to avoid repetitive struct construction.
pub fn scan_event_builder(
    subject_id: Uuid,
    checkpoint_id: CheckpointId,
    device_id: &str,
    occurred_at: i64,
) -> ScanEvent {
    ScanEvent {
        id: Uuid::new_v4(),
        subject_id,
        checkpoint_id,
        origin_device_id: device_id.to_string(),
        occurred_at,
        location_hint: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_767_225_600_000;

    fn submission() -> ScanSubmission {
        ScanSubmission {
            id: Some(Uuid::new_v4()),
            subject_id: Some(Uuid::new_v4()),
            checkpoint_id: Some(1),
            origin_device_id: Some("device-a".into()),
            occurred_at: Some(NOW - MINUTE_MS),
            location_hint: Some(GeoPoint {
                lat: 21.52,
                lng: 71.82,
            }),
        }
    }

    #[test]
    fn validates_submission_successfully() {
        let event = validate_submission(&submission(), &ValidationRules::default(), NOW).unwrap();
        assert_eq!(event.checkpoint_id, 1);
        assert_eq!(event.origin_device_id, "device-a");
    }

    #[test]
    fn rejects_submission_without_subject() {
        let mut raw = submission();
        raw.subject_id = None;
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::MissingField("subject_id"))
        );
    }

    #[test]
    fn rejects_nil_event_id() {
        let mut raw = submission();
        raw.id = Some(Uuid::nil());
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::MissingField("id"))
        );
    }

    #[test]
    fn rejects_unknown_checkpoint() {
        let mut raw = submission();
        raw.checkpoint_id = Some(42);
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::UnknownReference("checkpoint_id"))
        );
    }

    #[test]
    fn rejects_checkpoint_outside_small_int() {
        let mut raw = submission();
        raw.checkpoint_id = Some(70_000);
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::InvalidRange("checkpoint_id"))
        );
    }

    #[test]
    fn rejects_blank_device_id() {
        let mut raw = submission();
        raw.origin_device_id = Some("   ".into());
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::MissingField("origin_device_id"))
        );
    }

    #[test]
    fn rejects_timestamp_too_far_in_future() {
        let mut raw = submission();
        raw.occurred_at = Some(NOW + 11 * MINUTE_MS);
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::InvalidRange("occurred_at"))
        );

        raw.occurred_at = Some(NOW + 9 * MINUTE_MS);
        assert!(validate_submission(&raw, &ValidationRules::default(), NOW).is_ok());
    }

    #[test]
    fn rejects_out_of_range_location() {
        let mut raw = submission();
        raw.location_hint = Some(GeoPoint {
            lat: 95.0,
            lng: 71.0,
        });
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::InvalidRange("location_hint.lat"))
        );

        raw.location_hint = Some(GeoPoint {
            lat: 21.0,
            lng: f64::NAN,
        });
        assert_eq!(
            validate_submission(&raw, &ValidationRules::default(), NOW),
            Err(ValidationError::InvalidRange("location_hint.lng"))
        );
    }

    #[test]
    fn submission_accepts_client_event_id_alias() {
        let subject = Uuid::new_v4();
        let id = Uuid::new_v4();
        let body = format!(
            r#"{{"client_event_id":"{id}","subject_id":"{subject}","checkpoint_id":2,"origin_device_id":"d1","occurred_at":{}}}"#,
            NOW
        );
        let raw: ScanSubmission = serde_json::from_str(&body).unwrap();
        assert_eq!(raw.id, Some(id));
        let event = validate_submission(&raw, &ValidationRules::default(), NOW).unwrap();
        assert_eq!(event.location_hint, None);
    }

    #[test]
    fn route_roles_follow_configuration() {
        let route = CheckpointRoute::new(&[1, 4], &[2], &[3, 4]);
        assert_eq!(route.role(1), Some(CheckpointRole::DescentStart));
        assert_eq!(route.role(4), Some(CheckpointRole::DescentStart));
        assert_eq!(route.role(2), Some(CheckpointRole::LapCompletion));
        assert_eq!(route.role(3), Some(CheckpointRole::Waypoint));
        assert_eq!(route.role(9), None);
        assert_eq!(
            route.summary(),
            "1=descent_start,2=lap_completion,3=waypoint,4=descent_start"
        );
    }

    #[test]
    fn subject_id_for_badge_is_stable() {
        assert_eq!(subject_id_for_badge(17), subject_id_for_badge(17));
        assert_ne!(subject_id_for_badge(17), subject_id_for_badge(18));
        assert_eq!(qr_token_for_badge(17), "PALITANA_YATRA_17");
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }
}
