//! JSON bodies of the ingestion HTTP surface, shared with device clients.

use derivation::{AtRiskSubject, AtRiskThresholds};
use schema::{CheckpointId, ScanSubmission};
use serde::{Deserialize, Serialize};
use store::StoredEvent;
use uuid::Uuid;

use crate::gate::GateDecision;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitScanResponse {
    pub event_id: Uuid,
    /// The ledger has handled this id; the device may drop it from its outbox.
    pub accepted: bool,
    /// Suppressed by the duplicate window; no row was written.
    pub duplicate: bool,
    #[serde(default)]
    pub replay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
}

impl From<&GateDecision> for SubmitScanResponse {
    fn from(decision: &GateDecision) -> Self {
        match decision {
            GateDecision::Accepted { stored, replay } => Self {
                event_id: stored.event.id,
                accepted: true,
                duplicate: false,
                replay: *replay,
                seq: Some(stored.seq),
                duplicate_of: None,
            },
            GateDecision::DuplicateRejected {
                event_id,
                duplicate_of,
            } => Self {
                event_id: *event_id,
                accepted: true,
                duplicate: true,
                replay: false,
                seq: None,
                duplicate_of: Some(duplicate_of.event.id),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmitRequest {
    pub events: Vec<ScanSubmission>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Accepted,
    Duplicate,
    /// Terminal rejection (validation or payload conflict); do not resend.
    Rejected,
    /// Transient failure; resend later with the same id.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub event_id: Option<Uuid>,
    pub status: BatchItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubmitScanResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubmitResponse {
    pub results: Vec<BatchItemResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectEventsResponse {
    pub subject_id: Uuid,
    pub events: Vec<StoredEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEventsResponse {
    pub checkpoint_id: CheckpointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    pub events: Vec<StoredEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtRiskResponse {
    pub generated_at: i64,
    pub thresholds: AtRiskThresholds,
    pub subjects: Vec<AtRiskSubject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub event_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub event_id: Uuid,
    pub purged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}
