//! The device side of the ledger: synchronous capture backed by the outbox
//! and a local view that the reconciler keeps in step with the gate.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use derivation::{AtRiskSubject, AtRiskThresholds, DerivationConfig, SubjectStats};
use ingestion::api::{BatchItemResult, BatchItemStatus, BatchSubmitResponse};
use registry::{RegistryError, SubjectRegistry};
use schema::{
    CheckpointId, Clock, GeoPoint, ScanEvent, SystemClock, ValidationError, ValidationRules,
    validate_scan_event,
};
use serde::Serialize;
use store::{EventPage, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    local_view::{LocalView, MergeStats},
    outbox::{Outbox, OutboxError, OutboxLoadStats, PendingEvent},
};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    SubjectNotFound(#[from] RegistryError),
    #[error("invalid scan: {0}")]
    Validation(#[from] ValidationError),
    #[error("outbox full ({capacity} entries); sync before scanning more")]
    OutboxFull { capacity: usize },
    #[error("local storage failed: {0}")]
    Storage(String),
}

impl From<OutboxError> for CaptureError {
    fn from(value: OutboxError) -> Self {
        match value {
            OutboxError::Full { capacity } => Self::OutboxFull { capacity },
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<StoreError> for CaptureError {
    fn from(value: StoreError) -> Self {
        Self::Storage(value.to_string())
    }
}

/// What the operator sees right after a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutcome {
    pub event_id: Uuid,
    pub subject_id: Uuid,
    pub accepted: bool,
    /// Already scanned here within the window; nothing was queued.
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
    /// Oldest unsynced scan dropped to make room (evict-oldest overflow only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushReport {
    pub sent: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub retried: usize,
}

pub struct DeviceSettings {
    pub device_id: String,
    pub duplicate_window_ms: i64,
    pub validation: ValidationRules,
    pub derivation: DerivationConfig,
    pub at_risk: AtRiskThresholds,
}

impl DeviceSettings {
    pub fn new(device_id: &str) -> Self {
        let derivation = DerivationConfig::default();
        Self {
            device_id: device_id.to_string(),
            duplicate_window_ms: ingestion::gate::DEFAULT_DUPLICATE_WINDOW_MS,
            validation: ValidationRules {
                route: derivation.route.clone(),
                ..ValidationRules::default()
            },
            derivation,
            at_risk: AtRiskThresholds::default(),
        }
    }
}

struct DeviceCore {
    outbox: Outbox,
    view: LocalView,
}

pub struct DeviceNode {
    settings: DeviceSettings,
    core: Mutex<DeviceCore>,
    online: AtomicBool,
    clock: Arc<dyn Clock>,
    registry: Option<Arc<dyn SubjectRegistry>>,
}

impl DeviceNode {
    pub fn new(settings: DeviceSettings, outbox: Outbox) -> Self {
        let view = LocalView::new(settings.derivation.clone());
        let node = Self {
            settings,
            core: Mutex::new(DeviceCore { outbox, view }),
            online: AtomicBool::new(false),
            clock: Arc::new(SystemClock),
            registry: None,
        };
        node.restore_unsynced();
        node
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn SubjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.settings.device_id
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(device_id = %self.settings.device_id, online, "connectivity changed");
        }
    }

    fn core(&self) -> MutexGuard<'_, DeviceCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replays journaled captures into the view after a restart.
    fn restore_unsynced(&self) {
        let mut core = self.core();
        let DeviceCore { outbox, view } = &mut *core;
        for entry in outbox.entries() {
            if let Err(err) = view.record_local(entry.event.clone()) {
                warn!(event_id = %entry.event.id, error = %err, "could not restore unsynced scan");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Capture
    // ---------------------------------------------------------------------

    /// Resolves a badge QR token and records a scan for that pilgrim.
    pub fn capture_token(
        &self,
        token: &str,
        checkpoint_id: CheckpointId,
    ) -> Result<CaptureOutcome, CaptureError> {
        let subject_id = self.resolve_subject(token)?;
        self.submit_scan(subject_id, checkpoint_id, None)
    }

    /// Badge token to subject id. Without a roster only raw subject ids resolve.
    pub fn resolve_subject(&self, token: &str) -> Result<Uuid, CaptureError> {
        match self.registry.as_ref() {
            Some(registry) => Ok(registry.resolve_subject_by_token(token)?.id),
            None => Uuid::parse_str(token.trim())
                .map_err(|_| RegistryError::SubjectNotFound(token.to_string()).into()),
        }
    }

    /// Records a scan with zero network dependency.
    ///
    /// Only scans the ledger has confirmed can suppress a capture here. A
    /// repeat of an own scan still in the outbox is queued as well and the
    /// gate's duplicate window decides between them.
    pub fn submit_scan(
        &self,
        subject_id: Uuid,
        checkpoint_id: CheckpointId,
        location_hint: Option<GeoPoint>,
    ) -> Result<CaptureOutcome, CaptureError> {
        let now = self.now_ms();
        let event = ScanEvent {
            id: Uuid::new_v4(),
            subject_id,
            checkpoint_id,
            origin_device_id: self.settings.device_id.clone(),
            occurred_at: now,
            location_hint,
        };
        validate_scan_event(&event, &self.settings.validation, now)?;
        if let Some(registry) = self.registry.as_ref()
            && !registry.contains(&subject_id)
        {
            return Err(RegistryError::SubjectNotFound(subject_id.to_string()).into());
        }

        let mut core = self.core();
        if let Some(previous) = core.view.nearest_confirmed_same_pair(&event)
            && (previous.event.occurred_at - event.occurred_at).abs()
                < self.settings.duplicate_window_ms
        {
            debug!(
                subject_id = %subject_id,
                checkpoint_id,
                duplicate_of = %previous.event.id,
                "scan suppressed locally by duplicate window"
            );
            return Ok(CaptureOutcome {
                event_id: event.id,
                subject_id,
                accepted: true,
                duplicate: true,
                duplicate_of: Some(previous.event.id),
                evicted: None,
            });
        }

        let evicted = core.outbox.enqueue(event.clone(), now)?;
        if let Some(evicted) = evicted.as_ref() {
            core.view.drop_own(&evicted.event.id)?;
        }
        core.view.record_local(event.clone())?;
        Ok(CaptureOutcome {
            event_id: event.id,
            subject_id,
            accepted: true,
            duplicate: false,
            duplicate_of: None,
            evicted: evicted.map(|entry| entry.event.id),
        })
    }

    // ---------------------------------------------------------------------
    // Local reads
    // ---------------------------------------------------------------------

    pub fn subject_stats(&self, subject_id: &Uuid) -> SubjectStats {
        self.core().view.subject_stats(subject_id)
    }

    pub fn at_risk(&self) -> Vec<AtRiskSubject> {
        self.at_risk_with(&self.settings.at_risk)
    }

    pub fn at_risk_with(&self, thresholds: &AtRiskThresholds) -> Vec<AtRiskSubject> {
        let now = self.now_ms();
        self.core().view.at_risk(thresholds, now)
    }

    pub fn knows_event(&self, event_id: &Uuid) -> bool {
        self.core().view.contains(event_id)
    }

    pub fn watermark(&self) -> u64 {
        self.core().view.watermark()
    }

    pub fn outbox_len(&self) -> usize {
        self.core().outbox.len()
    }

    pub fn needs_attention(&self) -> Vec<PendingEvent> {
        self.core().outbox.attention().into_iter().cloned().collect()
    }

    pub fn requeue_attention(&self) -> Result<usize, OutboxError> {
        let now = self.now_ms();
        let requeued = self.core().outbox.requeue_attention(now)?;
        if requeued > 0 {
            info!(requeued, "parked scans returned to the retry schedule");
        }
        Ok(requeued)
    }

    pub fn compact_outbox(&self) -> Result<(), OutboxError> {
        self.core().outbox.compact()
    }

    // ---------------------------------------------------------------------
    // Reconciler hooks
    // ---------------------------------------------------------------------

    pub(crate) fn due_batch(&self, limit: usize) -> Vec<PendingEvent> {
        let now = self.now_ms();
        self.core().outbox.due(now, limit)
    }

    /// Applies the gate's per-item verdicts. Results are matched by event id.
    pub(crate) fn apply_push_results(
        &self,
        batch: &[PendingEvent],
        response: &BatchSubmitResponse,
    ) -> Result<PushReport, OutboxError> {
        let now = self.now_ms();
        let mut report = PushReport {
            sent: batch.len(),
            ..PushReport::default()
        };
        let mut core = self.core();
        let DeviceCore { outbox, view } = &mut *core;
        for (index, pending) in batch.iter().enumerate() {
            let event_id = pending.event.id;
            let result: Option<&BatchItemResult> = response
                .results
                .iter()
                .find(|item| item.event_id == Some(event_id))
                .or_else(|| {
                    response
                        .results
                        .get(index)
                        .filter(|item| item.event_id.is_none())
                });
            let ledger_seq = result
                .and_then(|item| item.outcome.as_ref())
                .and_then(|outcome| outcome.seq);
            match result.map(|item| (item.status, item.error.as_deref())) {
                Some((BatchItemStatus::Accepted, _)) => {
                    outbox.acknowledge(&event_id)?;
                    if let Err(err) = view.confirm_own(&event_id, ledger_seq) {
                        warn!(event_id = %event_id, error = %err, "could not move confirmed scan to its ledger sequence");
                    }
                    report.accepted += 1;
                }
                Some((BatchItemStatus::Duplicate, _)) => {
                    outbox.acknowledge(&event_id)?;
                    if let Err(err) = view.drop_own(&event_id) {
                        warn!(event_id = %event_id, error = %err, "could not drop duplicate from view");
                    }
                    debug!(event_id = %event_id, "ledger kept an earlier scan; local copy dropped");
                    report.duplicates += 1;
                }
                Some((BatchItemStatus::Rejected, error)) => {
                    outbox.reject(&event_id, error.unwrap_or("rejected"))?;
                    if let Err(err) = view.drop_own(&event_id) {
                        warn!(event_id = %event_id, error = %err, "could not drop rejected scan from view");
                    }
                    report.rejected += 1;
                }
                Some((BatchItemStatus::Retry, error)) => {
                    outbox.record_failure(&event_id, error.unwrap_or("retry"), now)?;
                    report.retried += 1;
                }
                None => {
                    outbox.record_failure(&event_id, "missing from gate response", now)?;
                    report.retried += 1;
                }
            }
        }
        Ok(report)
    }

    pub(crate) fn record_batch_failure(
        &self,
        batch: &[PendingEvent],
        error: &str,
    ) -> Result<(), OutboxError> {
        let now = self.now_ms();
        let mut core = self.core();
        for pending in batch {
            core.outbox.record_failure(&pending.event.id, error, now)?;
        }
        Ok(())
    }

    pub(crate) fn merge_remote(&self, page: &EventPage) -> Result<MergeStats, StoreError> {
        self.core().view.merge_remote(page)
    }
}

/// Opens the journaled outbox and logs what was recovered.
pub fn open_outbox(
    path: &std::path::Path,
    config: crate::outbox::OutboxConfig,
) -> Result<(Outbox, OutboxLoadStats), OutboxError> {
    let (outbox, stats) = Outbox::open(path, config)?;
    info!(
        path = %path.display(),
        journal_records = stats.journal_records,
        live_entries = stats.live_entries,
        needs_attention = stats.needs_attention,
        skipped_torn_records = stats.skipped_torn_records,
        "outbox recovered"
    );
    Ok((outbox, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{OutboxConfig, OverflowPolicy};
    use derivation::TransitState;
    use ingestion::api::SubmitScanResponse;
    use registry::InMemoryRegistry;
    use schema::{MINUTE_MS, ManualClock, subject_id_for_badge};

    const T0: i64 = 1_767_240_000_000;

    fn node_at(clock: Arc<ManualClock>, outbox: OutboxConfig) -> DeviceNode {
        DeviceNode::new(DeviceSettings::new("device-a"), Outbox::in_memory(outbox)).with_clock(clock)
    }

    #[test]
    fn capture_is_visible_locally_and_queued() {
        let clock = Arc::new(ManualClock::new(T0));
        let node = node_at(clock, OutboxConfig::default());
        let subject = Uuid::new_v4();

        let outcome = node.submit_scan(subject, 1, None).unwrap();
        assert!(outcome.accepted && !outcome.duplicate);
        assert_eq!(node.outbox_len(), 1);
        assert!(node.knows_event(&outcome.event_id));
        assert_eq!(
            node.subject_stats(&subject).transit_state,
            TransitState::Descending
        );
    }

    fn accepted(event_id: Uuid, seq: u64) -> BatchItemResult {
        BatchItemResult {
            event_id: Some(event_id),
            status: BatchItemStatus::Accepted,
            outcome: Some(SubmitScanResponse {
                event_id,
                accepted: true,
                duplicate: false,
                replay: false,
                seq: Some(seq),
                duplicate_of: None,
            }),
            error: None,
        }
    }

    #[test]
    fn repeat_of_unconfirmed_own_scan_is_still_queued() {
        let clock = Arc::new(ManualClock::new(T0));
        let node = node_at(clock.clone(), OutboxConfig::default());
        let subject = Uuid::new_v4();

        node.submit_scan(subject, 1, None).unwrap();
        clock.advance(2 * MINUTE_MS);
        let second = node.submit_scan(subject, 1, None).unwrap();
        assert!(!second.duplicate);
        assert_eq!(node.outbox_len(), 2);
    }

    #[test]
    fn repeat_of_confirmed_scan_within_window_is_suppressed_locally() {
        let clock = Arc::new(ManualClock::new(T0));
        let node = node_at(clock.clone(), OutboxConfig::default());
        let subject = Uuid::new_v4();

        let first = node.submit_scan(subject, 1, None).unwrap();
        let batch = node.due_batch(10);
        let response = BatchSubmitResponse {
            results: vec![accepted(first.event_id, 1)],
        };
        node.apply_push_results(&batch, &response).unwrap();
        assert_eq!(node.outbox_len(), 0);

        clock.advance(2 * MINUTE_MS);
        let second = node.submit_scan(subject, 1, None).unwrap();
        assert!(second.duplicate);
        assert_eq!(second.duplicate_of, Some(first.event_id));
        assert_eq!(node.outbox_len(), 0);

        clock.advance(10 * MINUTE_MS);
        assert!(!node.submit_scan(subject, 1, None).unwrap().duplicate);
    }

    #[test]
    fn full_outbox_surfaces_to_operator() {
        let clock = Arc::new(ManualClock::new(T0));
        let node = node_at(
            clock,
            OutboxConfig {
                max_entries: 1,
                overflow: OverflowPolicy::RejectNew,
                ..OutboxConfig::default()
            },
        );
        node.submit_scan(Uuid::new_v4(), 1, None).unwrap();
        let err = node.submit_scan(Uuid::new_v4(), 1, None).unwrap_err();
        assert!(matches!(err, CaptureError::OutboxFull { capacity: 1 }));
    }

    #[test]
    fn evicted_scan_leaves_local_view() {
        let clock = Arc::new(ManualClock::new(T0));
        let node = node_at(
            clock,
            OutboxConfig {
                max_entries: 1,
                overflow: OverflowPolicy::EvictOldest,
                ..OutboxConfig::default()
            },
        );
        let first = node.submit_scan(Uuid::new_v4(), 1, None).unwrap();
        let second = node.submit_scan(Uuid::new_v4(), 1, None).unwrap();
        assert_eq!(second.evicted, Some(first.event_id));
        assert!(!node.knows_event(&first.event_id));
    }

    #[test]
    fn capture_token_requires_known_subject() {
        let registry = InMemoryRegistry::from_roster_json(r#"[{"name":"Asha","badgeNumber":7}]"#)
            .unwrap();
        let node = node_at(Arc::new(ManualClock::new(T0)), OutboxConfig::default())
            .with_registry(Arc::new(registry));

        let outcome = node.capture_token("PALITANA_YATRA_7", 1).unwrap();
        assert_eq!(outcome.subject_id, subject_id_for_badge(7));

        let err = node.capture_token("PALITANA_YATRA_8", 1).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SubjectNotFound(RegistryError::SubjectNotFound(_))
        ));
        assert_eq!(node.outbox_len(), 1);
    }

    #[test]
    fn unknown_checkpoint_is_rejected_at_capture() {
        let node = node_at(Arc::new(ManualClock::new(T0)), OutboxConfig::default());
        let err = node.submit_scan(Uuid::new_v4(), 42, None).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Validation(ValidationError::UnknownReference("checkpoint_id"))
        ));
        assert_eq!(node.outbox_len(), 0);
    }

    #[test]
    fn push_results_are_terminal_except_retry() {
        let clock = Arc::new(ManualClock::new(T0));
        let node = node_at(clock, OutboxConfig::default());
        let ids: Vec<Uuid> = (0..4)
            .map(|_| node.submit_scan(Uuid::new_v4(), 1, None).unwrap().event_id)
            .collect();
        let batch = node.due_batch(10);
        let item = |event_id: Uuid, status: BatchItemStatus| BatchItemResult {
            event_id: Some(event_id),
            status,
            outcome: (status == BatchItemStatus::Accepted).then(|| SubmitScanResponse {
                event_id,
                accepted: true,
                duplicate: false,
                replay: false,
                seq: Some(1),
                duplicate_of: None,
            }),
            error: None,
        };
        let response = BatchSubmitResponse {
            results: vec![
                item(ids[0], BatchItemStatus::Accepted),
                item(ids[1], BatchItemStatus::Duplicate),
                item(ids[2], BatchItemStatus::Rejected),
                item(ids[3], BatchItemStatus::Retry),
            ],
        };

        let report = node.apply_push_results(&batch, &response).unwrap();
        assert_eq!(
            report,
            PushReport {
                sent: 4,
                accepted: 1,
                duplicates: 1,
                rejected: 1,
                retried: 1,
            }
        );
        assert_eq!(node.outbox_len(), 1);
        assert!(node.knows_event(&ids[0]));
        assert!(!node.knows_event(&ids[1]));
        assert!(!node.knows_event(&ids[2]));
        assert!(node.knows_event(&ids[3]));
    }
}
