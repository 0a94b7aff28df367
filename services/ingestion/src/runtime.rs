use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use derivation::{AtRiskThresholds, DerivationConfig, SubjectStats, detect_at_risk};
use registry::{RegistryError, SubjectRegistry};
use schema::{CheckpointId, Clock, ScanSubmission, Subject, SystemClock};
use serde::{Deserialize, Serialize};
use store::{EventLog, EventPage, InMemoryStore, StoredEvent};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api::{
        AtRiskResponse, BatchItemResult, BatchItemStatus, BatchSubmitRequest,
        BatchSubmitResponse, PurgeResponse, SubmitScanResponse,
    },
    config::{DEFAULT_BATCH_MAX_ITEMS, IngestConfig},
    gate::{GateConfig, GateDecision, GateError, IngestionGate},
    projection::ProjectionCache,
};

pub type SharedRuntime = Arc<IngestionRuntime>;

pub const DEFAULT_PAGE_LIMIT: usize = 200;
pub const MAX_PAGE_LIMIT: usize = 1_000;

pub struct RuntimeOptions {
    pub gate: GateConfig,
    pub derivation: DerivationConfig,
    pub at_risk: AtRiskThresholds,
    pub admin_token: Option<String>,
    pub max_batch_items: usize,
    pub registry: Option<Arc<dyn SubjectRegistry>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            derivation: DerivationConfig::default(),
            at_risk: AtRiskThresholds::default(),
            admin_token: None,
            max_batch_items: DEFAULT_BATCH_MAX_ITEMS,
            registry: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            gate: config.gate.clone(),
            derivation: config.derivation.clone(),
            at_risk: config.at_risk,
            admin_token: config.admin_token.clone(),
            max_batch_items: config.max_batch_items,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub generated_at: i64,
    pub subjects_evaluated: usize,
    pub flagged: Vec<derivation::AtRiskSubject>,
}

/// Everything the HTTP surface and the background loops share.
pub struct IngestionRuntime {
    gate: IngestionGate,
    projections: ProjectionCache,
    registry: Option<Arc<dyn SubjectRegistry>>,
    at_risk: AtRiskThresholds,
    admin_token: Option<String>,
    max_batch_items: usize,
    last_sweep: RwLock<Option<SweepReport>>,
    sweeps_total: AtomicU64,
    purges_total: AtomicU64,
    projection_failures: AtomicU64,
    wal_flush_failures: AtomicU64,
    started_at: Instant,
}

impl IngestionRuntime {
    pub fn in_memory(store: InMemoryStore) -> Self {
        Self::with_options(store, RuntimeOptions::default())
    }

    pub fn with_options(store: InMemoryStore, options: RuntimeOptions) -> Self {
        let mut gate = IngestionGate::new(store, options.gate).with_clock(options.clock);
        if let Some(registry) = options.registry.as_ref() {
            gate = gate.with_registry(Arc::clone(registry));
        }
        let runtime = Self {
            gate,
            projections: ProjectionCache::new(options.derivation),
            registry: options.registry,
            at_risk: options.at_risk,
            admin_token: options.admin_token,
            max_batch_items: options.max_batch_items.max(1),
            last_sweep: RwLock::new(None),
            sweeps_total: AtomicU64::new(0),
            purges_total: AtomicU64::new(0),
            projection_failures: AtomicU64::new(0),
            wal_flush_failures: AtomicU64::new(0),
            started_at: Instant::now(),
        };
        runtime.rebuild_projections();
        runtime
    }

    pub fn gate(&self) -> &IngestionGate {
        &self.gate
    }

    pub fn now_ms(&self) -> i64 {
        self.gate.clock().now_ms()
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub fn max_batch_items(&self) -> usize {
        self.max_batch_items
    }

    pub fn at_risk_thresholds(&self) -> AtRiskThresholds {
        self.at_risk
    }

    pub fn events_len(&self) -> usize {
        self.gate.with_store(|store| store.len()).unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    pub fn submit_scan(&self, submission: &ScanSubmission) -> Result<SubmitScanResponse, GateError> {
        let decision = self.gate.submit_submission(submission)?;
        self.after_decision(&decision);
        Ok(SubmitScanResponse::from(&decision))
    }

    /// Each item is decided independently; one bad scan never fails its neighbours.
    pub fn submit_batch(&self, request: &BatchSubmitRequest) -> BatchSubmitResponse {
        let results = request
            .events
            .iter()
            .map(|submission| match self.submit_scan(submission) {
                Ok(outcome) => BatchItemResult {
                    event_id: Some(outcome.event_id),
                    status: if outcome.duplicate {
                        BatchItemStatus::Duplicate
                    } else {
                        BatchItemStatus::Accepted
                    },
                    outcome: Some(outcome),
                    error: None,
                },
                Err(err) => BatchItemResult {
                    event_id: submission.id,
                    status: if err.is_retryable() {
                        BatchItemStatus::Retry
                    } else {
                        BatchItemStatus::Rejected
                    },
                    outcome: None,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        BatchSubmitResponse { results }
    }

    pub fn purge(&self, event_id: &Uuid) -> Result<PurgeResponse, GateError> {
        let purged = self.gate.purge(event_id)?;
        if let Some(stored) = purged.as_ref() {
            self.purges_total.fetch_add(1, Ordering::Relaxed);
            self.refresh_subject(stored.event.subject_id);
        }
        Ok(PurgeResponse {
            event_id: *event_id,
            purged: purged.is_some(),
            seq: purged.map(|stored| stored.seq),
        })
    }

    fn after_decision(&self, decision: &GateDecision) {
        if let GateDecision::Accepted {
            stored,
            replay: false,
        } = decision
        {
            self.refresh_subject(stored.event.subject_id);
        }
    }

    /// The append is already durable; a failed recompute only leaves a stale cache entry.
    fn refresh_subject(&self, subject_id: Uuid) {
        let result = self.projections.refresh(subject_id, || {
            self.gate.with_store(|store| {
                store
                    .query_by_subject(&subject_id)
                    .into_iter()
                    .map(|stored| stored.event)
                    .collect()
            })
        });
        if let Err(err) = result {
            self.projection_failures.fetch_add(1, Ordering::Relaxed);
            warn!(subject_id = %subject_id, error = %err, "subject stats recompute failed");
        }
    }

    fn rebuild_projections(&self) {
        let subject_ids = self
            .gate
            .with_store(|store| store.subject_ids())
            .unwrap_or_default();
        for subject_id in &subject_ids {
            self.refresh_subject(*subject_id);
        }
        if !subject_ids.is_empty() {
            info!(subjects = subject_ids.len(), "subject stats rebuilt from event log");
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn events_after(&self, after_seq: u64, limit: usize) -> Result<EventPage, GateError> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self.gate
            .with_store(|store| store.events_after(after_seq, limit))
    }

    pub fn subject_events(&self, subject_id: &Uuid) -> Result<Vec<StoredEvent>, GateError> {
        self.gate
            .with_store(|store| store.query_by_subject(subject_id))
    }

    pub fn checkpoint_events(
        &self,
        checkpoint_id: CheckpointId,
        since: Option<i64>,
    ) -> Result<Vec<StoredEvent>, GateError> {
        self.gate
            .with_store(|store| store.query_by_checkpoint(checkpoint_id, since))
    }

    pub fn subject_stats(&self, subject_id: &Uuid) -> SubjectStats {
        self.projections
            .get(subject_id)
            .unwrap_or_else(|| SubjectStats::empty(*subject_id))
    }

    pub fn resolve_subject(&self, token: &str) -> Result<Subject, RegistryError> {
        match self.registry.as_ref() {
            Some(registry) => registry.resolve_subject_by_token(token),
            None => Err(RegistryError::SubjectNotFound(token.to_string())),
        }
    }

    pub fn at_risk(&self, thresholds: &AtRiskThresholds) -> AtRiskResponse {
        let generated_at = self.now_ms();
        let stats = self.projections.all();
        AtRiskResponse {
            generated_at,
            thresholds: *thresholds,
            subjects: detect_at_risk(&stats, thresholds, generated_at),
        }
    }

    // ---------------------------------------------------------------------
    // Background work
    // ---------------------------------------------------------------------

    pub fn run_sweep(&self) -> SweepReport {
        let generated_at = self.now_ms();
        let stats = self.projections.all();
        let flagged = detect_at_risk(&stats, &self.at_risk, generated_at);
        for subject in &flagged {
            warn!(
                subject_id = %subject.subject_id,
                reason = ?subject.reason,
                transit_state = subject.transit_state.as_str(),
                overdue_ms = subject.overdue_ms,
                "subject at risk"
            );
        }
        let report = SweepReport {
            generated_at,
            subjects_evaluated: stats.len(),
            flagged,
        };
        self.sweeps_total.fetch_add(1, Ordering::Relaxed);
        *self
            .last_sweep
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn flush_wal_if_due(&self) {
        let result = self
            .gate
            .with_store_mut(|store| store.flush_wal_if_interval_elapsed());
        self.observe_flush(result);
    }

    /// Called on shutdown so batched records are synced before exit.
    pub fn flush_wal(&self) {
        let result = self.gate.with_store_mut(|store| store.flush_wal());
        self.observe_flush(result);
    }

    fn observe_flush(&self, result: Result<Result<bool, store::StoreError>, GateError>) {
        let error = match result {
            Ok(Ok(_)) => return,
            Ok(Err(err)) => err.to_string(),
            Err(err) => err.to_string(),
        };
        self.wal_flush_failures.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, "event log flush failed");
    }

    pub fn metrics_text(&self) -> String {
        let gate = self.gate.metrics();
        let (flagged, last_sweep_at) = self
            .last_sweep()
            .map(|report| (report.flagged.len(), report.generated_at))
            .unwrap_or((0, 0));
        format!(
            "# TYPE yatra_ingest_accepted_total counter\n\
yatra_ingest_accepted_total {}\n\
# TYPE yatra_ingest_replayed_total counter\n\
yatra_ingest_replayed_total {}\n\
# TYPE yatra_ingest_duplicates_total counter\n\
yatra_ingest_duplicates_total {}\n\
# TYPE yatra_ingest_validation_failures_total counter\n\
yatra_ingest_validation_failures_total {}\n\
# TYPE yatra_ingest_conflicts_total counter\n\
yatra_ingest_conflicts_total {}\n\
# TYPE yatra_ingest_storage_failures_total counter\n\
yatra_ingest_storage_failures_total {}\n\
# TYPE yatra_ingest_purges_total counter\n\
yatra_ingest_purges_total {}\n\
# TYPE yatra_ingest_projection_failures_total counter\n\
yatra_ingest_projection_failures_total {}\n\
# TYPE yatra_ingest_wal_flush_failures_total counter\n\
yatra_ingest_wal_flush_failures_total {}\n\
# TYPE yatra_ingest_events gauge\n\
yatra_ingest_events {}\n\
# TYPE yatra_ingest_subjects_tracked gauge\n\
yatra_ingest_subjects_tracked {}\n\
# TYPE yatra_ingest_sweeps_total counter\n\
yatra_ingest_sweeps_total {}\n\
# TYPE yatra_ingest_at_risk_flagged gauge\n\
yatra_ingest_at_risk_flagged {}\n\
# TYPE yatra_ingest_last_sweep_unix_ms gauge\n\
yatra_ingest_last_sweep_unix_ms {}\n\
# TYPE yatra_ingest_uptime_seconds gauge\n\
yatra_ingest_uptime_seconds {}\n",
            gate.accepted,
            gate.replayed,
            gate.duplicates,
            gate.validation_failures,
            gate.conflicts,
            gate.storage_failures,
            self.purges_total.load(Ordering::Relaxed),
            self.projection_failures.load(Ordering::Relaxed),
            self.wal_flush_failures.load(Ordering::Relaxed),
            self.events_len(),
            self.projections.len(),
            self.sweeps_total.load(Ordering::Relaxed),
            flagged,
            last_sweep_at,
            self.started_at.elapsed().as_secs(),
        )
    }
}
