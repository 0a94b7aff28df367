use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use registry::SubjectRegistry;
use schema::{
    Clock, DedupKey, MINUTE_MS, ScanEvent, ScanSubmission, SystemClock, ValidationError,
    ValidationRules, validate_scan_event, validate_submission,
};
use store::{AppendOutcome, EventLog, InMemoryStore, StoreError, StoredEvent};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_DUPLICATE_WINDOW_MS: i64 = 10 * MINUTE_MS;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("event {0} already stored with a different payload")]
    Conflict(Uuid),
    #[error("transient storage failure: {0}")]
    Storage(StoreError),
    #[error("event log lock poisoned")]
    Unavailable,
}

impl GateError {
    /// Validation and conflicts are final; storage trouble is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Unavailable)
    }
}

impl From<StoreError> for GateError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(id) => Self::Conflict(id),
            other => Self::Storage(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Durable in the log. `replay` is set when the id was already stored.
    Accepted { stored: StoredEvent, replay: bool },
    /// Another accepted scan of the same pair lies inside the window.
    DuplicateRejected {
        event_id: Uuid,
        duplicate_of: StoredEvent,
    },
}

impl GateDecision {
    pub fn event_id(&self) -> Uuid {
        match self {
            Self::Accepted { stored, .. } => stored.event.id,
            Self::DuplicateRejected { event_id, .. } => *event_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateRejected { .. })
    }

    /// True only for a fresh append; replays and duplicates change nothing.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Accepted { replay: false, .. })
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub duplicate_window_ms: i64,
    pub validation: ValidationRules,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
            validation: ValidationRules::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct GateMetrics {
    accepted: AtomicU64,
    replayed: AtomicU64,
    duplicates: AtomicU64,
    validation_failures: AtomicU64,
    conflicts: AtomicU64,
    storage_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateMetricsSnapshot {
    pub accepted: u64,
    pub replayed: u64,
    pub duplicates: u64,
    pub validation_failures: u64,
    pub conflicts: u64,
    pub storage_failures: u64,
}

impl GateMetrics {
    pub fn snapshot(&self) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
        }
    }

    fn observe_error(&self, error: &GateError) {
        let counter = match error {
            GateError::Validation(_) => &self.validation_failures,
            GateError::Conflict(_) => &self.conflicts,
            GateError::Storage(_) | GateError::Unavailable => &self.storage_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The single authority deciding which scans become durable.
///
/// Check-then-append runs under a lock keyed by `(subject_id, checkpoint_id)`,
/// so two devices racing on the same pair are serialized while unrelated pairs
/// proceed in parallel.
pub struct IngestionGate<S: EventLog = InMemoryStore> {
    store: RwLock<S>,
    pair_locks: Mutex<HashMap<DedupKey, Arc<Mutex<()>>>>,
    config: GateConfig,
    clock: Arc<dyn Clock>,
    registry: Option<Arc<dyn SubjectRegistry>>,
    metrics: GateMetrics,
}

impl<S: EventLog> IngestionGate<S> {
    pub fn new(store: S, config: GateConfig) -> Self {
        Self {
            store: RwLock::new(store),
            pair_locks: Mutex::new(HashMap::new()),
            config,
            clock: Arc::new(SystemClock),
            registry: None,
            metrics: GateMetrics::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// With a registry attached, scans for subjects it does not know are rejected.
    pub fn with_registry(mut self, registry: Arc<dyn SubjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> GateMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn submit_submission(&self, submission: &ScanSubmission) -> Result<GateDecision, GateError> {
        let event = validate_submission(submission, &self.config.validation, self.clock.now_ms())
            .map_err(|err| self.fail(GateError::Validation(err)))?;
        self.submit_validated(event)
    }

    pub fn submit(&self, event: ScanEvent) -> Result<GateDecision, GateError> {
        validate_scan_event(&event, &self.config.validation, self.clock.now_ms())
            .map_err(|err| self.fail(GateError::Validation(err)))?;
        self.submit_validated(event)
    }

    fn submit_validated(&self, event: ScanEvent) -> Result<GateDecision, GateError> {
        if let Some(registry) = self.registry.as_ref()
            && !registry.contains(&event.subject_id)
        {
            return Err(self.fail(GateError::Validation(ValidationError::UnknownReference(
                "subject_id",
            ))));
        }

        let key = event.dedup_key();
        let pair_lock = self.pair_lock(key)?;
        let _pair_guard = pair_lock.lock().map_err(|_| self.fail(GateError::Unavailable))?;
        self.decide(event).map_err(|err| self.fail(err))
    }

    fn decide(&self, event: ScanEvent) -> Result<GateDecision, GateError> {
        {
            let store = self.read_store()?;
            if let Some(existing) = store.get(&event.id) {
                if existing.event != event {
                    return Err(GateError::Conflict(event.id));
                }
                self.metrics.replayed.fetch_add(1, Ordering::Relaxed);
                debug!(event_id = %event.id, seq = existing.seq, "replayed scan acknowledged");
                return Ok(GateDecision::Accepted {
                    stored: existing,
                    replay: true,
                });
            }

            if let Some(nearest) = store.nearest_for_pair(&event.dedup_key(), event.occurred_at)
                && (nearest.event.occurred_at - event.occurred_at).abs()
                    < self.config.duplicate_window_ms
            {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %event.id,
                    subject_id = %event.subject_id,
                    checkpoint_id = event.checkpoint_id,
                    duplicate_of = %nearest.event.id,
                    "scan rejected as duplicate"
                );
                return Ok(GateDecision::DuplicateRejected {
                    event_id: event.id,
                    duplicate_of: nearest,
                });
            }
        }

        let outcome = self.write_store()?.append(event)?;
        match outcome {
            AppendOutcome::Appended(stored) => {
                self.metrics.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %stored.event.id,
                    subject_id = %stored.event.subject_id,
                    checkpoint_id = stored.event.checkpoint_id,
                    seq = stored.seq,
                    "scan accepted"
                );
                Ok(GateDecision::Accepted {
                    stored,
                    replay: false,
                })
            }
            AppendOutcome::AlreadyPresent(stored) => {
                self.metrics.replayed.fetch_add(1, Ordering::Relaxed);
                Ok(GateDecision::Accepted {
                    stored,
                    replay: true,
                })
            }
        }
    }

    /// Administrative removal. Held under the pair lock so it cannot interleave
    /// with a dedup decision for the same pair.
    pub fn purge(&self, event_id: &Uuid) -> Result<Option<StoredEvent>, GateError> {
        let Some(existing) = self.read_store()?.get(event_id) else {
            return Ok(None);
        };
        let pair_lock = self.pair_lock(existing.event.dedup_key())?;
        let _pair_guard = pair_lock.lock().map_err(|_| GateError::Unavailable)?;
        let purged = self.write_store()?.purge(event_id)?;
        if let Some(stored) = purged.as_ref() {
            warn!(
                event_id = %stored.event.id,
                subject_id = %stored.event.subject_id,
                seq = stored.seq,
                "scan purged by administrator"
            );
        }
        Ok(purged)
    }

    /// Runs `read` against the event log under its shared lock.
    pub fn with_store<R>(&self, read: impl FnOnce(&S) -> R) -> Result<R, GateError> {
        Ok(read(&*self.read_store()?))
    }

    pub fn with_store_mut<R>(&self, write: impl FnOnce(&mut S) -> R) -> Result<R, GateError> {
        Ok(write(&mut *self.write_store()?))
    }

    fn fail(&self, error: GateError) -> GateError {
        self.metrics.observe_error(&error);
        if error.is_retryable() {
            warn!(error = %error, "scan ingestion failed");
        }
        error
    }

    fn pair_lock(&self, key: DedupKey) -> Result<Arc<Mutex<()>>, GateError> {
        // Entries are never evicted; the key space is subjects x checkpoints.
        let mut locks = self.pair_locks.lock().map_err(|_| GateError::Unavailable)?;
        Ok(Arc::clone(locks.entry(key).or_default()))
    }

    fn read_store(&self) -> Result<RwLockReadGuard<'_, S>, GateError> {
        self.store.read().map_err(|_| GateError::Unavailable)
    }

    fn write_store(&self) -> Result<RwLockWriteGuard<'_, S>, GateError> {
        self.store.write().map_err(|_| GateError::Unavailable)
    }
}
