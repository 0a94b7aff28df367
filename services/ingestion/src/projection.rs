use std::{
    collections::HashMap,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use derivation::{DerivationConfig, SubjectStats, derive_subject_stats};
use schema::ScanEvent;
use uuid::Uuid;

/// Read cache of per-subject stats, rebuilt from the event log on every change.
///
/// Nothing here is authoritative: dropping the cache and calling
/// [`ProjectionCache::refresh`] for every subject restores identical content.
pub struct ProjectionCache {
    config: DerivationConfig,
    stats: RwLock<HashMap<Uuid, SubjectStats>>,
    recomputes: AtomicU64,
}

impl ProjectionCache {
    pub fn new(config: DerivationConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
            recomputes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DerivationConfig {
        &self.config
    }

    /// Recomputes one subject. `load` runs while the cache write lock is held,
    /// so two refreshes for the same subject cannot publish out of order.
    pub fn refresh<E>(
        &self,
        subject_id: Uuid,
        load: impl FnOnce() -> Result<Vec<ScanEvent>, E>,
    ) -> Result<SubjectStats, E> {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        let events = load()?;
        let derived = derive_subject_stats(subject_id, &events, &self.config);
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        if events.is_empty() {
            stats.remove(&subject_id);
        } else {
            stats.insert(subject_id, derived.clone());
        }
        Ok(derived)
    }

    pub fn get(&self, subject_id: &Uuid) -> Option<SubjectStats> {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<SubjectStats> {
        let mut all: Vec<SubjectStats> = self
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|stats| stats.subject_id);
        all
    }

    pub fn len(&self) -> usize {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }
}
