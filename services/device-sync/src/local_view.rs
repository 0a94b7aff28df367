use std::collections::HashSet;

use derivation::{
    AtRiskSubject, AtRiskThresholds, DerivationConfig, SubjectStats, derive_subject_stats,
    detect_at_risk,
};
use schema::ScanEvent;
use store::{EventLog, EventPage, InMemoryStore, PurgedEvent, StoreError, StoredEvent};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeStats {
    pub received: usize,
    pub inserted: usize,
    pub confirmed_own: usize,
    pub purged: usize,
}

/// Own captures the ledger has not sequenced yet sort after every ledger
/// event recorded at the same instant.
pub const PROVISIONAL_SEQ_BASE: u64 = 1 << 62;

/// The device's picture of the ledger: pulled events unioned with its own
/// optimistic captures. Pulled events keep their ledger sequence so ties on
/// `occurred_at` order the same way on every device.
pub struct LocalView {
    events: InMemoryStore,
    own_unconfirmed: HashSet<Uuid>,
    next_provisional_seq: u64,
    watermark: u64,
    derivation: DerivationConfig,
}

impl LocalView {
    pub fn new(derivation: DerivationConfig) -> Self {
        Self {
            events: InMemoryStore::new(),
            own_unconfirmed: HashSet::new(),
            next_provisional_seq: PROVISIONAL_SEQ_BASE,
            watermark: 0,
            derivation,
        }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, event_id: &Uuid) -> bool {
        self.events.get(event_id).is_some()
    }

    pub fn sequence_of(&self, event_id: &Uuid) -> Option<u64> {
        self.events.get(event_id).map(|stored| stored.seq)
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.own_unconfirmed.len()
    }

    /// Optimistic insert of a scan captured on this device.
    pub fn record_local(&mut self, event: ScanEvent) -> Result<(), StoreError> {
        let event_id = event.id;
        if self.contains(&event_id) {
            return Ok(());
        }
        self.events.insert_at(self.next_provisional_seq, event)?;
        self.next_provisional_seq += 1;
        self.own_unconfirmed.insert(event_id);
        Ok(())
    }

    /// The ledger stored our event, under `ledger_seq` when the gate reported it.
    pub fn confirm_own(&mut self, event_id: &Uuid, ledger_seq: Option<u64>) -> Result<(), StoreError> {
        self.own_unconfirmed.remove(event_id);
        if let (Some(seq), Some(stored)) = (ledger_seq, self.events.get(event_id)) {
            self.events.insert_at(seq, stored.event)?;
        }
        Ok(())
    }

    /// The ledger refused our event (duplicate or invalid); its decision wins.
    pub fn drop_own(&mut self, event_id: &Uuid) -> Result<bool, StoreError> {
        self.own_unconfirmed.remove(event_id);
        Ok(self.events.forget(event_id)?.is_some())
    }

    /// Unions a pulled page into the view, applying events and purges in
    /// ledger order. The watermark only moves forward.
    pub fn merge_remote(&mut self, page: &EventPage) -> Result<MergeStats, StoreError> {
        let mut stats = MergeStats {
            received: page.events.len(),
            ..MergeStats::default()
        };
        let mut purges = page.purged.iter().peekable();
        for stored in &page.events {
            while let Some(purged) = purges.next_if(|purged| purged.seq < stored.seq) {
                self.apply_purge(purged, &mut stats)?;
            }
            self.apply_remote(stored, &mut stats)?;
        }
        for purged in purges {
            self.apply_purge(purged, &mut stats)?;
        }
        if page.next_seq > self.watermark {
            self.watermark = page.next_seq;
        }
        debug!(
            received = stats.received,
            inserted = stats.inserted,
            purged = stats.purged,
            watermark = self.watermark,
            "merged ledger page"
        );
        Ok(stats)
    }

    fn apply_remote(&mut self, stored: &StoredEvent, stats: &mut MergeStats) -> Result<(), StoreError> {
        if self.own_unconfirmed.remove(&stored.event.id) {
            stats.confirmed_own += 1;
        }
        let known = self.contains(&stored.event.id);
        self.events.insert_at(stored.seq, stored.event.clone())?;
        if !known {
            stats.inserted += 1;
        }
        Ok(())
    }

    fn apply_purge(&mut self, purged: &PurgedEvent, stats: &mut MergeStats) -> Result<(), StoreError> {
        self.own_unconfirmed.remove(&purged.event_id);
        if self.events.forget(&purged.event_id)?.is_some() {
            stats.purged += 1;
        }
        Ok(())
    }

    /// Closest scan of the same subject at the same checkpoint that the
    /// ledger has confirmed. Own scans still awaiting the gate are skipped.
    pub fn nearest_confirmed_same_pair(&self, event: &ScanEvent) -> Option<StoredEvent> {
        self.events
            .query_by_subject(&event.subject_id)
            .into_iter()
            .filter(|stored| {
                stored.event.checkpoint_id == event.checkpoint_id
                    && !self.own_unconfirmed.contains(&stored.event.id)
            })
            .min_by_key(|stored| stored.event.occurred_at.abs_diff(event.occurred_at))
    }

    pub fn subject_events(&self, subject_id: &Uuid) -> Vec<ScanEvent> {
        self.events
            .query_by_subject(subject_id)
            .into_iter()
            .map(|stored| stored.event)
            .collect()
    }

    pub fn subject_stats(&self, subject_id: &Uuid) -> SubjectStats {
        derive_subject_stats(*subject_id, &self.subject_events(subject_id), &self.derivation)
    }

    pub fn at_risk(&self, thresholds: &AtRiskThresholds, now_ms: i64) -> Vec<AtRiskSubject> {
        let stats: Vec<SubjectStats> = self
            .events
            .subject_ids()
            .iter()
            .map(|subject_id| self.subject_stats(subject_id))
            .collect();
        detect_at_risk(&stats, thresholds, now_ms)
    }
}
