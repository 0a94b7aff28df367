//! Device-local durable queue of scans the ledger has not acknowledged yet.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions, create_dir_all, rename},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use schema::ScanEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_COMPACT_AFTER_RECORDS: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    #[error("outbox full ({capacity} entries); sync before scanning more")]
    Full { capacity: usize },
    #[error("outbox io error: {0}")]
    Io(String),
    #[error("outbox journal is corrupt: {0}")]
    Parse(String),
}

impl From<std::io::Error> for OutboxError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Acknowledged,
    Rejected,
    /// Retry budget exhausted; kept for an operator, never retried on its own.
    NeedsAttention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub local_seq: u64,
    pub event: ScanEvent,
    pub attempts: u32,
    pub next_retry_at: i64,
    pub status: PendingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 5 * 60_000,
            max_attempts: 12,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failures: base * 2^(attempts-1), capped.
    pub fn delay_after(&self, attempts: u32) -> i64 {
        let exponent = attempts.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.max_delay_ms)
            .max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    RejectNew,
    EvictOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reject_new" | "reject-new" | "reject" => Ok(Self::RejectNew),
            "evict_oldest" | "evict-oldest" | "evict" => Ok(Self::EvictOldest),
            other => Err(format!("unknown overflow policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    pub max_entries: usize,
    pub overflow: OverflowPolicy,
    pub retry: RetryPolicy,
    /// Journal records after which the journal is rewritten from live entries.
    pub compact_after_records: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            overflow: OverflowPolicy::default(),
            retry: RetryPolicy::default(),
            compact_after_records: DEFAULT_COMPACT_AFTER_RECORDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboxLoadStats {
    pub journal_records: usize,
    pub live_entries: usize,
    pub needs_attention: usize,
    pub skipped_torn_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JournalRecord {
    Upsert { entry: PendingEvent },
    Remove { event_id: Uuid, outcome: PendingStatus },
}

struct OutboxJournal {
    path: PathBuf,
    file: File,
    records: usize,
}

impl OutboxJournal {
    fn open(path: &Path) -> Result<(Self, Vec<JournalRecord>, usize), OutboxError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        let (records, torn_at) = if path.exists() {
            read_journal(path)?
        } else {
            (Vec::new(), None)
        };
        if let Some(offset) = torn_at {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let journal = Self {
            path: path.to_path_buf(),
            file,
            records: records.len(),
        };
        Ok((journal, records, usize::from(torn_at.is_some())))
    }

    fn append(&mut self, record: &JournalRecord) -> Result<(), OutboxError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        self.records += 1;
        Ok(())
    }

    fn rewrite<'a>(
        &mut self,
        entries: impl Iterator<Item = &'a PendingEvent>,
    ) -> Result<(), OutboxError> {
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut records = 0;
        for entry in entries {
            let record = JournalRecord::Upsert {
                entry: entry.clone(),
            };
            writeln!(tmp, "{}", serde_json::to_string(&record)?)?;
            records += 1;
        }
        tmp.sync_all()?;
        rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.records = records;
        Ok(())
    }
}

fn read_journal(path: &Path) -> Result<(Vec<JournalRecord>, Option<u64>), OutboxError> {
    let raw = std::fs::read_to_string(path)?;
    let lines: Vec<(usize, &str)> = raw
        .split_inclusive('\n')
        .scan(0usize, |offset, line| {
            let start = *offset;
            *offset += line.len();
            Some((start, line))
        })
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    let mut out = Vec::with_capacity(lines.len());
    let mut torn_at = None;
    for (index, (start, line)) in lines.iter().enumerate() {
        match serde_json::from_str(line.trim_end()) {
            Ok(record) => out.push(record),
            Err(err) if index + 1 == lines.len() => {
                warn!(path = %path.display(), error = %err, "skipping torn final outbox record");
                torn_at = Some(*start as u64);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((out, torn_at))
}

/// Bounded, optionally journaled queue of unacknowledged scans in capture order.
pub struct Outbox {
    entries: BTreeMap<u64, PendingEvent>,
    by_id: HashMap<Uuid, u64>,
    next_local_seq: u64,
    config: OutboxConfig,
    journal: Option<OutboxJournal>,
}

impl Outbox {
    pub fn in_memory(config: OutboxConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
            next_local_seq: 1,
            config,
            journal: None,
        }
    }

    pub fn open(
        path: impl AsRef<Path>,
        config: OutboxConfig,
    ) -> Result<(Self, OutboxLoadStats), OutboxError> {
        let (journal, records, skipped_torn_records) = OutboxJournal::open(path.as_ref())?;
        let mut outbox = Self::in_memory(config);
        let journal_records = records.len();
        for record in records {
            match record {
                JournalRecord::Upsert { entry } => outbox.insert_entry(entry),
                JournalRecord::Remove { event_id, .. } => {
                    outbox.remove_entry(&event_id);
                }
            }
        }
        outbox.journal = Some(journal);
        let stats = OutboxLoadStats {
            journal_records,
            live_entries: outbox.len(),
            needs_attention: outbox.attention().len(),
            skipped_torn_records,
        };
        outbox.compact_if_due()?;
        Ok((outbox, stats))
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, event_id: &Uuid) -> Option<&PendingEvent> {
        self.by_id
            .get(event_id)
            .and_then(|local_seq| self.entries.get(local_seq))
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingEvent> {
        self.entries.values()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == PendingStatus::Pending)
            .count()
    }

    pub fn attention(&self) -> Vec<&PendingEvent> {
        self.entries
            .values()
            .filter(|entry| entry.status == PendingStatus::NeedsAttention)
            .collect()
    }

    pub fn journal_records(&self) -> usize {
        self.journal.as_ref().map_or(0, |journal| journal.records)
    }

    /// Queues a freshly captured scan. Re-enqueueing a known id is a no-op.
    /// Returns the entry evicted to make room, if any.
    pub fn enqueue(
        &mut self,
        event: ScanEvent,
        now_ms: i64,
    ) -> Result<Option<PendingEvent>, OutboxError> {
        if self.by_id.contains_key(&event.id) {
            return Ok(None);
        }
        let mut evicted = None;
        if self.entries.len() >= self.config.max_entries.max(1) {
            match self.config.overflow {
                OverflowPolicy::RejectNew => {
                    return Err(OutboxError::Full {
                        capacity: self.config.max_entries,
                    });
                }
                OverflowPolicy::EvictOldest => {
                    let oldest = self
                        .entries
                        .values()
                        .next()
                        .map(|entry| entry.event.id);
                    if let Some(oldest) = oldest {
                        self.journal_append(&JournalRecord::Remove {
                            event_id: oldest,
                            outcome: PendingStatus::Rejected,
                        })?;
                        let entry = self.remove_entry(&oldest);
                        if let Some(entry) = entry.as_ref() {
                            warn!(
                                event_id = %entry.event.id,
                                subject_id = %entry.event.subject_id,
                                attempts = entry.attempts,
                                "outbox full; evicted oldest unsynced scan"
                            );
                        }
                        evicted = entry;
                    }
                }
            }
        }
        let entry = PendingEvent {
            local_seq: self.next_local_seq,
            event,
            attempts: 0,
            next_retry_at: now_ms,
            status: PendingStatus::Pending,
            last_error: None,
        };
        self.journal_append(&JournalRecord::Upsert {
            entry: entry.clone(),
        })?;
        self.insert_entry(entry);
        Ok(evicted)
    }

    /// Pending entries whose retry time has come, oldest capture first.
    pub fn due(&self, now_ms: i64, limit: usize) -> Vec<PendingEvent> {
        self.entries
            .values()
            .filter(|entry| entry.status == PendingStatus::Pending && entry.next_retry_at <= now_ms)
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    pub fn next_due_at(&self) -> Option<i64> {
        self.entries
            .values()
            .filter(|entry| entry.status == PendingStatus::Pending)
            .map(|entry| entry.next_retry_at)
            .min()
    }

    /// Terminal success: the ledger holds the event or already holds an equivalent one.
    pub fn acknowledge(&mut self, event_id: &Uuid) -> Result<Option<PendingEvent>, OutboxError> {
        self.finish(event_id, PendingStatus::Acknowledged)
    }

    /// Terminal rejection: resending could never succeed.
    pub fn reject(
        &mut self,
        event_id: &Uuid,
        reason: &str,
    ) -> Result<Option<PendingEvent>, OutboxError> {
        let removed = self.finish(event_id, PendingStatus::Rejected)?;
        if let Some(entry) = removed.as_ref() {
            warn!(
                event_id = %entry.event.id,
                subject_id = %entry.event.subject_id,
                reason,
                "ledger rejected scan; dropped from outbox"
            );
        }
        Ok(removed)
    }

    /// Schedules the next attempt, or parks the entry once the retry budget is spent.
    pub fn record_failure(
        &mut self,
        event_id: &Uuid,
        error: &str,
        now_ms: i64,
    ) -> Result<Option<PendingStatus>, OutboxError> {
        let Some(mut entry) = self.get(event_id).cloned() else {
            return Ok(None);
        };
        if entry.status != PendingStatus::Pending {
            return Ok(Some(entry.status));
        }
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = Some(error.to_string());
        if entry.attempts >= self.config.retry.max_attempts {
            entry.status = PendingStatus::NeedsAttention;
            warn!(
                event_id = %entry.event.id,
                subject_id = %entry.event.subject_id,
                attempts = entry.attempts,
                error,
                "retry budget exhausted; scan needs attention"
            );
        } else {
            entry.next_retry_at = now_ms.saturating_add(self.config.retry.delay_after(entry.attempts));
            debug!(
                event_id = %entry.event.id,
                attempts = entry.attempts,
                next_retry_at = entry.next_retry_at,
                "scan push failed; backing off"
            );
        }
        let status = entry.status;
        self.journal_append(&JournalRecord::Upsert {
            entry: entry.clone(),
        })?;
        self.insert_entry(entry);
        Ok(Some(status))
    }

    /// Operator action: puts every parked entry back on the retry schedule.
    pub fn requeue_attention(&mut self, now_ms: i64) -> Result<usize, OutboxError> {
        let parked: Vec<PendingEvent> = self
            .entries
            .values()
            .filter(|entry| entry.status == PendingStatus::NeedsAttention)
            .cloned()
            .collect();
        for mut entry in parked.iter().cloned() {
            entry.status = PendingStatus::Pending;
            entry.attempts = 0;
            entry.next_retry_at = now_ms;
            self.journal_append(&JournalRecord::Upsert {
                entry: entry.clone(),
            })?;
            self.insert_entry(entry);
        }
        Ok(parked.len())
    }

    /// Rewrites the journal from live entries.
    pub fn compact(&mut self) -> Result<(), OutboxError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.rewrite(self.entries.values())?;
        }
        Ok(())
    }

    fn compact_if_due(&mut self) -> Result<(), OutboxError> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(());
        };
        let threshold = self.config.compact_after_records.max(1);
        if journal.records >= threshold && journal.records > self.entries.len().saturating_mul(2) {
            let before = journal.records;
            self.compact()?;
            debug!(before, after = self.entries.len(), "outbox journal compacted");
        }
        Ok(())
    }

    fn finish(
        &mut self,
        event_id: &Uuid,
        outcome: PendingStatus,
    ) -> Result<Option<PendingEvent>, OutboxError> {
        if !self.by_id.contains_key(event_id) {
            return Ok(None);
        }
        self.journal_append(&JournalRecord::Remove {
            event_id: *event_id,
            outcome,
        })?;
        let removed = self.remove_entry(event_id);
        self.compact_if_due()?;
        Ok(removed)
    }

    fn journal_append(&mut self, record: &JournalRecord) -> Result<(), OutboxError> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(record),
            None => Ok(()),
        }
    }

    fn insert_entry(&mut self, entry: PendingEvent) {
        self.next_local_seq = self.next_local_seq.max(entry.local_seq + 1);
        self.by_id.insert(entry.event.id, entry.local_seq);
        self.entries.insert(entry.local_seq, entry);
    }

    fn remove_entry(&mut self, event_id: &Uuid) -> Option<PendingEvent> {
        let local_seq = self.by_id.remove(event_id)?;
        self.entries.remove(&local_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::scan_event_builder;

    const NOW: i64 = 1_767_240_000_000;

    fn event(at: i64) -> ScanEvent {
        scan_event_builder(Uuid::new_v4(), 1, "device-a", at)
    }

    fn small(max_entries: usize, overflow: OverflowPolicy) -> OutboxConfig {
        OutboxConfig {
            max_entries,
            overflow,
            ..OutboxConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        };
        assert_eq!(policy.delay_after(1), 1_000);
        assert_eq!(policy.delay_after(2), 2_000);
        assert_eq!(policy.delay_after(4), 8_000);
        assert_eq!(policy.delay_after(5), 10_000);
        assert_eq!(policy.delay_after(200), 10_000);
    }

    #[test]
    fn enqueue_is_idempotent_per_event_id() {
        let mut outbox = Outbox::in_memory(OutboxConfig::default());
        let scan = event(NOW);
        outbox.enqueue(scan.clone(), NOW).unwrap();
        outbox.enqueue(scan, NOW).unwrap();
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn reject_new_policy_fails_capture_when_full() {
        let mut outbox = Outbox::in_memory(small(2, OverflowPolicy::RejectNew));
        outbox.enqueue(event(NOW), NOW).unwrap();
        outbox.enqueue(event(NOW + 1), NOW).unwrap();
        let err = outbox.enqueue(event(NOW + 2), NOW).unwrap_err();
        assert_eq!(err, OutboxError::Full { capacity: 2 });
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn evict_oldest_policy_returns_evicted_entry() {
        let mut outbox = Outbox::in_memory(small(2, OverflowPolicy::EvictOldest));
        let first = event(NOW);
        outbox.enqueue(first.clone(), NOW).unwrap();
        outbox.enqueue(event(NOW + 1), NOW).unwrap();
        let evicted = outbox.enqueue(event(NOW + 2), NOW).unwrap().unwrap();
        assert_eq!(evicted.event.id, first.id);
        assert_eq!(outbox.len(), 2);
        assert!(outbox.get(&first.id).is_none());
    }

    #[test]
    fn due_respects_backoff_and_order() {
        let mut outbox = Outbox::in_memory(OutboxConfig::default());
        let a = event(NOW);
        let b = event(NOW + 1);
        outbox.enqueue(a.clone(), NOW).unwrap();
        outbox.enqueue(b.clone(), NOW).unwrap();

        outbox.record_failure(&a.id, "timeout", NOW).unwrap();
        let due: Vec<Uuid> = outbox.due(NOW, 10).iter().map(|e| e.event.id).collect();
        assert_eq!(due, vec![b.id]);

        let later: Vec<Uuid> = outbox
            .due(NOW + 2_000, 10)
            .iter()
            .map(|e| e.event.id)
            .collect();
        assert_eq!(later, vec![a.id, b.id]);
        assert_eq!(outbox.next_due_at(), Some(NOW));
    }

    #[test]
    fn exhausted_retries_park_entry_until_requeued() {
        let mut outbox = Outbox::in_memory(OutboxConfig {
            retry: RetryPolicy {
                base_delay_ms: 10,
                max_delay_ms: 10,
                max_attempts: 2,
            },
            ..OutboxConfig::default()
        });
        let scan = event(NOW);
        outbox.enqueue(scan.clone(), NOW).unwrap();
        assert_eq!(
            outbox.record_failure(&scan.id, "503", NOW).unwrap(),
            Some(PendingStatus::Pending)
        );
        assert_eq!(
            outbox.record_failure(&scan.id, "503", NOW + 10).unwrap(),
            Some(PendingStatus::NeedsAttention)
        );
        assert!(outbox.due(NOW + 1_000_000, 10).is_empty());
        assert_eq!(outbox.attention().len(), 1);
        assert_eq!(outbox.len(), 1);

        assert_eq!(outbox.requeue_attention(NOW + 20).unwrap(), 1);
        let due = outbox.due(NOW + 20, 10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 0);
    }

    #[test]
    fn journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let kept = event(NOW);
        let acked = event(NOW + 1);
        let parked = event(NOW + 2);
        {
            let (mut outbox, _) = Outbox::open(
                &path,
                OutboxConfig {
                    retry: RetryPolicy {
                        max_attempts: 1,
                        ..RetryPolicy::default()
                    },
                    ..OutboxConfig::default()
                },
            )
            .unwrap();
            outbox.enqueue(kept.clone(), NOW).unwrap();
            outbox.enqueue(acked.clone(), NOW).unwrap();
            outbox.enqueue(parked.clone(), NOW).unwrap();
            outbox.acknowledge(&acked.id).unwrap();
            outbox.record_failure(&parked.id, "boom", NOW).unwrap();
        }

        let (outbox, stats) = Outbox::open(&path, OutboxConfig::default()).unwrap();
        assert_eq!(stats.live_entries, 2);
        assert_eq!(stats.needs_attention, 1);
        assert!(outbox.get(&kept.id).is_some());
        assert!(outbox.get(&acked.id).is_none());
        assert_eq!(
            outbox.get(&parked.id).unwrap().last_error.as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn journal_compacts_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let config = OutboxConfig {
            compact_after_records: 4,
            ..OutboxConfig::default()
        };
        let (mut outbox, _) = Outbox::open(&path, config).unwrap();
        let keep = event(NOW);
        outbox.enqueue(keep.clone(), NOW).unwrap();
        for offset in 1..=3 {
            let scan = event(NOW + offset);
            outbox.enqueue(scan.clone(), NOW).unwrap();
            outbox.acknowledge(&scan.id).unwrap();
        }
        assert!(outbox.journal_records() < 4);
        drop(outbox);

        let (outbox, stats) = Outbox::open(&path, config).unwrap();
        assert_eq!(stats.live_entries, 1);
        assert!(outbox.get(&keep.id).is_some());
    }

    #[test]
    fn torn_final_journal_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let scan = event(NOW);
        {
            let (mut outbox, _) = Outbox::open(&path, OutboxConfig::default()).unwrap();
            outbox.enqueue(scan.clone(), NOW).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"type\":\"upsert\",\"entry\":{{\"local_seq\":2").unwrap();
        drop(file);

        let (mut outbox, stats) = Outbox::open(&path, OutboxConfig::default()).unwrap();
        assert_eq!(stats.skipped_torn_records, 1);
        assert_eq!(outbox.len(), 1);
        outbox.enqueue(event(NOW + 5), NOW).unwrap();
        drop(outbox);

        let (outbox, stats) = Outbox::open(&path, OutboxConfig::default()).unwrap();
        assert_eq!(stats.skipped_torn_records, 0);
        assert_eq!(outbox.len(), 2);
    }
}
