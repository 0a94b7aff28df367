use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::{OpenOptions, create_dir_all, rename},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use schema::{CheckpointId, DedupKey, ScanEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("event {0} already stored with a different payload")]
    Conflict(Uuid),
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a caller may retry the same request later and expect a different result.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

/// A scan event together with its store-assigned insertion sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: u64,
    pub event: ScanEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(StoredEvent),
    /// Same id already stored with an identical payload; nothing was written.
    AlreadyPresent(StoredEvent),
}

impl AppendOutcome {
    pub fn stored(&self) -> &StoredEvent {
        match self {
            Self::Appended(stored) | Self::AlreadyPresent(stored) => stored,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Self::AlreadyPresent(_))
    }
}

/// Marks an event removed by an administrator. A purge takes its own
/// sequence number so replicas past the event's sequence still see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgedEvent {
    pub seq: u64,
    pub event_id: Uuid,
}

/// One page of the ledger in sequence order, used by device pull loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<StoredEvent>,
    /// Purges sequenced inside this page; replicas drop these ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub purged: Vec<PurgedEvent>,
    /// Watermark to send on the next request.
    pub next_seq: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PersistedRecord {
    Scan { seq: u64, event: ScanEvent },
    Purge { seq: u64, event_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotHeader {
    snapshot_version: u32,
    last_seq: u64,
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalCheckpointStats {
    pub snapshot_records: usize,
    pub truncated_wal_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointPolicy {
    pub max_wal_records: Option<usize>,
    pub max_wal_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WalReplayStats {
    pub snapshot_records: usize,
    pub wal_records: usize,
    pub skipped_torn_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreLoadStats {
    pub replay: WalReplayStats,
    pub events_loaded: usize,
    pub purges_applied: usize,
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreIndexStats {
    pub event_count: usize,
    pub subject_count: usize,
    pub checkpoint_count: usize,
    pub pair_count: usize,
    pub last_seq: u64,
}

pub struct FileWal {
    path: PathBuf,
    wal_records: usize,
    sync_every_records: usize,
    append_buffer_max_records: usize,
    sync_interval: Option<Duration>,
    append_buffer: Vec<String>,
    unsynced_records: usize,
    last_sync_at: Instant,
    /// Start of the newest line handed to the file, for rolling back a failed append.
    last_line_offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalWritePolicy {
    pub sync_every_records: usize,
    pub append_buffer_max_records: usize,
    pub sync_interval: Option<Duration>,
}

impl Default for WalWritePolicy {
    fn default() -> Self {
        Self {
            sync_every_records: 1,
            append_buffer_max_records: 1,
            sync_interval: None,
        }
    }
}

struct ReplayedLog {
    last_seq: u64,
    records: Vec<PersistedRecord>,
    torn_at: Option<u64>,
    stats: WalReplayStats,
}

impl FileWal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_policy(path, WalWritePolicy::default())
    }

    pub fn open_with_policy(
        path: impl AsRef<Path>,
        policy: WalWritePolicy,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        let wal_records = count_non_empty_lines(&path)?;
        Ok(Self {
            path,
            wal_records,
            sync_every_records: policy.sync_every_records.max(1),
            append_buffer_max_records: policy.append_buffer_max_records.max(1),
            sync_interval: policy.sync_interval,
            append_buffer: Vec::new(),
            unsynced_records: 0,
            last_sync_at: Instant::now(),
            last_line_offset: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync_every_records(&self) -> usize {
        self.sync_every_records
    }

    pub fn append_buffer_max_records(&self) -> usize {
        self.append_buffer_max_records
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval
    }

    pub fn unsynced_record_count(&self) -> usize {
        self.unsynced_records
    }

    pub fn buffered_record_count(&self) -> usize {
        self.append_buffer.len()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".snapshot");
        PathBuf::from(path)
    }

    pub fn wal_record_count(&self) -> usize {
        self.wal_records
    }

    pub fn wal_size_bytes(&self) -> Result<u64, StoreError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn append_scan(&mut self, seq: u64, event: &ScanEvent) -> Result<(), StoreError> {
        self.append_record(&PersistedRecord::Scan {
            seq,
            event: event.clone(),
        })
    }

    fn append_purge(&mut self, seq: u64, event_id: Uuid) -> Result<(), StoreError> {
        self.append_record(&PersistedRecord::Purge { seq, event_id })
    }

    /// Either the record is buffered or written as configured, or the wal is
    /// left exactly as it was before the call.
    fn append_record(&mut self, record: &PersistedRecord) -> Result<(), StoreError> {
        self.append_buffer.push(serde_json::to_string(record)?);
        self.wal_records += 1;
        self.unsynced_records += 1;
        if let Err(err) = self.write_through() {
            self.roll_back_last_record();
            return Err(err);
        }
        Ok(())
    }

    fn write_through(&mut self) -> Result<(), StoreError> {
        if self.append_buffer.len() >= self.append_buffer_max_records {
            self.flush_append_buffer()?;
        }
        let interval_elapsed = self
            .sync_interval
            .is_some_and(|interval| self.last_sync_at.elapsed() >= interval);
        if self.unsynced_records >= self.sync_every_records || interval_elapsed {
            self.flush_pending_sync()?;
        }
        Ok(())
    }

    fn roll_back_last_record(&mut self) {
        self.wal_records = self.wal_records.saturating_sub(1);
        self.unsynced_records = self.unsynced_records.saturating_sub(1);
        if self.append_buffer.pop().is_some() {
            return;
        }
        // The line reached the file but the sync failed.
        let Some(offset) = self.last_line_offset.take() else {
            return;
        };
        let cut = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| file.set_len(offset));
        if let Err(err) = cut {
            warn!(path = %self.path.display(), offset, error = %err, "could not roll back failed wal append");
        }
    }

    pub fn flush_pending_sync_if_interval_elapsed(&mut self) -> Result<bool, StoreError> {
        let Some(interval) = self.sync_interval else {
            return Ok(false);
        };
        if self.unsynced_records == 0 || self.last_sync_at.elapsed() < interval {
            return Ok(false);
        }
        self.flush_pending_sync()?;
        Ok(true)
    }

    pub fn flush_pending_sync_if_unsynced(&mut self) -> Result<bool, StoreError> {
        if self.unsynced_records == 0 {
            return Ok(false);
        }
        self.flush_pending_sync()?;
        Ok(true)
    }

    /// Writes the buffer as one batch. On failure the partial write is cut off
    /// and the buffer kept, so the same lines can be written again.
    fn flush_append_buffer(&mut self) -> Result<(), StoreError> {
        if self.append_buffer.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        let mut batch = String::new();
        let mut last_line_start = 0usize;
        for line in &self.append_buffer {
            last_line_start = batch.len();
            batch.push_str(line);
            batch.push('\n');
        }
        if let Err(err) = file.write_all(batch.as_bytes()) {
            if let Err(cut) = file.set_len(start) {
                warn!(path = %self.path.display(), error = %cut, "could not cut partial wal write");
            }
            return Err(err.into());
        }
        self.append_buffer.clear();
        self.last_line_offset = Some(start + last_line_start as u64);
        Ok(())
    }

    pub fn flush_pending_sync(&mut self) -> Result<(), StoreError> {
        self.flush_append_buffer()?;
        if self.unsynced_records == 0 {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.sync_data()?;
        self.unsynced_records = 0;
        self.last_sync_at = Instant::now();
        Ok(())
    }

    fn replay(&self) -> Result<ReplayedLog, StoreError> {
        let (last_seq, snapshot_records) = self.replay_snapshot_records()?;
        let (mut wal_records, torn_at) = self.replay_wal_records()?;
        for line in &self.append_buffer {
            wal_records.push(serde_json::from_str(line)?);
        }
        let stats = WalReplayStats {
            snapshot_records: snapshot_records.len(),
            wal_records: wal_records.len(),
            skipped_torn_records: usize::from(torn_at.is_some()),
        };
        let mut records = snapshot_records;
        records.extend(wal_records);
        Ok(ReplayedLog {
            last_seq,
            records,
            torn_at,
            stats,
        })
    }

    fn replay_snapshot_records(&self) -> Result<(u64, Vec<PersistedRecord>), StoreError> {
        let snapshot_path = self.snapshot_path();
        if !snapshot_path.exists() {
            return Ok((0, Vec::new()));
        }
        let file = OpenOptions::new().read(true).open(snapshot_path)?;
        let mut lines = BufReader::new(file).lines();
        let header_line = loop {
            match lines.next() {
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    break line;
                }
                None => return Err(StoreError::Parse("snapshot file is empty".to_string())),
            }
        };
        let header: SnapshotHeader = serde_json::from_str(&header_line)
            .map_err(|_| StoreError::Parse("snapshot file has invalid header".to_string()))?;
        if header.snapshot_version != SNAPSHOT_VERSION {
            return Err(StoreError::Parse(format!(
                "unsupported snapshot version {}",
                header.snapshot_version
            )));
        }

        let mut out = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok((header.last_seq, out))
    }

    /// A crash mid-write can leave a partial final line. It is skipped and its
    /// byte offset returned so the tail can be cut; any other bad line is fatal.
    fn replay_wal_records(&self) -> Result<(Vec<PersistedRecord>, Option<u64>), StoreError> {
        let raw = std::fs::read_to_string(&self.path)?;
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
                    warn!(path = %self.path.display(), error = %err, "skipping torn final wal record");
                    torn_at = Some(*start as u64);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok((out, torn_at))
    }

    fn cut_torn_tail(&mut self, offset: u64) -> Result<(), StoreError> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        self.wal_records = self.wal_records.saturating_sub(1);
        Ok(())
    }

    fn write_snapshot_records(
        &self,
        last_seq: u64,
        records: &[PersistedRecord],
    ) -> Result<(), StoreError> {
        let snapshot_path = self.snapshot_path();
        if let Some(parent) = snapshot_path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }

        let mut tmp_path = snapshot_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let header = SnapshotHeader {
            snapshot_version: SNAPSHOT_VERSION,
            last_seq,
        };
        writeln!(file, "{}", serde_json::to_string(&header)?)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        file.sync_all()?;
        rename(tmp_path, snapshot_path)?;
        Ok(())
    }

    fn truncate_wal(&mut self) -> Result<(), StoreError> {
        self.append_buffer.clear();
        self.last_line_offset = None;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.wal_records = 0;
        self.unsynced_records = 0;
        self.last_sync_at = Instant::now();
        Ok(())
    }

    fn compact_with_snapshot(
        &mut self,
        last_seq: u64,
        snapshot_records: &[PersistedRecord],
    ) -> Result<WalCheckpointStats, StoreError> {
        let truncated_wal_records = self.wal_records;
        self.flush_pending_sync()?;
        self.write_snapshot_records(last_seq, snapshot_records)?;
        self.truncate_wal()?;
        Ok(WalCheckpointStats {
            snapshot_records: snapshot_records.len(),
            truncated_wal_records,
        })
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        let _ = self.flush_pending_sync();
    }
}

/// Read and write contract of the shared scan ledger.
///
/// Implementations order per-subject and per-checkpoint results by
/// `occurred_at`, breaking ties by insertion sequence.
pub trait EventLog: Send + Sync {
    fn append(&mut self, event: ScanEvent) -> Result<AppendOutcome, StoreError>;
    fn get(&self, event_id: &Uuid) -> Option<StoredEvent>;
    fn query_by_subject(&self, subject_id: &Uuid) -> Vec<StoredEvent>;
    fn query_by_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        since: Option<i64>,
    ) -> Vec<StoredEvent>;
    /// Accepted event of the pair whose `occurred_at` is closest to `occurred_at`.
    fn nearest_for_pair(&self, key: &DedupKey, occurred_at: i64) -> Option<StoredEvent>;
    fn events_after(&self, after_seq: u64, limit: usize) -> EventPage;
    fn subject_ids(&self) -> Vec<Uuid>;
    /// Removes an event and records a tombstone under the next sequence.
    fn purge(&mut self, event_id: &Uuid) -> Result<Option<StoredEvent>, StoreError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type TimeKey = (i64, u64);

#[derive(Default)]
pub struct InMemoryStore {
    events: BTreeMap<u64, ScanEvent>,
    by_id: HashMap<Uuid, u64>,
    by_subject: HashMap<Uuid, BTreeSet<TimeKey>>,
    by_checkpoint: HashMap<CheckpointId, BTreeSet<TimeKey>>,
    by_time: BTreeSet<TimeKey>,
    by_pair: HashMap<DedupKey, BTreeSet<TimeKey>>,
    tombstones: BTreeMap<u64, Uuid>,
    last_seq: u64,
    wal: Option<FileWal>,
    checkpoint_policy: CheckpointPolicy,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_wal(wal: FileWal, policy: CheckpointPolicy) -> Result<Self, StoreError> {
        let (store, _) = Self::load_from_wal_with_stats(wal, policy)?;
        Ok(store)
    }

    pub fn load_from_wal_with_stats(
        mut wal: FileWal,
        policy: CheckpointPolicy,
    ) -> Result<(Self, StoreLoadStats), StoreError> {
        let replayed = wal.replay()?;
        if let Some(offset) = replayed.torn_at {
            wal.cut_torn_tail(offset)?;
        }
        let mut store = Self {
            last_seq: replayed.last_seq,
            checkpoint_policy: policy,
            ..Self::default()
        };
        let mut events_loaded = 0usize;
        let mut purges_applied = 0usize;
        for record in replayed.records {
            match record {
                PersistedRecord::Scan { seq, event } => {
                    if let Some(existing) = store.get(&event.id) {
                        // A retried write may have left the same record twice.
                        if existing.seq == seq && existing.event == event {
                            warn!(event_id = %event.id, seq, "skipping repeated wal record");
                            continue;
                        }
                        return Err(StoreError::Parse(format!(
                            "wal holds event {} twice",
                            event.id
                        )));
                    }
                    events_loaded += 1;
                    store.last_seq = store.last_seq.max(seq);
                    store.apply_scan(seq, event);
                }
                PersistedRecord::Purge { seq, event_id } => {
                    store.last_seq = store.last_seq.max(seq);
                    store.tombstones.insert(seq, event_id);
                    if store.remove_event(&event_id).is_some() {
                        purges_applied += 1;
                    }
                }
            }
        }
        store.wal = Some(wal);
        let stats = StoreLoadStats {
            replay: replayed.stats,
            events_loaded,
            purges_applied,
            last_seq: store.last_seq,
        };
        Ok((store, stats))
    }

    pub fn wal(&self) -> Option<&FileWal> {
        self.wal.as_ref()
    }

    pub fn checkpoint_policy(&self) -> &CheckpointPolicy {
        &self.checkpoint_policy
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Stores an event under a sequence assigned by another log, as a replica
    /// of the shared ledger does. An id already held under a different
    /// sequence moves to `seq`. Only in-memory stores accept this.
    pub fn insert_at(&mut self, seq: u64, event: ScanEvent) -> Result<AppendOutcome, StoreError> {
        if self.wal.is_some() {
            return Err(StoreError::Unavailable(
                "a wal-backed ledger assigns its own sequence".to_string(),
            ));
        }
        if let Some(existing) = self.get(&event.id) {
            if existing.event != event {
                return Err(StoreError::Conflict(event.id));
            }
            if existing.seq == seq {
                return Ok(AppendOutcome::AlreadyPresent(existing));
            }
        }
        if self
            .events
            .get(&seq)
            .is_some_and(|occupant| occupant.id != event.id)
        {
            return Err(StoreError::Conflict(event.id));
        }
        self.remove_event(&event.id);
        self.last_seq = self.last_seq.max(seq);
        self.apply_scan(seq, event.clone());
        Ok(AppendOutcome::Appended(StoredEvent { seq, event }))
    }

    /// Drops an event without sequencing a purge, for replicas applying a
    /// purge the ledger already recorded. Only in-memory stores accept this.
    pub fn forget(&mut self, event_id: &Uuid) -> Result<Option<StoredEvent>, StoreError> {
        if self.wal.is_some() {
            return Err(StoreError::Unavailable(
                "a wal-backed ledger removes events through purge".to_string(),
            ));
        }
        Ok(self.remove_event(event_id))
    }

    pub fn last_for_pair(&self, key: &DedupKey) -> Option<StoredEvent> {
        self.by_pair
            .get(key)
            .and_then(|set| set.iter().next_back())
            .and_then(|(_, seq)| self.stored(*seq))
    }

    /// Events with `from <= occurred_at < to`, in time order.
    pub fn query_time_range(&self, from: i64, to: i64) -> Vec<StoredEvent> {
        if from >= to {
            return Vec::new();
        }
        self.by_time
            .range((from, 0)..(to, 0))
            .filter_map(|(_, seq)| self.stored(*seq))
            .collect()
    }

    pub fn index_stats(&self) -> StoreIndexStats {
        StoreIndexStats {
            event_count: self.events.len(),
            subject_count: self.by_subject.len(),
            checkpoint_count: self.by_checkpoint.len(),
            pair_count: self.by_pair.len(),
            last_seq: self.last_seq,
        }
    }

    pub fn flush_wal_if_interval_elapsed(&mut self) -> Result<bool, StoreError> {
        match self.wal.as_mut() {
            Some(wal) => wal.flush_pending_sync_if_interval_elapsed(),
            None => Ok(false),
        }
    }

    pub fn flush_wal(&mut self) -> Result<bool, StoreError> {
        match self.wal.as_mut() {
            Some(wal) => wal.flush_pending_sync_if_unsynced(),
            None => Ok(false),
        }
    }

    pub fn checkpoint_and_compact(&mut self) -> Result<Option<WalCheckpointStats>, StoreError> {
        let records = self.snapshot_records();
        let last_seq = self.last_seq;
        match self.wal.as_mut() {
            Some(wal) => wal.compact_with_snapshot(last_seq, &records).map(Some),
            None => Ok(None),
        }
    }

    fn should_checkpoint(&self) -> Result<bool, StoreError> {
        let Some(wal) = self.wal.as_ref() else {
            return Ok(false);
        };
        if let Some(max_wal_records) = self.checkpoint_policy.max_wal_records
            && wal.wal_record_count() >= max_wal_records
        {
            return Ok(true);
        }
        if let Some(max_wal_bytes) = self.checkpoint_policy.max_wal_bytes
            && wal.wal_size_bytes()? >= max_wal_bytes
        {
            return Ok(true);
        }
        Ok(false)
    }

    /// The triggering write is already durable in the wal, so a failed compaction only warns.
    fn checkpoint_if_due(&mut self) {
        match self.should_checkpoint() {
            Ok(true) => match self.checkpoint_and_compact() {
                Ok(Some(stats)) => info!(
                    snapshot_records = stats.snapshot_records,
                    truncated_wal_records = stats.truncated_wal_records,
                    "event log checkpoint written"
                ),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "event log checkpoint failed"),
            },
            Ok(false) => {}
            Err(err) => warn!(error = %err, "event log checkpoint policy check failed"),
        }
    }

    /// Live events and tombstones, merged in sequence order.
    fn snapshot_records(&self) -> Vec<PersistedRecord> {
        let mut records: Vec<(u64, PersistedRecord)> = self
            .events
            .iter()
            .map(|(seq, event)| {
                (
                    *seq,
                    PersistedRecord::Scan {
                        seq: *seq,
                        event: event.clone(),
                    },
                )
            })
            .chain(self.tombstones.iter().map(|(seq, event_id)| {
                (
                    *seq,
                    PersistedRecord::Purge {
                        seq: *seq,
                        event_id: *event_id,
                    },
                )
            }))
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, record)| record).collect()
    }

    fn stored(&self, seq: u64) -> Option<StoredEvent> {
        self.events.get(&seq).map(|event| StoredEvent {
            seq,
            event: event.clone(),
        })
    }

    fn collect(&self, keys: Option<&BTreeSet<TimeKey>>) -> Vec<StoredEvent> {
        keys.map(|set| {
            set.iter()
                .filter_map(|(_, seq)| self.stored(*seq))
                .collect()
        })
        .unwrap_or_default()
    }

    fn apply_scan(&mut self, seq: u64, event: ScanEvent) {
        let key = (event.occurred_at, seq);
        self.by_id.insert(event.id, seq);
        self.by_subject
            .entry(event.subject_id)
            .or_default()
            .insert(key);
        self.by_checkpoint
            .entry(event.checkpoint_id)
            .or_default()
            .insert(key);
        self.by_time.insert(key);
        self.by_pair
            .entry(event.dedup_key())
            .or_default()
            .insert(key);
        self.events.insert(seq, event);
    }

    fn remove_event(&mut self, event_id: &Uuid) -> Option<StoredEvent> {
        let seq = self.by_id.remove(event_id)?;
        let event = self.events.remove(&seq)?;
        let key = (event.occurred_at, seq);
        remove_from_index(&mut self.by_subject, &event.subject_id, &key);
        remove_from_index(&mut self.by_checkpoint, &event.checkpoint_id, &key);
        remove_from_index(&mut self.by_pair, &event.dedup_key(), &key);
        self.by_time.remove(&key);
        Some(StoredEvent { seq, event })
    }
}

impl EventLog for InMemoryStore {
    fn append(&mut self, event: ScanEvent) -> Result<AppendOutcome, StoreError> {
        if let Some(seq) = self.by_id.get(&event.id).copied() {
            let Some(existing) = self.stored(seq) else {
                return Err(StoreError::Parse(format!(
                    "id index points at missing seq {seq}"
                )));
            };
            if existing.event != event {
                return Err(StoreError::Conflict(event.id));
            }
            return Ok(AppendOutcome::AlreadyPresent(existing));
        }

        let seq = self.last_seq + 1;
        if let Some(wal) = self.wal.as_mut() {
            wal.append_scan(seq, &event)?;
        }
        self.last_seq = seq;
        self.apply_scan(seq, event.clone());
        self.checkpoint_if_due();
        Ok(AppendOutcome::Appended(StoredEvent { seq, event }))
    }

    fn get(&self, event_id: &Uuid) -> Option<StoredEvent> {
        self.by_id.get(event_id).and_then(|seq| self.stored(*seq))
    }

    fn query_by_subject(&self, subject_id: &Uuid) -> Vec<StoredEvent> {
        self.collect(self.by_subject.get(subject_id))
    }

    fn query_by_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
        since: Option<i64>,
    ) -> Vec<StoredEvent> {
        let Some(set) = self.by_checkpoint.get(&checkpoint_id) else {
            return Vec::new();
        };
        let since = since.unwrap_or(i64::MIN);
        set.range((since, 0)..)
            .filter_map(|(_, seq)| self.stored(*seq))
            .collect()
    }

    fn nearest_for_pair(&self, key: &DedupKey, occurred_at: i64) -> Option<StoredEvent> {
        let set = self.by_pair.get(key)?;
        let before = set.range(..=(occurred_at, u64::MAX)).next_back();
        let after = set.range((occurred_at, 0)..).next();
        let nearest = match (before, after) {
            (Some(b), Some(a)) => {
                if occurred_at - b.0 <= a.0 - occurred_at {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        self.stored(nearest.1)
    }

    /// Events and purge tombstones after `after_seq`; `limit` caps both together.
    fn events_after(&self, after_seq: u64, limit: usize) -> EventPage {
        let limit = limit.max(1);
        let from = after_seq.saturating_add(1);
        let mut events = self.events.range(from..).peekable();
        let mut tombstones = self.tombstones.range(from..).peekable();
        let mut page = EventPage {
            events: Vec::new(),
            purged: Vec::new(),
            next_seq: after_seq,
            has_more: false,
        };
        let mut taken = 0usize;
        loop {
            let take_event = match (events.peek(), tombstones.peek()) {
                (None, None) => break,
                (Some((event_seq, _)), Some((purge_seq, _))) => event_seq < purge_seq,
                (Some(_), None) => true,
                (None, Some(_)) => false,
            };
            if taken == limit {
                page.has_more = true;
                break;
            }
            if take_event {
                if let Some((seq, event)) = events.next() {
                    page.events.push(StoredEvent {
                        seq: *seq,
                        event: event.clone(),
                    });
                    page.next_seq = *seq;
                }
            } else if let Some((seq, event_id)) = tombstones.next() {
                page.purged.push(PurgedEvent {
                    seq: *seq,
                    event_id: *event_id,
                });
                page.next_seq = *seq;
            }
            taken += 1;
        }
        page
    }

    fn subject_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.by_subject.keys().copied().collect();
        ids.sort();
        ids
    }

    fn purge(&mut self, event_id: &Uuid) -> Result<Option<StoredEvent>, StoreError> {
        if !self.by_id.contains_key(event_id) {
            return Ok(None);
        }
        let seq = self.last_seq + 1;
        if let Some(wal) = self.wal.as_mut() {
            wal.append_purge(seq, *event_id)?;
        }
        self.last_seq = seq;
        self.tombstones.insert(seq, *event_id);
        let removed = self.remove_event(event_id);
        self.checkpoint_if_due();
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

fn remove_from_index<K>(index: &mut HashMap<K, BTreeSet<TimeKey>>, key: &K, time_key: &TimeKey)
where
    K: std::hash::Hash + Eq,
{
    let mut drop_key = false;
    if let Some(set) = index.get_mut(key) {
        set.remove(time_key);
        drop_key = set.is_empty();
    }
    if drop_key {
        index.remove(key);
    }
}

fn count_non_empty_lines(path: &Path) -> Result<usize, StoreError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let reader = BufReader::new(file);
    let mut count = 0usize;
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{GeoPoint, MINUTE_MS, scan_event_builder};
    use std::fs::read_to_string;

    const T0: i64 = 1_767_225_600_000;

    fn event(subject: Uuid, checkpoint: CheckpointId, at: i64) -> ScanEvent {
        scan_event_builder(subject, checkpoint, "device-a", at)
    }

    fn open_store(dir: &Path, policy: CheckpointPolicy) -> (InMemoryStore, StoreLoadStats) {
        let wal = FileWal::open(dir.join("events.wal")).unwrap();
        InMemoryStore::load_from_wal_with_stats(wal, policy).unwrap()
    }

    #[test]
    fn append_assigns_increasing_sequence() {
        let mut store = InMemoryStore::new();
        let subject = Uuid::new_v4();
        let first = store.append(event(subject, 1, T0)).unwrap();
        let second = store.append(event(subject, 2, T0 + MINUTE_MS)).unwrap();
        assert_eq!(first.stored().seq, 1);
        assert_eq!(second.stored().seq, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.last_seq(), 2);
    }

    #[test]
    fn append_same_id_twice_is_a_no_op() {
        let mut store = InMemoryStore::new();
        let scan = event(Uuid::new_v4(), 1, T0);
        let first = store.append(scan.clone()).unwrap();
        let second = store.append(scan).unwrap();
        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(second.stored().seq, first.stored().seq);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_same_id_with_different_payload_conflicts() {
        let mut store = InMemoryStore::new();
        let scan = event(Uuid::new_v4(), 1, T0);
        store.append(scan.clone()).unwrap();
        let mut altered = scan.clone();
        altered.checkpoint_id = 2;
        assert_eq!(store.append(altered), Err(StoreError::Conflict(scan.id)));
    }

    #[test]
    fn query_by_subject_orders_by_time_then_insertion() {
        let mut store = InMemoryStore::new();
        let subject = Uuid::new_v4();
        let late = event(subject, 2, T0 + 10 * MINUTE_MS);
        let tie_a = event(subject, 1, T0);
        let tie_b = event(subject, 3, T0);
        store.append(late.clone()).unwrap();
        store.append(tie_a.clone()).unwrap();
        store.append(tie_b.clone()).unwrap();
        store.append(event(Uuid::new_v4(), 1, T0)).unwrap();

        let ids: Vec<Uuid> = store
            .query_by_subject(&subject)
            .into_iter()
            .map(|stored| stored.event.id)
            .collect();
        assert_eq!(ids, vec![tie_a.id, tie_b.id, late.id]);
    }

    #[test]
    fn query_by_checkpoint_honours_since() {
        let mut store = InMemoryStore::new();
        for offset in 0..4 {
            store
                .append(event(Uuid::new_v4(), 1, T0 + offset * MINUTE_MS))
                .unwrap();
        }
        store.append(event(Uuid::new_v4(), 2, T0)).unwrap();

        assert_eq!(store.query_by_checkpoint(1, None).len(), 4);
        let since = store.query_by_checkpoint(1, Some(T0 + 2 * MINUTE_MS));
        assert_eq!(since.len(), 2);
        assert!(
            since
                .iter()
                .all(|stored| stored.event.occurred_at >= T0 + 2 * MINUTE_MS)
        );
        assert!(store.query_by_checkpoint(9, None).is_empty());
    }

    #[test]
    fn nearest_for_pair_looks_both_directions() {
        let mut store = InMemoryStore::new();
        let subject = Uuid::new_v4();
        let early = event(subject, 1, T0);
        let late = event(subject, 1, T0 + 60 * MINUTE_MS);
        store.append(early.clone()).unwrap();
        store.append(late.clone()).unwrap();
        store.append(event(subject, 2, T0 + 31 * MINUTE_MS)).unwrap();

        let key = DedupKey {
            subject_id: subject,
            checkpoint_id: 1,
        };
        let near_early = store.nearest_for_pair(&key, T0 + 20 * MINUTE_MS).unwrap();
        assert_eq!(near_early.event.id, early.id);
        let near_late = store.nearest_for_pair(&key, T0 + 50 * MINUTE_MS).unwrap();
        assert_eq!(near_late.event.id, late.id);
        assert_eq!(store.last_for_pair(&key).unwrap().event.id, late.id);
    }

    #[test]
    fn events_after_pages_by_sequence() {
        let mut store = InMemoryStore::new();
        for offset in 0..5 {
            store
                .append(event(Uuid::new_v4(), 1, T0 - offset * MINUTE_MS))
                .unwrap();
        }
        let first = store.events_after(0, 2);
        assert_eq!(
            first.events.iter().map(|s| s.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(first.has_more);
        assert_eq!(first.next_seq, 2);

        let last = store.events_after(4, 10);
        assert_eq!(last.events.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.next_seq, 5);

        let empty = store.events_after(5, 10);
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_seq, 5);
    }

    #[test]
    fn time_range_query_uses_occurred_at_index() {
        let mut store = InMemoryStore::new();
        for offset in 0..6 {
            store
                .append(event(Uuid::new_v4(), 1, T0 + offset * MINUTE_MS))
                .unwrap();
        }
        let window = store.query_time_range(T0 + MINUTE_MS, T0 + 4 * MINUTE_MS);
        assert_eq!(window.len(), 3);
        assert!(store.query_time_range(T0, T0).is_empty());
    }

    #[test]
    fn purge_removes_event_from_every_index() {
        let mut store = InMemoryStore::new();
        let subject = Uuid::new_v4();
        let scan = event(subject, 1, T0);
        store.append(scan.clone()).unwrap();

        let purged = store.purge(&scan.id).unwrap().unwrap();
        assert_eq!(purged.event.id, scan.id);
        assert!(store.get(&scan.id).is_none());
        assert!(store.query_by_subject(&subject).is_empty());
        assert!(store.query_by_checkpoint(1, None).is_empty());
        assert!(store.subject_ids().is_empty());
        assert_eq!(store.index_stats().pair_count, 0);
        assert_eq!(store.purge(&scan.id).unwrap(), None);
        assert_eq!(store.tombstone_count(), 1);
        assert_eq!(store.last_seq(), 2);
    }

    #[test]
    fn events_after_interleaves_purge_tombstones_by_sequence() {
        let mut store = InMemoryStore::new();
        let subject = Uuid::new_v4();
        let first = event(subject, 1, T0);
        store.append(first.clone()).unwrap();
        store.append(event(subject, 2, T0 + 40 * MINUTE_MS)).unwrap();
        store.purge(&first.id).unwrap();
        store.append(event(subject, 1, T0 + 90 * MINUTE_MS)).unwrap();

        // A replica that already holds seq 1 learns about the purge at seq 3.
        let page = store.events_after(1, 10);
        assert_eq!(
            page.events.iter().map(|s| s.seq).collect::<Vec<_>>(),
            vec![2, 4]
        );
        assert_eq!(
            page.purged,
            vec![PurgedEvent {
                seq: 3,
                event_id: first.id
            }]
        );
        assert_eq!(page.next_seq, 4);

        // The tombstone counts against the page limit.
        let short = store.events_after(2, 1);
        assert!(short.events.is_empty());
        assert_eq!(short.purged.len(), 1);
        assert!(short.has_more);
        assert_eq!(short.next_seq, 3);
    }

    #[test]
    fn insert_at_keeps_the_given_sequence_and_moves_known_ids() {
        let mut replica = InMemoryStore::new();
        let subject = Uuid::new_v4();
        let early = event(subject, 1, T0);
        let tied = scan_event_builder(subject, 1, "device-b", T0);

        replica.insert_at(900, early.clone()).unwrap();
        replica.insert_at(7, tied.clone()).unwrap();
        let order: Vec<Uuid> = replica
            .query_by_subject(&subject)
            .into_iter()
            .map(|stored| stored.event.id)
            .collect();
        assert_eq!(order, vec![tied.id, early.id]);

        // The ledger later reports `early` at seq 3.
        let moved = replica.insert_at(3, early.clone()).unwrap();
        assert!(!moved.is_replay());
        assert_eq!(replica.len(), 2);
        assert_eq!(replica.get(&early.id).unwrap().seq, 3);
        assert_eq!(replica.query_by_subject(&subject)[0].event.id, early.id);
        assert!(replica.insert_at(3, early.clone()).unwrap().is_replay());

        let stranger = event(Uuid::new_v4(), 2, T0);
        assert_eq!(
            replica.insert_at(3, stranger.clone()),
            Err(StoreError::Conflict(stranger.id))
        );
        assert_eq!(replica.forget(&early.id).unwrap().unwrap().seq, 3);
        assert_eq!(replica.tombstone_count(), 0);
    }

    #[test]
    fn wal_backed_store_refuses_replica_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(dir.path(), CheckpointPolicy::default());
        let scan = event(Uuid::new_v4(), 1, T0);
        assert!(matches!(
            store.insert_at(5, scan.clone()),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.forget(&scan.id),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn persistent_wal_replay_restores_events_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let subject = Uuid::new_v4();
        let mut scan = event(subject, 1, T0);
        scan.location_hint = Some(GeoPoint {
            lat: 21.48,
            lng: 71.79,
        });
        let purged = event(subject, 3, T0 + MINUTE_MS);
        {
            let (mut store, _) = open_store(dir.path(), CheckpointPolicy::default());
            store.append(scan.clone()).unwrap();
            store.append(purged.clone()).unwrap();
            store.append(event(subject, 2, T0 + 40 * MINUTE_MS)).unwrap();
            store.purge(&purged.id).unwrap();
        }

        let (mut store, stats) = open_store(dir.path(), CheckpointPolicy::default());
        assert_eq!(stats.events_loaded, 3);
        assert_eq!(stats.purges_applied, 1);
        // The purge took seq 4.
        assert_eq!(stats.last_seq, 4);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&scan.id).unwrap().event, scan);
        assert_eq!(
            store.events_after(3, 10).purged,
            vec![PurgedEvent {
                seq: 4,
                event_id: purged.id
            }]
        );

        let next = store.append(event(subject, 1, T0 + 90 * MINUTE_MS)).unwrap();
        assert_eq!(next.stored().seq, 5);
    }

    #[test]
    fn checkpoint_compacts_wal_and_keeps_sequence_after_purge() {
        let dir = tempfile::tempdir().unwrap();
        let subject = Uuid::new_v4();
        let tail = event(subject, 2, T0 + 40 * MINUTE_MS);
        {
            let (mut store, _) = open_store(dir.path(), CheckpointPolicy::default());
            store.append(event(subject, 1, T0)).unwrap();
            store.append(tail.clone()).unwrap();
            store.purge(&tail.id).unwrap();
            let stats = store.checkpoint_and_compact().unwrap().unwrap();
            // One live scan plus the tombstone.
            assert_eq!(stats.snapshot_records, 2);
            assert_eq!(stats.truncated_wal_records, 3);
            assert_eq!(store.wal().unwrap().wal_record_count(), 0);
            store.append(event(subject, 1, T0 + 90 * MINUTE_MS)).unwrap();
        }

        let (store, stats) = open_store(dir.path(), CheckpointPolicy::default());
        assert_eq!(stats.replay.snapshot_records, 2);
        assert_eq!(stats.replay.wal_records, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.tombstone_count(), 1);
        // seq 2 was purged under seq 3 before the snapshot; numbering continues after both.
        assert_eq!(store.last_seq(), 4);
        assert_eq!(
            store.events_after(2, 10).purged,
            vec![PurgedEvent {
                seq: 3,
                event_id: tail.id
            }]
        );
    }

    #[test]
    fn checkpoint_policy_triggers_compaction_by_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CheckpointPolicy {
            max_wal_records: Some(2),
            max_wal_bytes: None,
        };
        let (mut store, _) = open_store(dir.path(), policy);
        let subject = Uuid::new_v4();
        store.append(event(subject, 1, T0)).unwrap();
        assert_eq!(store.wal().unwrap().wal_record_count(), 1);
        store.append(event(subject, 2, T0 + MINUTE_MS)).unwrap();
        assert_eq!(store.wal().unwrap().wal_record_count(), 0);
        assert!(store.wal().unwrap().snapshot_path().exists());
    }

    #[test]
    fn torn_final_wal_line_is_skipped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let scan = event(Uuid::new_v4(), 1, T0);
        {
            let (mut store, _) = open_store(dir.path(), CheckpointPolicy::default());
            store.append(scan.clone()).unwrap();
        }
        let wal_path = dir.path().join("events.wal");
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        write!(file, "{{\"type\":\"scan\",\"seq\":2,\"ev").unwrap();
        drop(file);

        {
            let (mut store, stats) = open_store(dir.path(), CheckpointPolicy::default());
            assert_eq!(stats.replay.skipped_torn_records, 1);
            assert_eq!(store.len(), 1);
            assert!(!read_to_string(&wal_path).unwrap().contains("\"seq\":2"));
            store.append(event(scan.subject_id, 2, T0 + MINUTE_MS)).unwrap();
        }

        let (store, stats) = open_store(dir.path(), CheckpointPolicy::default());
        assert_eq!(stats.replay.skipped_torn_records, 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.last_seq(), 2);
    }

    #[test]
    fn failed_wal_write_rolls_back_so_a_retry_replays_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("events.wal");
        let scan = event(Uuid::new_v4(), 1, T0);
        {
            let (mut store, _) = open_store(dir.path(), CheckpointPolicy::default());
            // A directory in place of the wal file makes every write fail.
            std::fs::remove_file(&wal_path).unwrap();
            std::fs::create_dir(&wal_path).unwrap();

            let err = store.append(scan.clone()).unwrap_err();
            assert!(matches!(err, StoreError::Io(_)));
            assert!(err.is_retryable());
            assert!(store.is_empty());
            assert_eq!(store.last_seq(), 0);
            let wal = store.wal().unwrap();
            assert_eq!(wal.wal_record_count(), 0);
            assert_eq!(wal.buffered_record_count(), 0);
            assert_eq!(wal.unsynced_record_count(), 0);

            std::fs::remove_dir(&wal_path).unwrap();
            let retried = store.append(scan.clone()).unwrap();
            assert_eq!(retried.stored().seq, 1);
        }

        assert_eq!(read_to_string(&wal_path).unwrap().lines().count(), 1);
        let (store, stats) = open_store(dir.path(), CheckpointPolicy::default());
        assert_eq!(stats.events_loaded, 1);
        assert_eq!(store.get(&scan.id).unwrap().seq, 1);
    }

    #[test]
    fn failed_flush_keeps_earlier_buffered_records() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("events.wal");
        let wal = FileWal::open_with_policy(
            &wal_path,
            WalWritePolicy {
                sync_every_records: 2,
                append_buffer_max_records: 2,
                sync_interval: None,
            },
        )
        .unwrap();
        let (mut store, _) =
            InMemoryStore::load_from_wal_with_stats(wal, CheckpointPolicy::default()).unwrap();
        let subject = Uuid::new_v4();
        let buffered = event(subject, 1, T0);
        let failing = event(subject, 2, T0 + 40 * MINUTE_MS);
        store.append(buffered.clone()).unwrap();

        std::fs::remove_file(&wal_path).unwrap();
        std::fs::create_dir(&wal_path).unwrap();
        assert!(store.append(failing.clone()).is_err());
        assert_eq!(store.wal().unwrap().buffered_record_count(), 1);
        assert_eq!(store.wal().unwrap().wal_record_count(), 1);

        std::fs::remove_dir(&wal_path).unwrap();
        store.append(failing.clone()).unwrap();
        assert_eq!(store.wal().unwrap().buffered_record_count(), 0);
        drop(store);

        let (store, stats) = open_store(dir.path(), CheckpointPolicy::default());
        assert_eq!(stats.events_loaded, 2);
        assert_eq!(store.get(&buffered.id).unwrap().seq, 1);
        assert_eq!(store.get(&failing.id).unwrap().seq, 2);
    }

    #[test]
    fn repeated_identical_wal_record_is_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("events.wal");
        let scan = event(Uuid::new_v4(), 1, T0);
        {
            let (mut store, _) = open_store(dir.path(), CheckpointPolicy::default());
            store.append(scan.clone()).unwrap();
        }
        let line = read_to_string(&wal_path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        write!(file, "{line}").unwrap();
        drop(file);

        let (store, stats) = open_store(dir.path(), CheckpointPolicy::default());
        assert_eq!(stats.events_loaded, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.last_seq(), 1);

        // Same id under another sequence is still corruption.
        let moved = line.replace("\"seq\":1", "\"seq\":2");
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        write!(file, "{moved}").unwrap();
        drop(file);
        drop(store);
        let wal = FileWal::open(&wal_path).unwrap();
        assert!(matches!(
            InMemoryStore::load_from_wal_with_stats(wal, CheckpointPolicy::default()),
            Err(StoreError::Parse(_))
        ));
    }

    #[test]
    fn wal_append_buffer_batches_disk_writes_until_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open_with_policy(
            dir.path().join("events.wal"),
            WalWritePolicy {
                sync_every_records: 3,
                append_buffer_max_records: 3,
                sync_interval: None,
            },
        )
        .unwrap();
        let (mut store, _) =
            InMemoryStore::load_from_wal_with_stats(wal, CheckpointPolicy::default()).unwrap();
        let subject = Uuid::new_v4();
        store.append(event(subject, 1, T0)).unwrap();
        store.append(event(subject, 2, T0 + MINUTE_MS)).unwrap();
        assert_eq!(store.wal().unwrap().buffered_record_count(), 2);
        assert_eq!(store.wal().unwrap().unsynced_record_count(), 2);

        store.append(event(subject, 3, T0 + 2 * MINUTE_MS)).unwrap();
        assert_eq!(store.wal().unwrap().buffered_record_count(), 0);
        assert_eq!(store.wal().unwrap().unsynced_record_count(), 0);
    }

    #[test]
    fn wal_unsynced_flush_hook_syncs_without_interval_policy() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open_with_policy(
            dir.path().join("events.wal"),
            WalWritePolicy {
                sync_every_records: 10,
                append_buffer_max_records: 10,
                sync_interval: None,
            },
        )
        .unwrap();
        let (mut store, _) =
            InMemoryStore::load_from_wal_with_stats(wal, CheckpointPolicy::default()).unwrap();
        store.append(event(Uuid::new_v4(), 1, T0)).unwrap();
        assert!(!store.flush_wal_if_interval_elapsed().unwrap());
        assert!(store.flush_wal().unwrap());
        assert!(!store.flush_wal().unwrap());
        assert_eq!(store.wal().unwrap().unsynced_record_count(), 0);
    }
}
