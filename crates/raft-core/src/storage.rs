//! # storage
//!
//! why: abstract the durable log so the core can read persisted state without doing i/o itself
//! relations: read by log.rs, implemented here by MemStorage and by raft-storage's FileStorage
//! what: Storage trait, RaftState, MemStorage

use crate::entry::{ConfState, HardState, LogEntry, Snapshot};
use crate::error::StorageError;
use crate::util::limit_size;

/// Result type of [`Storage`] reads and writes.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persisted state a node restarts from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftState {
    pub hard_state: HardState,
    pub conf_state: ConfState,
}

/// Read side of durable raft storage.
///
/// The core only reads through this trait. The driver writes (entries, hard
/// state, snapshots) through the implementation's own methods after
/// consuming a `Ready`. Any error other than `Compacted` or `Unavailable` is
/// treated as fatal by the log.
pub trait Storage {
    /// Hard state and membership at startup.
    fn initial_state(&self) -> StorageResult<RaftState>;

    /// Entries in `[low, high)`, capped at `max_size` bytes but never empty
    /// when the range is non-empty.
    fn entries(&self, low: u64, high: u64, max_size: u64) -> StorageResult<Vec<LogEntry>>;

    /// Term of entry `idx`, which must lie in `[first_index() - 1, last_index()]`.
    /// The entry just before `first_index()` is retained for matching even
    /// though its payload is compacted away.
    fn term(&self, idx: u64) -> StorageResult<u64>;

    fn first_index(&self) -> StorageResult<u64>;

    fn last_index(&self) -> StorageResult<u64>;

    /// Most recent snapshot. `SnapshotTemporarilyUnavailable` makes the
    /// leader retry later.
    fn snapshot(&self) -> StorageResult<Snapshot>;
}

/// In-memory storage for tests and for drivers that keep their own
/// durability elsewhere.
///
/// `entries[0]` is a dummy at the snapshot index holding the snapshot term.
#[derive(Debug, Clone)]
pub struct MemStorage {
    hard_state: HardState,
    snapshot: Snapshot,
    entries: Vec<LogEntry>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: Snapshot::default(),
            entries: vec![LogEntry::default()],
        }
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose membership is `conf_state` and whose log is empty.
    pub fn new_with_conf_state(conf_state: ConfState) -> Self {
        let mut s = Self::new();
        s.set_conf_state(conf_state);
        s
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state
    }

    pub fn set_hard_state(&mut self, hs: HardState) {
        self.hard_state = hs;
    }

    /// Overrides the membership reported by `initial_state`.
    pub fn set_conf_state(&mut self, cs: ConfState) {
        self.snapshot.metadata.conf_state = cs;
    }

    /// Sets the commit index without touching term and vote.
    pub fn commit_to(&mut self, index: u64) -> StorageResult<()> {
        if index > self.last_index_inner() {
            return Err(StorageError::Unavailable);
        }
        self.hard_state.commit = index;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.entries[0].index
    }

    fn first_index_inner(&self) -> u64 {
        self.offset() + 1
    }

    fn last_index_inner(&self) -> u64 {
        self.offset() + self.entries.len() as u64 - 1
    }

    /// Replaces the whole log with `snapshot`. Older snapshots are refused.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> StorageResult<()> {
        if self.snapshot.metadata.index >= snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        self.entries = vec![LogEntry {
            index: snapshot.metadata.index,
            term: snapshot.metadata.term,
            ..Default::default()
        }];
        if self.hard_state.commit < snapshot.metadata.index {
            self.hard_state.commit = snapshot.metadata.index;
        }
        if self.hard_state.term < snapshot.metadata.term {
            self.hard_state.term = snapshot.metadata.term;
        }
        self.snapshot = snapshot;
        Ok(())
    }

    /// Records a snapshot of the application state at `index`. The log is
    /// left alone; call [`compact`](Self::compact) to drop entries.
    pub fn create_snapshot(
        &mut self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Vec<u8>,
    ) -> StorageResult<Snapshot> {
        if index <= self.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        if index > self.last_index_inner() {
            crate::fatal!(
                "snapshot {} is out of bound lastindex({})",
                index,
                self.last_index_inner()
            );
        }
        let offset = self.offset();
        self.snapshot.metadata.index = index;
        self.snapshot.metadata.term = self.entries[(index - offset) as usize].term;
        if let Some(cs) = conf_state {
            self.snapshot.metadata.conf_state = cs;
        }
        self.snapshot.data = data;
        Ok(self.snapshot.clone())
    }

    /// Discards entries before `compact_index`. The entry at
    /// `compact_index` becomes the new dummy.
    pub fn compact(&mut self, compact_index: u64) -> StorageResult<()> {
        let offset = self.offset();
        if compact_index <= offset {
            return Err(StorageError::Compacted);
        }
        if compact_index > self.last_index_inner() {
            crate::fatal!(
                "compact {} is out of bound lastindex({})",
                compact_index,
                self.last_index_inner()
            );
        }
        let i = (compact_index - offset) as usize;
        let dummy = LogEntry {
            index: self.entries[i].index,
            term: self.entries[i].term,
            ..Default::default()
        };
        let mut rest = self.entries.split_off(i + 1);
        self.entries = Vec::with_capacity(1 + rest.len());
        self.entries.push(dummy);
        self.entries.append(&mut rest);
        Ok(())
    }

    /// Appends `entries`, truncating any existing suffix they overlap.
    /// Entries already compacted away are skipped.
    pub fn append(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        let Some(head) = entries.first() else {
            return Ok(());
        };
        let first = self.first_index_inner();
        let last = head.index + entries.len() as u64 - 1;
        if last < first {
            return Ok(());
        }
        let entries = if first > head.index {
            &entries[(first - head.index) as usize..]
        } else {
            entries
        };

        let offset = (entries[0].index - self.offset()) as usize;
        if self.entries.len() < offset {
            crate::fatal!(
                "missing log entry [last: {}, append at: {}]",
                self.last_index_inner(),
                entries[0].index
            );
        }
        self.entries.truncate(offset);
        self.entries.extend_from_slice(entries);
        Ok(())
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> StorageResult<RaftState> {
        Ok(RaftState {
            hard_state: self.hard_state,
            conf_state: self.snapshot.metadata.conf_state.clone(),
        })
    }

    fn entries(&self, low: u64, high: u64, max_size: u64) -> StorageResult<Vec<LogEntry>> {
        let offset = self.offset();
        if low <= offset {
            return Err(StorageError::Compacted);
        }
        if high > self.last_index_inner() + 1 {
            crate::fatal!(
                "entries' hi({}) is out of bound lastindex({})",
                high,
                self.last_index_inner()
            );
        }
        if self.entries.len() == 1 {
            return Err(StorageError::Unavailable);
        }
        let mut ents = self.entries[(low - offset) as usize..(high - offset) as usize].to_vec();
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    fn term(&self, idx: u64) -> StorageResult<u64> {
        let offset = self.offset();
        if idx < offset {
            return Err(StorageError::Compacted);
        }
        self.entries
            .get((idx - offset) as usize)
            .map(|e| e.term)
            .ok_or(StorageError::Unavailable)
    }

    fn first_index(&self) -> StorageResult<u64> {
        Ok(self.first_index_inner())
    }

    fn last_index(&self) -> StorageResult<u64> {
        Ok(self.last_index_inner())
    }

    fn snapshot(&self) -> StorageResult<Snapshot> {
        Ok(self.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ENTRY_OVERHEAD;
    use crate::util::NO_LIMIT;

    fn ent(index: u64, term: u64) -> LogEntry {
        LogEntry::new(term, index, vec![])
    }

    // log with dummy at index 3 and entries 4, 5
    fn storage_3_4_5() -> MemStorage {
        let mut s = MemStorage::new();
        s.entries = vec![ent(3, 3), ent(4, 4), ent(5, 5)];
        s
    }

    #[test]
    fn term_covers_dummy_and_reports_bounds() {
        let s = storage_3_4_5();
        assert_eq!(s.term(2), Err(StorageError::Compacted));
        assert_eq!(s.term(3), Ok(3));
        assert_eq!(s.term(5), Ok(5));
        assert_eq!(s.term(6), Err(StorageError::Unavailable));
    }

    #[test]
    fn entries_respect_bounds_and_size() {
        let s = storage_3_4_5();
        assert_eq!(s.entries(2, 6, NO_LIMIT), Err(StorageError::Compacted));
        assert_eq!(s.entries(3, 4, NO_LIMIT), Err(StorageError::Compacted));
        assert_eq!(s.entries(4, 5, NO_LIMIT).unwrap(), vec![ent(4, 4)]);
        assert_eq!(s.entries(4, 6, NO_LIMIT).unwrap().len(), 2);
        assert_eq!(s.entries(4, 6, 0).unwrap().len(), 1);
        assert_eq!(s.entries(4, 6, 2 * ENTRY_OVERHEAD).unwrap().len(), 2);
    }

    #[test]
    fn first_and_last_index() {
        let s = storage_3_4_5();
        assert_eq!(s.first_index(), Ok(4));
        assert_eq!(s.last_index(), Ok(5));
    }

    #[test]
    fn compact_moves_the_dummy() {
        let mut s = storage_3_4_5();
        assert_eq!(s.compact(2), Err(StorageError::Compacted));
        assert_eq!(s.compact(3), Err(StorageError::Compacted));
        s.compact(4).unwrap();
        assert_eq!(s.first_index(), Ok(5));
        assert_eq!(s.term(4), Ok(4));
        assert_eq!(s.entries.len(), 2);
    }

    #[test]
    fn create_snapshot_records_term() {
        let mut s = storage_3_4_5();
        let cs = ConfState::with_voters(vec![1, 2, 3]);
        let snap = s.create_snapshot(4, Some(cs.clone()), b"data".to_vec()).unwrap();
        assert_eq!(snap.metadata.index, 4);
        assert_eq!(snap.metadata.term, 4);
        assert_eq!(snap.metadata.conf_state, cs);
        assert_eq!(
            s.create_snapshot(4, None, vec![]),
            Err(StorageError::SnapshotOutOfDate)
        );
    }

    #[test]
    fn append_truncates_overlap() {
        let mut s = storage_3_4_5();
        s.append(&[ent(4, 6), ent(5, 6)]).unwrap();
        assert_eq!(s.entries, vec![ent(3, 3), ent(4, 6), ent(5, 6)]);

        let mut s = storage_3_4_5();
        s.append(&[ent(5, 5), ent(6, 5)]).unwrap();
        assert_eq!(s.last_index(), Ok(6));

        // entries before the first index are skipped
        let mut s = storage_3_4_5();
        s.append(&[ent(2, 3), ent(3, 3), ent(4, 5)]).unwrap();
        assert_eq!(s.entries, vec![ent(3, 3), ent(4, 5)]);

        let mut s = storage_3_4_5();
        s.append(&[ent(6, 5)]).unwrap();
        assert_eq!(s.last_index(), Ok(6));
    }

    #[test]
    #[should_panic(expected = "missing log entry")]
    fn append_with_gap_halts() {
        let mut s = storage_3_4_5();
        let _ = s.append(&[ent(7, 5)]);
    }

    #[test]
    fn apply_snapshot_resets_log() {
        let mut s = MemStorage::new();
        let mut snap = Snapshot::default();
        snap.metadata.index = 4;
        snap.metadata.term = 4;
        snap.metadata.conf_state = ConfState::with_voters(vec![1, 2, 3]);
        s.apply_snapshot(snap.clone()).unwrap();
        assert_eq!(s.first_index(), Ok(5));
        assert_eq!(s.term(4), Ok(4));
        assert_eq!(s.initial_state().unwrap().conf_state.voters, vec![1, 2, 3]);

        snap.metadata.index = 3;
        assert_eq!(s.apply_snapshot(snap), Err(StorageError::SnapshotOutOfDate));
    }
}
