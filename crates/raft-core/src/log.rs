//! # log
//!
//! why: present durable storage and the unstable tail as one log with commit and apply watermarks
//! relations: wraps storage.rs and log_unstable.rs; owned by node.rs
//! what: RaftLog

use std::fmt;

use tracing::info;

use crate::entry::{LogEntry, Snapshot};
use crate::error::StorageError;
use crate::log_unstable::Unstable;
use crate::storage::{Storage, StorageResult};
use crate::util::{entries_size, limit_size, NO_LIMIT};

/// The replicated log of one node.
///
/// Invariant: `applied <= applying <= committed <= last_index()`.
pub struct RaftLog<S: Storage> {
    /// Everything up to the last durable entry.
    pub store: S,
    /// Entries and snapshot not yet durable.
    pub unstable: Unstable,
    /// Highest index known to be replicated on a quorum.
    pub committed: u64,
    /// Highest index handed to the application. Entries in
    /// `(applied, applying]` are being applied.
    pub applying: u64,
    /// Highest index the application confirmed as applied.
    pub applied: u64,
    max_applying_ents_size: u64,
    applying_ents_size: u64,
    applying_ents_paused: bool,
}

impl<S: Storage> RaftLog<S> {
    /// Opens the log over `store`, with everything in storage treated as
    /// stable and nothing applied beyond the storage's base index.
    pub fn new(store: S, max_applying_ents_size: u64) -> StorageResult<Self> {
        let first_index = store.first_index()?;
        let last_index = store.last_index()?;
        Ok(Self {
            store,
            unstable: Unstable::new(last_index + 1),
            committed: first_index - 1,
            applying: first_index - 1,
            applied: first_index - 1,
            max_applying_ents_size,
            applying_ents_size: 0,
            applying_ents_paused: false,
        })
    }

    /// Byte budget for entries being applied at once.
    pub fn max_applying_ents_size(&self) -> u64 {
        self.max_applying_ents_size
    }

    pub fn first_index(&self) -> u64 {
        if let Some(i) = self.unstable.maybe_first_index() {
            return i;
        }
        self.store
            .first_index()
            .unwrap_or_else(|e| crate::fatal!("storage first_index failed: {}", e))
    }

    pub fn last_index(&self) -> u64 {
        if let Some(i) = self.unstable.maybe_last_index() {
            return i;
        }
        self.store
            .last_index()
            .unwrap_or_else(|e| crate::fatal!("storage last_index failed: {}", e))
    }

    /// Term of entry `idx`. Valid for `[first_index() - 1, last_index()]`.
    pub fn term(&self, idx: u64) -> StorageResult<u64> {
        // the unstable log is authoritative for what it holds
        if let Some(t) = self.unstable.maybe_term(idx) {
            return Ok(t);
        }
        if idx + 1 < self.first_index() {
            return Err(StorageError::Compacted);
        }
        if idx > self.last_index() {
            return Err(StorageError::Unavailable);
        }
        match self.store.term(idx) {
            Ok(t) => Ok(t),
            Err(e @ (StorageError::Compacted | StorageError::Unavailable)) => Err(e),
            Err(e) => crate::fatal!("storage term({}) failed: {}", idx, e),
        }
    }

    pub fn last_term(&self) -> u64 {
        let last = self.last_index();
        self.term(last)
            .unwrap_or_else(|e| crate::fatal!("unexpected error when getting the last term: {}", e))
    }

    /// Term of `idx`, or 0 when it is out of the log's range.
    pub fn zero_term_on_out_of_bounds(&self, idx: u64) -> u64 {
        self.term(idx).unwrap_or(0)
    }

    pub fn match_term(&self, idx: u64, term: u64) -> bool {
        self.term(idx).is_ok_and(|t| t == term)
    }

    /// Whether a log ending at `(last_index, term)` is at least as up to date
    /// as this one.
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        let our_term = self.last_term();
        term > our_term || (term == our_term && last_index >= self.last_index())
    }

    /// Index of the first entry of `ents` that is missing or conflicts with
    /// this log, or 0 if all of them are present.
    pub fn find_conflict(&self, ents: &[LogEntry]) -> u64 {
        for e in ents {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    info!(
                        index = e.index,
                        existing_term = self.zero_term_on_out_of_bounds(e.index),
                        conflicting_term = e.term,
                        "found conflict"
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Largest `(index, term)` at or below `index` whose term is `<= term`.
    ///
    /// Used to skip a whole divergent term at once after a rejected append.
    /// Returns the position reached with term 0 if it is compacted or the
    /// log is exhausted.
    pub fn find_conflict_by_term(&self, mut index: u64, term: u64) -> (u64, u64) {
        while index > 0 {
            match self.term(index) {
                Err(_) => return (index, 0),
                Ok(our_term) if our_term <= term => return (index, our_term),
                Ok(_) => index -= 1,
            }
        }
        (0, 0)
    }

    /// Appends `ents` if the entry before them matches `(prev_index, prev_term)`.
    /// Returns the index of the last new entry, or `None` on a mismatch.
    pub fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        committed: u64,
        ents: &[LogEntry],
    ) -> Option<u64> {
        if !self.match_term(prev_index, prev_term) {
            return None;
        }
        let last_new = prev_index + ents.len() as u64;
        let ci = self.find_conflict(ents);
        if ci != 0 {
            if ci <= self.committed {
                crate::fatal!(
                    "entry {} conflict with committed entry [committed({})]",
                    ci,
                    self.committed
                );
            }
            let start = (ci - (prev_index + 1)) as usize;
            if start > ents.len() {
                crate::fatal!("index {} is out of range [{}]", start, ents.len());
            }
            self.append(&ents[start..]);
        }
        self.commit_to(committed.min(last_new));
        Some(last_new)
    }

    /// Appends to the unstable tail, truncating anything after the first
    /// entry's predecessor. Returns the new last index.
    pub fn append(&mut self, ents: &[LogEntry]) -> u64 {
        let Some(first) = ents.first() else {
            return self.last_index();
        };
        let after = first.index - 1;
        if after < self.committed {
            crate::fatal!(
                "after({}) is out of range [committed({})]",
                after,
                self.committed
            );
        }
        self.unstable.truncate_and_append(ents);
        self.last_index()
    }

    pub fn commit_to(&mut self, to_commit: u64) {
        // never decrease commit
        if self.committed < to_commit {
            if self.last_index() < to_commit {
                crate::fatal!(
                    "tocommit({}) is out of range [lastIndex({})]. Was the raft log corrupted, truncated, or lost?",
                    to_commit,
                    self.last_index()
                );
            }
            self.committed = to_commit;
        }
    }

    /// Commits `index` only if the entry there carries `term`.
    pub fn maybe_commit(&mut self, index: u64, term: u64) -> bool {
        // term 0 never matches: a leader campaigned at least at term 1
        if term != 0 && index > self.committed && self.match_term(index, term) {
            self.commit_to(index);
            return true;
        }
        false
    }

    /// Records that the application applied up to `index`; `size` is the
    /// byte size of the entries that finished.
    pub fn applied_to(&mut self, index: u64, size: u64) {
        if self.committed < index || index < self.applied {
            crate::fatal!(
                "applied({}) is out of range [prevApplied({}), committed({})]",
                index,
                self.applied,
                self.committed
            );
        }
        self.applied = index;
        self.applying = self.applying.max(index);
        self.applying_ents_size = self.applying_ents_size.saturating_sub(size);
        self.applying_ents_paused = self.applying_ents_size >= self.max_applying_ents_size;
    }

    /// Records that entries up to `index` (`size` bytes) were handed out
    /// for application.
    pub fn accept_applying(&mut self, index: u64, size: u64, allow_unstable: bool) {
        if self.committed < index {
            crate::fatal!(
                "applying({}) is out of range [prevApplying({}), committed({})]",
                index,
                self.applying,
                self.committed
            );
        }
        self.applying = index;
        self.applying_ents_size += size;
        // pause when at the cap, or when the batch was cut short by it
        self.applying_ents_paused = self.applying_ents_size >= self.max_applying_ents_size
            || index < self.max_appliable_index(allow_unstable);
    }

    pub fn stable_to(&mut self, index: u64, term: u64) {
        self.unstable.stable_to(index, term);
    }

    pub fn stable_snap_to(&mut self, index: u64) {
        self.unstable.stable_snap_to(index);
    }

    /// Marks the unstable entries and snapshot as handed to the driver.
    pub fn accept_unstable(&mut self) {
        self.unstable.accept_in_progress();
    }

    pub fn next_unstable_ents(&self) -> &[LogEntry] {
        self.unstable.next_entries()
    }

    pub fn has_next_unstable_ents(&self) -> bool {
        !self.next_unstable_ents().is_empty()
    }

    pub fn has_next_or_in_progress_unstable_ents(&self) -> bool {
        !self.unstable.entries.is_empty()
    }

    fn max_appliable_index(&self, allow_unstable: bool) -> u64 {
        let hi = self.committed;
        if allow_unstable {
            hi
        } else {
            hi.min(self.unstable.offset - 1)
        }
    }

    /// Committed entries the application has not been handed yet, capped by
    /// the outstanding apply budget. With `allow_unstable` the entries need
    /// not be durable locally.
    pub fn next_committed_ents(&self, allow_unstable: bool) -> Vec<LogEntry> {
        if self.applying_ents_paused || self.has_next_or_in_progress_snapshot() {
            return Vec::new();
        }
        let (lo, hi) = (self.applying + 1, self.max_appliable_index(allow_unstable) + 1);
        if lo >= hi {
            return Vec::new();
        }
        let max_size = self.max_applying_ents_size - self.applying_ents_size;
        if max_size == 0 {
            crate::fatal!(
                "applying entry size ({}-{})={} not positive",
                self.max_applying_ents_size,
                self.applying_ents_size,
                max_size
            );
        }
        self.slice(lo, hi, max_size)
            .unwrap_or_else(|e| crate::fatal!("unexpected error when getting unapplied entries: {}", e))
    }

    pub fn has_next_committed_ents(&self, allow_unstable: bool) -> bool {
        if self.applying_ents_paused || self.has_next_or_in_progress_snapshot() {
            return false;
        }
        self.applying + 1 < self.max_appliable_index(allow_unstable) + 1
    }

    pub fn next_unstable_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.next_snapshot()
    }

    pub fn has_next_unstable_snapshot(&self) -> bool {
        self.unstable.next_snapshot().is_some()
    }

    pub fn has_next_or_in_progress_snapshot(&self) -> bool {
        self.unstable.snapshot.is_some()
    }

    /// The unstable snapshot if any, otherwise the storage's.
    pub fn snapshot(&self) -> StorageResult<Snapshot> {
        match &self.unstable.snapshot {
            Some(s) => Ok(s.clone()),
            None => self.store.snapshot(),
        }
    }

    /// Entries from `idx` to the end, capped at `max_size`.
    pub fn entries(&self, idx: u64, max_size: u64) -> StorageResult<Vec<LogEntry>> {
        if idx > self.last_index() {
            return Ok(Vec::new());
        }
        self.slice(idx, self.last_index() + 1, max_size)
    }

    pub fn all_entries(&self) -> Vec<LogEntry> {
        match self.entries(self.first_index(), NO_LIMIT) {
            Ok(ents) => ents,
            // the storage was compacted between reads
            Err(StorageError::Compacted) => self.all_entries(),
            Err(e) => crate::fatal!("unexpected error reading all entries: {}", e),
        }
    }

    /// Restores the log to `snapshot`: everything is replaced and the
    /// snapshot index becomes the commit index.
    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            log = %self,
            index = snapshot.metadata.index,
            term = snapshot.metadata.term,
            "starts to restore snapshot"
        );
        self.committed = snapshot.metadata.index;
        self.unstable.restore(snapshot);
    }

    /// Visits `[lo, hi)` in pages of at most `page_size` bytes until `visit`
    /// returns false.
    pub fn scan(
        &self,
        mut lo: u64,
        hi: u64,
        page_size: u64,
        mut visit: impl FnMut(&[LogEntry]) -> bool,
    ) -> StorageResult<()> {
        while lo < hi {
            let ents = self.slice(lo, hi, page_size)?;
            if ents.is_empty() {
                return Err(StorageError::Other(format!(
                    "got 0 entries in [{}, {})",
                    lo, hi
                )));
            }
            if !visit(&ents) {
                return Ok(());
            }
            lo += ents.len() as u64;
        }
        Ok(())
    }

    /// Entries in `[lo, hi)` capped at `max_size` bytes, never empty for a
    /// non-empty range.
    pub fn slice(&self, lo: u64, hi: u64, max_size: u64) -> StorageResult<Vec<LogEntry>> {
        self.must_check_out_of_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }
        let offset = self.unstable.offset;
        if lo >= offset {
            let mut ents = self.unstable.slice(lo, hi).to_vec();
            limit_size(&mut ents, max_size);
            return Ok(ents);
        }

        let cut = hi.min(offset);
        let mut ents = match self.store.entries(lo, cut, max_size) {
            Ok(ents) => ents,
            Err(StorageError::Compacted) => return Err(StorageError::Compacted),
            Err(StorageError::Unavailable) => {
                crate::fatal!("entries[{}:{}) is unavailable from storage", lo, cut)
            }
            Err(e) => crate::fatal!("storage entries[{}:{}) failed: {}", lo, cut, e),
        };
        if hi <= offset {
            return Ok(ents);
        }
        // storage already hit the cap
        if (ents.len() as u64) < cut - lo {
            return Ok(ents);
        }
        let size = entries_size(&ents);
        if size >= max_size {
            return Ok(ents);
        }
        let mut tail = self.unstable.slice(offset, hi).to_vec();
        limit_size(&mut tail, max_size - size);
        // a single oversized unstable entry is left for the next call
        if tail.len() == 1 && size + entries_size(&tail) > max_size {
            return Ok(ents);
        }
        ents.extend(tail);
        Ok(ents)
    }

    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) -> StorageResult<()> {
        if lo > hi {
            crate::fatal!("invalid slice {} > {}", lo, hi);
        }
        let fi = self.first_index();
        if lo < fi {
            return Err(StorageError::Compacted);
        }
        let li = self.last_index();
        if hi > li + 1 {
            crate::fatal!("slice[{},{}) out of bound [{},{}]", lo, hi, fi, li);
        }
        Ok(())
    }
}

impl<S: Storage> fmt::Display for RaftLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "committed={}, applied={}, applying={}, unstable.offset={}, unstable.offset_in_progress={}, len(unstable.entries)={}",
            self.committed,
            self.applied,
            self.applying,
            self.unstable.offset,
            self.unstable.offset_in_progress,
            self.unstable.entries.len()
        )
    }
}

impl<S: Storage> fmt::Debug for RaftLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
