//! # log_unstable
//!
//! why: hold entries and a snapshot the driver has not yet made durable
//! relations: owned by log.rs; drained into Ready by raw_node.rs
//! what: Unstable

use tracing::{info, warn};

use crate::entry::{LogEntry, Snapshot};

/// The not-yet-persisted tail of the log.
///
/// `entries[i]` has index `offset + i`. Entries below `offset_in_progress`
/// (and the snapshot, once `snapshot_in_progress`) were already handed to
/// the driver and must not be handed out again.
#[derive(Debug, Clone, Default)]
pub struct Unstable {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
    pub offset: u64,
    pub snapshot_in_progress: bool,
    pub offset_in_progress: u64,
}

impl Unstable {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            offset_in_progress: offset,
            ..Default::default()
        }
    }

    /// First index, if only the unstable snapshot can tell.
    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.metadata.index + 1)
    }

    pub fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.metadata.index)
    }

    pub fn maybe_term(&self, idx: u64) -> Option<u64> {
        if idx < self.offset {
            return self
                .snapshot
                .as_ref()
                .filter(|s| s.metadata.index == idx)
                .map(|s| s.metadata.term);
        }
        let last = self.maybe_last_index()?;
        if idx > last {
            return None;
        }
        Some(self.entries[(idx - self.offset) as usize].term)
    }

    /// Entries not yet handed to the driver.
    pub fn next_entries(&self) -> &[LogEntry] {
        let in_progress = (self.offset_in_progress - self.offset) as usize;
        &self.entries[in_progress.min(self.entries.len())..]
    }

    /// Snapshot not yet handed to the driver.
    pub fn next_snapshot(&self) -> Option<&Snapshot> {
        if self.snapshot_in_progress {
            return None;
        }
        self.snapshot.as_ref()
    }

    /// Marks everything currently unstable as handed to the driver.
    pub fn accept_in_progress(&mut self) {
        if let Some(last) = self.entries.last() {
            self.offset_in_progress = last.index + 1;
        }
        if self.snapshot.is_some() {
            self.snapshot_in_progress = true;
        }
    }

    /// Drops entries up to `(index, term)` once they are durable. Stale
    /// acknowledgements (the entry was replaced or is not unstable) are
    /// ignored.
    pub fn stable_to(&mut self, index: u64, term: u64) {
        let Some(gt) = self.maybe_term(index) else {
            info!(index, "entry missing from unstable log; ignoring");
            return;
        };
        if index < self.offset {
            info!(index, "entry matched unstable snapshot; ignoring");
            return;
        }
        if gt != term {
            info!(
                index,
                term,
                unstable_term = gt,
                "entry mismatched with unstable log; ignoring"
            );
            return;
        }
        let num = (index + 1 - self.offset) as usize;
        self.entries.drain(..num);
        self.offset = index + 1;
        self.offset_in_progress = self.offset_in_progress.max(self.offset);
        self.shrink_entries();
    }

    // keep memory bounded once a large burst is persisted
    fn shrink_entries(&mut self) {
        const LEN_MULTIPLE: usize = 2;
        if self.entries.is_empty() {
            self.entries = Vec::new();
        } else if self.entries.len() * LEN_MULTIPLE < self.entries.capacity() {
            self.entries.shrink_to_fit();
        }
    }

    pub fn stable_snap_to(&mut self, index: u64) {
        if self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.metadata.index == index)
        {
            self.snapshot = None;
            self.snapshot_in_progress = false;
        }
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.offset = snapshot.metadata.index + 1;
        self.offset_in_progress = self.offset;
        self.entries.clear();
        self.snapshot = Some(snapshot);
        self.snapshot_in_progress = false;
    }

    pub fn truncate_and_append(&mut self, ents: &[LogEntry]) {
        let Some(first) = ents.first() else {
            return;
        };
        let from = first.index;
        if from == self.offset + self.entries.len() as u64 {
            self.entries.extend_from_slice(ents);
        } else if from <= self.offset {
            info!(from, "replace the unstable entries");
            self.entries = ents.to_vec();
            self.offset = from;
            self.offset_in_progress = self.offset;
        } else {
            warn!(from, "truncate the unstable entries");
            self.must_check_out_of_bounds(self.offset, from);
            self.entries.truncate((from - self.offset) as usize);
            self.entries.extend_from_slice(ents);
            self.offset_in_progress = self.offset_in_progress.min(from);
        }
    }

    /// Entries in `[lo, hi)`, which must lie within the unstable tail.
    pub fn slice(&self, lo: u64, hi: u64) -> &[LogEntry] {
        self.must_check_out_of_bounds(lo, hi);
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }

    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) {
        if lo > hi {
            crate::fatal!("invalid unstable.slice {} > {}", lo, hi);
        }
        let upper = self.offset + self.entries.len() as u64;
        if lo < self.offset || hi > upper {
            crate::fatal!(
                "unstable.slice[{},{}) out of bound [{},{}]",
                lo,
                hi,
                self.offset,
                upper
            );
        }
    }
}
