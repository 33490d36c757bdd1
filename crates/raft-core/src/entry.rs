//! # entry
//!
//! why: define the durable records raft replicates and persists
//! relations: carried by message.rs, stored through storage.rs, sliced by log.rs
//! what: LogEntry, EntryType, HardState, ConfState, Snapshot, SnapshotMetadata

use serde::{Deserialize, Serialize};

/// Fixed per-entry bytes counted on top of the payload when sizing entries
/// (term, index and kind).
pub const ENTRY_OVERHEAD: u64 = 17;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Application payload (or the empty entry a new leader appends).
    #[default]
    Normal,
    /// A single-node [`ConfChange`](crate::ConfChange).
    ConfChange,
    /// A [`ConfChangeV2`](crate::ConfChangeV2), which may enter or leave a
    /// joint configuration.
    ConfChangeJoint,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_type: EntryType,
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// Opaque payload; for conf-change entries the encoded change
    pub data: Vec<u8>,
    /// Opaque application context, never interpreted by raft
    pub context: Vec<u8>,
}

impl LogEntry {
    /// Create a new normal log entry
    pub fn new(term: u64, index: u64, data: Vec<u8>) -> Self {
        Self {
            entry_type: EntryType::Normal,
            term,
            index,
            data,
            context: Vec::new(),
        }
    }

    /// Bytes this entry accounts for in size-limited reads and messages.
    pub fn encoded_size(&self) -> u64 {
        ENTRY_OVERHEAD + self.data.len() as u64 + self.context.len() as u64
    }

    /// Payload bytes only. Empty entries are free, which keeps the new
    /// leader's empty entry and auto-leave proposals outside the
    /// uncommitted quota.
    pub fn payload_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_conf_change(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::ConfChange | EntryType::ConfChangeJoint
        )
    }
}

/// The state that must be durable before any message derived from it leaves
/// the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

/// Membership as persisted in snapshots and handed back after applying a
/// configuration change. A non-empty `voters_outgoing` means joint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    pub voters_outgoing: Vec<u64>,
    pub learners_next: Vec<u64>,
    pub auto_leave: bool,
}

impl ConfState {
    pub fn with_voters(voters: Vec<u64>) -> Self {
        Self {
            voters,
            ..Default::default()
        }
    }

    pub fn is_joint(&self) -> bool {
        !self.voters_outgoing.is_empty()
    }

    /// Compares two conf states ignoring the order of ids.
    pub fn equivalent(&self, other: &ConfState) -> std::result::Result<(), String> {
        let normalize = |cs: &ConfState| {
            let mut cs = cs.clone();
            cs.voters.sort_unstable();
            cs.learners.sort_unstable();
            cs.voters_outgoing.sort_unstable();
            cs.learners_next.sort_unstable();
            cs
        };
        let (a, b) = (normalize(self), normalize(other));
        if a == b {
            Ok(())
        } else {
            Err(format!("ConfStates not equivalent after sorting:\n{a:?}\n{b:?}"))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub conf_state: ConfState,
    pub index: u64,
    pub term: u64,
}

/// A point-in-time image of the application state plus the log position and
/// membership it covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}
