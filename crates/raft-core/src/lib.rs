//! # raft-core
//!
//! why: implement the raft consensus state machine as a deterministic library with no i/o of its own
//! relations: driven by the application through RawNode; raft-storage provides durable Storage
//! what: election, replication, membership changes, read index, Ready/advance driver interface
//!
//! The core never touches the network, the disk or a clock. The driver
//! feeds it ticks and messages, then drains a [`Ready`], persists what it
//! asks for, sends its messages and applies its committed entries.

pub mod config;
pub mod confchange;
pub mod describe;
pub mod entry;
pub mod error;
pub mod log;
pub mod log_unstable;
pub mod message;
pub mod node;
pub mod quorum;
pub mod raw_node;
pub mod read_only;
pub mod status;
pub mod storage;
pub mod tracker;
pub mod util;

/// Node id meaning "nobody": no leader, no vote.
pub const INVALID_ID: u64 = 0;
/// Log index meaning "no entry".
pub const INVALID_INDEX: u64 = 0;

pub use config::RaftConfig;
pub use confchange::{
    ConfChange, ConfChangeI, ConfChangeSingle, ConfChangeTransition, ConfChangeType, ConfChangeV2,
};
pub use describe::{DefaultFormatter, EntryFormatter};
pub use entry::{ConfState, EntryType, HardState, LogEntry, Snapshot, SnapshotMetadata};
pub use error::{RaftError, Result, StorageError};
pub use message::{MessageType, RaftMessage, LOCAL_APPEND_THREAD, LOCAL_APPLY_THREAD};
pub use node::{NodeState, RaftNode, SoftState, CAMPAIGN_TRANSFER};
pub use quorum::VoteResult;
pub use raw_node::{Peer, RawNode, Ready, SnapshotStatus};
pub use read_only::{ReadOnlyOption, ReadState};
pub use status::{BasicStatus, Status};
pub use storage::{MemStorage, RaftState, Storage, StorageResult};
pub use tracker::{Progress, ProgressState};
