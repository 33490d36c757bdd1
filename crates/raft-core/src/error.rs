//! # error
//!
//! why: give every recoverable failure of the core a typed, matchable shape
//! relations: returned by node.rs, raw_node.rs, storage.rs and the confchange changer
//! what: RaftError, StorageError, the crate Result alias and the fatal! halt macro

use thiserror::Error;

/// Errors the core hands back to its driver.
///
/// Anything that means local state can no longer be trusted is not in here:
/// those paths go through [`fatal!`](crate::fatal) and halt the node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// The proposal was not appended: no leader, not the leader with
    /// forwarding disabled, a leader transfer in flight, or the uncommitted
    /// quota is exhausted. The caller has to retry or redirect.
    #[error("raft: proposal dropped")]
    ProposalDropped,

    /// A configuration change was refused before reaching the log.
    #[error("raft: conf change rejected: {0}")]
    ConfChangeRejected(String),

    #[error("raft: cannot step raft local message")]
    StepLocalMsg,

    #[error("raft: cannot step as peer not found")]
    StepPeerNotFound,

    #[error("raft: invalid config: {0}")]
    ConfigInvalid(String),

    /// The membership changer refused to produce a configuration.
    #[error("raft: conf change: {0}")]
    ConfChange(String),

    #[error("raft: cannot decode payload: {0}")]
    Codec(String),

    #[error("raft: bootstrap: {0}")]
    Bootstrap(String),

    #[error("raft: storage: {0}")]
    Store(#[from] StorageError),
}

/// Errors a [`Storage`](crate::Storage) implementation may report.
///
/// Only `Compacted` and `Unavailable` are part of normal operation; the log
/// abstraction treats everything else as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    #[error("requested entry at index is unavailable")]
    Unavailable,

    #[error("requested index is older than the existing snapshot")]
    SnapshotOutOfDate,

    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,

    #[error("storage failure: {0}")]
    Other(String),
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Logs an invariant violation and halts the node.
///
/// Used where continuing would risk breaking log matching or commit safety:
/// truncating committed entries, regressing the applied index, corrupt
/// storage, irreconcilable membership after a snapshot restore.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        ::tracing::error!(fatal = true, "{}", msg);
        panic!("{}", msg)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_converts_into_raft_error() {
        let err: RaftError = StorageError::Compacted.into();
        assert_eq!(err, RaftError::Store(StorageError::Compacted));
        assert!(err.to_string().contains("compaction"));
    }

    #[test]
    #[should_panic(expected = "applied(7) is out of range")]
    fn fatal_panics_with_message() {
        fatal!("applied({}) is out of range", 7);
    }
}
