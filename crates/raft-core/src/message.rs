//! # message
//!
//! why: define the closed set of raft message kinds and the single envelope they travel in
//! relations: produced and consumed by node.rs, batched by raw_node.rs, rendered by describe.rs
//! what: MessageType with its classification helpers, RaftMessage

use serde::{Deserialize, Serialize};

use crate::entry::{HardState, LogEntry, Snapshot};

/// Pseudo node id of the driver's storage-append worker when
/// `async_storage_writes` is on.
pub const LOCAL_APPEND_THREAD: u64 = u64::MAX;
/// Pseudo node id of the driver's apply worker when `async_storage_writes`
/// is on.
pub const LOCAL_APPLY_THREAD: u64 = u64::MAX - 1;

/// Every kind of message the core sends or accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Local election trigger.
    #[default]
    Hup,
    /// Local heartbeat trigger on the leader.
    Beat,
    Prop,
    App,
    AppResp,
    Vote,
    VoteResp,
    Snap,
    Heartbeat,
    HeartbeatResp,
    Unreachable,
    SnapStatus,
    CheckQuorum,
    TransferLeader,
    TimeoutNow,
    ReadIndex,
    ReadIndexResp,
    PreVote,
    PreVoteResp,
    StorageAppend,
    StorageAppendResp,
    StorageApply,
    StorageApplyResp,
}

impl MessageType {
    /// Kinds that only ever originate inside the node or its driver and must
    /// never be accepted from the network.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            MessageType::Hup
                | MessageType::Beat
                | MessageType::Unreachable
                | MessageType::SnapStatus
                | MessageType::CheckQuorum
                | MessageType::StorageAppend
                | MessageType::StorageAppendResp
                | MessageType::StorageApply
                | MessageType::StorageApplyResp
        )
    }

    /// Kinds that answer an earlier request and so require a known peer.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::AppResp
                | MessageType::VoteResp
                | MessageType::HeartbeatResp
                | MessageType::Unreachable
                | MessageType::ReadIndexResp
                | MessageType::PreVoteResp
                | MessageType::StorageAppendResp
                | MessageType::StorageApplyResp
        )
    }

    /// The response kind for a vote request kind.
    ///
    /// Asking for anything other than `Vote` or `PreVote` is a programming
    /// error and halts the node.
    pub fn vote_response(self) -> MessageType {
        match self {
            MessageType::Vote => MessageType::VoteResp,
            MessageType::PreVote => MessageType::PreVoteResp,
            other => crate::fatal!("not a vote message: {:?}", other),
        }
    }
}

/// True for the pseudo ids of the driver's local storage workers.
pub fn is_local_msg_target(id: u64) -> bool {
    id == LOCAL_APPEND_THREAD || id == LOCAL_APPLY_THREAD
}

/// The envelope every raft message travels in.
///
/// Which fields are meaningful depends on `msg_type`; unused ones stay at
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMessage {
    pub msg_type: MessageType,
    pub to: u64,
    pub from: u64,
    pub term: u64,
    /// Term of the entry at `index` (append), of the candidate's last entry
    /// (vote), or of the reject hint (rejected append response).
    pub log_term: u64,
    pub index: u64,
    pub entries: Vec<LogEntry>,
    pub commit: u64,
    /// On `StorageAppend`, together with `term` and `commit`, the hard state
    /// to persist.
    pub vote: u64,
    pub snapshot: Option<Snapshot>,
    pub reject: bool,
    pub reject_hint: u64,
    /// Heartbeat read-index epoch, or the transfer marker on vote requests.
    pub context: Vec<u8>,
    /// Messages to deliver once a `StorageAppend`/`StorageApply` is done.
    pub responses: Vec<RaftMessage>,
}

impl RaftMessage {
    pub fn new(msg_type: MessageType, from: u64, to: u64) -> Self {
        Self {
            msg_type,
            from,
            to,
            ..Default::default()
        }
    }

    /// The hard state a `StorageAppend` asks the driver to persist, if any.
    pub fn hard_state(&self) -> Option<HardState> {
        let hs = HardState {
            term: self.term,
            vote: self.vote,
            commit: self.commit,
        };
        (!hs.is_empty()).then_some(hs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_kinds_are_classified() {
        assert!(MessageType::Hup.is_local());
        assert!(MessageType::StorageApplyResp.is_local());
        assert!(!MessageType::App.is_local());
        assert!(!MessageType::ReadIndex.is_local());
    }

    #[test]
    fn response_kinds_are_classified() {
        assert!(MessageType::AppResp.is_response());
        assert!(MessageType::PreVoteResp.is_response());
        assert!(MessageType::Unreachable.is_response());
        assert!(!MessageType::Vote.is_response());
        assert!(!MessageType::Heartbeat.is_response());
    }

    #[test]
    fn vote_kinds_map_to_responses() {
        assert_eq!(MessageType::Vote.vote_response(), MessageType::VoteResp);
        assert_eq!(MessageType::PreVote.vote_response(), MessageType::PreVoteResp);
    }

    #[test]
    #[should_panic(expected = "not a vote message")]
    fn vote_response_of_non_vote_halts() {
        MessageType::App.vote_response();
    }

    #[test]
    fn message_roundtrips_through_json() {
        let mut m = RaftMessage::new(MessageType::App, 1, 2);
        m.entries.push(LogEntry::new(1, 1, b"x".to_vec()));
        let json = serde_json::to_string(&m).unwrap();
        let back: RaftMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
