//! # config
//!
//! why: collect the tunables of a node in one serde-loadable, validated struct
//! relations: consumed by node.rs when building a RaftNode and by raw_node.rs
//! what: RaftConfig

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::message::is_local_msg_target;
use crate::read_only::ReadOnlyOption;
use crate::util::NO_LIMIT;
use crate::INVALID_ID;

/// Parameters to start a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Identity of the local node. Must not be 0.
    pub id: u64,

    /// Ticks without leader contact before a follower campaigns. The actual
    /// timeout is randomized in `[election_tick, 2 * election_tick)`.
    pub election_tick: usize,

    /// Ticks between leader heartbeats.
    pub heartbeat_tick: usize,

    /// Last applied index, when restarting. Entries at or below it are not
    /// handed out again.
    pub applied: u64,

    /// Byte cap per append message. Appends always carry at least one entry.
    pub max_size_per_msg: u64,

    /// Byte cap on committed entries handed out per Ready and still being
    /// applied. 0 falls back to `max_size_per_msg`.
    pub max_committed_size_per_ready: u64,

    /// Payload bytes a leader accepts into its uncommitted tail before it
    /// drops proposals. 0 means unlimited.
    pub max_uncommitted_entries_size: u64,

    /// Append messages in flight per follower while replicating.
    pub max_inflight_msgs: usize,

    /// Payload bytes in flight per follower. 0 means unlimited.
    pub max_inflight_bytes: u64,

    /// Leader steps down when it has not heard from a quorum within an
    /// election timeout.
    pub check_quorum: bool,

    /// Run a non-binding election round before bumping the term.
    pub pre_vote: bool,

    pub read_only_option: ReadOnlyOption,

    /// Followers drop proposals instead of forwarding them to the leader.
    pub disable_proposal_forwarding: bool,

    /// A leader removed from (or demoted in) the config steps down once the
    /// change applies.
    pub step_down_on_removal: bool,

    /// Persistence and application run on driver threads fed through
    /// `StorageAppend`/`StorageApply` messages instead of `advance`.
    pub async_storage_writes: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: INVALID_ID,
            election_tick: 10,
            heartbeat_tick: 1,
            applied: 0,
            max_size_per_msg: 1024 * 1024,
            max_committed_size_per_ready: 0,
            max_uncommitted_entries_size: 0,
            max_inflight_msgs: 256,
            max_inflight_bytes: 0,
            check_quorum: false,
            pre_vote: false,
            read_only_option: ReadOnlyOption::Safe,
            disable_proposal_forwarding: false,
            step_down_on_removal: false,
            async_storage_writes: false,
        }
    }
}

impl RaftConfig {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Parses a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RaftError::ConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(RaftError::ConfigInvalid(msg.to_string()));
        if self.id == INVALID_ID {
            return invalid("cannot use none as id");
        }
        if is_local_msg_target(self.id) {
            return invalid("cannot use local target as id");
        }
        if self.heartbeat_tick == 0 {
            return invalid("heartbeat tick must be greater than 0");
        }
        if self.election_tick <= self.heartbeat_tick {
            return invalid("election tick must be greater than heartbeat tick");
        }
        if self.max_inflight_msgs == 0 {
            return invalid("max inflight messages must be greater than 0");
        }
        if self.max_inflight_bytes != 0 && self.max_inflight_bytes < self.max_size_per_msg {
            return invalid("max inflight bytes must be >= max message size");
        }
        if self.read_only_option == ReadOnlyOption::LeaseBased && !self.check_quorum {
            return invalid(
                "CheckQuorum must be enabled when ReadOnlyOption is ReadOnlyLeaseBased",
            );
        }
        Ok(())
    }

    /// Effective uncommitted quota.
    pub fn uncommitted_size_limit(&self) -> u64 {
        match self.max_uncommitted_entries_size {
            0 => NO_LIMIT,
            n => n,
        }
    }

    /// Effective apply budget per Ready.
    pub fn committed_size_per_ready(&self) -> u64 {
        match (self.max_committed_size_per_ready, self.max_size_per_msg) {
            (0, 0) => NO_LIMIT,
            (0, n) => n,
            (n, _) => n,
        }
    }
}
