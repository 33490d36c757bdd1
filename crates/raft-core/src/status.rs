//! # status
//!
//! why: snapshot the node's externally interesting state for operators and tests
//! relations: built from node.rs by raw_node.rs
//! what: BasicStatus, Status

use std::fmt;

use crate::entry::HardState;
use crate::node::{NodeState, RaftNode, SoftState};
use crate::storage::Storage;
use crate::tracker::{ProgressMap, TrackerConfig};

/// Everything but the progress map, cheap to build on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicStatus {
    pub id: u64,
    pub hard_state: HardState,
    pub soft_state: SoftState,
    pub applied: u64,
    pub lead_transferee: u64,
}

impl BasicStatus {
    pub fn new<S: Storage>(r: &RaftNode<S>) -> Self {
        Self {
            id: r.id,
            hard_state: r.hard_state(),
            soft_state: r.soft_state(),
            applied: r.raft_log.applied,
            lead_transferee: r.lead_transferee,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub basic: BasicStatus,
    pub config: TrackerConfig,
    /// Per-follower replication state; only a leader tracks it.
    pub progress: Option<ProgressMap>,
}

impl Status {
    pub fn new<S: Storage>(r: &RaftNode<S>) -> Self {
        let progress = (r.state == NodeState::Leader).then(|| r.trk.progress.clone());
        Self {
            basic: BasicStatus::new(r),
            config: r.trk.config.clone(),
            progress,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.basic;
        write!(
            f,
            "id={} term={} vote={} commit={} lead={} state={} applied={} transferee={} config=[{}]",
            b.id,
            b.hard_state.term,
            b.hard_state.vote,
            b.hard_state.commit,
            b.soft_state.leader_id,
            b.soft_state.raft_state,
            b.applied,
            b.lead_transferee,
            self.config,
        )?;
        if let Some(progress) = &self.progress {
            for (id, pr) in progress {
                write!(f, " {}:[{}]", id, pr)?;
            }
        }
        Ok(())
    }
}
