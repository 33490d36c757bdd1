//! # tracker
//!
//! why: keep the leader's per-peer replication state and the active membership in one place
//! relations: built on quorum/, rebuilt by confchange/, driven by node.rs
//! what: TrackerConfig, ProgressTracker, Progress, ProgressState, Inflights

mod inflights;
mod progress;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

pub use inflights::Inflights;
pub use progress::{Progress, ProgressState};

use crate::entry::ConfState;
use crate::quorum::{AckedIndexer, Index, JointConfig, VoteResult};

/// Progress of every voter and learner, ordered by id.
pub type ProgressMap = BTreeMap<u64, Progress>;

impl AckedIndexer for ProgressMap {
    fn acked_index(&self, voter_id: u64) -> Option<Index> {
        self.get(&voter_id).map(|p| p.match_index)
    }
}

/// The active membership.
///
/// While joint, a node demoted from voter to learner stays a voter in the
/// outgoing half and is parked in `learners_next` until the joint state is
/// left; `learners` and the voter sets never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerConfig {
    pub voters: JointConfig,
    /// Leave the joint config automatically once it is committed.
    pub auto_leave: bool,
    pub learners: BTreeSet<u64>,
    pub learners_next: BTreeSet<u64>,
}

impl TrackerConfig {
    pub fn to_conf_state(&self) -> ConfState {
        ConfState {
            voters: self.voters.incoming().to_vec(),
            voters_outgoing: self.voters.outgoing().to_vec(),
            learners: self.learners.iter().copied().collect(),
            learners_next: self.learners_next.iter().copied().collect(),
            auto_leave: self.auto_leave,
        }
    }
}

impl fmt::Display for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voters={}", self.voters)?;
        let join = |set: &BTreeSet<u64>| {
            set.iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        };
        if !self.learners.is_empty() {
            write!(f, " learners=({})", join(&self.learners))?;
        }
        if !self.learners_next.is_empty() {
            write!(f, " learners_next=({})", join(&self.learners_next))?;
        }
        if self.auto_leave {
            write!(f, " autoleave")?;
        }
        Ok(())
    }
}

/// Membership, per-peer progress and the votes of the current election.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    pub config: TrackerConfig,
    pub progress: ProgressMap,
    votes: HashMap<u64, bool>,
    pub max_inflight: usize,
    pub max_inflight_bytes: u64,
}

impl ProgressTracker {
    pub fn new(max_inflight: usize, max_inflight_bytes: u64) -> Self {
        Self {
            config: TrackerConfig::default(),
            progress: ProgressMap::new(),
            votes: HashMap::new(),
            max_inflight,
            max_inflight_bytes,
        }
    }

    pub fn conf_state(&self) -> ConfState {
        self.config.to_conf_state()
    }

    /// True if the only voter is a single node, outside of a joint config.
    pub fn is_singleton(&self) -> bool {
        self.config.voters.incoming().len() == 1 && !self.config.voters.is_joint()
    }

    /// Highest index replicated on a quorum of voters.
    pub fn committed(&self) -> u64 {
        self.config.voters.committed_index(&self.progress)
    }

    /// Whether a quorum of voters has been recently active.
    pub fn quorum_active(&self) -> bool {
        let votes: HashMap<u64, bool> = self
            .progress
            .iter()
            .filter(|(_, pr)| !pr.is_learner)
            .map(|(id, pr)| (*id, pr.recent_active))
            .collect();
        self.config.voters.vote_result(&votes) == VoteResult::Won
    }

    /// Sorted ids of all voters, across both halves of a joint config.
    pub fn voter_nodes(&self) -> Vec<u64> {
        self.config.voters.ids().into_iter().collect()
    }

    /// Sorted ids of learners, including those parked in `learners_next`.
    pub fn learner_nodes(&self) -> Vec<u64> {
        self.config
            .learners
            .union(&self.config.learners_next)
            .copied()
            .collect()
    }

    pub fn reset_votes(&mut self) {
        self.votes.clear();
    }

    /// Records a vote. Only the first answer of each node counts.
    pub fn record_vote(&mut self, id: u64, granted: bool) {
        self.votes.entry(id).or_insert(granted);
    }

    /// Returns (granted, rejected, result) for the current election.
    pub fn tally_votes(&self) -> (usize, usize, VoteResult) {
        let (mut granted, mut rejected) = (0, 0);
        for (id, pr) in &self.progress {
            if pr.is_learner {
                continue;
            }
            match self.votes.get(id) {
                Some(true) => granted += 1,
                Some(false) => rejected += 1,
                None => {}
            }
        }
        (granted, rejected, self.config.voters.vote_result(&self.votes))
    }

    /// Calls `f` for each progress in id order.
    pub fn visit(&mut self, mut f: impl FnMut(u64, &mut Progress)) {
        for (id, pr) in self.progress.iter_mut() {
            f(*id, pr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::MajorityConfig;

    fn tracker(voters: &[u64], learners: &[u64]) -> ProgressTracker {
        let mut t = ProgressTracker::new(256, 0);
        t.config.voters.incoming = voters.iter().copied().collect::<MajorityConfig>();
        t.config.learners = learners.iter().copied().collect();
        for id in voters {
            t.progress.insert(*id, Progress::new(1, 256, 0));
        }
        for id in learners {
            let mut pr = Progress::new(1, 256, 0);
            pr.is_learner = true;
            t.progress.insert(*id, pr);
        }
        t
    }

    #[test]
    fn committed_ignores_learners() {
        let mut t = tracker(&[1, 2, 3], &[4]);
        for (id, m) in [(1, 5), (2, 3), (3, 1), (4, 9)] {
            t.progress.get_mut(&id).unwrap().match_index = m;
        }
        assert_eq!(t.committed(), 3);
    }

    #[test]
    fn first_vote_wins() {
        let mut t = tracker(&[1, 2, 3], &[]);
        t.record_vote(1, true);
        t.record_vote(2, false);
        t.record_vote(2, true);
        assert_eq!(t.tally_votes(), (1, 1, VoteResult::Pending));
        t.record_vote(3, true);
        assert_eq!(t.tally_votes(), (2, 1, VoteResult::Won));
        t.reset_votes();
        assert_eq!(t.tally_votes(), (0, 0, VoteResult::Pending));
    }

    #[test]
    fn quorum_active_counts_recent_voters() {
        let mut t = tracker(&[1, 2, 3], &[4]);
        t.progress.get_mut(&1).unwrap().recent_active = true;
        t.progress.get_mut(&4).unwrap().recent_active = true;
        assert!(!t.quorum_active());
        t.progress.get_mut(&2).unwrap().recent_active = true;
        assert!(t.quorum_active());
    }

    #[test]
    fn conf_state_reflects_config() {
        let mut t = tracker(&[1, 2], &[3]);
        t.config.voters.outgoing = [1, 2, 5].into_iter().collect();
        t.config.auto_leave = true;
        let cs = t.conf_state();
        assert_eq!(cs.voters, vec![1, 2]);
        assert_eq!(cs.voters_outgoing, vec![1, 2, 5]);
        assert_eq!(cs.learners, vec![3]);
        assert!(cs.auto_leave);
        assert!(!t.is_singleton());
        assert_eq!(t.voter_nodes(), vec![1, 2, 5]);
    }

    #[test]
    fn displays_config() {
        let mut t = tracker(&[1, 2], &[3]);
        t.config.auto_leave = true;
        assert_eq!(t.config.to_string(), "voters=(1 2) learners=(3) autoleave");
    }
}
