//! # joint
//!
//! why: decide votes and commits while a membership change keeps two voter sets alive
//! relations: combines two majority.rs configs; held by tracker/mod.rs as the active voters
//! what: JointConfig

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::{AckedIndexer, Index, MajorityConfig, VoteResult};

/// Incoming and outgoing voter sets. Outside of a membership change the
/// outgoing set is empty and the joint config behaves like the incoming one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JointConfig {
    pub(crate) incoming: MajorityConfig,
    pub(crate) outgoing: MajorityConfig,
}

impl JointConfig {
    pub fn new(voters: BTreeSet<u64>) -> Self {
        Self {
            incoming: MajorityConfig::new(voters),
            outgoing: MajorityConfig::default(),
        }
    }

    pub fn incoming(&self) -> &MajorityConfig {
        &self.incoming
    }

    pub fn outgoing(&self) -> &MajorityConfig {
        &self.outgoing
    }

    pub fn is_joint(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Union of both voter sets.
    pub fn ids(&self) -> BTreeSet<u64> {
        self.incoming
            .ids()
            .union(self.outgoing.ids())
            .copied()
            .collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.incoming.contains(id) || self.outgoing.contains(id)
    }

    /// The largest index that is committed under both configs: a value has to
    /// be safe for the old and the new membership before it commits.
    pub fn committed_index(&self, acked: &impl AckedIndexer) -> Index {
        let i = self.incoming.committed_index(acked);
        let o = self.outgoing.committed_index(acked);
        i.min(o)
    }

    /// Won only when both sides won; lost as soon as either side lost.
    pub fn vote_result(&self, votes: &HashMap<u64, bool>) -> VoteResult {
        let i = self.incoming.vote_result(votes);
        let o = self.outgoing.vote_result(votes);
        match (i, o) {
            (a, b) if a == b => a,
            (VoteResult::Lost, _) | (_, VoteResult::Lost) => VoteResult::Lost,
            _ => VoteResult::Pending,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
    }
}

impl fmt::Display for JointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outgoing.is_empty() {
            write!(f, "{}", self.incoming)
        } else {
            write!(f, "{}&&{}", self.incoming, self.outgoing)
        }
    }
}
