//! # majority
//!
//! why: compute the majority decision for a single voter set
//! relations: the building block of joint.rs; read through AckedIndexer
//! what: MajorityConfig, committed_index, vote_result

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::{AckedIndexer, Index, VoteResult};

/// A set of voters deciding by simple majority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MajorityConfig {
    voters: BTreeSet<u64>,
}

impl MajorityConfig {
    pub fn new(voters: BTreeSet<u64>) -> Self {
        Self { voters }
    }

    pub fn ids(&self) -> &BTreeSet<u64> {
        &self.voters
    }

    pub fn contains(&self, id: u64) -> bool {
        self.voters.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    pub(crate) fn insert(&mut self, id: u64) {
        self.voters.insert(id);
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.voters.remove(&id);
    }

    pub(crate) fn clear(&mut self) {
        self.voters.clear();
    }

    /// Sorted voter ids, as stored in a `ConfState`.
    pub fn to_vec(&self) -> Vec<u64> {
        self.voters.iter().copied().collect()
    }

    /// The largest index acknowledged by a majority of the voters.
    ///
    /// Voters without an acknowledgement count as index 0. An empty config
    /// returns `u64::MAX` so that it never constrains a joint config.
    pub fn committed_index(&self, acked: &impl AckedIndexer) -> Index {
        if self.voters.is_empty() {
            return Index::MAX;
        }
        let mut indexes: Vec<Index> = self
            .voters
            .iter()
            .map(|id| acked.acked_index(*id).unwrap_or_default())
            .collect();
        indexes.sort_unstable();
        let n = indexes.len();
        indexes[n - (n / 2 + 1)]
    }

    /// Tallies `votes` (true = granted). Voters missing from `votes` have
    /// not answered yet. An empty config wins trivially.
    pub fn vote_result(&self, votes: &HashMap<u64, bool>) -> VoteResult {
        if self.voters.is_empty() {
            return VoteResult::Won;
        }
        let (mut granted, mut missing) = (0, 0);
        for id in &self.voters {
            match votes.get(id) {
                Some(true) => granted += 1,
                Some(false) => {}
                None => missing += 1,
            }
        }
        let quorum = self.voters.len() / 2 + 1;
        if granted >= quorum {
            VoteResult::Won
        } else if granted + missing >= quorum {
            VoteResult::Pending
        } else {
            VoteResult::Lost
        }
    }
}

impl FromIterator<u64> for MajorityConfig {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for MajorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.voters.iter().map(u64::to_string).collect();
        write!(f, "({})", ids.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::AckIndexMap;

    fn acks(pairs: &[(u64, Index)]) -> AckIndexMap {
        AckIndexMap(pairs.iter().copied().collect())
    }

    #[test]
    fn committed_index_is_majority_watermark() {
        let c: MajorityConfig = [1, 2, 3].into_iter().collect();
        assert_eq!(c.committed_index(&acks(&[(1, 10), (2, 5), (3, 7)])), 7);
        assert_eq!(c.committed_index(&acks(&[(1, 10)])), 0);
        assert_eq!(c.committed_index(&acks(&[(1, 10), (2, 9)])), 9);

        let c: MajorityConfig = [1, 2, 3, 4].into_iter().collect();
        assert_eq!(
            c.committed_index(&acks(&[(1, 10), (2, 9), (3, 8), (4, 1)])),
            8
        );
    }

    #[test]
    fn empty_config_never_constrains() {
        let c = MajorityConfig::default();
        assert_eq!(c.committed_index(&acks(&[])), Index::MAX);
        assert_eq!(c.vote_result(&HashMap::new()), VoteResult::Won);
    }

    #[test]
    fn vote_result_transitions() {
        let c: MajorityConfig = [1, 2, 3].into_iter().collect();
        let mut votes = HashMap::new();
        assert_eq!(c.vote_result(&votes), VoteResult::Pending);
        votes.insert(1, true);
        assert_eq!(c.vote_result(&votes), VoteResult::Pending);
        votes.insert(2, false);
        assert_eq!(c.vote_result(&votes), VoteResult::Pending);
        votes.insert(3, false);
        assert_eq!(c.vote_result(&votes), VoteResult::Lost);
        votes.insert(3, true);
        assert_eq!(c.vote_result(&votes), VoteResult::Won);
    }

    #[test]
    fn votes_from_non_members_are_ignored() {
        let c: MajorityConfig = [1, 2, 3].into_iter().collect();
        let votes: HashMap<u64, bool> = [(1, true), (7, true), (8, true)].into_iter().collect();
        assert_eq!(c.vote_result(&votes), VoteResult::Pending);
    }

    #[test]
    fn displays_sorted_ids() {
        let c: MajorityConfig = [3, 1, 2].into_iter().collect();
        assert_eq!(c.to_string(), "(1 2 3)");
    }
}
