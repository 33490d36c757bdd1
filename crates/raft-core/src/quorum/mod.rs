//! # quorum
//!
//! why: answer "has a majority agreed?" for plain and joint voter configurations
//! relations: owned by tracker/mod.rs, consulted by node.rs for votes, commits and read-index acks
//! what: VoteResult, AckedIndexer, MajorityConfig, JointConfig

mod joint;
mod majority;

use std::collections::HashMap;

pub use joint::JointConfig;
pub use majority::MajorityConfig;

/// A log index as seen by quorum computations.
pub type Index = u64;

/// Outcome of counting votes against a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    /// Neither side has a majority yet.
    Pending,
    /// Enough rejections that a majority can no longer be reached.
    Lost,
    /// A majority granted.
    Won,
}

/// Source of acknowledged log indexes, keyed by voter id.
pub trait AckedIndexer {
    fn acked_index(&self, voter_id: u64) -> Option<Index>;
}

/// Plain map of acknowledged indexes, handy for tests and tooling.
#[derive(Debug, Clone, Default)]
pub struct AckIndexMap(pub HashMap<u64, Index>);

impl AckedIndexer for AckIndexMap {
    fn acked_index(&self, voter_id: u64) -> Option<Index> {
        self.0.get(&voter_id).copied()
    }
}
