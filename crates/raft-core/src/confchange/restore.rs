//! # restore
//!
//! why: rebuild the tracker config from a persisted ConfState
//! relations: used by node.rs on startup and when installing a snapshot
//! what: restore

use super::{Changer, ConfChangeSingle, ConfChangeType};
use crate::entry::ConfState;
use crate::error::Result;
use crate::tracker::{ProgressMap, ProgressTracker, TrackerConfig};

// Splits a conf state into the changes that rebuild its outgoing half and
// the changes that then enter the incoming half.
//
// For voters=(1 2 3) learners=(5) outgoing=(1 2 4 6) learners_next=(4):
//   outgoing: v1 v2 v4 v6
//   incoming: r1 r2 r4 r6 v1 v2 v3 l5 l4
fn to_conf_change_single(cs: &ConfState) -> (Vec<ConfChangeSingle>, Vec<ConfChangeSingle>) {
    let single = ConfChangeSingle::new;
    let outgoing = cs
        .voters_outgoing
        .iter()
        .map(|id| single(ConfChangeType::AddNode, *id))
        .collect();
    let incoming = cs
        .voters_outgoing
        .iter()
        .map(|id| single(ConfChangeType::RemoveNode, *id))
        .chain(cs.voters.iter().map(|id| single(ConfChangeType::AddNode, *id)))
        .chain(
            cs.learners
                .iter()
                .chain(cs.learners_next.iter())
                .map(|id| single(ConfChangeType::AddLearnerNode, *id)),
        )
        .collect();
    (outgoing, incoming)
}

/// Rebuilds the tracker configuration described by `cs`, starting from
/// `tracker` (normally empty), through a sequence of legal changes.
pub fn restore(
    tracker: &ProgressTracker,
    last_index: u64,
    cs: &ConfState,
) -> Result<(TrackerConfig, ProgressMap)> {
    let (outgoing, incoming) = to_conf_change_single(cs);
    let mut scratch = tracker.clone();

    fn install(scratch: &mut ProgressTracker, (cfg, trk): (TrackerConfig, ProgressMap)) {
        scratch.config = cfg;
        scratch.progress = trk;
    }

    if outgoing.is_empty() {
        for cc in &incoming {
            let res = Changer::new(&scratch, last_index).simple(std::slice::from_ref(cc))?;
            install(&mut scratch, res);
        }
    } else {
        // build the outgoing config as if it were the only one, then rotate
        // it out by entering the joint state with the incoming changes
        for cc in &outgoing {
            let res = Changer::new(&scratch, last_index).simple(std::slice::from_ref(cc))?;
            install(&mut scratch, res);
        }
        let res = Changer::new(&scratch, last_index).enter_joint(cs.auto_leave, &incoming)?;
        install(&mut scratch, res);
    }
    Ok((scratch.config, scratch.progress))
}
