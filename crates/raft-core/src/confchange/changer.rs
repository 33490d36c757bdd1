//! # changer
//!
//! why: turn requested membership changes into a new tracker config, refusing unsafe ones
//! relations: called by node.rs apply_conf_change and by restore.rs
//! what: Changer

use std::collections::BTreeSet;

use super::{ConfChangeSingle, ConfChangeType};
use crate::error::{RaftError, Result};
use crate::quorum::MajorityConfig;
use crate::tracker::{Progress, ProgressMap, ProgressTracker, TrackerConfig};

/// Computes the configuration that results from applying changes to a
/// tracker, without modifying it.
///
/// Every method works on a copy and checks the tracker invariants before and
/// after; the caller installs the result.
pub struct Changer<'a> {
    pub tracker: &'a ProgressTracker,
    /// New peers are probed from here.
    pub last_index: u64,
}

fn err(msg: impl Into<String>) -> RaftError {
    RaftError::ConfChange(msg.into())
}

impl<'a> Changer<'a> {
    pub fn new(tracker: &'a ProgressTracker, last_index: u64) -> Self {
        Self {
            tracker,
            last_index,
        }
    }

    /// Enters a joint config: the current voters become the outgoing half
    /// and `ccs` are applied to the incoming half.
    pub fn enter_joint(
        &self,
        auto_leave: bool,
        ccs: &[ConfChangeSingle],
    ) -> Result<(TrackerConfig, ProgressMap)> {
        let (mut cfg, mut trk) = self.check_and_copy()?;
        if cfg.voters.is_joint() {
            return Err(err("config is already joint"));
        }
        if cfg.voters.incoming.is_empty() {
            // an empty config may be grown directly but never made joint
            return Err(err("can't make a zero-voter config joint"));
        }
        cfg.voters.outgoing = cfg.voters.incoming.clone();
        self.apply(&mut cfg, &mut trk, ccs)?;
        cfg.auto_leave = auto_leave;
        check_and_return(cfg, trk)
    }

    /// Leaves a joint config: the outgoing half is dropped and staged
    /// learners become learners.
    pub fn leave_joint(&self) -> Result<(TrackerConfig, ProgressMap)> {
        let (mut cfg, mut trk) = self.check_and_copy()?;
        if !cfg.voters.is_joint() {
            return Err(err("can't leave a non-joint config"));
        }
        for id in std::mem::take(&mut cfg.learners_next) {
            cfg.learners.insert(id);
            if let Some(pr) = trk.get_mut(&id) {
                pr.is_learner = true;
            }
        }
        for id in cfg.voters.outgoing.to_vec() {
            if !cfg.voters.incoming.contains(id) && !cfg.learners.contains(&id) {
                trk.remove(&id);
            }
        }
        cfg.voters.outgoing = MajorityConfig::default();
        cfg.auto_leave = false;
        check_and_return(cfg, trk)
    }

    /// Applies changes outside of a joint config. At most one voter may be
    /// added or removed this way.
    pub fn simple(&self, ccs: &[ConfChangeSingle]) -> Result<(TrackerConfig, ProgressMap)> {
        let (mut cfg, mut trk) = self.check_and_copy()?;
        if cfg.voters.is_joint() {
            return Err(err("can't apply simple config change in joint config"));
        }
        self.apply(&mut cfg, &mut trk, ccs)?;
        let n = self
            .tracker
            .config
            .voters
            .incoming
            .ids()
            .symmetric_difference(cfg.voters.incoming.ids())
            .count();
        if n > 1 {
            return Err(err(
                "more than one voter changed without entering joint config",
            ));
        }
        check_and_return(cfg, trk)
    }

    fn apply(
        &self,
        cfg: &mut TrackerConfig,
        trk: &mut ProgressMap,
        ccs: &[ConfChangeSingle],
    ) -> Result<()> {
        for cc in ccs {
            // node id 0 marks a change the application chose to skip
            if cc.node_id == 0 {
                continue;
            }
            match cc.change_type {
                ConfChangeType::AddNode => self.make_voter(cfg, trk, cc.node_id),
                ConfChangeType::AddLearnerNode => self.make_learner(cfg, trk, cc.node_id),
                ConfChangeType::RemoveNode => remove(cfg, trk, cc.node_id),
                ConfChangeType::UpdateNode => {}
            }
        }
        if cfg.voters.incoming.is_empty() {
            return Err(err("removed all voters"));
        }
        Ok(())
    }

    fn make_voter(&self, cfg: &mut TrackerConfig, trk: &mut ProgressMap, id: u64) {
        let Some(pr) = trk.get_mut(&id) else {
            self.init_progress(cfg, trk, id, false);
            return;
        };
        pr.is_learner = false;
        cfg.learners.remove(&id);
        cfg.learners_next.remove(&id);
        cfg.voters.incoming.insert(id);
    }

    fn make_learner(&self, cfg: &mut TrackerConfig, trk: &mut ProgressMap, id: u64) {
        let Some(pr) = trk.get(&id).cloned() else {
            self.init_progress(cfg, trk, id, true);
            return;
        };
        if pr.is_learner {
            return;
        }
        // drop the voter from the incoming half but keep its progress
        remove(cfg, trk, id);
        let pr = trk.entry(id).or_insert(pr);
        // a voter still in the outgoing half can only become a learner once
        // the joint config is left
        if cfg.voters.outgoing.contains(id) {
            cfg.learners_next.insert(id);
        } else {
            pr.is_learner = true;
            cfg.learners.insert(id);
        }
    }

    fn init_progress(&self, cfg: &mut TrackerConfig, trk: &mut ProgressMap, id: u64, is_learner: bool) {
        if is_learner {
            cfg.learners.insert(id);
        } else {
            cfg.voters.incoming.insert(id);
        }
        let mut pr = Progress::new(
            self.last_index.max(1),
            self.tracker.max_inflight,
            self.tracker.max_inflight_bytes,
        );
        pr.is_learner = is_learner;
        // a fresh peer counts as active so check-quorum does not fire
        // before it had a chance to respond
        pr.recent_active = true;
        trk.insert(id, pr);
    }

    fn check_and_copy(&self) -> Result<(TrackerConfig, ProgressMap)> {
        check_and_return(self.tracker.config.clone(), self.tracker.progress.clone())
    }
}

fn remove(cfg: &mut TrackerConfig, trk: &mut ProgressMap, id: u64) {
    if !trk.contains_key(&id) {
        return;
    }
    cfg.voters.incoming.remove(id);
    cfg.learners.remove(&id);
    cfg.learners_next.remove(&id);
    // still a voter in the outgoing half: keep tracking it
    if !cfg.voters.outgoing.contains(id) {
        trk.remove(&id);
    }
}

fn check_and_return(
    cfg: TrackerConfig,
    trk: ProgressMap,
) -> Result<(TrackerConfig, ProgressMap)> {
    check_invariants(&cfg, &trk)?;
    Ok((cfg, trk))
}

/// Structural invariants of a config and its progress map. The empty config
/// is allowed so that an initial config can be built from nothing.
pub(crate) fn check_invariants(cfg: &TrackerConfig, trk: &ProgressMap) -> Result<()> {
    let voters: BTreeSet<u64> = cfg.voters.ids();
    for id in voters
        .iter()
        .chain(cfg.learners.iter())
        .chain(cfg.learners_next.iter())
    {
        if !trk.contains_key(id) {
            return Err(err(format!("no progress for {}", id)));
        }
    }

    for id in &cfg.learners_next {
        if !cfg.voters.outgoing.contains(*id) {
            return Err(err(format!("{} is in LearnersNext, but not Voters[1]", id)));
        }
        if trk[id].is_learner {
            return Err(err(format!(
                "{} is in LearnersNext, but is already marked as learner",
                id
            )));
        }
    }

    for id in &cfg.learners {
        if cfg.voters.outgoing.contains(*id) {
            return Err(err(format!("{} is in Learners and Voters[1]", id)));
        }
        if cfg.voters.incoming.contains(*id) {
            return Err(err(format!("{} is in Learners and Voters[0]", id)));
        }
        if !trk[id].is_learner {
            return Err(err(format!(
                "{} is in Learners, but is not marked as learner",
                id
            )));
        }
    }

    if !cfg.voters.is_joint() {
        if !cfg.learners_next.is_empty() {
            return Err(err("cfg.LearnersNext must be empty when not joint"));
        }
        if cfg.auto_leave {
            return Err(err("AutoLeave must be false when not joint"));
        }
    }
    Ok(())
}
