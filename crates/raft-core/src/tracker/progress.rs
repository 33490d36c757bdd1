//! # progress
//!
//! why: track how far each follower has replicated and how the leader should talk to it
//! relations: owned by tracker/mod.rs, mutated by node.rs on every append response
//! what: ProgressState, Progress

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Inflights;

/// How the leader currently replicates to a follower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressState {
    /// One append at a time until the follower's match index is known.
    #[default]
    Probe,
    /// Optimistic pipelining up to the inflight window.
    Replicate,
    /// Waiting for a snapshot to be applied; nothing else is sent.
    Snapshot,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressState::Probe => "StateProbe",
            ProgressState::Replicate => "StateReplicate",
            ProgressState::Snapshot => "StateSnapshot",
        };
        f.write_str(s)
    }
}

/// The leader's view of one follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Highest index known to be replicated on the follower.
    pub match_index: u64,
    /// Next index to send.
    pub next_index: u64,
    /// Highest commit index sent to the follower. Lets the leader skip
    /// empty appends that would only repeat a commit the follower has.
    pub sent_commit: u64,
    pub state: ProgressState,
    /// Index of the snapshot in flight while in `Snapshot` state.
    pub pending_snapshot: u64,
    /// Set on any message from the follower, cleared by check-quorum.
    pub recent_active: bool,
    /// Probe: an append is outstanding. Replicate: the window is full.
    pub msg_app_flow_paused: bool,
    pub inflights: Inflights,
    pub is_learner: bool,
}

impl Progress {
    pub fn new(next_index: u64, max_inflight: usize, max_inflight_bytes: u64) -> Self {
        Self {
            match_index: 0,
            next_index,
            sent_commit: 0,
            state: ProgressState::Probe,
            pending_snapshot: 0,
            recent_active: false,
            msg_app_flow_paused: false,
            inflights: Inflights::new(max_inflight, max_inflight_bytes),
            is_learner: false,
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.msg_app_flow_paused = false;
        self.pending_snapshot = 0;
        self.state = state;
        self.inflights.reset();
    }

    pub fn become_probe(&mut self) {
        // after a snapshot the follower is known to be at least at the
        // snapshot index, so probing resumes right after it
        if self.state == ProgressState::Snapshot {
            let pending = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next_index = (self.match_index + 1).max(pending + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next_index = self.match_index + 1;
        }
        self.sent_commit = self.sent_commit.min(self.next_index - 1);
    }

    pub fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next_index = self.match_index + 1;
    }

    pub fn become_snapshot(&mut self, snapshot_index: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_index;
        self.next_index = snapshot_index + 1;
        self.sent_commit = snapshot_index;
    }

    /// Bookkeeping after an append carrying `entries` entries and `bytes`
    /// payload bytes went out.
    pub fn sent_entries(&mut self, entries: u64, bytes: u64) {
        match self.state {
            ProgressState::Replicate => {
                if entries > 0 {
                    self.next_index += entries;
                    self.inflights.add(self.next_index - 1, bytes);
                }
                self.msg_app_flow_paused = self.inflights.full();
            }
            ProgressState::Probe => {
                if entries > 0 {
                    self.msg_app_flow_paused = true;
                }
            }
            ProgressState::Snapshot => {
                crate::fatal!("sending append in unhandled state {}", self.state)
            }
        }
    }

    /// Whether an empty append just to carry `index` as commit is worthwhile.
    pub fn can_bump_commit(&self, index: u64) -> bool {
        index > self.sent_commit && self.sent_commit < self.next_index - 1
    }

    pub fn set_sent_commit(&mut self, commit: u64) {
        self.sent_commit = commit;
    }

    /// Applies a successful append response. Returns false for stale acks.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        if n <= self.match_index {
            return false;
        }
        self.match_index = n;
        self.next_index = self.next_index.max(n + 1);
        self.msg_app_flow_paused = false;
        true
    }

    /// Applies a rejected append of index `rejected`. `match_hint` is the
    /// follower's guess at the highest index both logs may share. Returns
    /// false when the rejection is stale.
    pub fn maybe_decr_to(&mut self, rejected: u64, match_hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            if rejected <= self.match_index {
                return false;
            }
            self.next_index = self.match_index + 1;
            self.sent_commit = self.sent_commit.min(self.next_index - 1);
            return true;
        }

        // in probe the rejection must answer the outstanding probe
        if self.next_index - 1 != rejected {
            return false;
        }
        self.next_index = rejected
            .min(match_hint + 1)
            .max(self.match_index + 1);
        self.sent_commit = self.sent_commit.min(self.next_index - 1);
        self.msg_app_flow_paused = false;
        true
    }

    /// True when no append should be sent right now.
    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe | ProgressState::Replicate => self.msg_app_flow_paused,
            ProgressState::Snapshot => true,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} match={} next={}", self.state, self.match_index, self.next_index)?;
        if self.is_learner {
            write!(f, " learner")?;
        }
        if self.is_paused() {
            write!(f, " paused")?;
        }
        if self.pending_snapshot > 0 {
            write!(f, " pendingSnap={}", self.pending_snapshot)?;
        }
        if !self.recent_active {
            write!(f, " inactive")?;
        }
        let n = self.inflights.count();
        if n > 0 {
            write!(f, " inflight={}", n)?;
            if self.inflights.full() {
                write!(f, "[full]")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(state: ProgressState, m: u64, n: u64) -> Progress {
        let mut p = Progress::new(n, 256, 0);
        p.state = state;
        p.match_index = m;
        p
    }

    #[test]
    fn become_probe_after_snapshot_resumes_past_it() {
        let mut p = progress(ProgressState::Snapshot, 1, 5);
        p.pending_snapshot = 10;
        p.become_probe();
        assert_eq!(p.state, ProgressState::Probe);
        assert_eq!(p.next_index, 11);

        let mut p = progress(ProgressState::Snapshot, 12, 13);
        p.pending_snapshot = 10;
        p.become_probe();
        assert_eq!(p.next_index, 13);

        let mut p = progress(ProgressState::Replicate, 1, 5);
        p.become_probe();
        assert_eq!(p.next_index, 2);
    }

    #[test]
    fn become_replicate_and_snapshot() {
        let mut p = progress(ProgressState::Probe, 1, 5);
        p.become_replicate();
        assert_eq!((p.state, p.match_index, p.next_index), (ProgressState::Replicate, 1, 2));

        p.become_snapshot(10);
        assert_eq!((p.state, p.pending_snapshot, p.next_index), (ProgressState::Snapshot, 10, 11));
        assert!(p.is_paused());
    }

    #[test]
    fn maybe_update_only_moves_forward() {
        let mut p = progress(ProgressState::Probe, 3, 5);
        p.msg_app_flow_paused = true;
        assert!(!p.maybe_update(2));
        assert!(p.msg_app_flow_paused);
        assert!(p.maybe_update(4));
        assert_eq!((p.match_index, p.next_index), (4, 5));
        assert!(!p.msg_app_flow_paused);
        assert!(p.maybe_update(6));
        assert_eq!((p.match_index, p.next_index), (6, 7));
    }

    #[test]
    fn maybe_decr_to_in_replicate() {
        let mut p = progress(ProgressState::Replicate, 5, 10);
        assert!(!p.maybe_decr_to(5, 5), "stale rejection");
        assert!(p.maybe_decr_to(9, 9));
        assert_eq!(p.next_index, 6);
    }

    #[test]
    fn maybe_decr_to_in_probe() {
        let mut p = progress(ProgressState::Probe, 0, 10);
        assert!(!p.maybe_decr_to(5, 5), "does not answer the outstanding probe");
        assert!(p.maybe_decr_to(9, 9));
        assert_eq!(p.next_index, 9);

        let mut p = progress(ProgressState::Probe, 0, 10);
        assert!(p.maybe_decr_to(9, 2));
        assert_eq!(p.next_index, 3);

        let mut p = progress(ProgressState::Probe, 4, 10);
        assert!(p.maybe_decr_to(9, 0));
        assert_eq!(p.next_index, 5, "never below match + 1");
    }

    #[test]
    fn probe_pauses_after_sending_entries() {
        let mut p = progress(ProgressState::Probe, 0, 1);
        assert!(!p.is_paused());
        p.sent_entries(1, 10);
        assert!(p.is_paused());
        assert_eq!(p.next_index, 1, "probe does not advance next");
    }

    #[test]
    fn replicate_pauses_on_full_window() {
        let mut p = Progress::new(1, 2, 0);
        p.become_replicate();
        p.sent_entries(1, 1);
        assert!(!p.is_paused());
        p.sent_entries(2, 1);
        assert!(p.is_paused());
        assert_eq!(p.next_index, 4);
        p.inflights.free_le(1);
        p.maybe_update(1);
        assert!(!p.is_paused());
    }

    #[test]
    fn can_bump_commit_tracks_sent_commit() {
        let mut p = progress(ProgressState::Replicate, 5, 8);
        p.set_sent_commit(5);
        assert!(p.can_bump_commit(6));
        assert!(!p.can_bump_commit(5));
        p.set_sent_commit(7);
        assert!(!p.can_bump_commit(8));
    }
}
