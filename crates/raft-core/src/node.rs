//! # node
//!
//! why: define the raft node state machine and every role transition it can make
//! relations: drives log.rs, tracker/, confchange/ and read_only.rs; wrapped by raw_node.rs
//! what: NodeState, SoftState, RaftNode, election/heartbeat timers, message handling

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::confchange::{self, Changer, ConfChangeV2};
use crate::entry::{ConfState, EntryType, HardState, LogEntry, Snapshot};
use crate::error::{RaftError, Result, StorageError};
use crate::log::RaftLog;
use crate::message::{MessageType, RaftMessage};
use crate::quorum::VoteResult;
use crate::read_only::{ReadOnly, ReadOnlyOption, ReadState};
use crate::storage::Storage;
use crate::tracker::{Progress, ProgressMap, ProgressState, ProgressTracker, TrackerConfig};
use crate::util::{entries_size, payloads_size};
use crate::INVALID_ID;

/// Vote requests carrying this context come from a leader transfer and
/// bypass the leader lease.
pub const CAMPAIGN_TRANSFER: &[u8] = b"CampaignTransfer";

/// The role a Raft node currently plays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - accepts the leader's log, votes when asked
    #[default]
    Follower,
    /// Probing whether an election could be won, without bumping the term
    PreCandidate,
    /// Requesting votes for a new term
    Candidate,
    /// Replicates the log and sends heartbeats
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Follower => "StateFollower",
            NodeState::PreCandidate => "StatePreCandidate",
            NodeState::Candidate => "StateCandidate",
            NodeState::Leader => "StateLeader",
        };
        f.write_str(s)
    }
}

/// Volatile state that is useful for logging and status, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftState {
    pub leader_id: u64,
    pub raft_state: NodeState,
}

impl fmt::Display for SoftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lead:{} State:{}", self.leader_id, self.raft_state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CampaignType {
    PreElection,
    Election,
    Transfer,
}

/// A single Raft node.
///
/// Purely deterministic apart from the seeded election jitter: it never does
/// i/o, never reads a clock and only talks to the outside world through
/// `msgs` and `msgs_after_append`.
pub struct RaftNode<S: Storage> {
    pub id: u64,
    pub term: u64,
    /// Candidate voted for in `term`, or `INVALID_ID`.
    pub vote: u64,
    pub read_states: Vec<ReadState>,
    pub raft_log: RaftLog<S>,
    pub trk: ProgressTracker,
    pub state: NodeState,
    pub is_learner: bool,
    /// Outgoing messages that may be sent right away.
    pub msgs: Vec<RaftMessage>,
    /// Outgoing messages that may only be sent once the unstable state they
    /// depend on is durable: append acks and vote responses.
    pub msgs_after_append: Vec<RaftMessage>,
    pub leader_id: u64,
    /// Target of an ongoing leadership transfer, or `INVALID_ID`.
    pub lead_transferee: u64,
    /// Index of the latest conf change this leader appended. A new one may
    /// only be proposed once the applied index has reached it.
    pub pending_conf_index: u64,
    /// Payload bytes of the leader's uncommitted tail; an estimate that may
    /// under-count but never over-counts.
    pub uncommitted_size: u64,
    read_only: ReadOnly,
    pending_read_index_messages: Vec<RaftMessage>,

    election_elapsed: usize,
    heartbeat_elapsed: usize,
    heartbeat_timeout: usize,
    election_timeout: usize,
    randomized_election_timeout: usize,
    rng: StdRng,

    check_quorum: bool,
    pre_vote: bool,
    max_msg_size: u64,
    max_uncommitted_size: u64,
    disable_proposal_forwarding: bool,
    step_down_on_removal: bool,
}

impl<S: Storage> RaftNode<S> {
    /// Builds a node from `config` on top of `store`, restoring term, vote,
    /// commit index and membership from it. The node starts as a follower.
    pub fn new(config: &RaftConfig, store: S) -> Result<Self> {
        config.validate()?;
        let raft_state = store.initial_state()?;
        let raft_log = RaftLog::new(store, config.committed_size_per_ready())?;

        let mut r = Self {
            id: config.id,
            term: 0,
            vote: INVALID_ID,
            read_states: Vec::new(),
            raft_log,
            trk: ProgressTracker::new(config.max_inflight_msgs, config.max_inflight_bytes),
            state: NodeState::Follower,
            is_learner: false,
            msgs: Vec::new(),
            msgs_after_append: Vec::new(),
            leader_id: INVALID_ID,
            lead_transferee: INVALID_ID,
            pending_conf_index: 0,
            uncommitted_size: 0,
            read_only: ReadOnly::new(config.read_only_option),
            pending_read_index_messages: Vec::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            heartbeat_timeout: config.heartbeat_tick,
            election_timeout: config.election_tick,
            randomized_election_timeout: config.election_tick,
            rng: StdRng::seed_from_u64(config.id),
            check_quorum: config.check_quorum,
            pre_vote: config.pre_vote,
            max_msg_size: config.max_size_per_msg,
            max_uncommitted_size: config.uncommitted_size_limit(),
            disable_proposal_forwarding: config.disable_proposal_forwarding,
            step_down_on_removal: config.step_down_on_removal,
        };

        let (cfg, trk) =
            confchange::restore(&r.trk, r.raft_log.last_index(), &raft_state.conf_state)?;
        let cs = r.switch_to_config(cfg, trk);
        if let Err(e) = raft_state.conf_state.equivalent(&cs) {
            crate::fatal!("restored conf state diverges from storage: {}", e);
        }

        if !raft_state.hard_state.is_empty() {
            r.load_state(raft_state.hard_state);
        }
        if config.applied > 0 {
            r.raft_log.applied_to(config.applied, 0);
        }
        r.become_follower(r.term, INVALID_ID);

        info!(
            id = r.id,
            peers = ?r.trk.voter_nodes(),
            term = r.term,
            commit = r.raft_log.committed,
            applied = r.raft_log.applied,
            last_index = r.raft_log.last_index(),
            last_term = r.raft_log.last_term(),
            "new raft node"
        );
        Ok(r)
    }

    pub fn has_leader(&self) -> bool {
        self.leader_id != INVALID_ID
    }

    pub fn soft_state(&self) -> SoftState {
        SoftState {
            leader_id: self.leader_id,
            raft_state: self.state,
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
        }
    }

    pub fn election_elapsed(&self) -> usize {
        self.election_elapsed
    }

    pub fn randomized_election_timeout(&self) -> usize {
        self.randomized_election_timeout
    }

    pub fn read_only(&self) -> &ReadOnly {
        &self.read_only
    }

    pub fn pending_read_index_count(&self) -> usize {
        self.pending_read_index_messages.len()
    }

    /// Queues `m` for sending, stamping sender and term.
    fn send(&mut self, mut m: RaftMessage) {
        if m.from == INVALID_ID {
            m.from = self.id;
        }
        match m.msg_type {
            MessageType::Vote
            | MessageType::VoteResp
            | MessageType::PreVote
            | MessageType::PreVoteResp => {
                // campaign messages carry the term they are about, which is
                // not necessarily ours
                if m.term == 0 {
                    crate::fatal!("term should be set when sending {:?}", m.msg_type);
                }
            }
            _ => {
                if m.term != 0 {
                    crate::fatal!(
                        "term should not be set when sending {:?} (was {})",
                        m.msg_type,
                        m.term
                    );
                }
                // proposals and read requests are forwarded as if local
                if !matches!(m.msg_type, MessageType::Prop | MessageType::ReadIndex) {
                    m.term = self.term;
                }
            }
        }
        if matches!(
            m.msg_type,
            MessageType::AppResp | MessageType::VoteResp | MessageType::PreVoteResp
        ) {
            self.msgs_after_append.push(m);
        } else {
            if m.to == self.id {
                crate::fatal!("message should not be self-addressed when sending {:?}", m.msg_type);
            }
            self.msgs.push(m);
        }
    }

    pub(crate) fn send_append(&mut self, to: u64) {
        self.maybe_send_append(to, true);
    }

    /// Sends an append (or a snapshot when the needed entries are compacted)
    /// to `to`. Empty appends only go out with `send_if_empty`. Returns
    /// whether a message was sent.
    fn maybe_send_append(&mut self, to: u64, send_if_empty: bool) -> bool {
        let Some(pr) = self.trk.progress.get(&to) else {
            return false;
        };
        if pr.is_paused() {
            return false;
        }
        let next = pr.next_index;
        let prev_index = next - 1;
        // a throttled replicate stream still sends empty appends so that a
        // window of lost messages cannot stall it forever
        let throttled = pr.state == ProgressState::Replicate && pr.inflights.full();

        let Ok(prev_term) = self.raft_log.term(prev_index) else {
            return self.maybe_send_snapshot(to);
        };
        let ents = if throttled {
            Ok(Vec::new())
        } else {
            self.raft_log.entries(next, self.max_msg_size)
        };
        let ents = match ents {
            Ok(ents) if ents.is_empty() && !send_if_empty => return false,
            Ok(ents) => ents,
            Err(_) if !send_if_empty => return false,
            Err(_) => return self.maybe_send_snapshot(to),
        };

        let (count, bytes) = (ents.len() as u64, payloads_size(&ents));
        let committed = self.raft_log.committed;
        let mut m = RaftMessage::new(MessageType::App, self.id, to);
        m.index = prev_index;
        m.log_term = prev_term;
        m.entries = ents;
        m.commit = committed;
        self.send(m);

        if let Some(pr) = self.trk.progress.get_mut(&to) {
            pr.sent_entries(count, bytes);
            pr.set_sent_commit(committed);
        }
        true
    }

    fn maybe_send_snapshot(&mut self, to: u64) -> bool {
        if !self.trk.progress.get(&to).is_some_and(|pr| pr.recent_active) {
            debug!(id = self.id, to, "ignore sending snapshot since peer is not recently active");
            return false;
        }
        let snapshot = match self.raft_log.snapshot() {
            Ok(s) => s,
            Err(StorageError::SnapshotTemporarilyUnavailable) => {
                debug!(id = self.id, to, "failed to send snapshot: temporarily unavailable");
                return false;
            }
            Err(e) => crate::fatal!("{} failed to load snapshot: {}", self.id, e),
        };
        if snapshot.is_empty() {
            crate::fatal!("need non-empty snapshot");
        }
        let (sindex, sterm) = (snapshot.metadata.index, snapshot.metadata.term);
        if let Some(pr) = self.trk.progress.get_mut(&to) {
            pr.become_snapshot(sindex);
            debug!(
                id = self.id,
                first_index = self.raft_log.first_index(),
                commit = self.raft_log.committed,
                snapshot_index = sindex,
                snapshot_term = sterm,
                to,
                progress = %pr,
                "sent snapshot"
            );
        }
        let mut m = RaftMessage::new(MessageType::Snap, self.id, to);
        m.snapshot = Some(snapshot);
        self.send(m);
        true
    }

    fn send_heartbeat(&mut self, to: u64, ctx: Vec<u8>) {
        let Some(pr) = self.trk.progress.get_mut(&to) else {
            return;
        };
        // never advertise a commit index beyond what the follower matches
        let commit = pr.match_index.min(self.raft_log.committed);
        pr.set_sent_commit(commit);
        let mut m = RaftMessage::new(MessageType::Heartbeat, self.id, to);
        m.commit = commit;
        m.context = ctx;
        self.send(m);
    }

    fn peers(&self) -> Vec<u64> {
        self.trk
            .progress
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect()
    }

    pub(crate) fn bcast_append(&mut self) {
        for id in self.peers() {
            self.send_append(id);
        }
    }

    fn bcast_heartbeat(&mut self) {
        let ctx = self.read_only.last_pending_request_ctx().unwrap_or_default();
        self.bcast_heartbeat_with_ctx(ctx);
    }

    fn bcast_heartbeat_with_ctx(&mut self, ctx: Vec<u8>) {
        for id in self.peers() {
            self.send_heartbeat(id, ctx.clone());
        }
    }

    /// Advances the applied index to `index`; `size` is the encoded size of
    /// the entries that finished applying. A leader in an auto-leave joint
    /// config proposes leaving it once the config change is applied.
    pub fn applied_to(&mut self, index: u64, size: u64) {
        let new_applied = index.max(self.raft_log.applied);
        self.raft_log.applied_to(new_applied, size);

        if self.trk.config.auto_leave
            && new_applied >= self.pending_conf_index
            && self.state == NodeState::Leader
        {
            // empty data decodes to the leave-joint change and is never
            // refused for its size
            let mut m = RaftMessage::new(MessageType::Prop, self.id, INVALID_ID);
            m.entries = vec![LogEntry {
                entry_type: EntryType::ConfChangeJoint,
                ..Default::default()
            }];
            match self.step(m) {
                Ok(()) => info!(
                    id = self.id,
                    config = %self.trk.config,
                    "initiating automatic transition out of joint configuration"
                ),
                // retried on the next applied index
                Err(e) => debug!(
                    id = self.id,
                    config = %self.trk.config,
                    error = %e,
                    "not initiating automatic transition out of joint configuration"
                ),
            }
        }
    }

    fn applied_snap(&mut self, snap: &Snapshot) {
        let index = snap.metadata.index;
        self.raft_log.stable_snap_to(index);
        self.applied_to(index, 0);
    }

    /// Advances the commit index to what a quorum holds, if that entry is
    /// from the current term. Leader only.
    fn maybe_commit(&mut self) -> bool {
        let index = self.trk.committed();
        self.raft_log.maybe_commit(index, self.term)
    }

    fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = INVALID_ID;
        }
        self.leader_id = INVALID_ID;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.abort_leader_transfer();
        self.trk.reset_votes();

        let self_id = self.id;
        let last_index = self.raft_log.last_index();
        let (max_inflight, max_bytes) = (self.trk.max_inflight, self.trk.max_inflight_bytes);
        self.trk.visit(|id, pr| {
            let is_learner = pr.is_learner;
            *pr = Progress::new(last_index + 1, max_inflight, max_bytes);
            pr.is_learner = is_learner;
            if id == self_id {
                pr.match_index = last_index;
            }
        });

        self.pending_conf_index = 0;
        self.uncommitted_size = 0;
        self.read_only = ReadOnly::new(self.read_only.option);
        self.pending_read_index_messages.clear();
    }

    /// Stamps `es` with the current term and the next indexes and appends
    /// them. Returns false if they would exceed the uncommitted quota.
    fn append_entry(&mut self, mut es: Vec<LogEntry>) -> bool {
        let li = self.raft_log.last_index();
        for (i, e) in es.iter_mut().enumerate() {
            e.term = self.term;
            e.index = li + 1 + i as u64;
        }
        if !self.increase_uncommitted_size(&es) {
            warn!(
                id = self.id,
                "appending new entries to log would exceed uncommitted entry size limit; dropping proposal"
            );
            return false;
        }
        let li = self.raft_log.append(&es);
        // the leader acks its own entries once they are durable
        let mut m = RaftMessage::new(MessageType::AppResp, self.id, self.id);
        m.index = li;
        self.send(m);
        true
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        match self.state {
            NodeState::Leader => self.tick_heartbeat(),
            _ => self.tick_election(),
        }
    }

    /// Ages the election timer only. Lets a quiet group keep its follower
    /// clocks roughly in step without risking an election.
    pub fn tick_quiesced(&mut self) {
        self.election_elapsed += 1;
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if self.promotable() && self.past_election_timeout() {
            self.election_elapsed = 0;
            let m = RaftMessage::new(MessageType::Hup, self.id, INVALID_ID);
            if let Err(e) = self.step(m) {
                debug!(id = self.id, error = %e, "error occurred during election");
            }
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                let m = RaftMessage::new(MessageType::CheckQuorum, self.id, INVALID_ID);
                if let Err(e) = self.step(m) {
                    debug!(id = self.id, error = %e, "error occurred during checking quorum");
                }
            }
            // a transfer that did not finish within an election timeout is abandoned
            if self.state == NodeState::Leader && self.lead_transferee != INVALID_ID {
                self.abort_leader_transfer();
            }
        }

        if self.state != NodeState::Leader {
            return;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            let m = RaftMessage::new(MessageType::Beat, self.id, INVALID_ID);
            if let Err(e) = self.step(m) {
                debug!(id = self.id, error = %e, "error occurred during heartbeat");
            }
        }
    }

    pub fn become_follower(&mut self, term: u64, leader_id: u64) {
        self.reset(term);
        self.leader_id = leader_id;
        self.state = NodeState::Follower;
        info!(id = self.id, term = self.term, "became follower");
    }

    pub fn become_candidate(&mut self) {
        if self.state == NodeState::Leader {
            crate::fatal!("invalid transition [leader -> candidate]");
        }
        self.reset(self.term + 1);
        self.vote = self.id;
        self.state = NodeState::Candidate;
        info!(id = self.id, term = self.term, "became candidate");
    }

    /// Enters the pre-vote round. Term and vote are left alone.
    pub fn become_pre_candidate(&mut self) {
        if self.state == NodeState::Leader {
            crate::fatal!("invalid transition [leader -> pre-candidate]");
        }
        self.trk.reset_votes();
        self.leader_id = INVALID_ID;
        self.state = NodeState::PreCandidate;
        info!(id = self.id, term = self.term, "became pre-candidate");
    }

    pub fn become_leader(&mut self) {
        if self.state == NodeState::Follower {
            crate::fatal!("invalid transition [follower -> leader]");
        }
        self.reset(self.term);
        self.leader_id = self.id;
        self.state = NodeState::Leader;

        // reset() already put our own match at the last index
        if let Some(pr) = self.trk.progress.get_mut(&self.id) {
            pr.become_replicate();
            pr.recent_active = true;
        }

        // any entry in the tail may be a conf change; hold new ones back
        // until everything up to here is applied
        self.pending_conf_index = self.raft_log.last_index();

        // an empty entry has no payload, so this never counts against the quota
        if !self.append_entry(vec![LogEntry::default()]) {
            crate::fatal!("empty entry was dropped");
        }
        info!(id = self.id, term = self.term, "became leader");
    }

    fn hup(&mut self, t: CampaignType) {
        if self.state == NodeState::Leader {
            debug!(id = self.id, "ignoring Hup because already leader");
            return;
        }
        if !self.promotable() {
            warn!(id = self.id, "is unpromotable and can not campaign");
            return;
        }
        if self.has_unapplied_conf_changes() {
            warn!(
                id = self.id,
                term = self.term,
                "cannot campaign since there are still pending configuration changes to apply"
            );
            return;
        }
        info!(id = self.id, term = self.term, "starting a new election");
        self.campaign(t);
    }

    fn has_unapplied_conf_changes(&self) -> bool {
        let log = &self.raft_log;
        if log.applied >= log.committed {
            return false;
        }
        let (lo, hi) = (log.applied + 1, log.committed + 1);
        let mut found = false;
        let scanned = log.scan(lo, hi, log.max_applying_ents_size(), |ents| {
            found = ents.iter().any(LogEntry::is_conf_change);
            !found
        });
        if let Err(e) = scanned {
            crate::fatal!("error scanning unapplied entries [{}, {}): {}", lo, hi, e);
        }
        found
    }

    fn campaign(&mut self, t: CampaignType) {
        let (vote_msg, term) = if t == CampaignType::PreElection {
            self.become_pre_candidate();
            // pre-votes ask about the term we would move to
            (MessageType::PreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::Vote, self.term)
        };

        let (last_index, last_term) = (self.raft_log.last_index(), self.raft_log.last_term());
        for id in self.trk.voter_nodes() {
            if id == self.id {
                // our own vote counts once it is durable
                let mut m = RaftMessage::new(vote_msg.vote_response(), self.id, id);
                m.term = term;
                self.send(m);
                continue;
            }
            info!(
                id = self.id,
                last_term,
                last_index,
                to = id,
                term = self.term,
                "sent {:?} request",
                vote_msg
            );
            let mut m = RaftMessage::new(vote_msg, self.id, id);
            m.term = term;
            m.index = last_index;
            m.log_term = last_term;
            if t == CampaignType::Transfer {
                m.context = CAMPAIGN_TRANSFER.to_vec();
            }
            self.send(m);
        }
    }

    fn poll(&mut self, id: u64, t: MessageType, granted: bool) -> (usize, usize, VoteResult) {
        if granted {
            info!(id = self.id, from = id, term = self.term, "received {:?}", t);
        } else {
            info!(id = self.id, from = id, term = self.term, "received {:?} rejection", t);
        }
        self.trk.record_vote(id, granted);
        self.trk.tally_votes()
    }

    /// Processes one message. This is the single entry point for everything
    /// that can happen to the node: timers, proposals, peer messages and
    /// storage acknowledgements.
    pub fn step(&mut self, m: RaftMessage) -> Result<()> {
        // term 0 marks a local message
        if m.term > self.term {
            if matches!(m.msg_type, MessageType::Vote | MessageType::PreVote) {
                let force = m.context == CAMPAIGN_TRANSFER;
                let in_lease = self.check_quorum
                    && self.leader_id != INVALID_ID
                    && self.election_elapsed < self.election_timeout;
                if !force && in_lease {
                    // we heard from a live leader recently: do not let a
                    // partitioned node disrupt it
                    info!(
                        id = self.id,
                        last_term = self.raft_log.last_term(),
                        last_index = self.raft_log.last_index(),
                        vote = self.vote,
                        from = m.from,
                        term = self.term,
                        remaining_ticks = self.election_timeout - self.election_elapsed,
                        "ignored {:?}: lease is not expired",
                        m.msg_type
                    );
                    return Ok(());
                }
            }
            match m.msg_type {
                // never change our term in response to a pre-vote
                MessageType::PreVote => {}
                // a granted pre-vote carries the future term we asked about
                MessageType::PreVoteResp if !m.reject => {}
                _ => {
                    info!(
                        id = self.id,
                        term = self.term,
                        from = m.from,
                        msg_term = m.term,
                        "received a {:?} message with higher term",
                        m.msg_type
                    );
                    if matches!(
                        m.msg_type,
                        MessageType::App | MessageType::Heartbeat | MessageType::Snap
                    ) {
                        self.become_follower(m.term, m.from);
                    } else {
                        self.become_follower(m.term, INVALID_ID);
                    }
                }
            }
        } else if m.term != 0 && m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && matches!(m.msg_type, MessageType::Heartbeat | MessageType::App)
            {
                // a stale leader gets a response at our term so it steps down;
                // otherwise a node whose term ran ahead in a partition would
                // never be able to rejoin
                let resp = RaftMessage::new(MessageType::AppResp, self.id, m.from);
                self.send(resp);
            } else if m.msg_type == MessageType::PreVote {
                info!(
                    id = self.id,
                    last_term = self.raft_log.last_term(),
                    last_index = self.raft_log.last_index(),
                    vote = self.vote,
                    from = m.from,
                    term = self.term,
                    "rejected PreVote with lower term"
                );
                let mut resp = RaftMessage::new(MessageType::PreVoteResp, self.id, m.from);
                resp.term = self.term;
                resp.reject = true;
                self.send(resp);
            } else if m.msg_type == MessageType::StorageAppendResp {
                if m.index != 0 {
                    // the entries may have been overwritten in a later term
                    info!(
                        id = self.id,
                        term = self.term,
                        msg_term = m.term,
                        "ignored entry appends from a StorageAppendResp with lower term"
                    );
                }
                // snapshots carry committed state and stay valid across terms
                if let Some(snap) = &m.snapshot {
                    self.applied_snap(snap);
                }
            } else {
                info!(
                    id = self.id,
                    term = self.term,
                    from = m.from,
                    msg_term = m.term,
                    "ignored a {:?} message with lower term",
                    m.msg_type
                );
            }
            return Ok(());
        }

        match m.msg_type {
            MessageType::Hup => {
                if self.pre_vote {
                    self.hup(CampaignType::PreElection);
                } else {
                    self.hup(CampaignType::Election);
                }
            }
            MessageType::StorageAppendResp => {
                if m.index != 0 {
                    self.raft_log.stable_to(m.index, m.log_term);
                }
                if let Some(snap) = &m.snapshot {
                    self.applied_snap(snap);
                }
            }
            MessageType::StorageApplyResp => {
                if let Some(last) = m.entries.last() {
                    self.applied_to(last.index, entries_size(&m.entries));
                    self.reduce_uncommitted_size(payloads_size(&m.entries));
                }
            }
            MessageType::Vote | MessageType::PreVote => self.handle_vote_request(m),
            _ => match self.state {
                NodeState::Leader => return self.step_leader(m),
                NodeState::Candidate | NodeState::PreCandidate => {
                    return self.step_candidate(m)
                }
                NodeState::Follower => return self.step_follower(m),
            },
        }
        Ok(())
    }

    fn handle_vote_request(&mut self, m: RaftMessage) {
        // a repeat of the vote we cast, or no vote and no known leader in
        // this term, or a pre-vote for a future term
        let can_vote = self.vote == m.from
            || (self.vote == INVALID_ID && self.leader_id == INVALID_ID)
            || (m.msg_type == MessageType::PreVote && m.term > self.term);
        let (last_index, last_term) = (self.raft_log.last_index(), self.raft_log.last_term());

        // learners must vote too: a promoted learner may not know yet that
        // it is a voter
        if can_vote && self.raft_log.is_up_to_date(m.index, m.log_term) {
            info!(
                id = self.id,
                last_term,
                last_index,
                vote = self.vote,
                from = m.from,
                cand_term = m.log_term,
                cand_index = m.index,
                term = self.term,
                "cast {:?}",
                m.msg_type
            );
            // answer with the term of the request so a pre-candidate does not
            // discard it as stale
            let mut resp = RaftMessage::new(m.msg_type.vote_response(), self.id, m.from);
            resp.term = m.term;
            self.send(resp);
            if m.msg_type == MessageType::Vote {
                self.election_elapsed = 0;
                self.vote = m.from;
            }
        } else {
            info!(
                id = self.id,
                last_term,
                last_index,
                vote = self.vote,
                from = m.from,
                cand_term = m.log_term,
                cand_index = m.index,
                term = self.term,
                "rejected {:?}",
                m.msg_type
            );
            let mut resp = RaftMessage::new(m.msg_type.vote_response(), self.id, m.from);
            resp.term = self.term;
            resp.reject = true;
            self.send(resp);
        }
    }

    fn step_leader(&mut self, mut m: RaftMessage) -> Result<()> {
        match m.msg_type {
            MessageType::Beat => {
                self.bcast_heartbeat();
                return Ok(());
            }
            MessageType::CheckQuorum => {
                if !self.trk.quorum_active() {
                    warn!(id = self.id, "stepped down to follower since quorum is not active");
                    self.become_follower(self.term, INVALID_ID);
                }
                let self_id = self.id;
                self.trk.visit(|id, pr| {
                    if id != self_id {
                        pr.recent_active = false;
                    }
                });
                return Ok(());
            }
            MessageType::Prop => {
                if m.entries.is_empty() {
                    crate::fatal!("{} stepped empty Prop", self.id);
                }
                if !self.trk.progress.contains_key(&self.id) {
                    // removed from the config while leading
                    return Err(RaftError::ProposalDropped);
                }
                if self.lead_transferee != INVALID_ID {
                    debug!(
                        id = self.id,
                        term = self.term,
                        transferee = self.lead_transferee,
                        "transfer leadership is in progress; dropping proposal"
                    );
                    return Err(RaftError::ProposalDropped);
                }
                let prev_pending = self.pending_conf_index;
                for (i, e) in m.entries.iter().enumerate() {
                    if !e.is_conf_change() {
                        continue;
                    }
                    let checked = ConfChangeV2::from_entry(e)
                        .and_then(|cc| self.check_conf_change_proposal(&cc));
                    if let Err(e) = checked {
                        self.pending_conf_index = prev_pending;
                        return Err(e);
                    }
                    self.pending_conf_index = self.raft_log.last_index() + i as u64 + 1;
                }
                if !self.append_entry(std::mem::take(&mut m.entries)) {
                    self.pending_conf_index = prev_pending;
                    return Err(RaftError::ProposalDropped);
                }
                self.bcast_append();
                return Ok(());
            }
            MessageType::ReadIndex => {
                if m.entries.is_empty() {
                    warn!(id = self.id, from = m.from, "dropping ReadIndex without context");
                    return Ok(());
                }
                // only one voter, the leader itself
                if self.trk.is_singleton() {
                    let committed = self.raft_log.committed;
                    if let Some(resp) = self.response_to_read_index_req(m, committed) {
                        self.send(resp);
                    }
                    return Ok(());
                }
                // the commit index is only known to be current once an
                // entry of this term has committed
                if !self.committed_entry_in_current_term() {
                    self.pending_read_index_messages.push(m);
                    return Ok(());
                }
                self.send_read_index_response(m);
                return Ok(());
            }
            _ => {}
        }

        if !self.trk.progress.contains_key(&m.from) {
            debug!(id = self.id, from = m.from, "no progress available");
            return Ok(());
        }
        match m.msg_type {
            MessageType::AppResp => self.handle_append_response(&m),
            MessageType::HeartbeatResp => self.handle_heartbeat_response(&m),
            MessageType::SnapStatus => {
                let Some(pr) = self.trk.progress.get_mut(&m.from) else {
                    return Ok(());
                };
                if pr.state != ProgressState::Snapshot {
                    return Ok(());
                }
                if m.reject {
                    // forget the snapshot first or probing would resume past it
                    pr.pending_snapshot = 0;
                    pr.become_probe();
                    debug!(id = self.id, to = m.from, progress = %pr, "snapshot failed, resumed sending replication messages");
                } else {
                    pr.become_probe();
                    debug!(id = self.id, to = m.from, progress = %pr, "snapshot succeeded, resumed sending replication messages");
                }
                // wait for an append response or a heartbeat before sending more
                pr.msg_app_flow_paused = true;
            }
            MessageType::Unreachable => {
                if let Some(pr) = self.trk.progress.get_mut(&m.from) {
                    // an optimistic append was probably lost
                    if pr.state == ProgressState::Replicate {
                        pr.become_probe();
                    }
                    debug!(id = self.id, to = m.from, progress = %pr, "failed to send message: peer unreachable");
                }
            }
            MessageType::TransferLeader => self.handle_transfer_leader(&m),
            _ => {}
        }
        Ok(())
    }

    /// Refuses a conf change while another one is unapplied, or when it does
    /// not fit the joint state of the current config.
    fn check_conf_change_proposal(&self, cc: &ConfChangeV2) -> Result<()> {
        let already_pending = self.pending_conf_index > self.raft_log.applied;
        let already_joint = self.trk.config.voters.is_joint();
        let wants_leave_joint = cc.changes.is_empty();

        let failed = if already_pending {
            Some(format!(
                "possible unapplied conf change at index {} (applied to {})",
                self.pending_conf_index, self.raft_log.applied
            ))
        } else if already_joint && !wants_leave_joint {
            Some("must transition out of joint config first".to_string())
        } else if !already_joint && wants_leave_joint {
            Some("not in joint state; refusing empty conf change".to_string())
        } else {
            None
        };
        match failed {
            Some(reason) => {
                info!(
                    id = self.id,
                    config = %self.trk.config,
                    reason = %reason,
                    "ignoring conf change"
                );
                Err(RaftError::ConfChangeRejected(reason))
            }
            None => Ok(()),
        }
    }

    fn handle_append_response(&mut self, m: &RaftMessage) {
        let first_index = self.raft_log.first_index();
        if m.reject {
            // the hint is the follower's guess at the last index both logs
            // share; with a term attached, skip every leader index whose
            // term is above it since none of those can match
            let mut next_probe_idx = m.reject_hint;
            if m.log_term > 0 {
                next_probe_idx = self
                    .raft_log
                    .find_conflict_by_term(m.reject_hint, m.log_term)
                    .0;
            }
            debug!(
                id = self.id,
                from = m.from,
                index = m.index,
                hint_index = m.reject_hint,
                hint_term = m.log_term,
                "received rejected AppResp"
            );
            let Some(pr) = self.trk.progress.get_mut(&m.from) else {
                return;
            };
            pr.recent_active = true;
            if pr.maybe_decr_to(m.index, next_probe_idx) {
                debug!(id = self.id, to = m.from, progress = %pr, "decreased progress");
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                self.send_append(m.from);
            }
            return;
        }

        let Some(pr) = self.trk.progress.get_mut(&m.from) else {
            return;
        };
        pr.recent_active = true;
        // a probe answered at the known match also moves to replicate
        let updated = pr.maybe_update(m.index)
            || (pr.match_index == m.index && pr.state == ProgressState::Probe);
        if !updated {
            return;
        }
        match pr.state {
            ProgressState::Probe => pr.become_replicate(),
            ProgressState::Snapshot if pr.match_index + 1 >= first_index => {
                // the follower can be served from the log again, whatever
                // snapshot it actually applied
                debug!(id = self.id, to = m.from, progress = %pr, "recovered from needing snapshot");
                pr.become_probe();
                pr.become_replicate();
            }
            ProgressState::Replicate => pr.inflights.free_le(m.index),
            ProgressState::Snapshot => {}
        }
        let pr_match = pr.match_index;

        if self.maybe_commit() {
            self.release_pending_read_index_messages();
            self.bcast_append();
        } else if m.from != self.id
            && self
                .trk
                .progress
                .get(&m.from)
                .is_some_and(|pr| pr.can_bump_commit(self.raft_log.committed))
        {
            self.send_append(m.from);
        }

        // flow control may now allow several appends at once
        if m.from != self.id {
            while self.maybe_send_append(m.from, false) {}
        }

        if m.from == self.lead_transferee && pr_match == self.raft_log.last_index() {
            info!(id = self.id, to = m.from, "sent TimeoutNow after receiving AppResp");
            self.send_timeout_now(m.from);
        }
    }

    fn handle_heartbeat_response(&mut self, m: &RaftMessage) {
        let last_index = self.raft_log.last_index();
        let Some(pr) = self.trk.progress.get_mut(&m.from) else {
            return;
        };
        pr.recent_active = true;
        pr.msg_app_flow_paused = false;
        // a behind or probing follower gets an append; for a full window
        // this is the empty append that unsticks it
        if pr.match_index < last_index || pr.state == ProgressState::Probe {
            self.send_append(m.from);
        }

        if self.read_only.option != ReadOnlyOption::Safe || m.context.is_empty() {
            return;
        }
        let Some(acks) = self.read_only.recv_ack(m.from, &m.context) else {
            return;
        };
        if self.trk.config.voters.vote_result(acks) != VoteResult::Won {
            return;
        }
        for rs in self.read_only.advance(&m.context) {
            if let Some(resp) = self.response_to_read_index_req(rs.req, rs.index) {
                self.send(resp);
            }
        }
    }

    fn handle_transfer_leader(&mut self, m: &RaftMessage) {
        let Some(pr) = self.trk.progress.get(&m.from) else {
            return;
        };
        if pr.is_learner {
            debug!(id = self.id, "ignored transferring leadership to a learner");
            return;
        }
        let transferee = m.from;
        let pr_match = pr.match_index;
        let last = self.lead_transferee;
        if last != INVALID_ID {
            if last == transferee {
                info!(
                    id = self.id,
                    term = self.term,
                    transferee,
                    "transfer leadership is in progress, ignores request to same node"
                );
                return;
            }
            self.abort_leader_transfer();
            info!(id = self.id, term = self.term, previous = last, "abort previous transferring leadership");
        }
        if transferee == self.id {
            debug!(id = self.id, "is already leader; ignored transferring leadership to self");
            return;
        }
        info!(id = self.id, term = self.term, transferee, "starts to transfer leadership");
        // the transfer has one election timeout to finish
        self.election_elapsed = 0;
        self.lead_transferee = transferee;
        if pr_match == self.raft_log.last_index() {
            self.send_timeout_now(transferee);
            info!(id = self.id, transferee, "sends TimeoutNow immediately as transferee has up-to-date log");
        } else {
            self.send_append(transferee);
        }
    }

    fn step_candidate(&mut self, m: RaftMessage) -> Result<()> {
        // stale pre-vote responses may still arrive after the real campaign began
        let my_vote_resp = if self.state == NodeState::PreCandidate {
            MessageType::PreVoteResp
        } else {
            MessageType::VoteResp
        };
        match m.msg_type {
            MessageType::Prop => {
                info!(id = self.id, term = self.term, "no leader; dropping proposal");
                return Err(RaftError::ProposalDropped);
            }
            // m.term == self.term for all three: a leader exists in our term
            MessageType::App => {
                self.become_follower(m.term, m.from);
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            t if t == my_vote_resp => {
                let (granted, rejected, res) = self.poll(m.from, t, !m.reject);
                info!(id = self.id, granted, rejected, "has received {:?} votes", t);
                match res {
                    VoteResult::Won => {
                        if self.state == NodeState::PreCandidate {
                            self.campaign(CampaignType::Election);
                        } else {
                            self.become_leader();
                            self.bcast_append();
                        }
                    }
                    // a rejected pre-vote may carry a future term; stay at ours
                    VoteResult::Lost => self.become_follower(self.term, INVALID_ID),
                    VoteResult::Pending => {}
                }
            }
            MessageType::TimeoutNow => {
                debug!(id = self.id, term = self.term, state = %self.state, from = m.from, "ignored TimeoutNow");
            }
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, mut m: RaftMessage) -> Result<()> {
        match m.msg_type {
            MessageType::Prop => {
                if self.leader_id == INVALID_ID {
                    info!(id = self.id, term = self.term, "no leader; dropping proposal");
                    return Err(RaftError::ProposalDropped);
                }
                if self.disable_proposal_forwarding {
                    info!(
                        id = self.id,
                        leader = self.leader_id,
                        term = self.term,
                        "not forwarding to leader; dropping proposal"
                    );
                    return Err(RaftError::ProposalDropped);
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::App => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_snapshot(m);
            }
            MessageType::TransferLeader => {
                if self.leader_id == INVALID_ID {
                    info!(id = self.id, term = self.term, "no leader; dropping leader transfer msg");
                    return Ok(());
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::TimeoutNow => {
                info!(
                    id = self.id,
                    term = self.term,
                    from = m.from,
                    "received TimeoutNow and starts an election to get leadership"
                );
                // transfers skip pre-vote: there is no partition to recover from
                self.hup(CampaignType::Transfer);
            }
            MessageType::ReadIndex => {
                if self.leader_id == INVALID_ID {
                    info!(id = self.id, term = self.term, "no leader; dropping index reading msg");
                    return Ok(());
                }
                m.to = self.leader_id;
                self.send(m);
            }
            MessageType::ReadIndexResp => {
                if m.entries.len() != 1 {
                    error!(
                        id = self.id,
                        from = m.from,
                        count = m.entries.len(),
                        "invalid format of ReadIndexResp"
                    );
                    return Ok(());
                }
                self.read_states.push(ReadState {
                    index: m.index,
                    request_ctx: std::mem::take(&mut m.entries[0].data),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_append_entries(&mut self, m: RaftMessage) {
        if m.index < self.raft_log.committed {
            let mut resp = RaftMessage::new(MessageType::AppResp, self.id, m.from);
            resp.index = self.raft_log.committed;
            self.send(resp);
            return;
        }
        if let Some(last) = self
            .raft_log
            .maybe_append(m.index, m.log_term, m.commit, &m.entries)
        {
            let mut resp = RaftMessage::new(MessageType::AppResp, self.id, m.from);
            resp.index = last;
            self.send(resp);
            return;
        }

        debug!(
            id = self.id,
            our_term = self.raft_log.zero_term_on_out_of_bounds(m.index),
            index = m.index,
            log_term = m.log_term,
            from = m.from,
            "rejected App"
        );
        // hint the largest (index, term) at or below the probe whose term is
        // not above the leader's, skipping our divergent uncommitted tail
        let hint_index = m.index.min(self.raft_log.last_index());
        let (hint_index, hint_term) = self.raft_log.find_conflict_by_term(hint_index, m.log_term);
        let mut resp = RaftMessage::new(MessageType::AppResp, self.id, m.from);
        resp.index = m.index;
        resp.reject = true;
        resp.reject_hint = hint_index;
        resp.log_term = hint_term;
        self.send(resp);
    }

    fn handle_heartbeat(&mut self, m: RaftMessage) {
        self.raft_log.commit_to(m.commit);
        let mut resp = RaftMessage::new(MessageType::HeartbeatResp, self.id, m.from);
        resp.context = m.context;
        self.send(resp);
    }

    fn handle_snapshot(&mut self, m: RaftMessage) {
        let s = m.snapshot.unwrap_or_default();
        let (sindex, sterm) = (s.metadata.index, s.metadata.term);
        let mut resp = RaftMessage::new(MessageType::AppResp, self.id, m.from);
        if self.restore(s) {
            info!(id = self.id, commit = self.raft_log.committed, sindex, sterm, "restored snapshot");
            resp.index = self.raft_log.last_index();
        } else {
            info!(id = self.id, commit = self.raft_log.committed, sindex, sterm, "ignored snapshot");
            resp.index = self.raft_log.committed;
        }
        self.send(resp);
    }

    /// Installs a snapshot: log and membership are replaced. Returns false
    /// if the snapshot was obsolete or could not be used.
    pub fn restore(&mut self, s: Snapshot) -> bool {
        if s.metadata.index <= self.raft_log.committed {
            return false;
        }
        if self.state != NodeState::Follower {
            warn!(id = self.id, "attempted to restore snapshot as leader; should never happen");
            self.become_follower(self.term + 1, INVALID_ID);
            return false;
        }

        // a peer in learners_next is always in voters_outgoing too
        let cs = &s.metadata.conf_state;
        let found = cs
            .voters
            .iter()
            .chain(&cs.learners)
            .chain(&cs.voters_outgoing)
            .any(|id| *id == self.id);
        if !found {
            warn!(
                id = self.id,
                conf_state = ?cs,
                "attempted to restore snapshot but it is not in the ConfState; should never happen"
            );
            return false;
        }

        let (sindex, sterm) = (s.metadata.index, s.metadata.term);
        if self.raft_log.match_term(sindex, sterm) {
            // we already hold the snapshot's last entry: just commit up to it
            info!(
                id = self.id,
                commit = self.raft_log.committed,
                last_index = self.raft_log.last_index(),
                last_term = self.raft_log.last_term(),
                sindex,
                sterm,
                "fast-forwarded commit to snapshot"
            );
            self.raft_log.commit_to(sindex);
            return false;
        }

        let cs = cs.clone();
        self.raft_log.restore(s);

        let fresh = ProgressTracker::new(self.trk.max_inflight, self.trk.max_inflight_bytes);
        let (cfg, trk) = match confchange::restore(&fresh, self.raft_log.last_index(), &cs) {
            Ok(res) => res,
            Err(e) => crate::fatal!("unable to restore config {:?}: {}", cs, e),
        };
        self.trk = fresh;
        let restored = self.switch_to_config(cfg, trk);
        if let Err(e) = cs.equivalent(&restored) {
            crate::fatal!("restored conf state diverges from snapshot: {}", e);
        }

        info!(
            id = self.id,
            commit = self.raft_log.committed,
            last_index = self.raft_log.last_index(),
            last_term = self.raft_log.last_term(),
            sindex,
            sterm,
            "restored snapshot"
        );
        true
    }

    /// Whether this node may become leader: it is a voter and is not in the
    /// middle of installing a snapshot.
    pub fn promotable(&self) -> bool {
        self.trk.progress.get(&self.id).is_some_and(|pr| !pr.is_learner)
            && !self.raft_log.has_next_or_in_progress_snapshot()
    }

    /// Applies a committed membership change and returns the resulting
    /// config.
    pub fn apply_conf_change(&mut self, cc: &ConfChangeV2) -> Result<ConfState> {
        let changer = Changer::new(&self.trk, self.raft_log.last_index());
        let (cfg, trk) = if cc.leave_joint() {
            changer.leave_joint()?
        } else if let Some(auto_leave) = cc.enter_joint() {
            changer.enter_joint(auto_leave, &cc.changes)?
        } else {
            changer.simple(&cc.changes)?
        };
        Ok(self.switch_to_config(cfg, trk))
    }

    /// Installs a new configuration and reacts to it: a removed leader may
    /// step down, newly committable entries are committed and new peers
    /// probed right away.
    fn switch_to_config(&mut self, cfg: TrackerConfig, trk: ProgressMap) -> ConfState {
        self.trk.config = cfg;
        self.trk.progress = trk;
        info!(id = self.id, config = %self.trk.config, "switched to configuration");

        let cs = self.trk.conf_state();
        let pr = self.trk.progress.get(&self.id);
        self.is_learner = pr.is_some_and(|pr| pr.is_learner);

        if (pr.is_none() || self.is_learner) && self.state == NodeState::Leader {
            // removed or demoted while leading
            if self.step_down_on_removal {
                self.become_follower(self.term, INVALID_ID);
            }
            return cs;
        }

        if self.state != NodeState::Leader || cs.voters.is_empty() {
            return cs;
        }

        if self.maybe_commit() {
            // the new quorum may commit more entries
            self.bcast_append();
        } else {
            for id in self.peers() {
                self.maybe_send_append(id, false);
            }
        }
        if self.lead_transferee != INVALID_ID
            && !self.trk.config.voters.contains(self.lead_transferee)
        {
            self.abort_leader_transfer();
        }
        cs
    }

    fn load_state(&mut self, hs: HardState) {
        if hs.commit < self.raft_log.committed || hs.commit > self.raft_log.last_index() {
            crate::fatal!(
                "{} state.commit {} is out of range [{}, {}]",
                self.id,
                hs.commit,
                self.raft_log.committed,
                self.raft_log.last_index()
            );
        }
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
    }

    /// True once `election_elapsed` reaches the randomized timeout in
    /// `[election_timeout, 2 * election_timeout)`.
    pub fn past_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.election_timeout + self.rng.random_range(0..self.election_timeout);
    }

    fn send_timeout_now(&mut self, to: u64) {
        self.send(RaftMessage::new(MessageType::TimeoutNow, self.id, to));
    }

    fn abort_leader_transfer(&mut self) {
        self.lead_transferee = INVALID_ID;
    }

    fn committed_entry_in_current_term(&self) -> bool {
        // a leader's term is never 0, so an out-of-range 0 never matches
        self.raft_log
            .zero_term_on_out_of_bounds(self.raft_log.committed)
            == self.term
    }

    /// Answers a released read request. Requests from this node itself
    /// become a local ReadState and produce no message.
    fn response_to_read_index_req(&mut self, mut req: RaftMessage, read_index: u64) -> Option<RaftMessage> {
        if req.from == INVALID_ID || req.from == self.id {
            let request_ctx = req.entries.first().map(|e| e.data.clone()).unwrap_or_default();
            self.read_states.push(ReadState {
                index: read_index,
                request_ctx,
            });
            return None;
        }
        let mut resp = RaftMessage::new(MessageType::ReadIndexResp, self.id, req.from);
        resp.index = read_index;
        resp.entries = std::mem::take(&mut req.entries);
        Some(resp)
    }

    fn send_read_index_response(&mut self, m: RaftMessage) {
        let committed = self.raft_log.committed;
        match self.read_only.option {
            ReadOnlyOption::Safe => {
                let ctx = m.entries[0].data.clone();
                self.read_only.add_request(committed, m);
                // the leader acks its own request
                self.read_only.recv_ack(self.id, &ctx);
                self.bcast_heartbeat_with_ctx(ctx);
            }
            ReadOnlyOption::LeaseBased => {
                if let Some(resp) = self.response_to_read_index_req(m, committed) {
                    self.send(resp);
                }
            }
        }
    }

    fn release_pending_read_index_messages(&mut self) {
        if self.pending_read_index_messages.is_empty() {
            return;
        }
        if !self.committed_entry_in_current_term() {
            error!(id = self.id, "pending ReadIndex should be released only after first commit in current term");
            return;
        }
        for m in std::mem::take(&mut self.pending_read_index_messages) {
            self.send_read_index_response(m);
        }
    }

    /// Accounts for proposed entries against the uncommitted quota. An
    /// empty tail accepts anything, and empty payloads are never refused.
    fn increase_uncommitted_size(&mut self, ents: &[LogEntry]) -> bool {
        let s = payloads_size(ents);
        if self.uncommitted_size > 0
            && s > 0
            && self.uncommitted_size.saturating_add(s) > self.max_uncommitted_size
        {
            return false;
        }
        self.uncommitted_size += s;
        true
    }

    fn reduce_uncommitted_size(&mut self, s: u64) {
        self.uncommitted_size = self.uncommitted_size.saturating_sub(s);
    }

    /// Steps every self-addressed message waiting on durability and moves
    /// the rest to `msgs`, repeating until nothing is left. Only correct
    /// when the caller has made all unstable state durable.
    pub fn advance_messages_after_append(&mut self) {
        loop {
            let msgs = std::mem::take(&mut self.msgs_after_append);
            if msgs.is_empty() {
                break;
            }
            for m in msgs {
                if m.to == self.id {
                    if let Err(e) = self.step(m) {
                        debug!(id = self.id, error = %e, "stepping local response failed");
                    }
                } else {
                    self.msgs.push(m);
                }
            }
        }
    }

    /// Drains outgoing messages, treating all unstable state as durable.
    pub fn read_messages(&mut self) -> Vec<RaftMessage> {
        self.advance_messages_after_append();
        std::mem::take(&mut self.msgs)
    }
}

impl<S: Storage> fmt::Debug for RaftNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("term", &self.term)
            .field("vote", &self.vote)
            .field("leader_id", &self.leader_id)
            .field("log", &self.raft_log)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confchange::{ConfChangeI, ConfChangeSingle, ConfChangeType};
    use crate::storage::MemStorage;

    fn config(id: u64) -> RaftConfig {
        RaftConfig {
            election_tick: 10,
            heartbeat_tick: 1,
            ..RaftConfig::new(id)
        }
    }

    fn new_node(id: u64, peers: &[u64]) -> RaftNode<MemStorage> {
        new_node_with(config(id), peers)
    }

    fn new_node_with(cfg: RaftConfig, peers: &[u64]) -> RaftNode<MemStorage> {
        let store = MemStorage::new_with_conf_state(ConfState::with_voters(peers.to_vec()));
        RaftNode::new(&cfg, store).unwrap()
    }

    /// Node whose log holds one entry per term in `terms`, at the last term.
    fn node_with_log(id: u64, peers: &[u64], terms: &[u64]) -> RaftNode<MemStorage> {
        let mut store = MemStorage::new_with_conf_state(ConfState::with_voters(peers.to_vec()));
        let ents: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::new(*t, i as u64 + 1, vec![]))
            .collect();
        store.append(&ents).unwrap();
        let last_term = terms.last().copied().unwrap_or(0);
        store.set_hard_state(HardState {
            term: last_term,
            ..Default::default()
        });
        RaftNode::new(&config(id), store).unwrap()
    }

    fn msg(t: MessageType, from: u64, to: u64, term: u64) -> RaftMessage {
        let mut m = RaftMessage::new(t, from, to);
        m.term = term;
        m
    }

    fn hup(r: &mut RaftNode<MemStorage>) {
        r.step(RaftMessage::new(MessageType::Hup, r.id, r.id)).unwrap();
    }

    fn make_leader(r: &mut RaftNode<MemStorage>) {
        r.become_candidate();
        r.become_leader();
        r.read_messages();
    }

    #[test]
    fn single_node_elects_itself_and_commits_empty_entry() {
        let mut r = new_node(1, &[1]);
        hup(&mut r);
        assert_eq!(r.state, NodeState::Candidate);
        // the self vote only counts once it is durable
        assert!(r.read_messages().is_empty());
        assert_eq!(r.state, NodeState::Leader);
        assert_eq!(r.term, 1);
        assert_eq!(r.raft_log.committed, 1);
    }

    #[test]
    fn candidate_sends_vote_requests_with_last_entry() {
        let mut r = node_with_log(1, &[1, 2, 3], &[1, 1, 2]);
        hup(&mut r);
        let mut msgs = r.read_messages();
        msgs.sort_by_key(|m| m.to);
        assert_eq!(msgs.len(), 2);
        for (m, to) in msgs.iter().zip([2, 3]) {
            assert_eq!(m.msg_type, MessageType::Vote);
            assert_eq!(m.to, to);
            assert_eq!(m.term, 3);
            assert_eq!((m.index, m.log_term), (3, 2));
        }
        assert_eq!(r.vote, 1);
    }

    #[test]
    fn vote_granted_once_per_term() {
        let mut r = new_node(1, &[1, 2, 3]);
        let mut vote = |from: u64| {
            r.step(msg(MessageType::Vote, from, 1, 1)).unwrap();
            r.read_messages().pop().unwrap()
        };
        assert!(!vote(2).reject);
        assert!(vote(3).reject, "second candidate in the same term");
        assert!(!vote(2).reject, "repeat of the cast vote");
    }

    #[test]
    fn vote_rejected_for_stale_log() {
        let mut r = node_with_log(1, &[1, 2, 3], &[1, 2]);
        let mut m = msg(MessageType::Vote, 2, 1, 3);
        m.index = 5;
        m.log_term = 1;
        r.step(m).unwrap();
        let resp = r.read_messages().pop().unwrap();
        assert_eq!(resp.msg_type, MessageType::VoteResp);
        assert!(resp.reject);
        assert_eq!(resp.term, 3);
        assert_eq!(r.vote, INVALID_ID);
    }

    #[test]
    fn pre_vote_does_not_bump_term_or_record_vote() {
        let mut r = new_node(1, &[1, 2, 3]);
        let m = msg(MessageType::PreVote, 2, 1, 5);
        r.step(m).unwrap();
        let resp = r.read_messages().pop().unwrap();
        assert_eq!(resp.msg_type, MessageType::PreVoteResp);
        assert!(!resp.reject);
        assert_eq!(resp.term, 5);
        assert_eq!(r.term, 0);
        assert_eq!(r.vote, INVALID_ID);
    }

    #[test]
    fn pre_candidate_campaigns_for_real_after_quorum() {
        let cfg = RaftConfig {
            pre_vote: true,
            ..config(1)
        };
        let mut r = new_node_with(cfg, &[1, 2, 3]);
        hup(&mut r);
        assert_eq!(r.state, NodeState::PreCandidate);
        let msgs = r.read_messages();
        assert!(msgs.iter().all(|m| m.msg_type == MessageType::PreVote && m.term == 1));
        assert_eq!(r.term, 0);

        r.step(msg(MessageType::PreVoteResp, 2, 1, 1)).unwrap();
        assert_eq!(r.state, NodeState::Candidate);
        assert_eq!(r.term, 1);
    }

    #[test]
    fn higher_term_append_turns_candidate_into_follower() {
        let mut r = new_node(1, &[1, 2, 3]);
        hup(&mut r);
        r.read_messages();
        let mut m = msg(MessageType::App, 2, 1, 2);
        m.commit = 0;
        r.step(m).unwrap();
        assert_eq!(r.state, NodeState::Follower);
        assert_eq!(r.term, 2);
        assert_eq!(r.leader_id, 2);
    }

    #[test]
    fn candidate_loses_on_majority_rejection() {
        let mut r = new_node(1, &[1, 2, 3]);
        hup(&mut r);
        r.read_messages();
        let mut rej = msg(MessageType::VoteResp, 2, 1, 1);
        rej.reject = true;
        r.step(rej.clone()).unwrap();
        assert_eq!(r.state, NodeState::Candidate);
        rej.from = 3;
        r.step(rej).unwrap();
        assert_eq!(r.state, NodeState::Follower);
        assert_eq!(r.term, 1);
    }

    #[test]
    fn leader_only_commits_entries_of_its_own_term() {
        let mut r = node_with_log(1, &[1, 2, 3], &[1, 1]);
        make_leader(&mut r);
        assert_eq!(r.term, 2);
        // follower 2 acks only the old entries
        let mut ack = msg(MessageType::AppResp, 2, 1, 2);
        ack.index = 2;
        r.step(ack).unwrap();
        assert_eq!(r.raft_log.committed, 0);

        let mut ack = msg(MessageType::AppResp, 2, 1, 2);
        ack.index = 3;
        r.step(ack).unwrap();
        assert_eq!(r.raft_log.committed, 3);
    }

    #[test]
    fn follower_without_leader_drops_proposals() {
        let mut r = new_node(1, &[1, 2, 3]);
        let mut m = RaftMessage::new(MessageType::Prop, 1, 1);
        m.entries.push(LogEntry::new(0, 0, b"x".to_vec()));
        assert_eq!(r.step(m), Err(RaftError::ProposalDropped));
    }

    #[test]
    fn follower_forwards_proposals_to_leader() {
        let mut r = new_node(1, &[1, 2, 3]);
        r.become_follower(1, 2);
        let mut m = RaftMessage::new(MessageType::Prop, 1, INVALID_ID);
        m.entries.push(LogEntry::new(0, 0, b"x".to_vec()));
        r.step(m.clone()).unwrap();
        let fwd = r.read_messages().pop().unwrap();
        assert_eq!(fwd.to, 2);
        assert_eq!(fwd.term, 0);

        let cfg = RaftConfig {
            disable_proposal_forwarding: true,
            ..config(1)
        };
        let mut r = new_node_with(cfg, &[1, 2, 3]);
        r.become_follower(1, 2);
        assert_eq!(r.step(m), Err(RaftError::ProposalDropped));
    }

    #[test]
    fn second_conf_change_is_rejected_while_first_is_unapplied() {
        let mut r = new_node(1, &[1, 2, 3]);
        make_leader(&mut r);
        let cc = ConfChangeV2 {
            changes: vec![ConfChangeSingle::new(ConfChangeType::AddNode, 4)],
            ..Default::default()
        };
        let (entry_type, data) = cc.to_entry_data().unwrap();
        let prop = || {
            let mut m = RaftMessage::new(MessageType::Prop, 1, INVALID_ID);
            m.entries.push(LogEntry {
                entry_type,
                data: data.clone(),
                ..Default::default()
            });
            m
        };
        let last = r.raft_log.last_index();
        r.step(prop()).unwrap();
        assert_eq!(r.pending_conf_index, last + 1);
        r.read_messages();

        assert!(matches!(r.step(prop()), Err(RaftError::ConfChangeRejected(_))));
        assert_eq!(r.raft_log.last_index(), last + 1);

        // once the first change is committed and applied a new one is accepted
        let mut ack = msg(MessageType::AppResp, 2, 1, 1);
        ack.index = last + 1;
        r.step(ack).unwrap();
        assert_eq!(r.raft_log.committed, last + 1);
        r.applied_to(last + 1, 0);
        r.step(prop()).unwrap();
        assert_eq!(r.pending_conf_index, last + 2);
    }

    #[test]
    fn check_quorum_steps_down_isolated_leader() {
        let cfg = RaftConfig {
            check_quorum: true,
            ..config(1)
        };
        let mut r = new_node_with(cfg, &[1, 2, 3]);
        make_leader(&mut r);
        r.step(msg(MessageType::HeartbeatResp, 2, 1, 1)).unwrap();
        for _ in 0..10 {
            r.tick();
        }
        // 1 and 2 form a quorum
        assert_eq!(r.state, NodeState::Leader);
        for _ in 0..10 {
            r.tick();
        }
        assert_eq!(r.state, NodeState::Follower);
    }

    #[test]
    fn rejected_append_carries_conflict_hint() {
        // follower log terms: 1 1 1 1 2 2 ; leader probes at (9, term 5)
        let mut r = node_with_log(2, &[1, 2, 3], &[1, 1, 1, 1, 2, 2]);
        let mut m = msg(MessageType::App, 1, 2, 5);
        m.index = 9;
        m.log_term = 5;
        r.step(m).unwrap();
        let resp = r.read_messages().pop().unwrap();
        assert!(resp.reject);
        assert_eq!(resp.index, 9);
        assert_eq!((resp.reject_hint, resp.log_term), (6, 2));
    }

    #[test]
    fn uncommitted_quota_drops_large_proposals() {
        let cfg = RaftConfig {
            max_uncommitted_entries_size: 10,
            ..config(1)
        };
        let mut r = new_node_with(cfg, &[1, 2, 3]);
        make_leader(&mut r);
        let prop = |n: usize| {
            let mut m = RaftMessage::new(MessageType::Prop, 1, INVALID_ID);
            m.entries.push(LogEntry::new(0, 0, vec![0; n]));
            m
        };
        // an empty tail accepts anything
        r.step(prop(8)).unwrap();
        assert_eq!(r.step(prop(8)), Err(RaftError::ProposalDropped));
        r.step(prop(2)).unwrap();
        assert_eq!(r.uncommitted_size, 10);

        r.reduce_uncommitted_size(100);
        assert_eq!(r.uncommitted_size, 0);
    }

    #[test]
    fn learner_cannot_campaign() {
        let store = MemStorage::new_with_conf_state(ConfState {
            voters: vec![1],
            learners: vec![2],
            ..Default::default()
        });
        let mut r = RaftNode::new(&config(2), store).unwrap();
        assert!(r.is_learner);
        assert!(!r.promotable());
        for _ in 0..30 {
            r.tick();
        }
        assert_eq!(r.state, NodeState::Follower);
        assert!(r.read_messages().is_empty());
    }

    #[test]
    fn transfer_to_up_to_date_follower_sends_timeout_now() {
        let mut r = new_node(1, &[1, 2, 3]);
        make_leader(&mut r);
        let mut ack = msg(MessageType::AppResp, 2, 1, 1);
        ack.index = 1;
        r.step(ack).unwrap();
        r.read_messages();

        r.step(RaftMessage::new(MessageType::TransferLeader, 2, 1)).unwrap();
        assert_eq!(r.lead_transferee, 2);
        let msgs = r.read_messages();
        assert!(msgs.iter().any(|m| m.msg_type == MessageType::TimeoutNow && m.to == 2));

        let mut m = RaftMessage::new(MessageType::Prop, 1, INVALID_ID);
        m.entries.push(LogEntry::new(0, 0, b"x".to_vec()));
        assert_eq!(r.step(m), Err(RaftError::ProposalDropped));

        // abandoned after an election timeout
        for _ in 0..10 {
            r.tick();
        }
        assert_eq!(r.lead_transferee, INVALID_ID);
    }

    #[test]
    fn lease_read_on_singleton_is_immediate() {
        let cfg = RaftConfig {
            check_quorum: true,
            read_only_option: ReadOnlyOption::LeaseBased,
            ..config(1)
        };
        let mut r = new_node_with(cfg, &[1]);
        hup(&mut r);
        r.read_messages();
        let mut m = RaftMessage::new(MessageType::ReadIndex, INVALID_ID, INVALID_ID);
        m.entries.push(LogEntry::new(0, 0, b"ctx".to_vec()));
        r.step(m).unwrap();
        assert_eq!(
            r.read_states,
            vec![ReadState {
                index: 1,
                request_ctx: b"ctx".to_vec()
            }]
        );
    }

    #[test]
    fn randomized_timeout_stays_in_range() {
        let mut r = new_node(1, &[1, 2, 3]);
        for term in 1..50 {
            r.become_follower(term, INVALID_ID);
            let t = r.randomized_election_timeout();
            assert!((10..20).contains(&t), "timeout {} out of range", t);
        }
    }

    #[test]
    fn lower_term_heartbeat_gets_nudged_under_check_quorum() {
        let cfg = RaftConfig {
            check_quorum: true,
            ..config(1)
        };
        let mut r = new_node_with(cfg, &[1, 2, 3]);
        r.become_follower(5, INVALID_ID);
        r.step(msg(MessageType::Heartbeat, 2, 1, 3)).unwrap();
        let resp = r.read_messages().pop().unwrap();
        assert_eq!(resp.msg_type, MessageType::AppResp);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn snapshot_restore_replaces_log_and_membership() {
        let mut r = new_node(2, &[1, 2]);
        let snap = Snapshot {
            data: b"state".to_vec(),
            metadata: crate::entry::SnapshotMetadata {
                conf_state: ConfState::with_voters(vec![1, 2, 3]),
                index: 11,
                term: 11,
            },
        };
        let mut m = msg(MessageType::Snap, 1, 2, 11);
        m.snapshot = Some(snap);
        r.step(m).unwrap();
        assert_eq!(r.raft_log.committed, 11);
        assert_eq!(r.raft_log.last_index(), 11);
        assert_eq!(r.trk.voter_nodes(), vec![1, 2, 3]);
        assert!(!r.promotable(), "snapshot is not durable yet");
        let resp = r.read_messages().pop().unwrap();
        assert_eq!((resp.msg_type, resp.index), (MessageType::AppResp, 11));
    }
}
