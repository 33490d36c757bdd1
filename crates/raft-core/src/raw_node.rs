//! # raw_node
//!
//! why: give the driver one thread-unsafe handle that batches the node's effects into Ready structs
//! relations: wraps node.rs; the driver persists via storage.rs and sends the messages itself
//! what: RawNode, Ready, Peer, SnapshotStatus

use tracing::{debug, trace};

use crate::config::RaftConfig;
use crate::confchange::{ConfChange, ConfChangeI, ConfChangeType};
use crate::describe::{describe_ready, DefaultFormatter};
use crate::entry::{ConfState, HardState, LogEntry, Snapshot};
use crate::error::{RaftError, Result};
use crate::message::{is_local_msg_target, MessageType, RaftMessage, LOCAL_APPEND_THREAD, LOCAL_APPLY_THREAD};
use crate::node::{RaftNode, SoftState};
use crate::read_only::ReadState;
use crate::status::Status;
use crate::storage::Storage;
use crate::util::entries_size;
use crate::INVALID_ID;

/// A member of the initial cluster handed to [`RawNode::bootstrap`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub context: Vec<u8>,
}

/// Outcome of sending a snapshot, reported back by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Finish,
    Failure,
}

/// Everything the driver has to act on after a batch of events.
///
/// Entries, hard state and snapshot must be made durable before `messages`
/// are sent; committed entries may be applied in parallel with that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ready {
    /// Set only when leader or role changed.
    pub soft_state: Option<SoftState>,
    /// Set only when term, vote or commit changed.
    pub hard_state: Option<HardState>,
    /// Reads that may be served once `index` is applied.
    pub read_states: Vec<ReadState>,
    /// Entries to append to stable storage.
    pub entries: Vec<LogEntry>,
    /// Snapshot to install in stable storage.
    pub snapshot: Option<Snapshot>,
    /// Entries to apply to the state machine.
    pub committed_entries: Vec<LogEntry>,
    /// Outgoing messages. With asynchronous storage writes this also holds
    /// the `StorageAppend`/`StorageApply` requests for the local workers.
    pub messages: Vec<RaftMessage>,
    /// Whether entries and hard state must be synced to disk before the
    /// messages go out, rather than just written.
    pub must_sync: bool,
}

impl Ready {
    pub fn contains_updates(&self) -> bool {
        self.soft_state.is_some()
            || self.hard_state.is_some()
            || self.snapshot.is_some()
            || !self.entries.is_empty()
            || !self.committed_entries.is_empty()
            || !self.messages.is_empty()
            || !self.read_states.is_empty()
    }
}

/// Term, vote and new entries are the state that must survive a crash.
pub fn must_sync(st: &HardState, prev: &HardState, entries: usize) -> bool {
    entries != 0 || st.vote != prev.vote || st.term != prev.term
}

/// Driver-facing handle around a [`RaftNode`].
pub struct RawNode<S: Storage> {
    pub raft: RaftNode<S>,
    prev_soft_state: SoftState,
    prev_hard_state: HardState,
    /// Local responses to step once the accepted Ready is persisted.
    steps_on_advance: Vec<RaftMessage>,
    async_storage_writes: bool,
}

impl<S: Storage> RawNode<S> {
    pub fn new(config: &RaftConfig, store: S) -> Result<Self> {
        let raft = RaftNode::new(config, store)?;
        let prev_soft_state = raft.soft_state();
        let prev_hard_state = raft.hard_state();
        Ok(Self {
            raft,
            prev_soft_state,
            prev_hard_state,
            steps_on_advance: Vec::new(),
            async_storage_writes: config.async_storage_writes,
        })
    }

    /// Seeds an empty storage with the initial membership: one committed
    /// `AddNode` entry per peer at term 1, applied right away so the node
    /// can campaign. The entries still show up in the next Ready.
    pub fn bootstrap(&mut self, peers: &[Peer]) -> Result<()> {
        if peers.is_empty() {
            return Err(RaftError::Bootstrap(
                "must provide at least one peer to Bootstrap".to_string(),
            ));
        }
        if self.raft.raft_log.store.last_index()? != 0 {
            return Err(RaftError::Bootstrap(
                "can't bootstrap a nonempty Storage".to_string(),
            ));
        }
        // nothing is persisted yet, so the first Ready reports the hard state
        self.prev_hard_state = HardState::default();
        self.raft.become_follower(1, INVALID_ID);

        let mut ents = Vec::with_capacity(peers.len());
        let mut changes = Vec::with_capacity(peers.len());
        for (i, peer) in peers.iter().enumerate() {
            let cc = ConfChange {
                change_type: ConfChangeType::AddNode,
                node_id: peer.id,
                context: peer.context.clone(),
            };
            let (entry_type, data) = cc.to_entry_data()?;
            ents.push(LogEntry {
                entry_type,
                term: 1,
                index: i as u64 + 1,
                data,
                ..Default::default()
            });
            changes.push(cc);
        }
        self.raft.raft_log.append(&ents);
        // applied stays at 0 so the application sees every change
        self.raft.raft_log.committed = ents.len() as u64;
        for cc in &changes {
            self.raft.apply_conf_change(&cc.as_v2())?;
        }
        Ok(())
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        self.raft.tick();
    }

    /// Advances the election clock without triggering anything, for
    /// groups the application keeps quiet on purpose.
    pub fn tick_quiesced(&mut self) {
        self.raft.tick_quiesced();
    }

    /// Starts an election (or a pre-vote round when enabled).
    pub fn campaign(&mut self) -> Result<()> {
        self.raft
            .step(RaftMessage::new(MessageType::Hup, INVALID_ID, INVALID_ID))
    }

    /// Proposes `data` to be appended to the log.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<()> {
        let mut m = RaftMessage::new(MessageType::Prop, self.raft.id, INVALID_ID);
        m.entries.push(LogEntry {
            data,
            ..Default::default()
        });
        self.raft.step(m)
    }

    /// Proposes a membership change.
    pub fn propose_conf_change(&mut self, cc: &impl ConfChangeI) -> Result<()> {
        let (entry_type, data) = cc.to_entry_data()?;
        let mut m = RaftMessage::new(MessageType::Prop, self.raft.id, INVALID_ID);
        m.entries.push(LogEntry {
            entry_type,
            data,
            ..Default::default()
        });
        self.raft.step(m)
    }

    /// Applies a committed membership change. Must be called for every
    /// conf-change entry the application applies.
    pub fn apply_conf_change(&mut self, cc: &impl ConfChangeI) -> Result<ConfState> {
        self.raft.apply_conf_change(&cc.as_v2())
    }

    /// Feeds a message received from the network, or a storage response.
    pub fn step(&mut self, m: RaftMessage) -> Result<()> {
        // local kinds may only come back from the local storage workers
        if m.msg_type.is_local() && !is_local_msg_target(m.from) {
            return Err(RaftError::StepLocalMsg);
        }
        if m.msg_type.is_response()
            && !is_local_msg_target(m.from)
            && !self.raft.trk.progress.contains_key(&m.from)
        {
            return Err(RaftError::StepPeerNotFound);
        }
        self.raft.step(m)
    }

    /// Requests a linearizable read; the answer arrives as a `ReadState`
    /// carrying `ctx`.
    pub fn read_index(&mut self, ctx: Vec<u8>) {
        let mut m = RaftMessage::new(MessageType::ReadIndex, INVALID_ID, INVALID_ID);
        m.entries.push(LogEntry {
            data: ctx,
            ..Default::default()
        });
        let _ = self.raft.step(m);
    }

    pub fn transfer_leader(&mut self, transferee: u64) {
        let _ = self
            .raft
            .step(RaftMessage::new(MessageType::TransferLeader, transferee, INVALID_ID));
    }

    /// Reports that the last message to `id` could not be delivered.
    pub fn report_unreachable(&mut self, id: u64) {
        let _ = self
            .raft
            .step(RaftMessage::new(MessageType::Unreachable, id, INVALID_ID));
    }

    pub fn report_snapshot(&mut self, id: u64, status: SnapshotStatus) {
        let mut m = RaftMessage::new(MessageType::SnapStatus, id, INVALID_ID);
        m.reject = status == SnapshotStatus::Failure;
        let _ = self.raft.step(m);
    }

    pub fn status(&self) -> Status {
        Status::new(&self.raft)
    }

    pub fn store(&self) -> &S {
        &self.raft.raft_log.store
    }

    /// The storage, for the driver to write what a Ready asked for.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.raft.raft_log.store
    }

    /// Committed entries may be applied before they are durable locally,
    /// unless the driver persists and applies on separate workers.
    fn apply_unstable_entries(&self) -> bool {
        !self.async_storage_writes
    }

    /// Whether a call to [`ready`](Self::ready) would return anything.
    pub fn has_ready(&self) -> bool {
        let r = &self.raft;
        if r.soft_state() != self.prev_soft_state {
            return true;
        }
        let hs = r.hard_state();
        if !hs.is_empty() && hs != self.prev_hard_state {
            return true;
        }
        r.raft_log.has_next_unstable_snapshot()
            || !r.msgs.is_empty()
            || !r.msgs_after_append.is_empty()
            || r.raft_log.has_next_unstable_ents()
            || r.raft_log.has_next_committed_ents(self.apply_unstable_entries())
            || !r.read_states.is_empty()
    }

    /// Collects the pending effects into a Ready and marks them as handed
    /// out. Unless asynchronous storage writes are enabled, every Ready
    /// must be followed by [`advance`](Self::advance) before the next one.
    pub fn ready(&mut self) -> Ready {
        let rd = self.ready_without_accept();
        self.accept_ready(&rd);
        trace!(id = self.raft.id, ready = %describe_ready(&rd, &DefaultFormatter), "ready");
        rd
    }

    fn ready_without_accept(&self) -> Ready {
        let r = &self.raft;
        let mut rd = Ready {
            entries: r.raft_log.next_unstable_ents().to_vec(),
            committed_entries: r.raft_log.next_committed_ents(self.apply_unstable_entries()),
            messages: r.msgs.clone(),
            read_states: r.read_states.clone(),
            snapshot: r.raft_log.next_unstable_snapshot().cloned(),
            ..Default::default()
        };
        let ss = r.soft_state();
        if ss != self.prev_soft_state {
            rd.soft_state = Some(ss);
        }
        let hs = r.hard_state();
        if hs != self.prev_hard_state {
            rd.hard_state = Some(hs);
        }
        rd.must_sync = must_sync(&hs, &self.prev_hard_state, rd.entries.len());

        if self.async_storage_writes {
            if self.need_storage_append_msg(&rd) {
                rd.messages.push(self.new_storage_append_msg(&rd));
            }
            if !rd.committed_entries.is_empty() {
                rd.messages.push(self.new_storage_apply_msg(&rd));
            }
        } else {
            // durability-dependent responses to peers go out with this Ready;
            // the self-addressed ones are stepped on advance
            rd.messages.extend(
                r.msgs_after_append
                    .iter()
                    .filter(|m| m.to != r.id)
                    .cloned(),
            );
        }
        rd
    }

    fn need_storage_append_msg(&self, rd: &Ready) -> bool {
        !rd.entries.is_empty()
            || rd.hard_state.is_some()
            || rd.snapshot.is_some()
            || !self.raft.msgs_after_append.is_empty()
    }

    fn need_storage_append_resp_msg(&self, rd: &Ready) -> bool {
        // entries handed out in an earlier Ready may still be in flight
        self.raft.raft_log.has_next_or_in_progress_unstable_ents() || rd.snapshot.is_some()
    }

    /// Asks the append worker to persist entries, hard state and snapshot,
    /// then deliver the durability-dependent responses.
    fn new_storage_append_msg(&self, rd: &Ready) -> RaftMessage {
        let r = &self.raft;
        let mut m = RaftMessage::new(MessageType::StorageAppend, r.id, LOCAL_APPEND_THREAD);
        m.entries = rd.entries.clone();
        if let Some(hs) = rd.hard_state {
            m.term = hs.term;
            m.vote = hs.vote;
            m.commit = hs.commit;
        }
        m.snapshot = rd.snapshot.clone();
        // the leader's self ack goes before the append response so it can
        // still read terms from the unstable log
        m.responses = r.msgs_after_append.clone();
        if self.need_storage_append_resp_msg(rd) {
            m.responses.push(self.new_storage_append_resp_msg(rd));
        }
        m
    }

    /// Tells the node what became durable. It carries the current term so a
    /// response that straddles a term change is not trusted for entries.
    fn new_storage_append_resp_msg(&self, rd: &Ready) -> RaftMessage {
        let r = &self.raft;
        let mut m = RaftMessage::new(MessageType::StorageAppendResp, LOCAL_APPEND_THREAD, r.id);
        m.term = r.term;
        if r.raft_log.has_next_or_in_progress_unstable_ents() {
            m.index = r.raft_log.last_index();
            m.log_term = r.raft_log.last_term();
        }
        m.snapshot = rd.snapshot.clone();
        m
    }

    fn new_storage_apply_msg(&self, rd: &Ready) -> RaftMessage {
        let r = &self.raft;
        let mut m = RaftMessage::new(MessageType::StorageApply, r.id, LOCAL_APPLY_THREAD);
        m.entries = rd.committed_entries.clone();
        m.responses = vec![self.new_storage_apply_resp_msg(&rd.committed_entries)];
        m
    }

    fn new_storage_apply_resp_msg(&self, ents: &[LogEntry]) -> RaftMessage {
        // committed entries do not belong to a term
        let mut m = RaftMessage::new(MessageType::StorageApplyResp, LOCAL_APPLY_THREAD, self.raft.id);
        m.entries = ents.to_vec();
        m
    }

    fn accept_ready(&mut self, rd: &Ready) {
        if let Some(ss) = rd.soft_state {
            self.prev_soft_state = ss;
        }
        if let Some(hs) = rd.hard_state {
            self.prev_hard_state = hs;
        }
        if !rd.read_states.is_empty() {
            self.raft.read_states.clear();
        }
        if !self.async_storage_writes {
            if !self.steps_on_advance.is_empty() {
                crate::fatal!("two accepted Ready structs without call to Advance");
            }
            let id = self.raft.id;
            self.steps_on_advance.extend(
                self.raft
                    .msgs_after_append
                    .iter()
                    .filter(|m| m.to == id)
                    .cloned(),
            );
            if self.need_storage_append_resp_msg(rd) {
                let m = self.new_storage_append_resp_msg(rd);
                self.steps_on_advance.push(m);
            }
            if !rd.committed_entries.is_empty() {
                let m = self.new_storage_apply_resp_msg(&rd.committed_entries);
                self.steps_on_advance.push(m);
            }
        }
        self.raft.msgs.clear();
        self.raft.msgs_after_append.clear();
        self.raft.raft_log.accept_unstable();
        if let Some(last) = rd.committed_entries.last() {
            let allow_unstable = self.apply_unstable_entries();
            self.raft.raft_log.accept_applying(
                last.index,
                entries_size(&rd.committed_entries),
                allow_unstable,
            );
        }
    }

    /// Signals that the last Ready was persisted and its committed entries
    /// applied: steps the self-addressed responses it held back.
    ///
    /// Must not be used with asynchronous storage writes; the workers'
    /// responses take its place.
    pub fn advance(&mut self) {
        if self.async_storage_writes {
            crate::fatal!("Advance must not be called when using AsyncStorageWrites");
        }
        for m in std::mem::take(&mut self.steps_on_advance) {
            if let Err(e) = self.raft.step(m) {
                debug!(id = self.raft.id, error = %e, "stepping response on advance failed");
            }
        }
    }
}
