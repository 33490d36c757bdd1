//! # read_only
//!
//! why: track read-index requests until a quorum confirms the leader still leads
//! relations: owned by node.rs; released ReadStates surface through raw_node.rs Ready
//! what: ReadOnlyOption, ReadState, ReadIndexStatus, ReadOnly

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::message::RaftMessage;

/// How the leader confirms it may serve a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadOnlyOption {
    /// Confirm leadership with a quorum heartbeat round per batch of reads.
    #[default]
    Safe,
    /// Trust the leader lease. Depends on bounded clock drift across nodes,
    /// measured in ticks.
    LeaseBased,
}

/// A read that is safe to serve once the application has applied `index`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadState {
    pub index: u64,
    pub request_ctx: Vec<u8>,
}

/// A pending read request and the heartbeat acks collected for it.
#[derive(Debug, Clone)]
pub struct ReadIndexStatus {
    /// The `ReadIndex` request as received; its first entry carries the context.
    pub req: RaftMessage,
    /// Commit index when the request arrived.
    pub index: u64,
    pub acks: HashMap<u64, bool>,
}

/// Pending read-index requests in arrival order, keyed by request context.
#[derive(Debug, Clone, Default)]
pub struct ReadOnly {
    pub option: ReadOnlyOption,
    pending_read_index: HashMap<Vec<u8>, ReadIndexStatus>,
    read_index_queue: VecDeque<Vec<u8>>,
}

fn request_ctx(m: &RaftMessage) -> Vec<u8> {
    m.entries.first().map(|e| e.data.clone()).unwrap_or_default()
}

impl ReadOnly {
    pub fn new(option: ReadOnlyOption) -> Self {
        Self {
            option,
            ..Default::default()
        }
    }

    /// Queues `m` to be released at `index`. A context already pending is
    /// ignored.
    pub fn add_request(&mut self, index: u64, m: RaftMessage) {
        let ctx = request_ctx(&m);
        if self.pending_read_index.contains_key(&ctx) {
            return;
        }
        self.pending_read_index.insert(
            ctx.clone(),
            ReadIndexStatus {
                req: m,
                index,
                acks: HashMap::new(),
            },
        );
        self.read_index_queue.push_back(ctx);
    }

    /// Records a heartbeat ack from `id` for the request with `ctx` and
    /// returns the acks gathered so far, or `None` for an unknown context.
    pub fn recv_ack(&mut self, id: u64, ctx: &[u8]) -> Option<&HashMap<u64, bool>> {
        let rs = self.pending_read_index.get_mut(ctx)?;
        rs.acks.insert(id, true);
        Some(&rs.acks)
    }

    /// Releases the request with `ctx` and every request queued before it:
    /// confirming a later heartbeat round confirms the earlier ones too.
    pub fn advance(&mut self, ctx: &[u8]) -> Vec<ReadIndexStatus> {
        let Some(pos) = self.read_index_queue.iter().position(|c| c == ctx) else {
            return Vec::new();
        };
        self.read_index_queue
            .drain(..=pos)
            .map(|c| {
                self.pending_read_index.remove(&c).unwrap_or_else(|| {
                    crate::fatal!("cannot find corresponding read state from pending map")
                })
            })
            .collect()
    }

    /// Context of the newest pending request, sent along with heartbeats.
    pub fn last_pending_request_ctx(&self) -> Option<Vec<u8>> {
        self.read_index_queue.back().cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.read_index_queue.len()
    }

    /// Drops every pending request; they are implicitly abandoned on a term
    /// change.
    pub fn reset(&mut self) {
        self.pending_read_index.clear();
        self.read_index_queue.clear();
    }
}
