//! # common
//!
//! why: drive whole clusters of RawNodes deterministically without real i/o
//! relations: shared by comprehensive_tests.rs and property_tests.rs
//! what: Network simulator with per-link drop rates, isolation, message filters and restarts

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raft_core::{
    ConfChangeV2, ConfState, EntryType, LogEntry, MemStorage, MessageType, NodeState, RaftConfig,
    RaftMessage, RawNode, ReadState, Ready, Storage,
};

/// Upper bound on delivery rounds per `stabilize`; a healthy cluster
/// settles in a handful.
const MAX_ROUNDS: usize = 10_000;

pub struct Network {
    pub nodes: BTreeMap<u64, RawNode<MemStorage>>,
    /// Normal entries each node has applied, in order.
    pub applied: BTreeMap<u64, Vec<LogEntry>>,
    /// Read states each node surfaced, in order.
    pub read_states: BTreeMap<u64, Vec<ReadState>>,
    configs: BTreeMap<u64, RaftConfig>,
    drop_rates: HashMap<(u64, u64), f64>,
    ignored: HashSet<MessageType>,
    rng: StdRng,
}

impl Network {
    /// A cluster where every id starts as a voter.
    pub fn new(ids: &[u64]) -> Self {
        Self::with_config(ids, 0, |_| {})
    }

    fn empty(seed: u64) -> Self {
        Self {
            nodes: BTreeMap::new(),
            applied: BTreeMap::new(),
            read_states: BTreeMap::new(),
            configs: BTreeMap::new(),
            drop_rates: HashMap::new(),
            ignored: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn with_config(ids: &[u64], seed: u64, tweak: impl Fn(&mut RaftConfig)) -> Self {
        let mut net = Self::empty(seed);
        let cs = ConfState::with_voters(ids.to_vec());
        for &id in ids {
            let mut cfg = RaftConfig::new(id);
            tweak(&mut cfg);
            net.add_node_with(cfg, MemStorage::new_with_conf_state(cs.clone()));
        }
        net
    }

    /// Wraps nodes built by the caller, e.g. after a bootstrap.
    pub fn with_nodes(nodes: Vec<RawNode<MemStorage>>) -> Self {
        let mut net = Self::empty(0);
        for rn in nodes {
            let id = rn.raft.id;
            net.nodes.insert(id, rn);
            net.applied.entry(id).or_default();
            net.configs.insert(id, RaftConfig::new(id));
        }
        net
    }

    /// Adds a node with no log and no membership, as a freshly provisioned
    /// machine waiting to be caught up by the leader.
    pub fn add_empty_node(&mut self, id: u64, tweak: impl Fn(&mut RaftConfig)) {
        let mut cfg = RaftConfig::new(id);
        tweak(&mut cfg);
        self.add_node_with(cfg, MemStorage::new());
    }

    fn add_node_with(&mut self, cfg: RaftConfig, store: MemStorage) {
        let rn = RawNode::new(&cfg, store).expect("valid test config");
        self.nodes.insert(cfg.id, rn);
        self.applied.entry(cfg.id).or_default();
        self.configs.insert(cfg.id, cfg);
    }

    pub fn node(&self, id: u64) -> &RawNode<MemStorage> {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: u64) -> &mut RawNode<MemStorage> {
        self.nodes.get_mut(&id).expect("node exists")
    }

    pub fn state(&self, id: u64) -> NodeState {
        self.nodes[&id].raft.state
    }

    pub fn term(&self, id: u64) -> u64 {
        self.nodes[&id].raft.term
    }

    pub fn committed(&self, id: u64) -> u64 {
        self.nodes[&id].raft.raft_log.committed
    }

    /// The leader with the highest term, if any node believes it leads.
    pub fn leader(&self) -> Option<u64> {
        self.nodes
            .values()
            .filter(|n| n.raft.state == NodeState::Leader)
            .max_by_key(|n| n.raft.term)
            .map(|n| n.raft.id)
    }

    /// Payloads each node applied, skipping empty leader entries.
    pub fn applied_data(&self, id: u64) -> Vec<Vec<u8>> {
        self.applied[&id]
            .iter()
            .filter(|e| !e.data.is_empty())
            .map(|e| e.data.clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // faults
    // -------------------------------------------------------------------------

    /// Drops `rate` of the messages from `from` to `to`.
    pub fn drop_link(&mut self, from: u64, to: u64, rate: f64) {
        self.drop_rates.insert((from, to), rate);
    }

    /// Cuts both directions between `a` and `b`.
    pub fn cut(&mut self, a: u64, b: u64) {
        self.drop_link(a, b, 1.0);
        self.drop_link(b, a, 1.0);
    }

    /// Cuts `id` off from every other node.
    pub fn isolate(&mut self, id: u64) {
        let others: Vec<u64> = self.nodes.keys().copied().filter(|&o| o != id).collect();
        for o in others {
            self.cut(id, o);
        }
    }

    /// Drops every message of kind `t`.
    pub fn ignore(&mut self, t: MessageType) {
        self.ignored.insert(t);
    }

    pub fn recover(&mut self) {
        self.drop_rates.clear();
        self.ignored.clear();
    }

    /// Applies the same drop rate to every link.
    pub fn drop_all(&mut self, rate: f64) {
        let ids: Vec<u64> = self.nodes.keys().copied().collect();
        for &a in &ids {
            for &b in &ids {
                if a != b {
                    self.drop_link(a, b, rate);
                }
            }
        }
    }

    /// Simulates a crash and restart: everything not persisted to the
    /// node's storage is lost.
    pub fn restart(&mut self, id: u64) {
        let Some(old) = self.nodes.remove(&id) else {
            return;
        };
        let store = old.store().clone();
        let mut cfg = self.configs[&id].clone();
        cfg.applied = old.raft.raft_log.applied;
        let rn = RawNode::new(&cfg, store).expect("restart from persisted state");
        self.nodes.insert(id, rn);
    }

    // -------------------------------------------------------------------------
    // driving
    // -------------------------------------------------------------------------

    /// Snapshots node `id` at its applied index under its current
    /// membership and drops the log up to there.
    pub fn compact(&mut self, id: u64) {
        let rn = self.node_mut(id);
        let index = rn.raft.raft_log.applied;
        let cs = rn.raft.trk.conf_state();
        let store = rn.store_mut();
        store
            .create_snapshot(index, Some(cs), b"snap".to_vec())
            .expect("snapshot at applied index");
        store.compact(index).expect("compact at applied index");
    }

    pub fn campaign(&mut self, id: u64) {
        let _ = self.node_mut(id).campaign();
        self.stabilize();
    }

    pub fn propose(&mut self, id: u64, data: &[u8]) -> raft_core::Result<()> {
        let res = self.node_mut(id).propose(data.to_vec());
        self.stabilize();
        res
    }

    pub fn tick(&mut self, id: u64) {
        self.node_mut(id).tick();
        self.stabilize();
    }

    /// Ticks every node `n` times, delivering messages after each round.
    pub fn tick_all(&mut self, n: usize) {
        for _ in 0..n {
            for rn in self.nodes.values_mut() {
                rn.tick();
            }
            self.stabilize();
        }
    }

    /// Ticks until some node leads, up to `max` rounds.
    pub fn elect_any(&mut self, max: usize) -> Option<u64> {
        for _ in 0..max {
            if let Some(l) = self.leader() {
                return Some(l);
            }
            self.tick_all(1);
        }
        self.leader()
    }

    /// Delivers messages until no node has anything left to say.
    pub fn stabilize(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut queue = VecDeque::new();
            let ids: Vec<u64> = self.nodes.keys().copied().collect();
            for id in ids {
                queue.extend(self.drain(id));
            }
            if queue.is_empty() {
                return;
            }
            while let Some(m) = queue.pop_front() {
                if !self.deliverable(&m) {
                    continue;
                }
                if let Some(rn) = self.nodes.get_mut(&m.to) {
                    // peers unknown to the receiver are expected around
                    // membership changes
                    let _ = rn.step(m);
                }
            }
        }
        panic!("network did not stabilize");
    }

    /// Steps a message directly, bypassing the fault filters.
    pub fn send(&mut self, m: RaftMessage) {
        if let Some(rn) = self.nodes.get_mut(&m.to) {
            let _ = rn.step(m);
        }
        self.stabilize();
    }

    fn deliverable(&mut self, m: &RaftMessage) -> bool {
        if self.ignored.contains(&m.msg_type) {
            return false;
        }
        match self.drop_rates.get(&(m.from, m.to)) {
            Some(&rate) if rate >= 1.0 => false,
            Some(&rate) if rate > 0.0 => !self.rng.random_bool(rate),
            _ => true,
        }
    }

    /// Runs the synchronous Ready loop of one node and returns what it
    /// wants to send.
    fn drain(&mut self, id: u64) -> Vec<RaftMessage> {
        let mut out = Vec::new();
        let Some(rn) = self.nodes.get_mut(&id) else {
            return out;
        };
        let applied = self.applied.entry(id).or_default();
        let reads = self.read_states.entry(id).or_default();
        while rn.has_ready() {
            let rd = rn.ready();
            reads.extend(rd.read_states.iter().cloned());
            persist(rn, &rd);
            apply(rn, &rd.committed_entries, applied);
            out.extend(rd.messages);
            rn.advance();
        }
        out
    }
}

/// Writes what a Ready asks to persist.
pub fn persist(rn: &mut RawNode<MemStorage>, rd: &Ready) {
    let store = rn.store_mut();
    if let Some(snap) = &rd.snapshot {
        store.apply_snapshot(snap.clone()).expect("newer snapshot");
    }
    store.append(&rd.entries).expect("append");
    if let Some(hs) = rd.hard_state {
        store.set_hard_state(hs);
    }
}

/// Applies committed entries: conf changes go back into the node, the rest
/// is recorded.
pub fn apply(rn: &mut RawNode<MemStorage>, ents: &[LogEntry], applied: &mut Vec<LogEntry>) {
    for e in ents {
        match e.entry_type {
            EntryType::Normal => applied.push(e.clone()),
            EntryType::ConfChange | EntryType::ConfChangeJoint => {
                let cc = ConfChangeV2::from_entry(e).expect("decodable conf change");
                let cs = rn.apply_conf_change(&cc).expect("conf change applies");
                rn.store_mut().set_conf_state(cs);
            }
        }
    }
}

/// Asserts that every pair of nodes agrees on the entries both have
/// committed and still hold.
pub fn assert_logs_agree(net: &Network) {
    let logs: Vec<(u64, BTreeMap<u64, u64>)> = net
        .nodes
        .iter()
        .map(|(&id, rn)| {
            let store = rn.store();
            let first = store.first_index().unwrap_or(1);
            let committed = rn.raft.raft_log.committed.min(store.last_index().unwrap_or(0));
            let ents = if first <= committed {
                store
                    .entries(first, committed + 1, u64::MAX)
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            (id, ents.iter().map(|e| (e.index, e.term)).collect())
        })
        .collect();
    for (a, la) in &logs {
        for (b, lb) in &logs {
            for (index, term) in la {
                if let Some(other) = lb.get(index) {
                    assert_eq!(
                        term, other,
                        "nodes {} and {} disagree on committed entry {}",
                        a, b, index
                    );
                }
            }
        }
    }
}
