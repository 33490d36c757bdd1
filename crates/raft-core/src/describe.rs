//! # describe
//!
//! why: render raft records as compact one-line text for trace output and test assertions
//! relations: used by raw_node.rs when tracing Ready, and by drivers for their own logs
//! what: EntryFormatter, DefaultFormatter, describe_* helpers

use std::fmt::Write;

use crate::confchange::{conf_changes_to_string, ConfChangeV2};
use crate::entry::{ConfState, EntryType, HardState, LogEntry, Snapshot};
use crate::message::RaftMessage;
use crate::node::SoftState;
use crate::raw_node::Ready;

/// Renders application payloads. Applications with structured payloads
/// plug their own decoder in here.
pub trait EntryFormatter {
    fn format(&self, data: &[u8]) -> String;
}

/// Prints payloads as quoted, escaped strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFormatter;

impl EntryFormatter for DefaultFormatter {
    fn format(&self, data: &[u8]) -> String {
        format!("{:?}", String::from_utf8_lossy(data))
    }
}

impl<F: Fn(&[u8]) -> String> EntryFormatter for F {
    fn format(&self, data: &[u8]) -> String {
        self(data)
    }
}

pub fn describe_hard_state(hs: &HardState) -> String {
    let mut s = format!("Term:{}", hs.term);
    if hs.vote != 0 {
        let _ = write!(s, " Vote:{}", hs.vote);
    }
    let _ = write!(s, " Commit:{}", hs.commit);
    s
}

pub fn describe_soft_state(ss: &SoftState) -> String {
    ss.to_string()
}

fn ids(v: &[u64]) -> String {
    format!("{:?}", v)
}

pub fn describe_conf_state(cs: &ConfState) -> String {
    format!(
        "Voters:{} VotersOutgoing:{} Learners:{} LearnersNext:{} AutoLeave:{}",
        ids(&cs.voters),
        ids(&cs.voters_outgoing),
        ids(&cs.learners),
        ids(&cs.learners_next),
        cs.auto_leave
    )
}

pub fn describe_snapshot(snap: &Snapshot) -> String {
    let m = &snap.metadata;
    format!(
        "Index:{} Term:{} ConfState:{}",
        m.index,
        m.term,
        describe_conf_state(&m.conf_state)
    )
}

/// `term/index kind payload`; conf changes are decoded into the `v1 l2`
/// notation.
pub fn describe_entry(e: &LogEntry, f: &dyn EntryFormatter) -> String {
    let payload = match e.entry_type {
        EntryType::Normal => f.format(&e.data),
        EntryType::ConfChange | EntryType::ConfChangeJoint => match ConfChangeV2::from_entry(e) {
            Ok(cc) => conf_changes_to_string(&cc.changes),
            Err(err) => err.to_string(),
        },
    };
    format!("{}/{} {:?} {}", e.term, e.index, e.entry_type, payload)
}

pub fn describe_entries(ents: &[LogEntry], f: &dyn EntryFormatter) -> String {
    ents.iter()
        .map(|e| describe_entry(e, f))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn describe_message(m: &RaftMessage, f: &dyn EntryFormatter) -> String {
    let mut s = format!(
        "{}->{} {:?} Term:{} Log:{}/{}",
        m.from, m.to, m.msg_type, m.term, m.log_term, m.index
    );
    if m.reject {
        let _ = write!(s, " Rejected (Hint: {})", m.reject_hint);
    }
    if m.commit != 0 {
        let _ = write!(s, " Commit:{}", m.commit);
    }
    if m.vote != 0 {
        let _ = write!(s, " Vote:{}", m.vote);
    }
    if !m.entries.is_empty() {
        let ents: Vec<String> = m.entries.iter().map(|e| describe_entry(e, f)).collect();
        let _ = write!(s, " Entries:[{}]", ents.join(", "));
    }
    if let Some(snap) = m.snapshot.as_ref().filter(|snap| !snap.is_empty()) {
        let _ = write!(s, " Snapshot: {}", describe_snapshot(snap));
    }
    if !m.responses.is_empty() {
        let resps: Vec<String> = m.responses.iter().map(|r| describe_message(r, f)).collect();
        let _ = write!(s, " Responses:[{}]", resps.join(", "));
    }
    s
}

/// Multi-line rendering with one labelled block per non-empty field.
pub fn describe_ready(rd: &Ready, f: &dyn EntryFormatter) -> String {
    let mut blocks = Vec::new();
    if let Some(ss) = &rd.soft_state {
        blocks.push(describe_soft_state(ss));
    }
    if let Some(hs) = &rd.hard_state {
        blocks.push(format!("HardState {}", describe_hard_state(hs)));
    }
    if !rd.read_states.is_empty() {
        blocks.push(format!("ReadStates {:?}", rd.read_states));
    }
    if !rd.entries.is_empty() {
        blocks.push(format!("Entries:\n{}", describe_entries(&rd.entries, f)));
    }
    if let Some(snap) = &rd.snapshot {
        blocks.push(format!("Snapshot {}", describe_snapshot(snap)));
    }
    if !rd.committed_entries.is_empty() {
        blocks.push(format!(
            "CommittedEntries:\n{}",
            describe_entries(&rd.committed_entries, f)
        ));
    }
    if !rd.messages.is_empty() {
        let msgs: Vec<String> = rd.messages.iter().map(|m| describe_message(m, f)).collect();
        blocks.push(format!("Messages:\n{}", msgs.join("\n")));
    }
    if blocks.is_empty() {
        return "<empty Ready>".to_string();
    }
    let mut out = String::from("Ready MustSync=");
    let _ = write!(out, "{}:\n{}", rd.must_sync, blocks.join("\n"));
    out
}
