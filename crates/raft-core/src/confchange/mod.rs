//! # confchange
//!
//! why: describe membership changes and turn them into new tracker configurations safely
//! relations: payloads travel inside LogEntry::data; Changer rebuilds tracker/ state for node.rs
//! what: ConfChange, ConfChangeV2, ConfChangeSingle, ConfChangeType, ConfChangeTransition, ConfChangeI, Changer, restore

mod changer;
mod restore;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::{EntryType, LogEntry};
use crate::error::{RaftError, Result};

pub use changer::Changer;
pub use restore::restore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfChangeType {
    #[default]
    AddNode,
    RemoveNode,
    /// Carries only context for the application; membership is unchanged.
    UpdateNode,
    AddLearnerNode,
}

/// How a [`ConfChangeV2`] moves through joint consensus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfChangeTransition {
    /// A single change is applied directly; several changes go through a
    /// joint config that is left automatically.
    #[default]
    Auto,
    /// Always enter a joint config and leave it automatically.
    JointImplicit,
    /// Always enter a joint config and stay until an explicit empty
    /// `ConfChangeV2` leaves it.
    JointExplicit,
}

/// One membership operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfChangeSingle {
    pub change_type: ConfChangeType,
    pub node_id: u64,
}

impl ConfChangeSingle {
    pub fn new(change_type: ConfChangeType, node_id: u64) -> Self {
        Self {
            change_type,
            node_id,
        }
    }
}

/// Legacy single-node change, always applied without a joint config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: u64,
    pub context: Vec<u8>,
}

/// A batch of membership changes. The empty value means "leave the joint
/// config".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChangeV2 {
    pub transition: ConfChangeTransition,
    pub changes: Vec<ConfChangeSingle>,
    pub context: Vec<u8>,
}

impl ConfChangeV2 {
    /// Whether this change enters a joint config, and if so whether it
    /// leaves it automatically. Returns `None` for a simple change.
    pub fn enter_joint(&self) -> Option<bool> {
        if self.transition == ConfChangeTransition::Auto && self.changes.len() <= 1 {
            return None;
        }
        Some(match self.transition {
            ConfChangeTransition::Auto | ConfChangeTransition::JointImplicit => true,
            ConfChangeTransition::JointExplicit => false,
        })
    }

    /// Whether this is the (context-free) empty change that leaves a joint
    /// config.
    pub fn leave_joint(&self) -> bool {
        self.transition == ConfChangeTransition::Auto && self.changes.is_empty()
    }

    /// Decodes the change carried by a conf-change entry. Legacy entries
    /// are upgraded. Only an empty joint payload is the leave-joint change;
    /// a legacy entry always names a node.
    pub fn from_entry(entry: &LogEntry) -> Result<ConfChangeV2> {
        let decode_err = |e: serde_json::Error| RaftError::Codec(e.to_string());
        match entry.entry_type {
            EntryType::ConfChange => {
                if entry.data.is_empty() {
                    return Err(RaftError::Codec(format!(
                        "legacy conf change at {} has no payload",
                        entry.index
                    )));
                }
                let cc: ConfChange = serde_json::from_slice(&entry.data).map_err(decode_err)?;
                Ok(cc.as_v2())
            }
            EntryType::ConfChangeJoint => {
                if entry.data.is_empty() {
                    return Ok(ConfChangeV2::default());
                }
                serde_json::from_slice(&entry.data).map_err(decode_err)
            }
            EntryType::Normal => Err(RaftError::Codec(format!(
                "entry {} is not a conf change",
                entry.index
            ))),
        }
    }
}

/// Common view of both conf-change flavours.
pub trait ConfChangeI {
    fn as_v2(&self) -> ConfChangeV2;

    /// The legacy change, if this is one.
    fn as_v1(&self) -> Option<&ConfChange>;

    /// Entry kind and payload for proposing this change.
    fn to_entry_data(&self) -> Result<(EntryType, Vec<u8>)>;
}

impl ConfChangeI for ConfChange {
    fn as_v2(&self) -> ConfChangeV2 {
        ConfChangeV2 {
            transition: ConfChangeTransition::Auto,
            changes: vec![ConfChangeSingle::new(self.change_type, self.node_id)],
            context: self.context.clone(),
        }
    }

    fn as_v1(&self) -> Option<&ConfChange> {
        Some(self)
    }

    fn to_entry_data(&self) -> Result<(EntryType, Vec<u8>)> {
        let data = serde_json::to_vec(self).map_err(|e| RaftError::Codec(e.to_string()))?;
        Ok((EntryType::ConfChange, data))
    }
}

impl ConfChangeI for ConfChangeV2 {
    fn as_v2(&self) -> ConfChangeV2 {
        self.clone()
    }

    fn as_v1(&self) -> Option<&ConfChange> {
        None
    }

    fn to_entry_data(&self) -> Result<(EntryType, Vec<u8>)> {
        let data = serde_json::to_vec(self).map_err(|e| RaftError::Codec(e.to_string()))?;
        Ok((EntryType::ConfChangeJoint, data))
    }
}

impl fmt::Display for ConfChangeSingle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.change_type {
            ConfChangeType::AddNode => 'v',
            ConfChangeType::AddLearnerNode => 'l',
            ConfChangeType::RemoveNode => 'r',
            ConfChangeType::UpdateNode => 'u',
        };
        write!(f, "{}{}", prefix, self.node_id)
    }
}

/// Renders changes in the compact `v1 l2 r3 u4` form.
pub fn conf_changes_to_string(ccs: &[ConfChangeSingle]) -> String {
    ccs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses the compact form: `v` adds a voter, `l` a learner, `r` removes and
/// `u` updates, each followed by a node id.
pub fn conf_changes_from_string(s: &str) -> Result<Vec<ConfChangeSingle>> {
    s.split_whitespace()
        .map(|tok| {
            let mut chars = tok.chars();
            let change_type = match chars.next() {
                Some('v') => ConfChangeType::AddNode,
                Some('l') => ConfChangeType::AddLearnerNode,
                Some('r') => ConfChangeType::RemoveNode,
                Some('u') => ConfChangeType::UpdateNode,
                _ => return Err(RaftError::Codec(format!("unknown input: {}", tok))),
            };
            let node_id = chars
                .as_str()
                .parse::<u64>()
                .map_err(|e| RaftError::Codec(format!("{}: {}", tok, e)))?;
            Ok(ConfChangeSingle::new(change_type, node_id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_leave_joint_classification() {
        let single = ConfChangeV2 {
            changes: vec![ConfChangeSingle::new(ConfChangeType::AddNode, 2)],
            ..Default::default()
        };
        assert_eq!(single.enter_joint(), None);
        assert!(!single.leave_joint());

        let multi = ConfChangeV2 {
            changes: conf_changes_from_string("v2 v3").unwrap(),
            ..Default::default()
        };
        assert_eq!(multi.enter_joint(), Some(true));

        let explicit = ConfChangeV2 {
            transition: ConfChangeTransition::JointExplicit,
            ..single.clone()
        };
        assert_eq!(explicit.enter_joint(), Some(false));

        let leave = ConfChangeV2 {
            context: b"ctx".to_vec(),
            ..Default::default()
        };
        assert!(leave.leave_joint());
        assert!(!explicit.leave_joint());
    }

    #[test]
    fn legacy_change_upgrades() {
        let cc = ConfChange {
            change_type: ConfChangeType::RemoveNode,
            node_id: 3,
            context: b"x".to_vec(),
        };
        let v2 = cc.as_v2();
        assert_eq!(v2.transition, ConfChangeTransition::Auto);
        assert_eq!(v2.changes, vec![ConfChangeSingle::new(ConfChangeType::RemoveNode, 3)]);
        assert_eq!(v2.context, b"x".to_vec());
        assert!(cc.as_v1().is_some());
        assert!(v2.as_v1().is_none());
    }

    #[test]
    fn entry_payload_decodes_both_flavours() {
        let cc = ConfChange {
            change_type: ConfChangeType::AddLearnerNode,
            node_id: 4,
            context: vec![],
        };
        let (entry_type, data) = cc.to_entry_data().unwrap();
        let entry = LogEntry {
            entry_type,
            data,
            ..Default::default()
        };
        assert_eq!(ConfChangeV2::from_entry(&entry).unwrap(), cc.as_v2());

        let empty = LogEntry {
            entry_type: EntryType::ConfChangeJoint,
            ..Default::default()
        };
        assert!(ConfChangeV2::from_entry(&empty).unwrap().leave_joint());

        let empty_legacy = LogEntry {
            entry_type: EntryType::ConfChange,
            index: 7,
            ..Default::default()
        };
        assert!(matches!(
            ConfChangeV2::from_entry(&empty_legacy),
            Err(RaftError::Codec(_))
        ));

        let garbage = LogEntry {
            entry_type: EntryType::ConfChangeJoint,
            data: b"not json".to_vec(),
            ..Default::default()
        };
        assert!(matches!(
            ConfChangeV2::from_entry(&garbage),
            Err(RaftError::Codec(_))
        ));
    }

    #[test]
    fn compact_string_form() {
        let ccs = conf_changes_from_string("v1 l2  r3 u4").unwrap();
        assert_eq!(ccs.len(), 4);
        assert_eq!(ccs[1], ConfChangeSingle::new(ConfChangeType::AddLearnerNode, 2));
        assert_eq!(conf_changes_to_string(&ccs), "v1 l2 r3 u4");
        assert!(conf_changes_from_string("x1").is_err());
        assert!(conf_changes_from_string("vfoo").is_err());
        assert!(conf_changes_from_string("").unwrap().is_empty());
    }
}
