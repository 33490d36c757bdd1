//! # property tests
//!
//! why: check the safety properties over many random schedules rather than hand-picked ones
//! relations: drives raft-core through the simulator in common/mod.rs
//! what: election safety, log matching and state machine safety under lossy links

mod common;

use std::collections::BTreeMap;

use common::{assert_logs_agree, Network};
use proptest::prelude::*;
use raft_core::quorum::{AckIndexMap, MajorityConfig};
use raft_core::NodeState;

/// Records who led each term, failing on a second leader in the same term.
fn observe_leaders(net: &Network, seen: &mut BTreeMap<u64, u64>) -> Result<(), TestCaseError> {
    for rn in net.nodes.values() {
        if rn.raft.state != NodeState::Leader {
            continue;
        }
        let prev = *seen.entry(rn.raft.term).or_insert(rn.raft.id);
        prop_assert_eq!(prev, rn.raft.id, "two leaders in term {}", rn.raft.term);
    }
    Ok(())
}

/// Every applied sequence must be a prefix of the longest one.
fn assert_applied_prefixes(net: &Network) -> Result<(), TestCaseError> {
    let seqs: Vec<Vec<Vec<u8>>> = net.nodes.keys().map(|&id| net.applied_data(id)).collect();
    let longest = seqs.iter().max_by_key(|s| s.len()).cloned().unwrap_or_default();
    for s in &seqs {
        prop_assert_eq!(&longest[..s.len()], &s[..]);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn safety_under_lossy_network(
        seed in any::<u64>(),
        size in prop::sample::select(vec![3u64, 5]),
        drop_rate in 0.0f64..0.4,
        pre_vote in any::<bool>(),
        rounds in 20usize..80,
    ) {
        let ids: Vec<u64> = (1..=size).collect();
        let mut net = Network::with_config(&ids, seed, |c| c.pre_vote = pre_vote);
        net.drop_all(drop_rate);
        let mut seen = BTreeMap::new();

        for round in 0..rounds {
            net.tick_all(1);
            if let Some(l) = net.leader() {
                let _ = net.propose(l, format!("r{}", round).as_bytes());
            }
            observe_leaders(&net, &mut seen)?;
            assert_applied_prefixes(&net)?;
        }

        // heal and let the cluster settle: everyone converges
        net.recover();
        net.tick_all(60);
        observe_leaders(&net, &mut seen)?;
        assert_logs_agree(&net);
        assert_applied_prefixes(&net)?;

        let leader = net.leader();
        prop_assert!(leader.is_some());
        let leader = leader.unwrap_or_default();
        let commit = net.committed(leader);
        for &id in &ids {
            prop_assert_eq!(net.committed(id), commit);
        }
    }

    #[test]
    fn partitioned_minority_never_commits(
        seed in any::<u64>(),
        proposals in 1usize..10,
    ) {
        let mut net = Network::with_config(&[1, 2, 3, 4, 5], seed, |_| {});
        net.campaign(1);
        let base = net.committed(1);
        for i in [1u64, 2] {
            for j in [3u64, 4, 5] {
                net.cut(i, j);
            }
        }
        for p in 0..proposals {
            let _ = net.propose(1, format!("p{}", p).as_bytes());
        }
        prop_assert_eq!(net.committed(1), base);
        prop_assert_eq!(net.committed(2), base);
    }

    #[test]
    fn majority_commit_is_quorum_order_statistic(
        acks in prop::collection::btree_map(1u64..8, 0u64..100, 1..8),
    ) {
        let cfg = MajorityConfig::new(acks.keys().copied().collect());
        let committed = cfg.committed_index(&AckIndexMap(acks.clone().into_iter().collect()));

        // a quorum has acked `committed`, and no quorum acked anything higher
        let q = acks.len() / 2 + 1;
        let at_least = acks.values().filter(|&&v| v >= committed).count();
        prop_assert!(at_least >= q);
        let above = acks.values().filter(|&&v| v > committed).count();
        prop_assert!(above < q);
    }
}
