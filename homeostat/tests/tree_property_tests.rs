//! Load-balancing tree property tests: invariants checked over fixed,
//! varied input grids.
//!
//! Tests verify:
//! - Routing never pushes a node past its capacity
//! - A saturated tree grows instead of failing
//! - CapacityExhausted only when growth cannot help
//! - Rebalance never increases sibling-group variance
//! - Two siblings never drift further apart under rebalance
//! - Siblings below the group average never overtake one another
//! - Rebalance conserves total load
//! - balance_score is 0 for uniform trees and monotone in one deviation

use homeostat::{ControllerConfig, LoadBalancingTree, NodeId, NodeState, TreeError};

fn config(capacity: f64, threshold: f64) -> ControllerConfig {
    ControllerConfig {
        default_node_capacity: capacity,
        rebalance_variance_threshold: threshold,
        ..Default::default()
    }
}

/// Deterministic weight stream in (0, max].
fn weights(seed: u64, count: usize, max: f64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = ((state >> 33) % 1000 + 1) as f64 / 1000.0;
            unit * max
        })
        .collect()
}

/// Two-level tree: root, `groups` inner nodes, `leaves` leaves under each.
fn layered_tree(threshold: f64, groups: usize, leaves: usize, capacities: &[f64]) -> LoadBalancingTree {
    let mut tree = LoadBalancingTree::new(&config(10.0, threshold)).unwrap();
    let mut k = 0;
    for _ in 0..groups {
        let inner = tree
            .add_child(tree.root(), capacities[k % capacities.len()])
            .unwrap();
        k += 1;
        for _ in 0..leaves {
            tree.add_child(inner, capacities[k % capacities.len()]).unwrap();
            k += 1;
        }
    }
    tree
}

fn sibling_groups(tree: &LoadBalancingTree) -> Vec<Vec<NodeId>> {
    tree.nodes()
        .iter()
        .filter(|n| n.children().len() > 1)
        .map(|n| n.children().to_vec())
        .collect()
}

fn variance(tree: &LoadBalancingTree, group: &[NodeId]) -> f64 {
    let pcts: Vec<f64> = group
        .iter()
        .map(|id| tree.node(*id).unwrap().load_pct())
        .collect();
    let avg = pcts.iter().sum::<f64>() / pcts.len() as f64;
    pcts.iter().map(|p| (p - avg) * (p - avg)).sum::<f64>() / pcts.len() as f64
}

/// Load every node to a seed-dependent percentage.
fn scatter_load(tree: &mut LoadBalancingTree, seed: u64) {
    let ids: Vec<NodeId> = tree.nodes().iter().map(|n| n.id()).collect();
    for (i, id) in ids.into_iter().enumerate() {
        let pct = ((seed * 31 + i as u64 * 17) % 11) as f64 / 10.0;
        let capacity = tree.node(id).unwrap().capacity();
        if pct > 0.0 {
            tree.assign(id, pct * capacity).unwrap();
        }
    }
}

// ── Property: routing never exceeds capacity ───────────────────────

#[test]
fn prop_route_never_exceeds_capacity() {
    for seed in 0..20u64 {
        let mut tree = layered_tree(0.3, 2, 3, &[10.0, 4.0, 16.0]);
        for weight in weights(seed, 150, 10.0) {
            let node = tree.route(weight).unwrap();
            assert!(tree.node(node).unwrap().load() > 0.0);
            for n in tree.nodes() {
                assert!(
                    n.load() <= n.capacity() + 1e-9,
                    "seed {}: {} holds {} of {}",
                    seed,
                    n.id(),
                    n.load(),
                    n.capacity()
                );
            }
        }
    }
}

#[test]
fn prop_route_conserves_weight() {
    for seed in 0..10u64 {
        let mut tree = LoadBalancingTree::new(&config(25.0, 0.3)).unwrap();
        let stream = weights(seed, 80, 25.0);
        let expected: f64 = stream.iter().sum();
        for weight in stream {
            tree.route(weight).unwrap();
        }
        assert!((tree.total_load() - expected).abs() < 1e-6);
    }
}

// ── Property: saturation grows the tree ────────────────────────────

#[test]
fn prop_saturated_tree_grows() {
    for capacity in [1.0, 5.0, 10.0, 100.0] {
        let mut tree = LoadBalancingTree::new(&config(capacity, 0.3)).unwrap();
        tree.route(capacity).unwrap();
        assert_eq!(tree.node_state(tree.root()).unwrap(), NodeState::Saturated);

        for expected_len in 2..6 {
            let node = tree.route(capacity).unwrap();
            assert_eq!(tree.len(), expected_len);
            assert_eq!(node, NodeId(expected_len - 1));
            assert_eq!(tree.parent(node).unwrap(), Some(tree.root()));
        }
    }
}

#[test]
fn prop_capacity_exhausted_only_beyond_default() {
    for capacity in [1.0, 8.0, 64.0] {
        let mut tree = LoadBalancingTree::new(&config(capacity, 0.3)).unwrap();
        for factor in [0.25, 0.5, 1.0] {
            assert!(tree.route(capacity * factor).is_ok());
        }
        match tree.route(capacity * 1.5) {
            Err(TreeError::CapacityExhausted { weight, max_capacity }) => {
                assert_eq!(weight, capacity * 1.5);
                assert_eq!(max_capacity, capacity);
            }
            other => panic!("expected CapacityExhausted, got {:?}", other),
        }
    }
}

// ── Property: rebalance never increases sibling variance ───────────

#[test]
fn prop_rebalance_never_increases_group_variance() {
    for seed in 0..30u64 {
        for threshold in [0.0, 0.1, 0.3, 0.6] {
            let mut tree = layered_tree(threshold, 3, 4, &[10.0, 3.0, 27.0, 8.0]);
            scatter_load(&mut tree, seed);

            let groups = sibling_groups(&tree);
            let before: Vec<f64> = groups.iter().map(|g| variance(&tree, g)).collect();
            let load_before = tree.total_load();

            let report = tree.rebalance();

            for (group, before) in groups.iter().zip(before) {
                let after = variance(&tree, group);
                assert!(
                    after <= before + 1e-12,
                    "seed {} threshold {}: variance {} -> {}",
                    seed,
                    threshold,
                    before,
                    after
                );
            }
            assert!((tree.total_load() - load_before).abs() < 1e-9);
            assert!(report.score_after.is_finite());
            for node in tree.nodes() {
                assert!(node.load() >= 0.0);
                assert!(node.load() <= node.capacity() + 1e-9);
            }
        }
    }
}

#[test]
fn prop_two_siblings_never_drift_apart() {
    for a_pct in 0..=10 {
        for b_pct in 0..=10 {
            for (cap_a, cap_b) in [(10.0, 10.0), (4.0, 20.0), (30.0, 6.0)] {
                let mut tree = LoadBalancingTree::new(&config(10.0, 0.3)).unwrap();
                let a = tree.add_child(tree.root(), cap_a).unwrap();
                let b = tree.add_child(tree.root(), cap_b).unwrap();
                if a_pct > 0 {
                    tree.assign(a, cap_a * a_pct as f64 / 10.0).unwrap();
                }
                if b_pct > 0 {
                    tree.assign(b, cap_b * b_pct as f64 / 10.0).unwrap();
                }

                let gap = |t: &LoadBalancingTree| {
                    (t.node(a).unwrap().load_pct() - t.node(b).unwrap().load_pct()).abs()
                };
                let before = gap(&tree);
                tree.rebalance();
                let after = gap(&tree);
                assert!(
                    after <= before + 1e-12,
                    "{}% of {} vs {}% of {}: gap {} -> {}",
                    a_pct * 10,
                    cap_a,
                    b_pct * 10,
                    cap_b,
                    before,
                    after
                );
            }
        }
    }
}

#[test]
fn prop_receivers_never_overtake() {
    for seed in 0..40u64 {
        let mut tree = layered_tree(0.1, 1, 5, &[10.0]);
        scatter_load(&mut tree, seed);
        let group = tree.children(NodeId(1)).unwrap().to_vec();
        let pct = |t: &LoadBalancingTree, id: NodeId| t.node(id).unwrap().load_pct();
        let average = group.iter().map(|id| pct(&tree, *id)).sum::<f64>() / group.len() as f64;
        let below: Vec<(NodeId, f64)> = group
            .iter()
            .map(|id| (*id, pct(&tree, *id)))
            .filter(|(_, p)| *p < average)
            .collect();

        tree.rebalance();

        for (i, (a, a_before)) in below.iter().enumerate() {
            for (b, b_before) in &below[i + 1..] {
                let gap_before = b_before - a_before;
                let gap_after = pct(&tree, *b) - pct(&tree, *a);
                assert!(
                    gap_after * gap_before.signum() >= -1e-9,
                    "seed {}: {} and {} swapped order",
                    seed,
                    a,
                    b
                );
                assert!(gap_after.abs() <= gap_before.abs() + 1e-9, "seed {}: gap grew", seed);
            }
        }
    }
}

#[test]
fn prop_repeated_rebalance_converges_below_threshold() {
    for seed in 0..10u64 {
        let mut tree = layered_tree(0.3, 1, 5, &[10.0]);
        scatter_load(&mut tree, seed);
        for _ in 0..20 {
            tree.rebalance();
        }
        let group = tree.children(NodeId(1)).unwrap().to_vec();
        let avg = group
            .iter()
            .map(|id| tree.node(*id).unwrap().load_pct())
            .sum::<f64>()
            / group.len() as f64;
        for id in &group {
            let deviation = tree.node(*id).unwrap().load_pct() - avg;
            assert!(deviation <= 0.3 + 1e-9, "seed {}: {} still {} above", seed, id, deviation);
        }
    }
}

// ── Property: balance score ────────────────────────────────────────

#[test]
fn prop_balance_score_zero_for_uniform() {
    for pct in [0.0, 0.1, 0.5, 0.9, 1.0] {
        let mut tree = layered_tree(0.3, 2, 2, &[5.0, 12.0, 40.0]);
        let ids: Vec<NodeId> = tree.nodes().iter().map(|n| n.id()).collect();
        for id in ids {
            let capacity = tree.node(id).unwrap().capacity();
            if pct > 0.0 {
                tree.assign(id, capacity * pct).unwrap();
            }
        }
        assert!(tree.balance_score().abs() < 1e-12, "pct {}", pct);
    }
}

#[test]
fn prop_balance_score_monotone_in_single_deviation() {
    for others in [0.0, 0.2, 0.5] {
        let mut previous = None;
        for step in 0..=10 {
            let pct = others + (1.0 - others) * step as f64 / 10.0;
            let mut tree = layered_tree(0.3, 1, 3, &[10.0]);
            let ids: Vec<NodeId> = tree.nodes().iter().map(|n| n.id()).collect();
            for id in &ids[1..] {
                if others > 0.0 {
                    tree.assign(*id, 10.0 * others).unwrap();
                }
            }
            if pct > 0.0 {
                tree.assign(ids[0], 10.0 * pct).unwrap();
            }

            let score = tree.balance_score();
            assert!((0.0..=1.0).contains(&score));
            if let Some(prev) = previous {
                assert!(score > prev, "others {} step {}: {} <= {}", others, step, score, prev);
            }
            previous = Some(score);
        }
    }
}
