//! Load-Balancing Tree: capacity-bounded worker hierarchy
//!
//! Nodes live in an arena owned by the tree and are addressed by [`NodeId`].
//! A node's parent link is a lookup id only; it is used to find siblings
//! when a saturated node asks for relief, never for ownership.
//!
//! # Node lifecycle
//!
//! ```text
//! Idle ──route──▶ Loaded ──route──▶ Saturated ──relief request──▶ parent
//!                    ▲                                              │
//!                    └──────────── transfer to a sibling ◀──────────┘
//! ```
//!
//! A saturated node with no sibling room stays saturated; new capacity then
//! comes from growth in [`LoadBalancingTree::route`].
//!
//! # Rebalance
//!
//! Sibling groups are swept bottom-up. Within a group the pre-transfer
//! average load percentage is fixed; every transfer moves a donor down
//! toward it and a receiver up to at most it, so no node crosses the
//! average and the group's variance never increases.

use std::cmp::Ordering;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ConfigError, ConfigResult, TreeError, TreeResult};
use crate::telemetry;

/// Float tolerance for capacity comparisons.
const EPSILON: f64 = 1e-9;

/// Arena index of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Load state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No load.
    Idle,
    /// Some load, spare capacity left.
    Loaded,
    /// Load equals capacity.
    Saturated,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loaded => write!(f, "loaded"),
            Self::Saturated => write!(f, "saturated"),
        }
    }
}

/// A capacity-bounded worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedNode {
    id: NodeId,
    capacity: f64,
    load: f64,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl WeightedNode {
    fn new(id: NodeId, capacity: f64, parent: Option<NodeId>) -> Self {
        Self {
            id,
            capacity,
            load: 0.0,
            children: Vec::new(),
            parent,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn load(&self) -> f64 {
        self.load
    }

    pub fn spare(&self) -> f64 {
        (self.capacity - self.load).max(0.0)
    }

    /// `load / capacity`, in [0, 1].
    pub fn load_pct(&self) -> f64 {
        self.load / self.capacity
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn state(&self) -> NodeState {
        if self.load <= EPSILON {
            NodeState::Idle
        } else if self.load >= self.capacity - EPSILON {
            NodeState::Saturated
        } else {
            NodeState::Loaded
        }
    }

    fn can_accept(&self, weight: f64) -> bool {
        self.load + weight <= self.capacity + EPSILON
    }

    fn add_load(&mut self, weight: f64) {
        self.load = (self.load + weight).min(self.capacity);
    }

    fn remove_load(&mut self, weight: f64) {
        self.load = (self.load - weight).max(0.0);
    }
}

/// Why a transfer happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    /// Upward redistribution request from a saturated node.
    Relief,
    /// Sibling deviation above the rebalance threshold.
    Variance,
}

/// One load movement between siblings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: NodeId,
    pub to: NodeId,
    pub amount: f64,
    pub reason: TransferReason,
}

/// Summary of a rebalance pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub transfers: Vec<Transfer>,
    /// Relief requests drained at the start of the pass.
    pub relief_requests: usize,
    pub score_before: f64,
    pub score_after: f64,
}

impl RebalanceReport {
    /// Total load moved.
    pub fn moved(&self) -> f64 {
        self.transfers.iter().map(|t| t.amount).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Serializable view of the whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root: NodeId,
    pub nodes: Vec<WeightedNode>,
    pub total_load: f64,
    pub total_capacity: f64,
    pub average_load_pct: f64,
    pub balance_score: f64,
}

/// Arena-backed hierarchy of weighted nodes. Single writer: every mutating
/// method takes `&mut self`; wrap in [`SharedLoadBalancingTree`] to share.
#[derive(Debug, Clone)]
pub struct LoadBalancingTree {
    nodes: Vec<WeightedNode>,
    root: NodeId,
    default_capacity: f64,
    variance_threshold: f64,
    max_nodes: usize,
    pending_relief: Vec<NodeId>,
}

impl LoadBalancingTree {
    /// Tree with a single root of `default_node_capacity`.
    pub fn new(config: &ControllerConfig) -> ConfigResult<Self> {
        Self::with_root_capacity(config, config.default_node_capacity)
    }

    /// Tree with a single root of the given capacity.
    pub fn with_root_capacity(config: &ControllerConfig, root_capacity: f64) -> ConfigResult<Self> {
        config.validate()?;
        if !valid_amount(root_capacity) {
            return Err(ConfigError::invalid(
                "root_capacity",
                format!("{} must be finite and > 0", root_capacity),
            ));
        }
        let root = NodeId(0);
        Ok(Self {
            nodes: vec![WeightedNode::new(root, root_capacity, None)],
            root,
            default_capacity: config.default_node_capacity,
            variance_threshold: config.rebalance_variance_threshold,
            max_nodes: config.max_nodes,
            pending_relief: Vec::new(),
        })
    }

    /// Create a shared, lock-protected handle to this tree
    pub fn shared(self) -> SharedLoadBalancingTree {
        SharedLoadBalancingTree::new(self)
    }

    // =========================================================================
    // Structure
    // =========================================================================

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn default_capacity(&self) -> f64 {
        self.default_capacity
    }

    pub fn node(&self, id: NodeId) -> TreeResult<&WeightedNode> {
        self.nodes.get(id.0).ok_or(TreeError::NodeNotFound(id))
    }

    pub fn nodes(&self) -> &[WeightedNode] {
        &self.nodes
    }

    pub fn children(&self, id: NodeId) -> TreeResult<&[NodeId]> {
        Ok(self.node(id)?.children())
    }

    pub fn parent(&self, id: NodeId) -> TreeResult<Option<NodeId>> {
        Ok(self.node(id)?.parent())
    }

    pub fn node_state(&self, id: NodeId) -> TreeResult<NodeState> {
        Ok(self.node(id)?.state())
    }

    /// Saturated nodes waiting for the next rebalance pass.
    pub fn pending_relief(&self) -> &[NodeId] {
        &self.pending_relief
    }

    /// Attach a new empty node under `parent`.
    pub fn add_child(&mut self, parent: NodeId, capacity: f64) -> TreeResult<NodeId> {
        if !valid_amount(capacity) {
            return Err(TreeError::InvalidCapacity(capacity));
        }
        self.node(parent)?;
        if self.nodes.len() >= self.max_nodes {
            return Err(TreeError::GrowthLimitReached {
                max_nodes: self.max_nodes,
            });
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(WeightedNode::new(id, capacity, Some(parent)));
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// Node ids in depth-first pre-order from the root.
    pub fn depth_first(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    // =========================================================================
    // Load accounting
    // =========================================================================

    pub fn total_load(&self) -> f64 {
        self.nodes.iter().map(|n| n.load).sum()
    }

    pub fn total_capacity(&self) -> f64 {
        self.nodes.iter().map(|n| n.capacity).sum()
    }

    /// Mean load percentage over every node.
    pub fn average_load_pct(&self) -> f64 {
        mean(self.nodes.iter().map(WeightedNode::load_pct), self.nodes.len())
    }

    /// Population variance of load percentages, clamped to [0, 1].
    ///
    /// 0 means every node is equally loaded.
    pub fn balance_score(&self) -> f64 {
        let n = self.nodes.len();
        if n == 0 {
            return 0.0;
        }
        let avg = self.average_load_pct();
        let variance = self
            .nodes
            .iter()
            .map(|node| {
                let d = node.load_pct() - avg;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        variance.clamp(0.0, 1.0)
    }

    /// Route `weight` to the node whose post-acceptance load percentage
    /// deviates least from the post-acceptance tree average.
    ///
    /// Every node with room is a candidate, the root included; ties go to
    /// the lowest id. With no room anywhere a new leaf is grown under the
    /// root. Fails only when growth cannot help.
    pub fn route(&mut self, weight: f64) -> TreeResult<NodeId> {
        if !valid_amount(weight) {
            return Err(TreeError::InvalidWeight(weight));
        }
        let span = telemetry::route_span(weight, self.nodes.len());
        let _guard = span.enter();

        let (target, grew) = match self.best_candidate(weight) {
            Some(id) => (id, false),
            None => (self.grow_for(weight)?, true),
        };

        self.nodes[target.0].add_load(weight);
        if self.nodes[target.0].state() == NodeState::Saturated {
            self.request_relief(target);
        }

        telemetry::record_route_result(&span, &target.to_string(), grew);
        debug!(node = %target, weight, grew, "Routed weight");
        Ok(target)
    }

    /// Place `weight` on a specific node.
    pub fn assign(&mut self, id: NodeId, weight: f64) -> TreeResult<()> {
        if !valid_amount(weight) {
            return Err(TreeError::InvalidWeight(weight));
        }
        let node = self.node(id)?;
        if !node.can_accept(weight) {
            return Err(TreeError::NodeFull {
                node: id,
                weight,
                spare: node.spare(),
            });
        }
        self.nodes[id.0].add_load(weight);
        if self.nodes[id.0].state() == NodeState::Saturated {
            self.request_relief(id);
        }
        Ok(())
    }

    /// Remove up to `weight` of completed work from a node. Returns the
    /// amount actually removed.
    pub fn release(&mut self, id: NodeId, weight: f64) -> TreeResult<f64> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(TreeError::InvalidWeight(weight));
        }
        self.node(id)?;
        let node = &mut self.nodes[id.0];
        let before = node.load;
        node.remove_load(weight);
        let released = before - node.load;
        if node.state() != NodeState::Saturated {
            self.pending_relief.retain(|pending| *pending != id);
        }
        Ok(released)
    }

    // =========================================================================
    // Redistribution
    // =========================================================================

    /// Handle one node's relief request through its parent: move load to
    /// siblings below the group average until the node reaches that
    /// average or no sibling has room.
    ///
    /// Returns the transfers made; empty if the node is not saturated, has
    /// no parent, or no sibling can take load. A node still saturated
    /// afterwards keeps its request queued for the next `rebalance()`.
    pub fn relieve(&mut self, id: NodeId) -> TreeResult<Vec<Transfer>> {
        let node = self.node(id)?;
        let (state, parent) = (node.state(), node.parent());
        let parent = match parent {
            Some(parent) if state == NodeState::Saturated => parent,
            _ => {
                self.pending_relief.retain(|pending| *pending != id);
                return Ok(Vec::new());
            }
        };

        let group = self.nodes[parent.0].children.clone();
        let average = self.group_average(&group);
        let excess = (self.nodes[id.0].load_pct() - average) * self.nodes[id.0].capacity;

        let mut transfers = Vec::new();
        self.give_to_siblings(id, &group, average, excess, TransferReason::Relief, &mut transfers);

        if self.nodes[id.0].state() == NodeState::Saturated {
            debug!(node = %id, parent = %parent, "Relief request found no sibling room, kept queued");
            self.request_relief(id);
        } else {
            self.pending_relief.retain(|pending| *pending != id);
        }
        Ok(transfers)
    }

    /// One bottom-up pass: drain relief requests, then reduce deviation
    /// within every sibling group.
    pub fn rebalance(&mut self) -> RebalanceReport {
        let span = telemetry::rebalance_span(self.nodes.len());
        let _guard = span.enter();

        let score_before = self.balance_score();
        let mut transfers = Vec::new();

        let pending = std::mem::take(&mut self.pending_relief);
        let relief_requests = pending.len();
        for id in pending {
            match self.relieve(id) {
                Ok(moved) => transfers.extend(moved),
                Err(e) => warn!(node = %id, error = %e, "Dropping relief request"),
            }
        }

        // Reverse pre-order visits every parent after all of its descendants.
        let parents: Vec<NodeId> = self
            .depth_first()
            .into_iter()
            .rev()
            .filter(|id| self.nodes[id.0].children.len() > 1)
            .collect();
        for parent in parents {
            let group = self.nodes[parent.0].children.clone();
            self.rebalance_group(&group, &mut transfers);
        }

        let score_after = self.balance_score();
        telemetry::record_rebalance_result(&span, transfers.len(), score_before, score_after);
        if !transfers.is_empty() {
            info!(
                transfers = transfers.len(),
                score_before, score_after, "Rebalanced tree"
            );
        }

        RebalanceReport {
            transfers,
            relief_requests,
            score_before,
            score_after,
        }
    }

    /// Serializable copy of every node plus aggregate figures.
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.root,
            nodes: self.nodes.clone(),
            total_load: self.total_load(),
            total_capacity: self.total_capacity(),
            average_load_pct: self.average_load_pct(),
            balance_score: self.balance_score(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn best_candidate(&self, weight: f64) -> Option<NodeId> {
        let n = self.nodes.len() as f64;
        let pct_sum: f64 = self.nodes.iter().map(WeightedNode::load_pct).sum();

        let mut best: Option<(NodeId, f64)> = None;
        for id in self.depth_first() {
            let node = &self.nodes[id.0];
            if !node.can_accept(weight) {
                continue;
            }
            let post_pct = ((node.load + weight) / node.capacity).min(1.0);
            let post_avg = (pct_sum - node.load_pct() + post_pct) / n;
            let deviation = (post_pct - post_avg).abs();

            let better = match best {
                None => true,
                Some((best_id, best_dev)) => {
                    deviation < best_dev - EPSILON
                        || ((deviation - best_dev).abs() <= EPSILON && id < best_id)
                }
            };
            if better {
                best = Some((id, deviation));
            }
        }
        best.map(|(id, _)| id)
    }

    fn grow_for(&mut self, weight: f64) -> TreeResult<NodeId> {
        if weight > self.default_capacity + EPSILON {
            return Err(TreeError::CapacityExhausted {
                weight,
                max_capacity: self.default_capacity,
            });
        }
        let id = self.add_child(self.root, self.default_capacity)?;
        info!(node = %id, capacity = self.default_capacity, "No capacity left, grew new leaf");
        Ok(id)
    }

    fn request_relief(&mut self, id: NodeId) {
        if !self.pending_relief.contains(&id) {
            debug!(node = %id, "Node saturated, relief requested");
            self.pending_relief.push(id);
        }
    }

    fn group_average(&self, group: &[NodeId]) -> f64 {
        mean(group.iter().map(|id| self.nodes[id.0].load_pct()), group.len())
    }

    fn rebalance_group(&mut self, group: &[NodeId], transfers: &mut Vec<Transfer>) {
        let average = self.group_average(group);

        let mut donors: Vec<(NodeId, f64)> = group
            .iter()
            .map(|id| (*id, self.nodes[id.0].load_pct() - average))
            .filter(|(_, deviation)| *deviation > self.variance_threshold)
            .collect();
        donors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));

        for (donor, deviation) in donors {
            let excess = deviation * self.nodes[donor.0].capacity;
            self.give_to_siblings(
                donor,
                group,
                average,
                excess / 2.0,
                TransferReason::Variance,
                transfers,
            );
        }
    }

    /// Move up to `budget` load from `donor` to siblings below `average`.
    ///
    /// Receivers are water-filled: the lowest is raised to the next-lowest,
    /// then both together, and so on, never past `average`. A receiver never
    /// overtakes another one.
    fn give_to_siblings(
        &mut self,
        donor: NodeId,
        group: &[NodeId],
        average: f64,
        budget: f64,
        reason: TransferReason,
        transfers: &mut Vec<Transfer>,
    ) {
        if budget <= EPSILON {
            return;
        }

        let mut receivers: Vec<NodeId> = group
            .iter()
            .copied()
            .filter(|id| *id != donor && self.room_below(*id, average) > EPSILON)
            .collect();
        receivers.sort_by(|a, b| {
            let pa = self.nodes[a.0].load_pct();
            let pb = self.nodes[b.0].load_pct();
            pa.partial_cmp(&pb).unwrap_or(Ordering::Equal).then(a.cmp(b))
        });
        if receivers.is_empty() {
            return;
        }

        let level = self.fill_level(&receivers, average, budget);
        let mut remaining = budget;
        for receiver in receivers {
            if remaining <= EPSILON {
                break;
            }
            let node = &self.nodes[receiver.0];
            let wanted = ((level - node.load_pct()) * node.capacity).max(0.0);
            let amount = wanted
                .min(self.room_below(receiver, average))
                .min(remaining);
            if amount <= EPSILON {
                continue;
            }
            self.nodes[donor.0].remove_load(amount);
            self.nodes[receiver.0].add_load(amount);
            remaining -= amount;

            debug!(from = %donor, to = %receiver, amount, ?reason, "Transferred load");
            transfers.push(Transfer {
                from: donor,
                to: receiver,
                amount,
                reason,
            });
        }
    }

    /// Common load percentage the receivers (sorted ascending) reach when
    /// `budget` is poured into them, capped at `average`.
    fn fill_level(&self, receivers: &[NodeId], average: f64, budget: f64) -> f64 {
        let mut level = self.nodes[receivers[0].0].load_pct();
        let mut active_capacity = 0.0;
        let mut remaining = budget;

        for (i, id) in receivers.iter().enumerate() {
            active_capacity += self.nodes[id.0].capacity;
            let next = receivers
                .get(i + 1)
                .map(|next| self.nodes[next.0].load_pct().min(average))
                .unwrap_or(average);
            let cost = (next - level).max(0.0) * active_capacity;
            if remaining < cost {
                return level + remaining / active_capacity;
            }
            remaining -= cost;
            level = next;
        }
        level
    }

    /// Load a node can take before its percentage reaches `average`.
    fn room_below(&self, id: NodeId, average: f64) -> f64 {
        let node = &self.nodes[id.0];
        ((average - node.load_pct()) * node.capacity)
            .min(node.spare())
            .max(0.0)
    }
}

/// Shared, lock-protected tree.
///
/// Mutations (`route`, `assign`, `release`, `relieve`, `rebalance`,
/// `add_child`) hold the write lock for the whole operation, so concurrent
/// routers see either the pre- or post-rebalance tree. Reads take the read
/// lock.
#[derive(Debug, Clone)]
pub struct SharedLoadBalancingTree {
    inner: Arc<RwLock<LoadBalancingTree>>,
}

impl SharedLoadBalancingTree {
    pub fn new(tree: LoadBalancingTree) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tree)),
        }
    }

    pub fn route(&self, weight: f64) -> TreeResult<NodeId> {
        self.write().route(weight)
    }

    pub fn assign(&self, id: NodeId, weight: f64) -> TreeResult<()> {
        self.write().assign(id, weight)
    }

    pub fn release(&self, id: NodeId, weight: f64) -> TreeResult<f64> {
        self.write().release(id, weight)
    }

    pub fn relieve(&self, id: NodeId) -> TreeResult<Vec<Transfer>> {
        self.write().relieve(id)
    }

    pub fn add_child(&self, parent: NodeId, capacity: f64) -> TreeResult<NodeId> {
        self.write().add_child(parent, capacity)
    }

    pub fn rebalance(&self) -> RebalanceReport {
        self.write().rebalance()
    }

    pub fn balance_score(&self) -> f64 {
        self.read().balance_score()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.read().snapshot()
    }

    /// Run a read-only closure against a consistent view of the tree.
    pub fn with<R>(&self, f: impl FnOnce(&LoadBalancingTree) -> R) -> R {
        f(&self.read())
    }

    // Poisoning is recovered rather than surfaced as an error: node loads
    // are soft state.
    fn read(&self) -> RwLockReadGuard<'_, LoadBalancingTree> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LoadBalancingTree> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn valid_amount(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn mean(values: impl Iterator<Item = f64>, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        values.sum::<f64>() / count as f64
    }
}
