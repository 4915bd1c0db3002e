//! Resilience Controller: executor + tree behind one handle
//!
//! Owns one [`ResilientExecutor`] and one [`SharedLoadBalancingTree`] and
//! reports their combined health. The snapshot is read-only: nothing in the
//! controller feeds it back into a decision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::classifier::BalanceState;
use crate::config::ControllerConfig;
use crate::error::{ConfigError, ConfigResult, TreeResult};
use crate::executor::{AsyncOperation, ExecutionResult, ResilientExecutor, SharedExecutor};
use crate::sensor::SensorSnapshot;
use crate::tree::{LoadBalancingTree, NodeId, RebalanceReport, SharedLoadBalancingTree, TreeSnapshot};

/// Point-in-time health of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: BalanceState,
    pub tension: f64,
    pub balance_score: f64,
    pub node_count: usize,
    pub observed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Whether the executor is serving from its primary path.
    pub fn is_nominal(&self) -> bool {
        self.state == BalanceState::Nominal
    }
}

/// Executor and tree managed together.
pub struct ResilienceController<P, F> {
    executor: SharedExecutor<P, F>,
    tree: SharedLoadBalancingTree,
    config: ControllerConfig,
}

impl<P> ResilienceController<P, P> {
    /// Controller whose executor has no fallback.
    pub fn primary_only(primary: P, config: ControllerConfig) -> ConfigResult<Self> {
        let config = config.validated()?;
        let executor = ResilientExecutor::primary_only(primary, &config)?;
        Self::assemble(executor, config)
    }
}

impl<P, F> ResilienceController<P, F> {
    /// Build executor and tree from one validated config.
    pub fn new(primary: P, fallback: F, config: ControllerConfig) -> ConfigResult<Self> {
        let config = config.validated()?;
        let executor = ResilientExecutor::new(primary, fallback, &config)?;
        Self::assemble(executor, config)
    }

    /// Wrap existing components, e.g. a tree shared with other routers.
    pub fn from_parts(
        executor: SharedExecutor<P, F>,
        tree: SharedLoadBalancingTree,
        config: ControllerConfig,
    ) -> Self {
        Self {
            executor,
            tree,
            config,
        }
    }

    fn assemble(executor: ResilientExecutor<P, F>, config: ControllerConfig) -> ConfigResult<Self> {
        let tree = LoadBalancingTree::new(&config)?.shared();
        info!(
            window = config.window_capacity,
            low = config.tension_low,
            high = config.tension_high,
            node_capacity = config.default_node_capacity,
            "Resilience controller initialized"
        );
        Ok(Self {
            executor: executor.named("controller").shared(),
            tree,
            config,
        })
    }

    pub fn executor(&self) -> &SharedExecutor<P, F> {
        &self.executor
    }

    pub fn tree(&self) -> &SharedLoadBalancingTree {
        &self.tree
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // =========================================================================
    // Execution
    // =========================================================================

    pub fn execute<I, T, E>(&self, input: &I) -> ExecutionResult<T, E>
    where
        I: ?Sized,
        P: Fn(&I) -> Result<T, E>,
        F: Fn(&I) -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        self.executor.execute(input)
    }

    pub async fn execute_async<I>(&self, input: &I) -> ExecutionResult<P::Output, P::Error>
    where
        I: Sync + ?Sized,
        P: AsyncOperation<I>,
        F: AsyncOperation<I, Output = P::Output, Error = P::Error>,
    {
        self.executor.execute_async(input).await
    }

    // =========================================================================
    // Load distribution
    // =========================================================================

    pub fn route(&self, weight: f64) -> TreeResult<NodeId> {
        self.tree.route(weight)
    }

    pub fn release(&self, node: NodeId, weight: f64) -> TreeResult<f64> {
        self.tree.release(node, weight)
    }

    pub fn rebalance(&self) -> RebalanceReport {
        self.tree.rebalance()
    }

    /// Run `rebalance()` on the shared tree every `period` until stopped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_rebalancer(&self, period: Duration) -> ConfigResult<RebalanceLoop> {
        RebalanceLoop::spawn(self.tree.clone(), period)
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub fn status(&self) -> HealthSnapshot {
        let executor = self.executor.status();
        let (balance_score, node_count) = self.tree.with(|t| (t.balance_score(), t.len()));
        HealthSnapshot {
            state: executor.state,
            tension: executor.tension,
            balance_score,
            node_count,
            observed_at: Utc::now(),
        }
    }

    pub fn sensor_snapshot(&self) -> SensorSnapshot {
        self.executor.sensor_snapshot()
    }

    pub fn tree_snapshot(&self) -> TreeSnapshot {
        self.tree.snapshot()
    }
}

impl<P, F> std::fmt::Debug for ResilienceController<P, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceController")
            .field("executor", &self.executor)
            .field("tree", &self.tree)
            .field("config", &self.config)
            .finish()
    }
}

/// Background task calling `rebalance()` on a fixed period.
#[derive(Debug)]
pub struct RebalanceLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<usize>,
}

impl RebalanceLoop {
    /// Start the loop. The first pass runs one full `period` after spawn.
    pub fn spawn(tree: SharedLoadBalancingTree, period: Duration) -> ConfigResult<Self> {
        if period.is_zero() {
            return Err(ConfigError::invalid("rebalance_period", "must be non-zero"));
        }
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut passes = 0usize;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = tree.rebalance();
                        passes += 1;
                        debug!(pass = passes, transfers = report.transfers.len(), "Periodic rebalance");
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            passes
        });
        Ok(Self { shutdown, handle })
    }

    /// Signal the loop to stop and wait for it. Returns the number of
    /// passes it ran, or the join error if the task panicked.
    pub async fn stop(self) -> Result<usize, JoinError> {
        let _ = self.shutdown.send(true);
        self.handle.await.map_err(|e| {
            warn!(error = %e, "Rebalance loop did not exit cleanly");
            e
        })
    }
}
