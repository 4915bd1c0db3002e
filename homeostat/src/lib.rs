//! Homeostat: a self-measuring resilience controller
//!
//! This library provides:
//! - A sliding-window tension sensor over recent successes and failures
//! - A threshold classifier mapping tension to Nominal/Observing/Degraded
//! - A primary/fallback executor that switches paths from its own health
//! - A capacity-bounded load-balancing tree that grows and rebalances itself
//!
//! # Components
//!
//! ## Execution
//! - [`TensionSensor`]: bounded outcome window, O(1) tension read
//! - [`BalanceClassifier`]: tension → [`BalanceState`]
//! - [`ResilientExecutor`]: sync closures or [`AsyncOperation`] legs
//!
//! ## Load distribution
//! - [`LoadBalancingTree`]: arena of [`WeightedNode`]s addressed by [`NodeId`]
//! - [`SharedLoadBalancingTree`]: lock-protected handle for concurrent routers
//!
//! ## Together
//! - [`ResilienceController`]: one executor plus one tree, with a
//!   serializable [`HealthSnapshot`]
//!
//! # Usage
//!
//! ```rust,ignore
//! use homeostat::{ControllerConfig, ResilienceController};
//!
//! let controller = ResilienceController::new(
//!     |key: &str| primary_lookup(key),
//!     |key: &str| cached_lookup(key),
//!     ControllerConfig::from_env()?,
//! )?;
//!
//! let result = controller.execute("user:42");
//! let node = controller.route(12.5)?;
//! println!("{}", serde_json::to_string(&controller.status())?);
//! ```

pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod sensor;
pub mod telemetry;
pub mod tree;

// Re-export key types
pub use classifier::{BalanceClassifier, BalanceState, ExecutionPath};
pub use config::ControllerConfig;
pub use controller::{HealthSnapshot, RebalanceLoop, ResilienceController};
pub use error::{ConfigError, ConfigResult, ExecutionError, TreeError, TreeResult};
pub use executor::{
    AsyncOperation, ExecutionResult, ExecutorStatus, RebalanceAction, ResilientExecutor,
    SharedExecutor,
};
pub use sensor::{Outcome, SensorSnapshot, TensionSensor};
pub use tree::{
    LoadBalancingTree, NodeId, NodeState, RebalanceReport, SharedLoadBalancingTree, Transfer,
    TransferReason, TreeSnapshot, WeightedNode,
};
