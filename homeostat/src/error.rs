//! Error types for the controller
//!
//! Three families, one per surface:
//! - [`ConfigError`]: invalid construction parameters, fatal at startup
//! - [`ExecutionError`]: primary/fallback failures surfaced by the executor
//! - [`TreeError`]: routing and node bookkeeping failures

use std::path::PathBuf;
use thiserror::Error;

use crate::tree::NodeId;

/// Result type alias for configuration loading and validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for load-balancing tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// Invalid configuration. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Thresholds must satisfy `0 <= low < high <= 1`
    #[error("Invalid tension thresholds: low={low}, high={high} (require 0 <= low < high <= 1)")]
    InvalidThresholds { low: f64, high: f64 },

    /// A single option is out of range
    #[error("Invalid value for {option}: {message}")]
    InvalidValue {
        option: &'static str,
        message: String,
    },

    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for [`crate::config::ControllerConfig`]
    #[error("Invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    /// Create an out-of-range error for a named option
    pub fn invalid(option: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            option,
            message: message.into(),
        }
    }
}

/// Failure surfaced by [`crate::executor::ResilientExecutor`].
///
/// `BothFailed` reports the primary failure first: its `Display` and
/// `source()` both point at the primary cause, the fallback cause is kept
/// alongside for inspection.
#[derive(Debug, Error)]
pub enum ExecutionError<E>
where
    E: std::error::Error + 'static,
{
    /// Primary failed and no fallback is configured
    #[error("Primary operation failed: {0}")]
    PrimaryFailure(#[source] E),

    /// Fallback failed on the direct path (primary was skipped)
    #[error("Fallback operation failed: {0}")]
    FallbackFailure(#[source] E),

    /// Primary failed, then the fallback failed too
    #[error("Primary operation failed: {primary} (fallback also failed: {fallback})")]
    BothFailed {
        #[source]
        primary: E,
        fallback: E,
    },
}

impl<E> ExecutionError<E>
where
    E: std::error::Error + 'static,
{
    /// The failure the caller should act on: the primary cause when there
    /// was a primary attempt, the fallback cause otherwise.
    pub fn cause(&self) -> &E {
        match self {
            Self::PrimaryFailure(e) | Self::FallbackFailure(e) => e,
            Self::BothFailed { primary, .. } => primary,
        }
    }

    /// The fallback's failure, if the fallback ran and failed
    pub fn fallback_cause(&self) -> Option<&E> {
        match self {
            Self::PrimaryFailure(_) => None,
            Self::FallbackFailure(e) => Some(e),
            Self::BothFailed { fallback, .. } => Some(fallback),
        }
    }

    /// Whether the primary operation was attempted for this call
    pub fn primary_attempted(&self) -> bool {
        !matches!(self, Self::FallbackFailure(_))
    }

    /// Short machine-readable code, used in log fields
    pub fn code(&self) -> &'static str {
        match self {
            Self::PrimaryFailure(_) => "primary_failure",
            Self::FallbackFailure(_) => "fallback_failure",
            Self::BothFailed { .. } => "both_failed",
        }
    }
}

/// Errors from [`crate::tree::LoadBalancingTree`]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    /// No node can hold the weight and a grown node could not either
    #[error("Capacity exhausted: weight {weight} exceeds maximum node capacity {max_capacity}")]
    CapacityExhausted { weight: f64, max_capacity: f64 },

    /// Growth would exceed the configured node limit
    #[error("Growth limit reached: tree already holds {max_nodes} nodes")]
    GrowthLimitReached { max_nodes: usize },

    /// Weight is NaN, infinite, zero or negative
    #[error("Invalid weight: {0} (must be finite and > 0)")]
    InvalidWeight(f64),

    /// Node capacity is NaN, infinite, zero or negative
    #[error("Invalid capacity: {0} (must be finite and > 0)")]
    InvalidCapacity(f64),

    /// Direct placement on a node without enough spare capacity
    #[error("Node {node} cannot take weight {weight} (spare {spare})")]
    NodeFull { node: NodeId, weight: f64, spare: f64 },

    /// No node with this id in the tree
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
}
