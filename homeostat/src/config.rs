//! Controller configuration
//!
//! Every option is caller-supplied at construction and validated eagerly.
//! Sources, in the order a deployment usually layers them:
//!
//! - [`ControllerConfig::default`]: built-in defaults
//! - [`ControllerConfig::from_toml_str`] / [`ControllerConfig::from_file`]:
//!   TOML with the same keys as the struct fields, all optional
//! - [`ControllerConfig::from_env`]: `HOMEOSTAT_*` environment overrides
//!
//! # Example
//!
//! ```toml
//! window_capacity = 200
//! min_samples = 20
//! tension_low = 0.25
//! tension_high = 0.5
//! default_node_capacity = 64.0
//! rebalance_variance_threshold = 0.2
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Default number of outcomes kept by the tension sensor.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// Default sample count below which tension reads as 0.
pub const DEFAULT_MIN_SAMPLES: usize = 10;

/// Default Nominal/Observing boundary.
pub const DEFAULT_TENSION_LOW: f64 = 0.3;

/// Default Observing/Degraded boundary.
pub const DEFAULT_TENSION_HIGH: f64 = 0.6;

/// Default capacity of autonomously grown nodes.
pub const DEFAULT_NODE_CAPACITY: f64 = 100.0;

/// Default load-percentage deviation that triggers a sibling transfer.
pub const DEFAULT_REBALANCE_THRESHOLD: f64 = 0.3;

/// Default upper bound on tree size.
pub const DEFAULT_MAX_NODES: usize = 1024;

/// Full controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Maximum outcomes retained by the tension sensor.
    pub window_capacity: usize,
    /// Samples below which tension defaults to 0.
    pub min_samples: usize,
    /// Tension at or above which the controller is Observing.
    pub tension_low: f64,
    /// Tension at or above which the controller is Degraded.
    pub tension_high: f64,
    /// Capacity assigned to nodes grown by routing.
    pub default_node_capacity: f64,
    /// Sibling load-percentage deviation that triggers a transfer.
    pub rebalance_variance_threshold: f64,
    /// Maximum number of nodes the tree may grow to.
    pub max_nodes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            min_samples: DEFAULT_MIN_SAMPLES,
            tension_low: DEFAULT_TENSION_LOW,
            tension_high: DEFAULT_TENSION_HIGH,
            default_node_capacity: DEFAULT_NODE_CAPACITY,
            rebalance_variance_threshold: DEFAULT_REBALANCE_THRESHOLD,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by environment variables, then validated.
    ///
    /// - `HOMEOSTAT_WINDOW_CAPACITY`
    /// - `HOMEOSTAT_MIN_SAMPLES`
    /// - `HOMEOSTAT_TENSION_LOW` / `HOMEOSTAT_TENSION_HIGH`
    /// - `HOMEOSTAT_NODE_CAPACITY`
    /// - `HOMEOSTAT_REBALANCE_THRESHOLD`
    /// - `HOMEOSTAT_MAX_NODES`
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().with_env_overrides().validated()
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validated()
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        debug!(path = %path.display(), "Loaded controller config file");
        config.with_env_overrides().validated()
    }

    /// Apply `HOMEOSTAT_*` overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("HOMEOSTAT_WINDOW_CAPACITY") {
            self.window_capacity = v;
        }
        if let Some(v) = env_parse::<usize>("HOMEOSTAT_MIN_SAMPLES") {
            self.min_samples = v;
        }
        if let Some(v) = env_parse::<f64>("HOMEOSTAT_TENSION_LOW") {
            self.tension_low = v;
        }
        if let Some(v) = env_parse::<f64>("HOMEOSTAT_TENSION_HIGH") {
            self.tension_high = v;
        }
        if let Some(v) = env_parse::<f64>("HOMEOSTAT_NODE_CAPACITY") {
            self.default_node_capacity = v;
        }
        if let Some(v) = env_parse::<f64>("HOMEOSTAT_REBALANCE_THRESHOLD") {
            self.rebalance_variance_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("HOMEOSTAT_MAX_NODES") {
            self.max_nodes = v;
        }
        self
    }

    /// Check every invariant the components rely on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.window_capacity == 0 {
            return Err(ConfigError::invalid("window_capacity", "must be at least 1"));
        }
        if self.min_samples > self.window_capacity {
            return Err(ConfigError::invalid(
                "min_samples",
                format!(
                    "{} exceeds window_capacity {}; tension would never leave 0",
                    self.min_samples, self.window_capacity
                ),
            ));
        }
        validate_thresholds(self.tension_low, self.tension_high)?;
        if !self.default_node_capacity.is_finite() || self.default_node_capacity <= 0.0 {
            return Err(ConfigError::invalid(
                "default_node_capacity",
                format!("{} must be finite and > 0", self.default_node_capacity),
            ));
        }
        if !self.rebalance_variance_threshold.is_finite() || self.rebalance_variance_threshold < 0.0
        {
            return Err(ConfigError::invalid(
                "rebalance_variance_threshold",
                format!("{} must be finite and >= 0", self.rebalance_variance_threshold),
            ));
        }
        if self.max_nodes == 0 {
            return Err(ConfigError::invalid("max_nodes", "must be at least 1"));
        }
        Ok(())
    }

    /// Validate and return `self`.
    pub fn validated(self) -> ConfigResult<Self> {
        self.validate()?;
        Ok(self)
    }
}

/// `0 <= low < high <= 1`, NaN rejected.
pub(crate) fn validate_thresholds(low: f64, high: f64) -> ConfigResult<()> {
    let ordered = low >= 0.0 && low < high && high <= 1.0;
    if ordered {
        Ok(())
    } else {
        Err(ConfigError::InvalidThresholds { low, high })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
