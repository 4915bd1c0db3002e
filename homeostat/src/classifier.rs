//! Balance Classifier: tension → discrete operating state
//!
//! ```text
//!  0.0            low             high            1.0
//!   |── Nominal ───|── Observing ───|── Degraded ───|
//! ```
//!
//! Boundary values belong to the higher-tension bucket, so crossing a
//! threshold is monotonic: `classify(low) == Observing`,
//! `classify(high) == Degraded`.

use serde::{Deserialize, Serialize};

use crate::config::{validate_thresholds, ControllerConfig, DEFAULT_TENSION_HIGH, DEFAULT_TENSION_LOW};
use crate::error::ConfigResult;

/// Discrete operating state derived from tension.
///
/// Ordered by severity: `Nominal < Observing < Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceState {
    /// Tension below the low threshold.
    Nominal,
    /// Tension between the thresholds; primary still preferred.
    Observing,
    /// Tension at or above the high threshold; primary is skipped.
    Degraded,
}

impl BalanceState {
    /// Whether the primary path is attempted in this state.
    pub fn prefers_primary(&self) -> bool {
        !matches!(self, Self::Degraded)
    }
}

impl std::fmt::Display for BalanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nominal => write!(f, "nominal"),
            Self::Observing => write!(f, "observing"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Which leg the executor runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    Primary,
    Fallback,
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Threshold classifier. Pure and deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BalanceClassifier {
    low: f64,
    high: f64,
}

impl BalanceClassifier {
    /// Create a classifier. Fails unless `0 <= low < high <= 1`.
    pub fn new(low: f64, high: f64) -> ConfigResult<Self> {
        validate_thresholds(low, high)?;
        Ok(Self { low, high })
    }

    /// Create a classifier from the threshold options of a controller config.
    pub fn from_config(config: &ControllerConfig) -> ConfigResult<Self> {
        Self::new(config.tension_low, config.tension_high)
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    /// Map a tension value to a state. NaN is treated as maximal tension.
    pub fn classify(&self, tension: f64) -> BalanceState {
        if tension.is_nan() || tension >= self.high {
            BalanceState::Degraded
        } else if tension >= self.low {
            BalanceState::Observing
        } else {
            BalanceState::Nominal
        }
    }

    /// Execution path for a state.
    pub fn path_for(&self, state: BalanceState) -> ExecutionPath {
        if state.prefers_primary() {
            ExecutionPath::Primary
        } else {
            ExecutionPath::Fallback
        }
    }

    /// Classify and pick the path in one step.
    pub fn decide(&self, tension: f64) -> (BalanceState, ExecutionPath) {
        let state = self.classify(tension);
        (state, self.path_for(state))
    }
}

impl Default for BalanceClassifier {
    fn default() -> Self {
        Self {
            low: DEFAULT_TENSION_LOW,
            high: DEFAULT_TENSION_HIGH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buckets() {
        let c = BalanceClassifier::default();
        assert_eq!(c.classify(0.0), BalanceState::Nominal);
        assert_eq!(c.classify(0.29), BalanceState::Nominal);
        assert_eq!(c.classify(0.45), BalanceState::Observing);
        assert_eq!(c.classify(0.99), BalanceState::Degraded);
        assert_eq!(c.classify(1.0), BalanceState::Degraded);
    }

    #[test]
    fn test_boundaries_go_to_higher_bucket() {
        let c = BalanceClassifier::new(0.3, 0.6).unwrap();
        assert_eq!(c.classify(0.3), BalanceState::Observing);
        assert_eq!(c.classify(0.6), BalanceState::Degraded);
    }

    #[test]
    fn test_monotonic_over_grid() {
        let c = BalanceClassifier::new(0.2, 0.7).unwrap();
        let mut previous = BalanceState::Nominal;
        for i in 0..=1000 {
            let state = c.classify(i as f64 / 1000.0);
            assert!(state >= previous, "state regressed at {}", i);
            previous = state;
        }
        assert_eq!(previous, BalanceState::Degraded);
    }

    #[test]
    fn test_rejects_invalid_thresholds() {
        assert!(BalanceClassifier::new(0.5, 0.5).is_err());
        assert!(BalanceClassifier::new(0.6, 0.3).is_err());
        assert!(BalanceClassifier::new(-0.1, 0.3).is_err());
        assert!(BalanceClassifier::new(0.1, 1.1).is_err());
    }

    #[test]
    fn test_nan_is_degraded() {
        let c = BalanceClassifier::default();
        assert_eq!(c.classify(f64::NAN), BalanceState::Degraded);
    }

    #[test]
    fn test_path_selection() {
        let c = BalanceClassifier::default();
        assert_eq!(c.decide(0.1), (BalanceState::Nominal, ExecutionPath::Primary));
        assert_eq!(c.decide(0.4), (BalanceState::Observing, ExecutionPath::Primary));
        assert_eq!(c.decide(0.8), (BalanceState::Degraded, ExecutionPath::Fallback));
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(BalanceState::Observing.to_string(), "observing");
        let json = serde_json::to_string(&BalanceState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert!(BalanceState::Nominal < BalanceState::Observing);
        assert!(BalanceState::Observing < BalanceState::Degraded);
    }
}
