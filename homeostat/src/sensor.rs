//! Tension Sensor: sliding-window success/failure history
//!
//! Keeps the most recent `capacity` outcomes and derives a scalar tension
//! from them:
//!
//! ```text
//! tension = 1 - successes / total      (total >= min_samples)
//! tension = 0                          (total <  min_samples, optimistic)
//! ```
//!
//! The success count is maintained on insert/evict, so [`TensionSensor::tension`]
//! is O(1). The sensor itself is not synchronized; owners serialize access
//! (the executor keeps it behind a lock).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::error::{ConfigError, ConfigResult};

/// A single recorded outcome. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Monotonic sequence number, unique per sensor.
    pub seq: u64,
    /// Whether the observed call succeeded.
    pub success: bool,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Bounded outcome window with a running success count.
#[derive(Debug, Clone)]
pub struct TensionSensor {
    window: VecDeque<Outcome>,
    capacity: usize,
    min_samples: usize,
    successes: usize,
    next_seq: u64,
}

impl TensionSensor {
    /// Create a sensor. Fails if `capacity == 0` or `min_samples > capacity`.
    pub fn new(capacity: usize, min_samples: usize) -> ConfigResult<Self> {
        if capacity == 0 {
            return Err(ConfigError::invalid("window_capacity", "must be at least 1"));
        }
        if min_samples > capacity {
            return Err(ConfigError::invalid(
                "min_samples",
                format!("{} exceeds window_capacity {}", min_samples, capacity),
            ));
        }
        Ok(Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_samples,
            successes: 0,
            next_seq: 0,
        })
    }

    /// Create a sensor from the window options of a controller config.
    pub fn from_config(config: &ControllerConfig) -> ConfigResult<Self> {
        Self::new(config.window_capacity, config.min_samples)
    }

    /// Append an outcome, evicting the oldest when full.
    pub fn record(&mut self, success: bool) -> Outcome {
        if self.window.len() == self.capacity {
            if let Some(evicted) = self.window.pop_front() {
                if evicted.success {
                    self.successes -= 1;
                }
            }
        }

        let outcome = Outcome {
            seq: self.next_seq,
            success,
            recorded_at: Utc::now(),
        };
        self.next_seq += 1;
        if success {
            self.successes += 1;
        }
        self.window.push_back(outcome);
        outcome
    }

    /// Record a success.
    pub fn record_success(&mut self) -> Outcome {
        self.record(true)
    }

    /// Record a failure.
    pub fn record_failure(&mut self) -> Outcome {
        self.record(false)
    }

    /// Failure rate over the window, 0 below `min_samples`.
    pub fn tension(&self) -> f64 {
        let total = self.window.len();
        if total == 0 || total < self.min_samples {
            return 0.0;
        }
        let rate = self.successes as f64 / total as f64;
        (1.0 - rate).clamp(0.0, 1.0)
    }

    /// Raw success rate over the window (1.0 when empty).
    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            1.0
        } else {
            self.successes as f64 / self.window.len() as f64
        }
    }

    /// Whether enough samples exist for tension to be measured.
    pub fn is_warm(&self) -> bool {
        !self.window.is_empty() && self.window.len() >= self.min_samples
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn failures(&self) -> usize {
        self.window.len() - self.successes
    }

    /// Most recently recorded outcome still in the window.
    pub fn last(&self) -> Option<&Outcome> {
        self.window.back()
    }

    /// Outcomes oldest-first.
    pub fn outcomes(&self) -> impl Iterator<Item = &Outcome> {
        self.window.iter()
    }

    /// Drop all history; tension returns to the optimistic default.
    ///
    /// Sequence numbers keep increasing across resets.
    pub fn reset(&mut self) {
        self.window.clear();
        self.successes = 0;
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            tension: self.tension(),
            samples: self.window.len(),
            successes: self.successes,
            failures: self.failures(),
            capacity: self.capacity,
            min_samples: self.min_samples,
            last_seq: self.window.back().map(|o| o.seq),
        }
    }
}

impl Default for TensionSensor {
    fn default() -> Self {
        Self {
            window: VecDeque::with_capacity(crate::config::DEFAULT_WINDOW_CAPACITY),
            capacity: crate::config::DEFAULT_WINDOW_CAPACITY,
            min_samples: crate::config::DEFAULT_MIN_SAMPLES,
            successes: 0,
            next_seq: 0,
        }
    }
}

/// Serializable view of a sensor's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub tension: f64,
    pub samples: usize,
    pub successes: usize,
    pub failures: usize,
    pub capacity: usize,
    pub min_samples: usize,
    pub last_seq: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_window() {
        assert!(TensionSensor::new(0, 0).is_err());
        assert!(TensionSensor::new(5, 6).is_err());
        assert!(TensionSensor::new(5, 5).is_ok());
    }

    #[test]
    fn test_optimistic_below_min_samples() {
        let mut sensor = TensionSensor::new(100, 10).unwrap();
        for _ in 0..9 {
            sensor.record_failure();
        }
        assert_eq!(sensor.tension(), 0.0);
        assert!(!sensor.is_warm());

        sensor.record_failure();
        assert!(sensor.is_warm());
        assert_eq!(sensor.tension(), 1.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut sensor = TensionSensor::new(10, 10).unwrap();
        for _ in 0..10 {
            sensor.record_failure();
        }
        sensor.record_success();

        assert_eq!(sensor.len(), 10);
        assert_eq!(sensor.successes(), 1);
        assert_eq!(sensor.failures(), 9);
        assert!((sensor.tension() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_running_count_tracks_evicted_successes() {
        let mut sensor = TensionSensor::new(4, 1).unwrap();
        for _ in 0..4 {
            sensor.record_success();
        }
        assert_eq!(sensor.tension(), 0.0);

        for _ in 0..4 {
            sensor.record_failure();
        }
        assert_eq!(sensor.successes(), 0);
        assert_eq!(sensor.tension(), 1.0);

        sensor.record_success();
        sensor.record_success();
        assert_eq!(sensor.successes(), 2);
        assert!((sensor.tension() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_tension_bounded_for_mixed_sequences() {
        for pattern in 1u32..64 {
            let mut sensor = TensionSensor::new(7, 3).unwrap();
            for step in 0..40 {
                sensor.record((pattern >> (step % 6)) & 1 == 1);
                let t = sensor.tension();
                assert!((0.0..=1.0).contains(&t), "tension {} out of range", t);
                assert!(sensor.len() <= sensor.capacity());
            }
        }
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let mut sensor = TensionSensor::new(3, 1).unwrap();
        let seqs: Vec<u64> = (0..6).map(|i| sensor.record(i % 2 == 0).seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);

        let retained: Vec<u64> = sensor.outcomes().map(|o| o.seq).collect();
        assert_eq!(retained, vec![3, 4, 5]);

        sensor.reset();
        assert!(sensor.is_empty());
        assert_eq!(sensor.tension(), 0.0);
        assert_eq!(sensor.record_success().seq, 6);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut sensor = TensionSensor::new(10, 2).unwrap();
        sensor.record_success();
        sensor.record_failure();

        let snap = sensor.snapshot();
        assert_eq!(snap.samples, 2);
        assert_eq!(snap.last_seq, Some(1));
        assert!((snap.tension - 0.5).abs() < 1e-12);

        let json = serde_json::to_string(&snap).unwrap();
        let parsed: SensorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snap);
    }
}
