//! Resilient Executor: tension-aware primary/fallback execution
//!
//! Wraps a primary and a fallback operation. Each call reads the sensor,
//! classifies, runs the chosen path and feeds the outcome back.
//!
//! # Design
//!
//! ```text
//! execute(input)
//!   ├─ Nominal | Observing → primary
//!   │    ├─ Ok             → record success, state as decided, no action
//!   │    └─ Err            → record failure, run fallback once
//!   │         ├─ Ok        → Degraded, switched_to_fallback
//!   │         └─ Err       → record failure, BothFailed (primary cause first)
//!   └─ Degraded → fallback only
//!        ├─ Ok             → record success, Degraded, skipped_primary
//!        └─ Err            → record failure, FallbackFailure
//! ```
//!
//! A fallback that rescues a failed primary is not recorded as a success:
//! the sensor measures the preferred path. On the direct path the fallback
//! outcome is recorded either way, which lets tension decay and the primary
//! be probed again once the window recovers.
//!
//! The sensor lock is only held for the read and for each record, never
//! while an operation runs.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn, Instrument};

use crate::classifier::{BalanceClassifier, BalanceState, ExecutionPath};
use crate::config::ControllerConfig;
use crate::error::{ConfigResult, ExecutionError};
use crate::sensor::{SensorSnapshot, TensionSensor};
use crate::telemetry;

/// Shared reference to a ResilientExecutor
pub type SharedExecutor<P, F> = Arc<ResilientExecutor<P, F>>;

/// Async leg of an executor.
///
/// Sync legs are plain closures `Fn(&I) -> Result<T, E>`; async legs
/// implement this trait.
#[async_trait]
pub trait AsyncOperation<I: Sync + ?Sized>: Send + Sync {
    type Output: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn run(&self, input: &I) -> Result<Self::Output, Self::Error>;
}

/// Autonomous action the executor took on a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceAction {
    /// Primary failed and the fallback was attempted.
    SwitchedToFallback,
    /// Degraded: the primary was not attempted.
    SkippedPrimary,
}

impl RebalanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SwitchedToFallback => "switched_to_fallback",
            Self::SkippedPrimary => "skipped_primary",
        }
    }
}

impl std::fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `execute` call.
#[derive(Debug)]
pub struct ExecutionResult<T, E>
where
    E: std::error::Error + 'static,
{
    value: Result<T, ExecutionError<E>>,
    state: BalanceState,
    tension: f64,
    rebalance_action: Option<RebalanceAction>,
}

impl<T, E> ExecutionResult<T, E>
where
    E: std::error::Error + 'static,
{
    fn new(
        value: Result<T, ExecutionError<E>>,
        state: BalanceState,
        tension: f64,
        rebalance_action: Option<RebalanceAction>,
    ) -> Self {
        Self {
            value,
            state,
            tension,
            rebalance_action,
        }
    }

    /// Produced value or error.
    pub fn value(&self) -> &Result<T, ExecutionError<E>> {
        &self.value
    }

    /// State the call was served in.
    pub fn state(&self) -> BalanceState {
        self.state
    }

    /// Tension read at decision time.
    pub fn tension(&self) -> f64 {
        self.tension
    }

    pub fn rebalance_action(&self) -> Option<RebalanceAction> {
        self.rebalance_action
    }

    pub fn is_ok(&self) -> bool {
        self.value.is_ok()
    }

    /// Whether the fallback leg served or attempted this call.
    pub fn used_fallback(&self) -> bool {
        self.rebalance_action.is_some()
    }

    /// Drop the metadata and keep the value.
    pub fn into_result(self) -> Result<T, ExecutionError<E>> {
        self.value
    }
}

/// Point-in-time executor health.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub state: BalanceState,
    pub tension: f64,
}

#[derive(Debug, Clone, Copy)]
struct Decision {
    state: BalanceState,
    tension: f64,
    path: ExecutionPath,
}

/// Primary/fallback executor driven by its own tension sensor.
pub struct ResilientExecutor<P, F> {
    name: String,
    primary: P,
    fallback: Option<F>,
    sensor: RwLock<TensionSensor>,
    classifier: BalanceClassifier,
}

impl<P> ResilientExecutor<P, P> {
    /// Executor without a fallback. Primary failures surface as
    /// [`ExecutionError::PrimaryFailure`] and the primary is attempted in
    /// every state.
    pub fn primary_only(primary: P, config: &ControllerConfig) -> ConfigResult<Self> {
        Ok(Self::from_parts(
            primary,
            None,
            TensionSensor::from_config(config)?,
            BalanceClassifier::from_config(config)?,
        ))
    }
}

impl<P, F> ResilientExecutor<P, F> {
    /// Create an executor with sensor and classifier built from `config`.
    pub fn new(primary: P, fallback: F, config: &ControllerConfig) -> ConfigResult<Self> {
        Ok(Self::from_parts(
            primary,
            Some(fallback),
            TensionSensor::from_config(config)?,
            BalanceClassifier::from_config(config)?,
        ))
    }

    /// Assemble from pre-built components.
    pub fn from_parts(
        primary: P,
        fallback: Option<F>,
        sensor: TensionSensor,
        classifier: BalanceClassifier,
    ) -> Self {
        Self {
            name: "executor".to_string(),
            primary,
            fallback,
            sensor: RwLock::new(sensor),
            classifier,
        }
    }

    /// Name used in log fields.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create a shared reference to this executor
    pub fn shared(self) -> SharedExecutor<P, F> {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&F> {
        self.fallback.as_ref()
    }

    pub fn classifier(&self) -> &BalanceClassifier {
        &self.classifier
    }

    pub fn tension(&self) -> f64 {
        self.read_sensor().tension()
    }

    pub fn state(&self) -> BalanceState {
        self.classifier.classify(self.tension())
    }

    pub fn status(&self) -> ExecutorStatus {
        let tension = self.tension();
        ExecutorStatus {
            state: self.classifier.classify(tension),
            tension,
        }
    }

    pub fn sensor_snapshot(&self) -> SensorSnapshot {
        self.read_sensor().snapshot()
    }

    /// Forget all recorded outcomes.
    pub fn reset(&self) {
        self.write_sensor().reset();
    }

    /// Run one call through the synchronous legs.
    pub fn execute<I, T, E>(&self, input: &I) -> ExecutionResult<T, E>
    where
        I: ?Sized,
        P: Fn(&I) -> Result<T, E>,
        F: Fn(&I) -> Result<T, E>,
        E: std::error::Error + 'static,
    {
        let decision = self.decide();
        let span = telemetry::execute_span(decision.state, decision.tension);
        let _guard = span.enter();

        let result = match (decision.path, self.fallback.as_ref()) {
            (ExecutionPath::Fallback, Some(fallback)) => {
                let outcome = fallback(input);
                self.settle_direct(decision, outcome)
            }
            (_, fallback) => match (self.primary)(input) {
                Ok(value) => self.settle_primary_success(decision, value),
                Err(primary_err) => {
                    self.primary_failed(&primary_err);
                    match fallback {
                        Some(fallback) => {
                            let outcome = fallback(input);
                            self.settle_switched(decision, primary_err, outcome)
                        }
                        None => Self::settle_primary_only(decision, primary_err),
                    }
                }
            },
        };

        telemetry::record_execute_result(
            &span,
            result.is_ok(),
            result.rebalance_action.map(|a| a.as_str()),
        );
        result
    }

    /// Run one call through the async legs. Same semantics as [`Self::execute`].
    pub async fn execute_async<I>(&self, input: &I) -> ExecutionResult<P::Output, P::Error>
    where
        I: Sync + ?Sized,
        P: AsyncOperation<I>,
        F: AsyncOperation<I, Output = P::Output, Error = P::Error>,
    {
        let decision = self.decide();
        let span = telemetry::execute_span(decision.state, decision.tension);

        let result = async {
            match (decision.path, self.fallback.as_ref()) {
                (ExecutionPath::Fallback, Some(fallback)) => {
                    let outcome = fallback.run(input).await;
                    self.settle_direct(decision, outcome)
                }
                (_, fallback) => match self.primary.run(input).await {
                    Ok(value) => self.settle_primary_success(decision, value),
                    Err(primary_err) => {
                        self.primary_failed(&primary_err);
                        match fallback {
                            Some(fallback) => {
                                let outcome = fallback.run(input).await;
                                self.settle_switched(decision, primary_err, outcome)
                            }
                            None => Self::settle_primary_only(decision, primary_err),
                        }
                    }
                },
            }
        }
        .instrument(span.clone())
        .await;

        telemetry::record_execute_result(
            &span,
            result.is_ok(),
            result.rebalance_action.map(|a| a.as_str()),
        );
        result
    }

    // =========================================================================
    // Decision and settlement
    // =========================================================================

    fn decide(&self) -> Decision {
        let tension = self.tension();
        let (state, path) = self.classifier.decide(tension);
        // Nothing to fall back to: keep using the primary.
        let path = if self.fallback.is_none() {
            ExecutionPath::Primary
        } else {
            path
        };
        Decision {
            state,
            tension,
            path,
        }
    }

    fn settle_primary_success<T, E>(&self, decision: Decision, value: T) -> ExecutionResult<T, E>
    where
        E: std::error::Error + 'static,
    {
        self.write_sensor().record_success();
        ExecutionResult::new(Ok(value), decision.state, decision.tension, None)
    }

    fn primary_failed<E: std::error::Error>(&self, err: &E) {
        self.write_sensor().record_failure();
        debug!(executor = %self.name, error = %err, "Primary operation failed");
    }

    fn settle_primary_only<T, E>(decision: Decision, err: E) -> ExecutionResult<T, E>
    where
        E: std::error::Error + 'static,
    {
        ExecutionResult::new(
            Err(ExecutionError::PrimaryFailure(err)),
            decision.state,
            decision.tension,
            None,
        )
    }

    fn settle_switched<T, E>(
        &self,
        decision: Decision,
        primary_err: E,
        outcome: Result<T, E>,
    ) -> ExecutionResult<T, E>
    where
        E: std::error::Error + 'static,
    {
        let action = Some(RebalanceAction::SwitchedToFallback);
        match outcome {
            Ok(value) => {
                debug!(executor = %self.name, "Served by fallback after primary failure");
                ExecutionResult::new(Ok(value), BalanceState::Degraded, decision.tension, action)
            }
            Err(fallback_err) => {
                self.write_sensor().record_failure();
                warn!(
                    executor = %self.name,
                    primary = %primary_err,
                    fallback = %fallback_err,
                    "Primary and fallback both failed"
                );
                ExecutionResult::new(
                    Err(ExecutionError::BothFailed {
                        primary: primary_err,
                        fallback: fallback_err,
                    }),
                    BalanceState::Degraded,
                    decision.tension,
                    action,
                )
            }
        }
    }

    fn settle_direct<T, E>(&self, decision: Decision, outcome: Result<T, E>) -> ExecutionResult<T, E>
    where
        E: std::error::Error + 'static,
    {
        self.write_sensor().record(outcome.is_ok());
        let value = outcome.map_err(|err| {
            warn!(executor = %self.name, error = %err, "Fallback failed with primary skipped");
            ExecutionError::FallbackFailure(err)
        });
        ExecutionResult::new(
            value,
            BalanceState::Degraded,
            decision.tension,
            Some(RebalanceAction::SkippedPrimary),
        )
    }

    // A poisoned sensor is recovered rather than surfaced: the window is
    // soft state and never held across a leg.
    fn read_sensor(&self) -> RwLockReadGuard<'_, TensionSensor> {
        self.sensor.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sensor(&self) -> RwLockWriteGuard<'_, TensionSensor> {
        self.sensor.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P, F> std::fmt::Debug for ResilientExecutor<P, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("name", &self.name)
            .field("has_fallback", &self.fallback.is_some())
            .field("classifier", &self.classifier)
            .field("sensor", &self.sensor_snapshot())
            .finish()
    }
}
