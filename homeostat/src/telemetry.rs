//! Tracing span helpers
//!
//! Structured `tracing` spans for the three control-loop operations. Field
//! names use OpenTelemetry-style dot notation so a subscriber can export
//! them unchanged.
//!
//! # Span Hierarchy
//!
//! ```text
//! homeostat.execute     (one per ResilientExecutor call)
//! homeostat.route       (one per LoadBalancingTree::route)
//! homeostat.rebalance   (one per rebalance pass)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let span = telemetry::execute_span(BalanceState::Nominal, 0.12);
//! let _guard = span.enter();
//! // ... run the legs ...
//! telemetry::record_execute_result(&span, true, Some("switched_to_fallback"));
//! ```

use tracing::Span;

use crate::classifier::BalanceState;

// ── Span Name Constants ──────────────────────────────────────────────

/// One executor invocation.
pub const SPAN_EXECUTE: &str = "homeostat.execute";

/// One routing decision.
pub const SPAN_ROUTE: &str = "homeostat.route";

/// One rebalance pass over the tree.
pub const SPAN_REBALANCE: &str = "homeostat.rebalance";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_STATE: &str = "homeostat.state";
pub const FIELD_TENSION: &str = "homeostat.tension";
pub const FIELD_SUCCESS: &str = "homeostat.success";
pub const FIELD_ACTION: &str = "homeostat.action";
pub const FIELD_WEIGHT: &str = "homeostat.route.weight";
pub const FIELD_NODE: &str = "homeostat.route.node";
pub const FIELD_GREW: &str = "homeostat.route.grew";
pub const FIELD_NODE_COUNT: &str = "homeostat.tree.node_count";
pub const FIELD_TRANSFERS: &str = "homeostat.rebalance.transfers";
pub const FIELD_SCORE_BEFORE: &str = "homeostat.rebalance.score_before";
pub const FIELD_SCORE_AFTER: &str = "homeostat.rebalance.score_after";

// ── Span Builders ────────────────────────────────────────────────────

/// Span for one executor call.
///
/// Fields filled at creation: state, tension.
/// Fields filled later via [`record_execute_result`]: success, action.
pub fn execute_span(state: BalanceState, tension: f64) -> Span {
    tracing::debug_span!(
        "homeostat.execute",
        "homeostat.state" = %state,
        "homeostat.tension" = tension,
        "homeostat.success" = tracing::field::Empty,
        "homeostat.action" = tracing::field::Empty,
    )
}

/// Record how an executor call settled.
pub fn record_execute_result(span: &Span, success: bool, action: Option<&str>) {
    span.record("homeostat.success", success);
    if let Some(action) = action {
        span.record("homeostat.action", action);
    }
}

/// Span for one routing decision.
///
/// Fields filled later via [`record_route_result`]: node, grew.
pub fn route_span(weight: f64, node_count: usize) -> Span {
    tracing::debug_span!(
        "homeostat.route",
        "homeostat.route.weight" = weight,
        "homeostat.tree.node_count" = node_count as u64,
        "homeostat.route.node" = tracing::field::Empty,
        "homeostat.route.grew" = tracing::field::Empty,
    )
}

/// Record where a routed weight landed.
pub fn record_route_result(span: &Span, node: &str, grew: bool) {
    span.record("homeostat.route.node", node);
    span.record("homeostat.route.grew", grew);
}

/// Span for one rebalance pass.
///
/// Fields filled later via [`record_rebalance_result`]: transfers, scores.
pub fn rebalance_span(node_count: usize) -> Span {
    tracing::info_span!(
        "homeostat.rebalance",
        "homeostat.tree.node_count" = node_count as u64,
        "homeostat.rebalance.transfers" = tracing::field::Empty,
        "homeostat.rebalance.score_before" = tracing::field::Empty,
        "homeostat.rebalance.score_after" = tracing::field::Empty,
    )
}

/// Record the outcome of a rebalance pass.
pub fn record_rebalance_result(span: &Span, transfers: usize, score_before: f64, score_after: f64) {
    span.record("homeostat.rebalance.transfers", transfers as u64);
    span.record("homeostat.rebalance.score_before", score_before);
    span.record("homeostat.rebalance.score_after", score_after);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names_use_crate_prefix() {
        for name in [SPAN_EXECUTE, SPAN_ROUTE, SPAN_REBALANCE] {
            assert!(name.starts_with("homeostat."));
        }
        for field in [FIELD_STATE, FIELD_TENSION, FIELD_WEIGHT, FIELD_TRANSFERS] {
            assert!(field.starts_with("homeostat."));
        }
    }

    #[test]
    fn test_spans_accept_late_fields_without_subscriber() {
        let span = execute_span(BalanceState::Observing, 0.4);
        record_execute_result(&span, false, Some("switched_to_fallback"));

        let span = route_span(3.5, 4);
        record_route_result(&span, "node-2", false);

        let span = rebalance_span(4);
        record_rebalance_result(&span, 2, 0.2, 0.05);
    }
}
