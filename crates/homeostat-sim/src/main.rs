//! Homeostat simulation driver
//!
//! Runs a flaky primary backend and a reliable fallback through a
//! [`ResilienceController`], routes each request's weight through the
//! controller's load-balancing tree, rebalances on a timer, and prints the
//! final health as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 400 requests, primary outage on calls 100..220
//! homeostat-sim
//!
//! # Longer outage, more workers, config from file
//! homeostat-sim --requests 1000 --outage-start 200 --outage-len 400 --workers 8 --config homeostat.toml
//!
//! # Verbose controller logs
//! RUST_LOG=homeostat=debug homeostat-sim
//! ```

mod workload;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use homeostat::{
    ControllerConfig, HealthSnapshot, NodeId, RebalanceAction, ResilienceController, TreeSnapshot,
};
use serde::Serialize;
use tracing::{info, warn};

use workload::{Request, RequestStream, SimulatedBackend};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML controller config (HOMEOSTAT_* env vars still override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total requests to run
    #[arg(long, default_value_t = 400)]
    requests: u64,

    /// Concurrent workers sharing the controller
    #[arg(long, default_value_t = 4)]
    workers: u64,

    /// First primary call that fails
    #[arg(long, default_value_t = 100)]
    outage_start: u64,

    /// Number of consecutive failing primary calls
    #[arg(long, default_value_t = 120)]
    outage_len: u64,

    /// Smallest request weight
    #[arg(long, default_value_t = 1.0)]
    min_weight: f64,

    /// Largest request weight
    #[arg(long, default_value_t = 20.0)]
    max_weight: f64,

    /// Requests a worker keeps routed before releasing the oldest
    #[arg(long, default_value_t = 8)]
    in_flight: usize,

    /// Milliseconds between rebalance passes
    #[arg(long, default_value_t = 25)]
    rebalance_ms: u64,

    /// Simulated backend latency in milliseconds
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,

    /// Seed for the request weight stream
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Include every tree node in the JSON output
    #[arg(long, default_value_t = false)]
    dump_tree: bool,
}

#[derive(Debug, Default)]
struct Counters {
    served_by_primary: AtomicU64,
    served_by_fallback: AtomicU64,
    failed: AtomicU64,
    switched_to_fallback: AtomicU64,
    skipped_primary: AtomicU64,
    routed: AtomicU64,
    route_errors: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Summary {
    requests: u64,
    served_by_primary: u64,
    served_by_fallback: u64,
    failed: u64,
    switched_to_fallback: u64,
    skipped_primary: u64,
    routed: u64,
    route_errors: u64,
    primary_calls: u64,
    fallback_calls: u64,
    rebalance_passes: usize,
    health: HealthSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    tree: Option<TreeSnapshot>,
}

type SimController = ResilienceController<SimulatedBackend, SimulatedBackend>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if !(args.min_weight > 0.0 && args.min_weight <= args.max_weight) {
        anyhow::bail!(
            "weights must satisfy 0 < min ({}) <= max ({})",
            args.min_weight,
            args.max_weight
        );
    }

    let config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load controller config from {}", path.display()))?,
        None => ControllerConfig::from_env().context("Invalid HOMEOSTAT_* environment")?,
    };

    let latency = Duration::from_millis(args.latency_ms);
    let outage = args.outage_start..args.outage_start.saturating_add(args.outage_len);
    let controller: Arc<SimController> = Arc::new(ResilienceController::new(
        SimulatedBackend::new("primary", outage.clone(), latency),
        SimulatedBackend::reliable("fallback", latency),
        config,
    )?);

    info!(
        requests = args.requests,
        workers = args.workers,
        outage_start = outage.start,
        outage_end = outage.end,
        "Simulation starting"
    );

    let rebalancer = controller.spawn_rebalancer(Duration::from_millis(args.rebalance_ms.max(1)))?;
    let counters = Arc::new(Counters::default());

    let workers = args.workers.max(1);
    let mut handles = Vec::with_capacity(workers as usize);
    for worker in 0..workers {
        let share = args.requests / workers + u64::from(worker < args.requests % workers);
        let stream = RequestStream::new(args.seed.wrapping_add(worker), args.min_weight, args.max_weight);
        let controller = controller.clone();
        let counters = counters.clone();
        let in_flight = args.in_flight;
        handles.push(tokio::spawn(async move {
            run_worker(worker, &controller, &counters, stream.take(share as usize), in_flight).await
        }));
    }
    for handle in handles {
        handle.await.context("Worker task panicked")?;
    }

    let rebalance_passes = rebalancer.stop().await.context("Rebalance loop panicked")?;
    let final_pass = controller.rebalance();
    info!(
        transfers = final_pass.transfers.len(),
        score = final_pass.score_after,
        "Final rebalance"
    );

    let summary = Summary {
        requests: args.requests,
        served_by_primary: counters.served_by_primary.load(Ordering::Relaxed),
        served_by_fallback: counters.served_by_fallback.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        switched_to_fallback: counters.switched_to_fallback.load(Ordering::Relaxed),
        skipped_primary: counters.skipped_primary.load(Ordering::Relaxed),
        routed: counters.routed.load(Ordering::Relaxed),
        route_errors: counters.route_errors.load(Ordering::Relaxed),
        primary_calls: controller.executor().primary().calls(),
        fallback_calls: controller
            .executor()
            .fallback()
            .map(SimulatedBackend::calls)
            .unwrap_or(0),
        rebalance_passes,
        health: controller.status(),
        tree: args.dump_tree.then(|| controller.tree_snapshot()),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
    );
    Ok(())
}

/// Execute and route one worker's share of the stream.
async fn run_worker(
    worker: u64,
    controller: &SimController,
    counters: &Counters,
    requests: impl Iterator<Item = Request>,
    in_flight: usize,
) {
    let mut held: VecDeque<(NodeId, f64)> = VecDeque::with_capacity(in_flight + 1);

    for request in requests {
        let result = controller.execute_async(&request).await;
        match result.rebalance_action() {
            Some(RebalanceAction::SwitchedToFallback) => {
                counters.switched_to_fallback.fetch_add(1, Ordering::Relaxed);
            }
            Some(RebalanceAction::SkippedPrimary) => {
                counters.skipped_primary.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
        let used_fallback = result.used_fallback();
        match result.into_result() {
            Ok(_) if used_fallback => {
                counters.served_by_fallback.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                counters.served_by_primary.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker, request = request.id, code = e.code(), error = %e, "Request failed");
                continue;
            }
        }

        match controller.route(request.weight) {
            Ok(node) => {
                counters.routed.fetch_add(1, Ordering::Relaxed);
                held.push_back((node, request.weight));
            }
            Err(e) => {
                counters.route_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, request = request.id, error = %e, "Routing failed");
            }
        }

        while held.len() > in_flight {
            if let Some((node, weight)) = held.pop_front() {
                if let Err(e) = controller.release(node, weight) {
                    warn!(worker, node = %node, error = %e, "Release failed");
                }
            }
        }
    }
}
