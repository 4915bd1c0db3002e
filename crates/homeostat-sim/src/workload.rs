//! Simulated backends and request stream.
//!
//! Everything is deterministic: the primary fails exactly inside its outage
//! window (counted in calls), and weights come from a fixed LCG seed.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use homeostat::AsyncOperation;
use serde::Serialize;

/// One unit of simulated work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Request {
    pub id: u64,
    pub weight: f64,
}

/// Response tagged with the backend that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub request_id: u64,
    pub served_by: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{backend} unavailable (call {call} inside outage)")]
    Outage { backend: &'static str, call: u64 },
}

/// Backend that fails for every call whose index falls in `outage`.
#[derive(Debug)]
pub struct SimulatedBackend {
    name: &'static str,
    outage: Range<u64>,
    latency: Duration,
    calls: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(name: &'static str, outage: Range<u64>, latency: Duration) -> Self {
        Self {
            name,
            outage,
            latency,
            calls: AtomicU64::new(0),
        }
    }

    /// Backend that never fails.
    pub fn reliable(name: &'static str, latency: Duration) -> Self {
        Self::new(name, 0..0, latency)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AsyncOperation<Request> for SimulatedBackend {
    type Output = Response;
    type Error = BackendError;

    async fn run(&self, request: &Request) -> Result<Response, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.outage.contains(&call) {
            return Err(BackendError::Outage {
                backend: self.name,
                call,
            });
        }
        Ok(Response {
            request_id: request.id,
            served_by: self.name,
        })
    }
}

/// Deterministic request generator with weights in `[min, max]`.
#[derive(Debug, Clone)]
pub struct RequestStream {
    next_id: u64,
    state: u64,
    min: f64,
    max: f64,
}

impl RequestStream {
    pub fn new(seed: u64, min: f64, max: f64) -> Self {
        Self {
            next_id: 0,
            state: seed,
            min,
            max,
        }
    }
}

impl Iterator for RequestStream {
    type Item = Request;

    fn next(&mut self) -> Option<Request> {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let unit = (self.state >> 11) as f64 / (1u64 << 53) as f64;
        let request = Request {
            id: self.next_id,
            weight: self.min + unit * (self.max - self.min),
        };
        self.next_id += 1;
        Some(request)
    }
}
