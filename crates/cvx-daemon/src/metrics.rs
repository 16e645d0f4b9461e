// SPDX-License-Identifier: MIT OR Apache-2.0
//! Invocation counters exposed via `GET /metrics`.

use cvx_exec::{ErrorClass, ExecError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide conversion counters.
#[derive(Debug, Default)]
pub struct ConvertMetrics {
    invocations: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    in_flight: AtomicU64,
    bytes_streamed: AtomicU64,
}

/// Point-in-time copy of [`ConvertMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tool processes started (or attempted).
    pub invocations: u64,
    /// Invocations whose tool exited zero.
    pub succeeded: u64,
    /// Invocations that failed for any reason other than a timeout.
    pub failed: u64,
    /// Invocations killed by the timeout.
    pub timed_out: u64,
    /// Tool processes currently running.
    pub in_flight: u64,
    /// Output bytes handed to response bodies.
    pub bytes_streamed: u64,
}

impl ConvertMetrics {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new invocation; the guard marks it finished when dropped.
    pub fn start(&self) -> InFlight<'_> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight { metrics: self }
    }

    /// Record a successful invocation producing `bytes` of output.
    pub fn record_success(&self, bytes: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_streamed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed invocation.
    pub fn record_failure(&self, err: &ExecError) {
        match err.class() {
            ErrorClass::Timeout => self.timed_out.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the in-flight gauge on drop.
#[derive(Debug)]
pub struct InFlight<'a> {
    metrics: &'a ConvertMetrics,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
