//! Upstream observability counters.
//!
//! Collected by the completion path, read by whoever reports on the bridge.
//! Nothing here feeds back into polling decisions except the last-success
//! timestamp used for the operational flag.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::correlator::{AddressRange, UpstreamError};

/// Number of latency samples kept in the sliding window.
pub const LATENCY_WINDOW: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Round-trip latency over a sliding window.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    samples: VecDeque<Duration>,
}

/// Summary of [`LatencyStats`], in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub average_ms: f64,
    pub std_deviation_ms: f64,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.samples.len();
        if count == 0 {
            return LatencySummary::default();
        }

        let millis: Vec<f64> = self
            .samples
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let min_ms = millis.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = millis.iter().copied().fold(0.0, f64::max);
        let average_ms = millis.iter().sum::<f64>() / count as f64;

        // Population deviation needs at least two samples to mean anything.
        let std_deviation_ms = if count < 2 {
            0.0
        } else {
            let variance = millis
                .iter()
                .map(|m| (m - average_ms).powi(2))
                .sum::<f64>()
                / count as f64;
            variance.sqrt()
        };

        LatencySummary {
            samples: count,
            min_ms,
            max_ms,
            average_ms,
            std_deviation_ms,
        }
    }
}

/// Failure record for one address range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RangeFailures {
    pub count: u64,
    pub last_error: Option<String>,
}

/// Counters shared between the completion path and reporting.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    failures: Mutex<BTreeMap<AddressRange, RangeFailures>>,
    latency: Mutex<LatencyStats>,
    last_success: Mutex<Option<Instant>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl UpstreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful read that took `latency`.
    pub fn record_success(&self, latency: Duration, at: Instant) {
        lock(&self.latency).record(latency);
        *lock(&self.last_success) = Some(at);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed read of `range`.
    pub fn record_failure(&self, range: AddressRange, error: &UpstreamError) {
        let mut failures = lock(&self.failures);
        let entry = failures.entry(range).or_default();
        entry.count += 1;
        entry.last_error = Some(error.to_string());
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Failure count for one range.
    pub fn failures_for(&self, range: AddressRange) -> u64 {
        lock(&self.failures).get(&range).map_or(0, |f| f.count)
    }

    /// Every range that has failed at least once.
    pub fn failures(&self) -> BTreeMap<AddressRange, RangeFailures> {
        lock(&self.failures).clone()
    }

    pub fn latency(&self) -> LatencySummary {
        lock(&self.latency).summary()
    }

    pub fn last_success(&self) -> Option<Instant> {
        *lock(&self.last_success)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
