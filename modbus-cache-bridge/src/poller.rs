//! Periodic upstream polling.
//!
//! One [`UpstreamPoller::tick`] per scheduling pass. A tick never awaits:
//! it only decides which batches are due and pushes them into the worker
//! queue with `try_send`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::config::PollingConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::correlator::{AddressRange, CompletionHandler, RequestCorrelator, UpstreamError};
use crate::transport::Job;

/// Split a sorted, de-duplicated address list into contiguous runs of at
/// most `max_batch` registers.
pub fn plan_batches(addresses: &[u16], max_batch: u16) -> Vec<AddressRange> {
    let max_batch = max_batch.max(1);
    let mut batches = Vec::new();
    let mut iter = addresses.iter().copied();

    let Some(first) = iter.next() else {
        return batches;
    };
    let mut current = AddressRange::new(first, 1);

    for address in iter {
        let contiguous = current.end() == address as u32;
        if contiguous && current.count < max_batch {
            current.count += 1;
        } else {
            batches.push(current);
            current = AddressRange::new(address, 1);
        }
    }
    batches.push(current);
    batches
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The polling interval has not elapsed yet.
    NotDue,
    /// Too many requests in flight; nothing was issued.
    Saturated { pending: usize },
    /// No link; a connect was requested instead of reads.
    Reconnecting,
    /// Batches were handed to the worker.
    Polled {
        issued: usize,
        in_flight: usize,
        dropped: usize,
    },
}

/// Turns the configured address list into upstream read jobs.
pub struct UpstreamPoller {
    correlator: Arc<RequestCorrelator>,
    status: Arc<ConnectionStatus>,
    jobs: mpsc::Sender<Job>,
    /// Batches over every address, used until the static registers are known.
    startup_batches: Vec<AddressRange>,
    /// Batches over the dynamic registers only.
    dynamic_batches: Vec<AddressRange>,
    static_registers: Vec<u16>,
    static_fetched: bool,
    interval: Duration,
    pending_ttl: Duration,
    max_pending: usize,
    last_poll: Option<Instant>,
}

impl UpstreamPoller {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        status: Arc<ConnectionStatus>,
        jobs: mpsc::Sender<Job>,
        dynamic_registers: &[u16],
        static_registers: &[u16],
        polling: &PollingConfig,
    ) -> Self {
        let all = correlator.cache().address_map().addresses().to_vec();

        let mut dynamic = dynamic_registers.to_vec();
        dynamic.sort_unstable();
        dynamic.dedup();

        let mut statics = static_registers.to_vec();
        statics.sort_unstable();
        statics.dedup();

        Self {
            startup_batches: plan_batches(&all, polling.max_batch_size),
            dynamic_batches: plan_batches(&dynamic, polling.max_batch_size),
            static_fetched: statics.is_empty(),
            static_registers: statics,
            correlator,
            status,
            jobs,
            interval: polling.interval(),
            pending_ttl: polling.pending_ttl(),
            max_pending: polling.max_pending,
            last_poll: None,
        }
    }

    /// True once every static register holds a value.
    pub fn static_fetched(&self) -> bool {
        self.static_fetched
    }

    /// Batches the next poll would cover.
    pub fn current_batches(&self) -> &[AddressRange] {
        if self.static_fetched {
            &self.dynamic_batches
        } else {
            &self.startup_batches
        }
    }

    /// Run one polling pass.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self
            .last_poll
            .is_some_and(|last| now.saturating_duration_since(last) < self.interval)
        {
            return TickOutcome::NotDue;
        }
        self.last_poll = Some(now);

        let expired = self.correlator.expire(now, self.pending_ttl);
        if expired > 0 {
            debug!(expired, "Purged stale pending requests");
        }

        let pending = self.correlator.pending_count();
        if pending >= self.max_pending {
            debug!(pending, "Skipping poll, too many pending requests");
            return TickOutcome::Saturated { pending };
        }

        match self.status.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => return TickOutcome::Reconnecting,
            ConnectionState::Disconnected => {
                // A full queue already holds work that will trigger a connect.
                if let Err(TrySendError::Closed(_)) = self.jobs.try_send(Job::Connect) {
                    error!("Upstream worker is gone");
                }
                return TickOutcome::Reconnecting;
            }
        }

        if !self.static_fetched
            && self
                .correlator
                .cache()
                .all_fetched(&self.static_registers)
        {
            info!(
                count = self.static_registers.len(),
                "Static registers fetched, polling dynamic registers only"
            );
            self.static_fetched = true;
        }

        let batches = if self.static_fetched {
            &self.dynamic_batches
        } else {
            &self.startup_batches
        };

        let mut issued = 0;
        let mut in_flight = 0;
        let mut dropped = 0;

        for &range in batches {
            if self.correlator.is_in_flight(&range) {
                trace!(range = %range, "Batch still in flight");
                in_flight += 1;
                continue;
            }

            let request = self.correlator.register(range, now);
            let job = Job::Read {
                token: request.token,
                range,
            };
            match self.jobs.try_send(job) {
                Ok(()) => issued += 1,
                Err(TrySendError::Full(_)) => {
                    self.correlator
                        .on_error(request.token, &UpstreamError::QueueFull);
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    self.correlator
                        .on_error(request.token, &UpstreamError::NotConnected);
                    error!("Upstream worker is gone");
                    dropped += 1;
                }
            }
        }

        debug!(issued, in_flight, dropped, "Poll pass complete");
        TickOutcome::Polled {
            issued,
            in_flight,
            dropped,
        }
    }
}
