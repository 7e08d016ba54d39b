//! The cache bridge context.
//!
//! [`ModbusCache`] owns every piece of the engine: the register cache, the
//! request correlator, the poller and the handle of the upstream worker
//! task. The host calls [`ModbusCache::begin`] once and
//! [`ModbusCache::update`] on every scheduling pass.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::cache::{CacheError, RegisterCache, RegisterEntry};
use crate::config::{ConfigError, ModbusCacheConfig, WritePolicy};
use crate::connection::{ConnectionManager, ConnectionState, ConnectionStatus};
use crate::correlator::{AddressRange, CompletionHandler, RequestCorrelator};
use crate::poller::{TickOutcome, UpstreamPoller};
use crate::server::{CacheService, UpstreamWriter};
use crate::stats::{LatencySummary, UpstreamStats};
use crate::transport::{Connector, Job, UpstreamWorker};

/// Errors raised while setting the bridge up.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Failure counters of one address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeReport {
    pub start: u16,
    pub count: u16,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Point-in-time view of the bridge for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeSnapshot {
    pub connection: ConnectionState,
    pub operational: bool,
    pub registers: usize,
    pub valid_registers: usize,
    pub static_fetched: bool,
    pub pending_requests: usize,
    pub completed_reads: u64,
    pub failed_reads: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    /// Milliseconds since the last successful upstream read.
    pub last_success_age_ms: Option<u64>,
    pub latency: LatencySummary,
    pub failing_ranges: Vec<RangeReport>,
}

/// Caching bridge between one upstream device and any number of
/// downstream clients.
pub struct ModbusCache {
    cache: Arc<RegisterCache>,
    correlator: Arc<RequestCorrelator>,
    stats: Arc<UpstreamStats>,
    status: Arc<ConnectionStatus>,
    poller: UpstreamPoller,
    jobs: mpsc::Sender<Job>,
    worker: JoinHandle<()>,
    writes: WritePolicy,
    operational_window: Duration,
}

impl ModbusCache {
    /// Build the cache, start the upstream worker and request the first
    /// connection. Must be called from within a Tokio runtime.
    pub fn begin<C: Connector>(config: &ModbusCacheConfig, connector: C) -> Result<Self, SetupError> {
        config.verify()?;

        let cache = Arc::new(RegisterCache::new(&config.address_list())?);
        let stats = Arc::new(UpstreamStats::new());
        let correlator = Arc::new(RequestCorrelator::new(Arc::clone(&cache), Arc::clone(&stats)));

        let timeout = Duration::from_millis(config.upstream.timeout_ms);
        let manager = ConnectionManager::new(connector, timeout, &config.reconnect);
        let status = manager.status();

        let (jobs, rx) = mpsc::channel(config.polling.queue_depth);
        let handler: Arc<dyn CompletionHandler> = correlator.clone();
        let worker = UpstreamWorker::new(manager, rx, handler, config.upstream.function, timeout);
        let worker = tokio::spawn(worker.run());

        // The queue is empty at this point, so this cannot fail for lack of room.
        let _ = jobs.try_send(Job::Connect);

        let poller = UpstreamPoller::new(
            Arc::clone(&correlator),
            Arc::clone(&status),
            jobs.clone(),
            &config.registers,
            &config.static_registers,
            &config.polling,
        );

        info!(
            registers = cache.len(),
            static_registers = config.static_registers.len(),
            batches = poller.current_batches().len(),
            upstream = %config.upstream.connection.describe(),
            writes = ?config.writes,
            "Modbus cache initialized"
        );

        Ok(Self {
            cache,
            correlator,
            stats,
            status,
            poller,
            jobs,
            worker,
            writes: config.writes,
            operational_window: config.polling.operational_window(),
        })
    }

    /// Run one scheduling pass. Never waits on upstream I/O.
    pub fn update(&mut self) -> TickOutcome {
        self.poller.tick(Instant::now())
    }

    /// Last fetched value of `address`.
    pub fn get_register_value(&self, address: u16) -> Result<u16, CacheError> {
        self.cache.get_register_value(address)
    }

    /// Overwrite the cached value of `address`. Never forwarded upstream.
    pub fn set_register_value(&self, address: u16, value: u16) -> Result<(), CacheError> {
        self.cache.set_register_value(address, value)
    }

    /// Full entry of `address`, including its last-updated time.
    pub fn register_entry(&self, address: u16) -> Result<RegisterEntry, CacheError> {
        self.cache.lookup(address)
    }

    pub fn cache(&self) -> &Arc<RegisterCache> {
        &self.cache
    }

    /// Completion handler that lands upstream results in this cache.
    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn stats(&self) -> &Arc<UpstreamStats> {
        &self.stats
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn connection_status(&self) -> &Arc<ConnectionStatus> {
        &self.status
    }

    /// Number of reads of `range` that failed.
    pub fn failures_for(&self, range: AddressRange) -> u64 {
        self.stats.failures_for(range)
    }

    /// True while the last successful upstream read is recent enough.
    pub fn is_operational(&self) -> bool {
        self.stats.last_success().is_some_and(|at| {
            Instant::now().saturating_duration_since(at) < self.operational_window
        })
    }

    /// Service for a downstream server role.
    pub fn service(&self) -> CacheService {
        CacheService::new(
            Arc::clone(&self.cache),
            self.writes,
            UpstreamWriter::new(self.jobs.clone()),
        )
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        let now = Instant::now();
        let failing_ranges = self
            .stats
            .failures()
            .into_iter()
            .map(|(range, f)| RangeReport {
                start: range.start,
                count: range.count,
                failures: f.count,
                last_error: f.last_error,
            })
            .collect();

        BridgeSnapshot {
            connection: self.connection_state(),
            operational: self.is_operational(),
            registers: self.cache.len(),
            valid_registers: self.cache.valid_count(),
            static_fetched: self.poller.static_fetched(),
            pending_requests: self.correlator.pending_count(),
            completed_reads: self.stats.completed(),
            failed_reads: self.stats.failed(),
            connect_attempts: self.status.attempts(),
            connect_failures: self.status.connect_failures(),
            last_success_age_ms: self
                .stats
                .last_success()
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            latency: self.stats.latency(),
            failing_ranges,
        }
    }

    /// Stop the upstream worker.
    pub fn shutdown(self) {
        self.worker.abort();
        info!("Modbus cache stopped");
    }
}
