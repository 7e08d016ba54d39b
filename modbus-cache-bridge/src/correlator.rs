//! Correlation of asynchronous upstream completions with the requests that
//! caused them.
//!
//! Every batch sent upstream gets a [`Token`]. The upstream worker reports
//! the outcome through [`CompletionHandler`]; the correlator looks the token
//! up, drops it, and lands the registers in the cache. The pending map lock
//! covers the lookup and erase only, never the cache write.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_modbus::ExceptionCode;
use tracing::{debug, trace, warn};

use crate::cache::RegisterCache;
use crate::stats::UpstreamStats;

/// Opaque per-request correlation id.
pub type Token = u32;

/// Most requests the correlator tracks before evicting the oldest.
pub const MAX_PENDING_REQUESTS: usize = 200;

/// A contiguous run of register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AddressRange {
    pub start: u16,
    pub count: u16,
}

impl AddressRange {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// One past the last address, widened so that it cannot overflow.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    pub fn contains(&self, address: u16) -> bool {
        (self.start as u32..self.end()).contains(&(address as u32))
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        (self.start as u32) < other.end() && (other.start as u32) < self.end()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.count)
    }
}

/// Errors reported for an upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("Not connected to upstream device")]
    NotConnected,
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Device answered with exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("Malformed response: {0}")]
    Protocol(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Upstream request queue is full")]
    QueueFull,
}

impl UpstreamError {
    /// Whether the link must be torn down after this error.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            UpstreamError::Connection(_) | UpstreamError::Transport(_) | UpstreamError::Timeout
        )
    }
}

/// Request in flight towards the upstream device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub token: Token,
    pub range: AddressRange,
    pub issued_at: Instant,
}

/// Receiver of upstream completions.
///
/// Invoked from the upstream worker task, which runs concurrently with the
/// poller and the downstream servers.
pub trait CompletionHandler: Send + Sync {
    fn on_data(&self, token: Token, registers: &[u16]);
    fn on_error(&self, token: Token, error: &UpstreamError);
}

/// Maps tokens to pending ranges and lands completions in the cache.
#[derive(Debug)]
pub struct RequestCorrelator {
    cache: Arc<RegisterCache>,
    stats: Arc<UpstreamStats>,
    pending: Mutex<HashMap<Token, PendingRequest>>,
    next_token: AtomicU32,
}

impl RequestCorrelator {
    pub fn new(cache: Arc<RegisterCache>, stats: Arc<UpstreamStats>) -> Self {
        Self {
            cache,
            stats,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Token, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache(&self) -> &Arc<RegisterCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<UpstreamStats> {
        &self.stats
    }

    /// Track a new request for `range` and hand out its token.
    ///
    /// Tokens are unique among outstanding requests. When the map is full
    /// the oldest request is dropped and counted as timed out.
    pub fn register(&self, range: AddressRange, issued_at: Instant) -> PendingRequest {
        let (request, evicted) = {
            let mut pending = self.pending();

            let evicted = if pending.len() >= MAX_PENDING_REQUESTS {
                let oldest = pending
                    .values()
                    .min_by_key(|p| p.issued_at)
                    .map(|p| p.token);
                oldest.and_then(|token| pending.remove(&token))
            } else {
                None
            };

            let token = loop {
                let candidate = self.next_token.fetch_add(1, Ordering::Relaxed);
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };

            let request = PendingRequest {
                token,
                range,
                issued_at,
            };
            pending.insert(token, request);
            (request, evicted)
        };

        if let Some(old) = evicted {
            warn!(token = old.token, range = %old.range, "Evicting oldest pending request");
            self.stats.record_failure(old.range, &UpstreamError::Timeout);
        }

        trace!(token = request.token, range = %range, "Registered pending request");
        request
    }

    /// Forget a request that never reached the upstream worker.
    pub fn cancel(&self, token: Token) -> Option<PendingRequest> {
        self.pending().remove(&token)
    }

    /// Remove and return the request for `token`.
    fn take(&self, token: Token) -> Option<PendingRequest> {
        self.pending().remove(&token)
    }

    /// True when a pending request overlaps `range`.
    pub fn is_in_flight(&self, range: &AddressRange) -> bool {
        self.pending().values().any(|p| p.range.overlaps(range))
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Copy of every outstanding request.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<_> = self.pending().values().copied().collect();
        requests.sort_by_key(|p| p.token);
        requests
    }

    /// Resolve every request older than `ttl` as a timeout.
    ///
    /// Returns the number of requests purged.
    pub fn expire(&self, now: Instant, ttl: Duration) -> usize {
        let expired: Vec<Token> = self
            .pending()
            .values()
            .filter(|p| now.saturating_duration_since(p.issued_at) > ttl)
            .map(|p| p.token)
            .collect();

        for &token in &expired {
            self.on_error(token, &UpstreamError::Timeout);
        }
        expired.len()
    }
}

impl CompletionHandler for RequestCorrelator {
    fn on_data(&self, token: Token, registers: &[u16]) {
        let Some(request) = self.take(token) else {
            debug!(token, "Response for unknown or expired token");
            return;
        };

        let count = request.range.count as usize;
        if registers.len() < count {
            let error = UpstreamError::Protocol(format!(
                "expected {} registers, got {}",
                count,
                registers.len()
            ));
            warn!(token, range = %request.range, error = %error, "Discarding short response");
            self.stats.record_failure(request.range, &error);
            return;
        }

        // Ordered by issue time; `last_updated` records the landing time.
        let written = self
            .cache
            .write_run(request.range.start, &registers[..count], request.issued_at);

        let now = Instant::now();
        self.stats
            .record_success(now.saturating_duration_since(request.issued_at), now);

        debug!(
            token,
            range = %request.range,
            written,
            "Landed upstream response in cache"
        );
    }

    fn on_error(&self, token: Token, error: &UpstreamError) {
        let Some(request) = self.take(token) else {
            debug!(token, error = %error, "Error for unknown or expired token");
            return;
        };

        warn!(token, range = %request.range, error = %error, "Upstream request failed");
        self.stats.record_failure(request.range, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator(addresses: &[u16]) -> RequestCorrelator {
        let cache = Arc::new(RegisterCache::new(addresses).unwrap());
        RequestCorrelator::new(cache, Arc::new(UpstreamStats::new()))
    }

    #[test]
    fn test_range_overlap() {
        let a = AddressRange::new(0, 10);
        assert!(a.overlaps(&AddressRange::new(9, 1)));
        assert!(!a.overlaps(&AddressRange::new(10, 5)));
        assert!(AddressRange::new(65530, 6).contains(65535));
        assert_eq!(AddressRange::new(65535, 1).end(), 65536);
        assert_eq!(a.to_string(), "0+10");
    }

    #[test]
    fn test_tokens_are_unique_while_outstanding() {
        let correlator = correlator(&[0]);
        let now = Instant::now();

        let first = correlator.register(AddressRange::new(0, 1), now);
        let second = correlator.register(AddressRange::new(0, 1), now);

        assert_eq!(first.token, 1);
        assert_ne!(first.token, second.token);
        assert_eq!(correlator.pending_count(), 2);
    }

    #[test]
    fn test_on_data_lands_values_and_erases_token() {
        let correlator = correlator(&[0, 1, 2]);
        let request = correlator.register(AddressRange::new(0, 3), Instant::now());

        correlator.on_data(request.token, &[230, 10, 2400]);

        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.cache().read_run(0, 3), Ok(vec![230, 10, 2400]));
        assert_eq!(correlator.stats().completed(), 1);
        assert!(correlator.stats().last_success().is_some());

        // A duplicate completion is ignored.
        correlator.on_data(request.token, &[1, 1, 1]);
        assert_eq!(correlator.cache().get_register_value(0), Ok(230));
    }

    #[test]
    fn test_on_error_keeps_cache_and_counts_failure() {
        let correlator = correlator(&[0, 1]);
        let range = AddressRange::new(0, 2);

        let first = correlator.register(range, Instant::now());
        correlator.on_data(first.token, &[5, 6]);

        let second = correlator.register(range, Instant::now());
        correlator.on_error(second.token, &UpstreamError::Exception(ExceptionCode::ServerDeviceBusy));

        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.stats().failures_for(range), 1);
        assert_eq!(correlator.cache().read_run(0, 2), Ok(vec![5, 6]));
    }

    #[test]
    fn test_short_response_is_protocol_error() {
        let correlator = correlator(&[0, 1, 2]);
        let range = AddressRange::new(0, 3);
        let request = correlator.register(range, Instant::now());

        correlator.on_data(request.token, &[1, 2]);

        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.stats().failures_for(range), 1);
        assert_eq!(correlator.cache().valid_count(), 0);
    }

    #[test]
    fn test_in_flight_dedup() {
        let correlator = correlator(&[0]);
        let request = correlator.register(AddressRange::new(0, 10), Instant::now());

        assert!(correlator.is_in_flight(&AddressRange::new(5, 10)));
        assert!(!correlator.is_in_flight(&AddressRange::new(10, 10)));

        correlator.cancel(request.token);
        assert!(!correlator.is_in_flight(&AddressRange::new(5, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_purges_old_requests() {
        let correlator = correlator(&[0, 100]);
        let old = AddressRange::new(0, 1);
        let fresh = AddressRange::new(100, 1);

        correlator.register(old, Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;
        correlator.register(fresh, Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;

        let purged = correlator.expire(Instant::now(), Duration::from_secs(4));

        assert_eq!(purged, 1);
        assert_eq!(correlator.pending_count(), 1);
        assert_eq!(correlator.stats().failures_for(old), 1);
        assert_eq!(correlator.stats().failures_for(fresh), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let correlator = correlator(&[0]);
        let first = correlator.register(AddressRange::new(0, 1), Instant::now());
        for i in 1..MAX_PENDING_REQUESTS as u16 {
            tokio::time::advance(Duration::from_millis(1)).await;
            correlator.register(AddressRange::new(i, 1), Instant::now());
        }
        assert_eq!(correlator.pending_count(), MAX_PENDING_REQUESTS);

        correlator.register(AddressRange::new(1000, 1), Instant::now());

        assert_eq!(correlator.pending_count(), MAX_PENDING_REQUESTS);
        assert!(correlator.cancel(first.token).is_none());
        assert_eq!(correlator.stats().failures_for(first.range), 1);
    }
}
