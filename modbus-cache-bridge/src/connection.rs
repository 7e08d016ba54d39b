//! Lifecycle of the single upstream connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{MAX_BACKOFF_MS, ReconnectConfig};
use crate::correlator::UpstreamError;
use crate::transport::Connector;

/// Connection state machine.
///
/// `Disconnected -> Connecting -> Connected`, and back to `Disconnected`
/// on a failed attempt, a transport error or an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Connection state readable from any task.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: AtomicU8,
    attempts: AtomicU64,
    failures: AtomicU64,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            attempts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl ConnectionStatus {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Connect attempts that failed or timed out.
    pub fn connect_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    retry_at: Option<Instant>,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_millis(config.backoff_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_backoff_ms),
            current: initial,
            retry_at: None,
        }
    }

    /// Whether an attempt is allowed at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Earliest time of the next attempt, if one is being held back.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Schedule the next attempt and double the delay. Returns the delay applied.
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        let retry_at = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_millis(MAX_BACKOFF_MS));
        self.retry_at = Some(retry_at);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn on_success(&mut self) {
        self.current = self.initial;
        self.retry_at = None;
    }
}

/// Owner of the one physical upstream connection.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    link: Option<C::Link>,
    status: Arc<ConnectionStatus>,
    connect_timeout: Duration,
    backoff: Backoff,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, connect_timeout: Duration, reconnect: &ReconnectConfig) -> Self {
        Self {
            connector,
            link: None,
            status: Arc::new(ConnectionStatus::default()),
            connect_timeout,
            backoff: Backoff::new(reconnect),
        }
    }

    /// Shared handle on the connection state.
    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Connect unless already connected.
    ///
    /// Returns immediately with [`UpstreamError::NotConnected`] while the
    /// backoff holds attempts back. A connect that outlives the timeout is
    /// a failure.
    pub async fn ensure_connection(&mut self) -> Result<(), UpstreamError> {
        if self.link.is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if !self.backoff.ready(now) {
            debug!(
                retry_in_ms = self
                    .backoff
                    .retry_at()
                    .map_or(0, |at| at.saturating_duration_since(now).as_millis() as u64),
                "Waiting to reconnect"
            );
            return Err(UpstreamError::NotConnected);
        }

        self.status.set(ConnectionState::Connecting);
        self.status.attempts.fetch_add(1, Ordering::Relaxed);
        debug!(upstream = %self.connector.describe(), "Connecting to upstream device");

        let result = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .unwrap_or_else(|_| {
                Err(UpstreamError::Connection(
                    "Connection timeout".to_string(),
                ))
            });

        match result {
            Ok(link) => {
                self.link = Some(link);
                self.backoff.on_success();
                self.status.set(ConnectionState::Connected);
                info!(upstream = %self.connector.describe(), "Connected to upstream device");
                Ok(())
            }
            Err(e) => {
                let delay = self.backoff.on_failure(Instant::now());
                self.status.failures.fetch_add(1, Ordering::Relaxed);
                self.status.set(ConnectionState::Disconnected);
                warn!(
                    upstream = %self.connector.describe(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Upstream connection failed"
                );
                Err(e)
            }
        }
    }

    /// Drop the current link, if any.
    pub fn reset(&mut self) {
        if self.link.take().is_some() {
            info!(upstream = %self.connector.describe(), "Upstream connection closed");
        }
        self.status.set(ConnectionState::Disconnected);
    }

    pub fn link_mut(&mut self) -> Option<&mut C::Link> {
        self.link.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadFunction;
    use crate::correlator::AddressRange;
    use crate::transport::UpstreamLink;
    use std::sync::atomic::AtomicUsize;

    struct NullLink;

    impl UpstreamLink for NullLink {
        async fn read(
            &mut self,
            _function: ReadFunction,
            range: AddressRange,
        ) -> Result<Vec<u16>, UpstreamError> {
            Ok(vec![0; range.count as usize])
        }

        async fn write(&mut self, _address: u16, _values: Vec<u16>) -> Result<(), UpstreamError> {
            Ok(())
        }
    }

    /// Fails the first `failures` attempts, then connects.
    struct FlakyConnector {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Connector for FlakyConnector {
        type Link = NullLink;

        async fn connect(&self) -> Result<NullLink, UpstreamError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(UpstreamError::Connection("refused".to_string()))
            } else {
                Ok(NullLink)
            }
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    struct HangingConnector;

    impl Connector for HangingConnector {
        type Link = NullLink;

        async fn connect(&self) -> Result<NullLink, UpstreamError> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    fn reconnect(backoff_ms: u64, max_backoff_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            backoff_ms,
            max_backoff_ms,
        }
    }

    fn flaky(failures: usize) -> (ConnectionManager<FlakyConnector>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = FlakyConnector {
            failures,
            calls: Arc::clone(&calls),
        };
        let manager =
            ConnectionManager::new(connector, Duration::from_secs(1), &reconnect(1000, 4000));
        (manager, calls)
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(&reconnect(1000, 3000));
        let now = Instant::now();

        assert!(backoff.ready(now));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(1000));
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + Duration::from_millis(1000)));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(2000));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(3000));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(3000));

        backoff.on_success();
        assert!(backoff.ready(now));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_with_huge_delay_does_not_overflow() {
        let mut backoff = Backoff::new(&reconnect(u64::MAX, u64::MAX));
        let now = Instant::now();

        assert_eq!(backoff.on_failure(now), Duration::from_millis(u64::MAX));
        assert!(!backoff.ready(now));
        assert!(backoff.retry_at().is_some_and(|at| at > now));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connection_is_idempotent() {
        let (mut manager, calls) = flaky(0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.ensure_connection().await.unwrap();
        manager.ensure_connection().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.link_mut().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_holds_back_retries() {
        let (mut manager, calls) = flaky(2);
        let status = manager.status();

        assert!(manager.ensure_connection().await.is_err());
        assert_eq!(status.state(), ConnectionState::Disconnected);

        // Within the backoff window nothing is attempted.
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(
            manager.ensure_connection().await,
            Err(UpstreamError::NotConnected)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(manager.ensure_connection().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Second failure doubled the delay.
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(manager.ensure_connection().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_millis(1)).await;
        manager.ensure_connection().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(status.attempts(), 3);
        assert_eq!(status.connect_failures(), 2);
        assert!(status.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_a_failure() {
        let mut manager = ConnectionManager::new(
            HangingConnector,
            Duration::from_millis(500),
            &reconnect(1000, 1000),
        );

        let started = Instant::now();
        let result = manager.ensure_connection().await;

        assert!(matches!(result, Err(UpstreamError::Connection(_))));
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_disconnects() {
        let (mut manager, calls) = flaky(0);
        manager.ensure_connection().await.unwrap();

        manager.reset();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.link_mut().is_none());

        manager.ensure_connection().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
