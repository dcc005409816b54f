//! Protocol version probe
//!
//! Detects the protocol version a remote endpoint speaks by opening a short
//! status session through a [`ProbeConnector`]. Results are cached per
//! address for a configurable time. Concurrent detections for the same
//! address share one in-flight probe, so the endpoint sees a single
//! connection no matter how many callers ask.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use viabridge_core::{
    HandlerKind, ProbeConfig, ProbeConnector, ProbeError, ProbeSession, ProtocolVersion,
    SchedulerError,
};

use crate::scheduler::TaskScheduler;

pub type ProbeOutcome = Result<ProtocolVersion, ProbeError>;

// ----------------------------------------------------------------------------
// Probe State
// ----------------------------------------------------------------------------

/// Lifecycle of one probe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Pending,
    Connecting,
    Handshaking,
    Resolved,
    Failed,
    TimedOut,
}

impl ProbeState {
    fn advance(&mut self, next: ProbeState, address: SocketAddr) {
        debug!(%address, from = %self, to = %next, "Probe state change");
        *self = next;
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeState::Pending => "pending",
            ProbeState::Connecting => "connecting",
            ProbeState::Handshaking => "handshaking",
            ProbeState::Resolved => "resolved",
            ProbeState::Failed => "failed",
            ProbeState::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Cache Entries
// ----------------------------------------------------------------------------

/// A successful detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: SocketAddr,
    pub version: ProtocolVersion,
    pub probed_at: Instant,
    /// Handler kind the channel had when the result was recorded
    pub handler: HandlerKind,
}

impl ProbeResult {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.probed_at.elapsed() < ttl
    }
}

// ----------------------------------------------------------------------------
// Probe Future
// ----------------------------------------------------------------------------

/// Shareable handle to a detection. Every clone resolves to the same outcome.
#[derive(Clone)]
pub struct ProbeFuture {
    inner: ProbeFutureInner,
}

#[derive(Clone)]
enum ProbeFutureInner {
    Ready(ProbeOutcome),
    Pending(Shared<BoxFuture<'static, ProbeOutcome>>),
}

impl ProbeFuture {
    fn new<F>(future: F) -> Self
    where
        F: Future<Output = ProbeOutcome> + Send + 'static,
    {
        Self {
            inner: ProbeFutureInner::Pending(future.boxed().shared()),
        }
    }

    fn ready(outcome: ProbeOutcome) -> Self {
        Self {
            inner: ProbeFutureInner::Ready(outcome),
        }
    }

    /// The outcome, if the detection has already finished.
    ///
    /// A cached answer is visible immediately; an in-flight probe only
    /// becomes visible after some clone has been polled to completion.
    pub fn peek(&self) -> Option<ProbeOutcome> {
        match &self.inner {
            ProbeFutureInner::Ready(outcome) => Some(outcome.clone()),
            ProbeFutureInner::Pending(shared) => shared.peek().cloned(),
        }
    }
}

impl Future for ProbeFuture {
    type Output = ProbeOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            ProbeFutureInner::Ready(outcome) => Poll::Ready(outcome.clone()),
            ProbeFutureInner::Pending(shared) => Pin::new(shared).poll(cx),
        }
    }
}

impl fmt::Debug for ProbeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeFuture")
            .field("outcome", &self.peek())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Disabled Connector
// ----------------------------------------------------------------------------

/// Connector used when the host installs none; every probe fails
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledConnector;

#[async_trait]
impl ProbeConnector for DisabledConnector {
    async fn connect(&self, address: SocketAddr) -> Result<Box<dyn ProbeSession>, ProbeError> {
        Err(ProbeError::ConnectionFailed {
            address,
            reason: "no probe connector installed".to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Protocol Version Probe
// ----------------------------------------------------------------------------

struct ProbeInner {
    connector: Arc<dyn ProbeConnector>,
    scheduler: TaskScheduler,
    timeout: Duration,
    ttl: Duration,
    cache: DashMap<SocketAddr, ProbeResult>,
    in_flight: DashMap<SocketAddr, ProbeFuture>,
}

/// Cached, coalescing remote version detection
#[derive(Clone)]
pub struct ProtocolVersionProbe {
    inner: Arc<ProbeInner>,
}

impl ProtocolVersionProbe {
    pub fn new(
        connector: Arc<dyn ProbeConnector>,
        scheduler: TaskScheduler,
        config: &ProbeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                connector,
                scheduler,
                timeout: config.timeout(),
                ttl: config.cache_ttl(),
                cache: DashMap::new(),
                in_flight: DashMap::new(),
            }),
        }
    }

    /// Detect the protocol version spoken at `address`.
    ///
    /// A fresh cached answer resolves immediately. A cached answer recorded
    /// under a different handler kind, or any answer while the channel is
    /// `Foreign`, is discarded and probed again. Failures are never cached.
    pub fn detect(&self, address: SocketAddr, handler: HandlerKind) -> ProbeFuture {
        if let Some(hit) = self.lookup(address, handler) {
            return ProbeFuture::ready(Ok(hit.version));
        }

        match self.inner.in_flight.entry(address) {
            Entry::Occupied(entry) => {
                debug!(%address, "Joining in-flight probe");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // A probe may have finished between the lookup and the entry lock.
                if let Some(hit) = self.lookup(address, handler) {
                    return ProbeFuture::ready(Ok(hit.version));
                }
                match self.launch(address, handler) {
                    Ok(probe) => {
                        entry.insert(probe.clone());
                        probe
                    }
                    Err(_) => ProbeFuture::ready(Err(ProbeError::Aborted)),
                }
            }
        }
    }

    fn lookup(&self, address: SocketAddr, handler: HandlerKind) -> Option<ProbeResult> {
        let cached = self.inner.cache.get(&address).map(|entry| *entry.value())?;

        let usable =
            !handler.is_foreign() && cached.handler == handler && cached.is_fresh(self.inner.ttl);
        if usable {
            return Some(cached);
        }

        debug!(%address, %handler, "Discarding cached probe result");
        self.inner
            .cache
            .remove_if(&address, |_, current| current.probed_at == cached.probed_at);
        None
    }

    fn launch(&self, address: SocketAddr, handler: HandlerKind) -> Result<ProbeFuture, SchedulerError> {
        let inner = self.inner.clone();
        let task = async move {
            let _registration = InFlightGuard {
                inner: inner.clone(),
                address,
            };
            let outcome = run_probe(inner.connector.as_ref(), address, inner.timeout).await;
            match &outcome {
                Ok(version) => {
                    inner.cache.insert(
                        address,
                        ProbeResult {
                            address,
                            version: *version,
                            probed_at: Instant::now(),
                            handler,
                        },
                    );
                    info!("Auto-detected {} for {}", version, address);
                }
                Err(err) => warn!(%address, "Protocol detection failed: {}", err),
            }
            outcome
        };

        let join = self.inner.scheduler.spawn_future(task)?;
        Ok(ProbeFuture::new(async move {
            join.await.unwrap_or(Err(ProbeError::Aborted))
        }))
    }

    /// Cached result for `address`, fresh or not
    pub fn cached(&self, address: SocketAddr) -> Option<ProbeResult> {
        self.inner.cache.get(&address).map(|entry| *entry.value())
    }

    /// Drop the cached result for `address`
    pub fn invalidate(&self, address: SocketAddr) -> Option<ProbeResult> {
        self.inner.cache.remove(&address).map(|(_, result)| result)
    }

    /// Drop every stale entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.inner.cache.len();
        let ttl = self.inner.ttl;
        self.inner.cache.retain(|_, result| result.is_fresh(ttl));
        before.saturating_sub(self.inner.cache.len())
    }

    /// Number of probes currently running
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn cache_ttl(&self) -> Duration {
        self.inner.ttl
    }
}

impl fmt::Debug for ProtocolVersionProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolVersionProbe")
            .field("cached", &self.inner.cache.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Removes the in-flight entry when the probe task ends or is dropped
struct InFlightGuard {
    inner: Arc<ProbeInner>,
    address: SocketAddr,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.address);
    }
}

/// One probe attempt under a single deadline covering connect and handshake.
/// An opened session is always closed before returning.
async fn run_probe(
    connector: &dyn ProbeConnector,
    address: SocketAddr,
    timeout: Duration,
) -> ProbeOutcome {
    let deadline = Instant::now() + timeout;
    let timed_out = ProbeError::Timeout {
        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    };
    let mut state = ProbeState::Pending;

    state.advance(ProbeState::Connecting, address);
    let mut session = match tokio::time::timeout_at(deadline, connector.connect(address)).await {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            state.advance(ProbeState::Failed, address);
            return Err(err);
        }
        Err(_) => {
            state.advance(ProbeState::TimedOut, address);
            return Err(timed_out);
        }
    };

    state.advance(ProbeState::Handshaking, address);
    let outcome = match tokio::time::timeout_at(deadline, session.query_version(address)).await {
        Ok(Ok(version)) => {
            state.advance(ProbeState::Resolved, address);
            Ok(version)
        }
        Ok(Err(err)) => {
            state.advance(ProbeState::Failed, address);
            Err(err)
        }
        Err(_) => {
            state.advance(ProbeState::TimedOut, address);
            Err(timed_out)
        }
    };

    session.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use viabridge_core::BridgeConfig;
    use viabridge_harness::{ConnectorBehavior, MockConnector};

    const WAIT: Duration = Duration::from_secs(5);

    fn setup(connector: MockConnector, config: ProbeConfig) -> (ProtocolVersionProbe, TaskScheduler) {
        let scheduler = TaskScheduler::start(&BridgeConfig::testing().scheduler)
            .expect("Failed to start scheduler");
        let probe = ProtocolVersionProbe::new(Arc::new(connector), scheduler.clone(), &config);
        (probe, scheduler)
    }

    fn addr() -> SocketAddr {
        "192.0.2.10:25565".parse().expect("addr")
    }

    fn config(timeout_ms: u64) -> ProbeConfig {
        ProbeConfig {
            timeout_ms,
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_detect_resolves_and_caches() {
        let connector = MockConnector::responding(340, Duration::from_millis(10));
        let (probe, _scheduler) = setup(connector.clone(), config(1_000));

        let version = tokio::time::timeout(WAIT, probe.detect(addr(), HandlerKind::Native))
            .await
            .expect("probe hung")
            .expect("probe failed");
        assert_eq!(version, ProtocolVersion::new(340));

        let cached = probe.cached(addr()).expect("cached result");
        assert_eq!(cached.version, ProtocolVersion::new(340));
        assert_eq!(cached.handler, HandlerKind::Native);

        let again = probe.detect(addr(), HandlerKind::Native);
        assert_eq!(again.peek(), Some(Ok(ProtocolVersion::new(340))));
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(connector.sessions_closed(), 1);
        assert_eq!(probe.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cached_answer_is_visible_without_polling() {
        let connector = MockConnector::responding(107, Duration::from_millis(5));
        let (probe, _scheduler) = setup(connector.clone(), config(1_000));

        let first = probe.detect(addr(), HandlerKind::Native);
        assert!(first.peek().is_none());
        first.await.expect("probe failed");

        for _ in 0..3 {
            let hit = probe.detect(addr(), HandlerKind::Native);
            assert_eq!(hit.peek(), Some(Ok(ProtocolVersion::new(107))));
            assert_eq!(hit.await, Ok(ProtocolVersion::new(107)));
        }
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(probe.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_detects_share_one_connection() {
        let connector = MockConnector::responding(47, Duration::from_millis(100));
        let (probe, _scheduler) = setup(connector.clone(), config(1_000));

        let probes: Vec<_> = (0..16)
            .map(|_| probe.detect(addr(), HandlerKind::Native))
            .collect();
        assert_eq!(probe.in_flight(), 1);

        let outcomes = tokio::time::timeout(WAIT, futures::future::join_all(probes))
            .await
            .expect("probes hung");
        assert!(outcomes
            .iter()
            .all(|outcome| outcome == &Ok(ProtocolVersion::new(47))));
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out_and_closes_session() {
        let connector = MockConnector::new(ConnectorBehavior::Silent);
        let (probe, _scheduler) = setup(connector.clone(), config(100));

        let started = Instant::now();
        let outcome = tokio::time::timeout(WAIT, probe.detect(addr(), HandlerKind::Native))
            .await
            .expect("probe hung");

        assert_eq!(outcome, Err(ProbeError::Timeout { duration_ms: 100 }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(connector.sessions_closed(), 1);
        assert_eq!(connector.sessions_dropped_open(), 0);
        assert!(probe.cached(addr()).is_none());
    }

    #[tokio::test]
    async fn test_deadline_covers_connect_phase() {
        let connector = MockConnector::new(ConnectorBehavior::Unreachable);
        let (probe, _scheduler) = setup(connector.clone(), config(100));

        let outcome = tokio::time::timeout(WAIT, probe.detect(addr(), HandlerKind::Native))
            .await
            .expect("probe hung");
        assert!(matches!(outcome, Err(ProbeError::Timeout { .. })));
        assert_eq!(connector.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let connector = MockConnector::new(ConnectorBehavior::Refuse);
        let (probe, _scheduler) = setup(connector.clone(), config(1_000));

        let first = probe.detect(addr(), HandlerKind::Native).await;
        assert!(matches!(first, Err(ProbeError::ConnectionFailed { .. })));
        assert!(probe.cached(addr()).is_none());

        connector.set_behavior(ConnectorBehavior::Respond {
            version: ProtocolVersion::new(5),
            delay: Duration::from_millis(1),
        });
        let second = probe.detect(addr(), HandlerKind::Native).await;
        assert_eq!(second, Ok(ProtocolVersion::new(5)));
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_handshake_failure_closes_session() {
        let connector = MockConnector::new(ConnectorBehavior::BrokenHandshake);
        let (probe, _scheduler) = setup(connector.clone(), config(1_000));

        let outcome = probe.detect(addr(), HandlerKind::Native).await;
        assert!(matches!(outcome, Err(ProbeError::Handshake { .. })));
        assert_eq!(connector.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_foreign_handler_invalidates_cache() {
        let connector = MockConnector::responding(340, Duration::from_millis(1));
        let (probe, _scheduler) = setup(connector.clone(), config(1_000));

        probe
            .detect(addr(), HandlerKind::Native)
            .await
            .expect("probe failed");
        assert_eq!(connector.connect_attempts(), 1);

        let reprobe = probe.detect(addr(), HandlerKind::Foreign);
        assert!(reprobe.peek().is_none());
        reprobe.await.expect("probe failed");
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(
            probe.cached(addr()).map(|r| r.handler),
            Some(HandlerKind::Foreign)
        );
    }

    #[tokio::test]
    async fn test_expired_entries_are_reprobed_and_purged() {
        let connector = MockConnector::responding(340, Duration::from_millis(1));
        let config = ProbeConfig {
            cache_ttl_secs: 0,
            ..config(1_000)
        };
        let (probe, _scheduler) = setup(connector.clone(), config);

        probe
            .detect(addr(), HandlerKind::Native)
            .await
            .expect("probe failed");
        assert_eq!(probe.purge_expired(), 1);
        assert!(probe.cached(addr()).is_none());

        probe
            .detect(addr(), HandlerKind::Native)
            .await
            .expect("probe failed");
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_closed_scheduler_aborts_probe() {
        let connector = MockConnector::responding(340, Duration::from_millis(1));
        let (probe, scheduler) = setup(connector.clone(), config(1_000));
        scheduler.close();

        let outcome = probe.detect(addr(), HandlerKind::Native).await;
        assert_eq!(outcome, Err(ProbeError::Aborted));
        assert_eq!(connector.connect_attempts(), 0);
        assert_eq!(probe.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_disabled_connector_fails() {
        let scheduler = TaskScheduler::start(&BridgeConfig::testing().scheduler)
            .expect("Failed to start scheduler");
        let probe = ProtocolVersionProbe::new(
            Arc::new(DisabledConnector),
            scheduler,
            &ProbeConfig::default(),
        );
        let outcome = probe.detect(addr(), HandlerKind::Native).await;
        assert!(matches!(outcome, Err(ProbeError::ConnectionFailed { .. })));
    }
}
