//! Mock probe connector
//!
//! Scripted remote endpoint for version probes. Counts connection attempts
//! and session lifecycle so tests can check coalescing and cleanup.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use viabridge_core::{ProbeConnector, ProbeError, ProbeSession, ProtocolVersion};

/// How the scripted endpoint answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorBehavior {
    /// Accept and answer with `version` after `delay`
    Respond {
        version: ProtocolVersion,
        delay: Duration,
    },
    /// Accept the connection but never answer the status query
    Silent,
    /// Never complete the connection attempt
    Unreachable,
    /// Refuse the connection outright
    Refuse,
    /// Accept and then fail the handshake
    BrokenHandshake,
}

#[derive(Debug)]
struct ConnectorState {
    behavior: Mutex<ConnectorBehavior>,
    connect_attempts: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    sessions_dropped_open: AtomicUsize,
}

/// Scripted [`ProbeConnector`]. Clones share counters and behaviour.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new(behavior: ConnectorBehavior) -> Self {
        Self {
            state: Arc::new(ConnectorState {
                behavior: Mutex::new(behavior),
                connect_attempts: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
                sessions_closed: AtomicUsize::new(0),
                sessions_dropped_open: AtomicUsize::new(0),
            }),
        }
    }

    /// Endpoint answering `version` after `delay`
    pub fn responding(version: i32, delay: Duration) -> Self {
        Self::new(ConnectorBehavior::Respond {
            version: ProtocolVersion::new(version),
            delay,
        })
    }

    pub fn set_behavior(&self, behavior: ConnectorBehavior) {
        if let Ok(mut current) = self.state.behavior.lock() {
            *current = behavior;
        }
    }

    fn behavior(&self) -> ConnectorBehavior {
        self.state
            .behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(ConnectorBehavior::Refuse)
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    /// Sessions dropped without an explicit `close`
    pub fn sessions_dropped_open(&self) -> usize {
        self.state.sessions_dropped_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeConnector for MockConnector {
    async fn connect(&self, address: SocketAddr) -> Result<Box<dyn ProbeSession>, ProbeError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior();
        debug!(%address, ?behavior, "Mock probe connect");

        match behavior {
            ConnectorBehavior::Refuse => Err(ProbeError::ConnectionFailed {
                address,
                reason: "connection refused".to_string(),
            }),
            ConnectorBehavior::Unreachable => {
                std::future::pending::<()>().await;
                Err(ProbeError::Aborted)
            }
            behavior => {
                self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockSession {
                    state: self.state.clone(),
                    behavior,
                    closed: false,
                }))
            }
        }
    }
}

struct MockSession {
    state: Arc<ConnectorState>,
    behavior: ConnectorBehavior,
    closed: bool,
}

#[async_trait]
impl ProbeSession for MockSession {
    async fn query_version(&mut self, _address: SocketAddr) -> Result<ProtocolVersion, ProbeError> {
        match &self.behavior {
            ConnectorBehavior::Respond { version, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(*version)
            }
            ConnectorBehavior::BrokenHandshake => Err(ProbeError::Handshake {
                reason: "unexpected packet".to_string(),
            }),
            _ => {
                std::future::pending::<()>().await;
                Err(ProbeError::Aborted)
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if !self.closed {
            self.state.sessions_dropped_open.fetch_add(1, Ordering::SeqCst);
        }
    }
}
