//! Connection registry
//!
//! Concurrent map of live client connections keyed by [`ConnectionId`]. Every
//! operation is safe from any thread, including the main context.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use viabridge_core::{ConnectionChannel, ConnectionId, HandlerKind, ProtocolVersion};

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// A live client connection as seen by the platform
pub struct Connection {
    id: ConnectionId,
    name: String,
    native_version: ProtocolVersion,
    alive: AtomicBool,
    channel: Arc<dyn ConnectionChannel>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        name: impl Into<String>,
        native_version: ProtocolVersion,
        channel: Arc<dyn ConnectionChannel>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            native_version,
            alive: AtomicBool::new(true),
            channel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Display name of the remote participant
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol version the client itself speaks
    pub fn native_version(&self) -> ProtocolVersion {
        self.native_version
    }

    pub fn channel(&self) -> &Arc<dyn ConnectionChannel> {
        &self.channel
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.channel.remote_address()
    }

    pub fn handler_kind(&self) -> HandlerKind {
        self.channel.handler_kind()
    }

    /// False once the connection was unregistered or superseded
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("native_version", &self.native_version)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Registry Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryCounters {
    registered: AtomicU64,
    unregistered: AtomicU64,
    superseded: AtomicU64,
}

/// Connection registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    pub unregistered: u64,
    /// Registrations that replaced an existing entry with the same id
    pub superseded: u64,
    pub live: usize,
}

// ----------------------------------------------------------------------------
// Connection Registry
// ----------------------------------------------------------------------------

/// Thread-safe registry of live connections
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    counters: Arc<RegistryCounters>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. An existing entry with the same id is superseded.
    pub fn register(&self, connection: impl Into<Arc<Connection>>) -> Arc<Connection> {
        let connection = connection.into();
        self.counters.registered.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = self.connections.insert(connection.id(), connection.clone()) {
            if !Arc::ptr_eq(&previous, &connection) {
                previous.retire();
                self.counters.superseded.fetch_add(1, Ordering::Relaxed);
                debug!(connection = %connection.id(), "Superseded existing registration");
            }
        } else {
            debug!(connection = %connection.id(), name = %connection.name(), "Registered connection");
        }
        connection
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let (_, removed) = self.connections.remove(&id)?;
        removed.retire();
        self.counters.unregistered.fetch_add(1, Ordering::Relaxed);
        debug!(connection = %id, "Unregistered connection");
        Some(removed)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Snapshot of all live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// First connection whose channel reports this remote address
    pub fn find_by_address(&self, address: SocketAddr) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|entry| entry.remote_address() == Some(address))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            unregistered: self.counters.unregistered.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
            live: self.connections.len(),
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("live", &self.len())
            .finish()
    }
}
