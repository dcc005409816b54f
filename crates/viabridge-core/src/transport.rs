//! Transport abstraction for protocol-version probing
//!
//! A probe opens a short-lived connection that only speaks the handshake
//! sub-protocol. The byte-level encoding belongs to the host's protocol
//! library, so the platform sees nothing but these two traits.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::errors::ProbeError;
use crate::types::ProtocolVersion;

/// Opens outbound handshake-only connections
#[async_trait]
pub trait ProbeConnector: Send + Sync + 'static {
    /// Connect to `address`; the returned session owns the socket
    async fn connect(&self, address: SocketAddr) -> Result<Box<dyn ProbeSession>, ProbeError>;
}

/// One open probe connection
#[async_trait]
pub trait ProbeSession: Send {
    /// Send the status handshake and wait for the advertised protocol version
    async fn query_version(&mut self, address: SocketAddr) -> Result<ProtocolVersion, ProbeError>;

    /// Release the connection. Must be idempotent.
    async fn close(&mut self);
}
