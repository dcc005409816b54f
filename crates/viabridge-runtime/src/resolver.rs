//! Server protocol resolution
//!
//! Picks the protocol version a client connection should be translated to,
//! from configuration and the probe cache.

use tracing::debug;
use viabridge_core::{HandlerKind, ProbeConfig, ProtocolVersion, VersionMode};

use crate::probe::ProtocolVersionProbe;
use crate::registry::Connection;

/// Chooses the closest server protocol for a connection
#[derive(Debug, Clone)]
pub struct VersionResolver {
    config: ProbeConfig,
    probe: ProtocolVersionProbe,
}

impl VersionResolver {
    pub fn new(config: ProbeConfig, probe: ProtocolVersionProbe) -> Self {
        Self { config, probe }
    }

    /// Server protocol to use for `connection`.
    ///
    /// In auto-detect mode this never waits: until the probe for the remote
    /// address has finished, the client's native version is returned and the
    /// probe keeps running in the background.
    pub fn closest_server_protocol(&self, connection: &Connection) -> ProtocolVersion {
        let native = connection.native_version();

        if connection.handler_kind().is_foreign() {
            debug!(connection = %connection.id(), "Foreign handler owns channel, keeping native version");
            return native;
        }

        let address = connection.remote_address();
        if let Some(address) = address {
            if self.config.is_host_disabled(&address.ip().to_string()) {
                debug!(%address, "Translation disabled for host");
                return native;
            }
        }

        match self.config.version_mode() {
            VersionMode::Native => native,
            VersionMode::Fixed(version) => version,
            VersionMode::AutoDetect => {
                let Some(address) = address else {
                    return native;
                };
                match self.probe.detect(address, HandlerKind::Native).peek() {
                    Some(Ok(version)) => version,
                    _ => native,
                }
            }
        }
    }
}
