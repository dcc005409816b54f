//! Core types for the viabridge platform
//!
//! Newtype identifiers and small value types shared by the runtime, the
//! harness, and host integrations.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Connection Identifier
// ----------------------------------------------------------------------------

/// Stable unique identifier of a remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Wrap an existing UUID
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ----------------------------------------------------------------------------
// Protocol Version
// ----------------------------------------------------------------------------

/// Protocol number spoken by a client or server endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(i32);

impl ProtocolVersion {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Raw protocol number
    pub fn id(&self) -> i32 {
        self.0
    }
}

impl From<i32> for ProtocolVersion {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol {}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Handler Kind
// ----------------------------------------------------------------------------

/// Which component currently owns version negotiation on a channel
///
/// `Foreign` means a competing translation layer already took over the
/// channel, so anything this platform learned about the remote endpoint must
/// not be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    /// The channel is handled by this platform (or nobody else)
    Native,
    /// Another version-translation mechanism handles the channel
    Foreign,
}

impl HandlerKind {
    pub fn is_foreign(&self) -> bool {
        matches!(self, HandlerKind::Foreign)
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Native => write!(f, "native"),
            HandlerKind::Foreign => write!(f, "foreign"),
        }
    }
}

// ----------------------------------------------------------------------------
// Rendered Text
// ----------------------------------------------------------------------------

/// Text produced by a [`TextFormatter`](crate::TextFormatter), ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderedText(String);

impl RenderedText {
    pub fn new(body: impl Into<String>) -> Self {
        Self(body.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RenderedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
