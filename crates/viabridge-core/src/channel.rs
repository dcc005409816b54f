//! Collaborator interfaces for live connections
//!
//! The transport layer and the text formatter are owned by the host; the
//! platform only talks to them through these traits.

use std::net::SocketAddr;

use crate::errors::BridgeResult;
use crate::types::{HandlerKind, RenderedText};

// ----------------------------------------------------------------------------
// Connection Channel
// ----------------------------------------------------------------------------

/// Transport channel underneath a registered connection
pub trait ConnectionChannel: Send + Sync {
    /// Deliver rendered text to the remote participant
    fn send_text(&self, text: &RenderedText) -> BridgeResult<()>;

    /// Terminate the connection with a reason
    fn close(&self, reason: &RenderedText);

    /// Which component currently negotiates versions on this channel
    fn handler_kind(&self) -> HandlerKind {
        HandlerKind::Native
    }

    /// Address of the remote endpoint the channel is connected to, if known
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }
}

// ----------------------------------------------------------------------------
// Text Formatting
// ----------------------------------------------------------------------------

/// Turns raw message text into something deliverable
pub trait TextFormatter: Send + Sync {
    fn format(&self, raw: &str) -> RenderedText;
}

/// Formatter that delivers text unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextFormatter;

impl TextFormatter for PlainTextFormatter {
    fn format(&self, raw: &str) -> RenderedText {
        RenderedText::new(raw)
    }
}

impl<F> TextFormatter for F
where
    F: Fn(&str) -> RenderedText + Send + Sync,
{
    fn format(&self, raw: &str) -> RenderedText {
        self(raw)
    }
}
