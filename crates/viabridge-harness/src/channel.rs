//! Mock client channel

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use viabridge_core::{BridgeError, BridgeResult, ConnectionChannel, HandlerKind, RenderedText};

/// Channel that records delivered text instead of writing to a socket
#[derive(Debug, Default)]
pub struct MockChannel {
    sent: Mutex<Vec<String>>,
    closed_with: Mutex<Option<String>>,
    fail_sends: AtomicBool,
    handler: AtomicU8,
    address: Option<SocketAddr>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Pretend a competing translation layer owns this channel
    pub fn with_foreign_handler(self) -> Self {
        self.set_handler_kind(HandlerKind::Foreign);
        self
    }

    pub fn set_handler_kind(&self, kind: HandlerKind) {
        let raw = match kind {
            HandlerKind::Native => 0,
            HandlerKind::Foreign => 1,
        };
        self.handler.store(raw, Ordering::SeqCst);
    }

    /// Make every following `send_text` fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Text delivered so far, in order
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn closed_with(&self) -> Option<String> {
        self.closed_with.lock().ok().and_then(|c| c.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed_with().is_some()
    }
}

impl ConnectionChannel for MockChannel {
    fn send_text(&self, text: &RenderedText) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::channel("channel is closed"));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BridgeError::channel("send refused by mock"));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(text.as_str().to_string());
        }
        Ok(())
    }

    fn close(&self, reason: &RenderedText) {
        if let Ok(mut closed) = self.closed_with.lock() {
            closed.get_or_insert_with(|| reason.as_str().to_string());
        }
    }

    fn handler_kind(&self) -> HandlerKind {
        match self.handler.load(Ordering::SeqCst) {
            0 => HandlerKind::Native,
            _ => HandlerKind::Foreign,
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_sent_text() {
        let channel = MockChannel::new();
        channel
            .send_text(&RenderedText::new("hello"))
            .expect("Failed to send");
        channel
            .send_text(&RenderedText::new("world"))
            .expect("Failed to send");
        assert_eq!(channel.sent(), vec!["hello", "world"]);
    }

    #[test]
    fn test_closed_channel_rejects_sends() {
        let channel = MockChannel::new();
        channel.close(&RenderedText::new("bye"));
        channel.close(&RenderedText::new("ignored"));

        assert_eq!(channel.closed_with().as_deref(), Some("bye"));
        assert!(channel.send_text(&RenderedText::new("late")).is_err());
    }

    #[test]
    fn test_handler_kind_switch() {
        let channel = MockChannel::new();
        assert_eq!(channel.handler_kind(), HandlerKind::Native);
        channel.set_handler_kind(HandlerKind::Foreign);
        assert_eq!(channel.handler_kind(), HandlerKind::Foreign);
    }
}
