//! Mock simulation and participants
//!
//! [`MockSimulation`] can be bound to the main-context thread; every call it
//! receives from any other thread is counted as a violation, which lets tests
//! prove the platform never touches the simulation off the main context.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use tracing::warn;
use viabridge_core::{ConnectionId, Participant, RenderedText, Simulation};

// ----------------------------------------------------------------------------
// Participant
// ----------------------------------------------------------------------------

/// Joined participant that records the messages it receives
#[derive(Debug)]
pub struct MockParticipant {
    id: ConnectionId,
    name: String,
    permissions: Mutex<HashSet<String>>,
    messages: Mutex<Vec<String>>,
}

impl MockParticipant {
    pub fn new(id: ConnectionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            permissions: Mutex::new(HashSet::new()),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn grant(&self, permission: impl Into<String>) {
        if let Ok(mut permissions) = self.permissions.lock() {
            permissions.insert(permission.into());
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl Participant for MockParticipant {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .lock()
            .map(|p| p.contains(permission))
            .unwrap_or(false)
    }

    fn send_message(&self, text: &RenderedText) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(text.as_str().to_string());
        }
    }
}

// ----------------------------------------------------------------------------
// Simulation
// ----------------------------------------------------------------------------

/// In-memory simulation with a mutable participant list
#[derive(Debug, Default)]
pub struct MockSimulation {
    participants: Mutex<Vec<Arc<MockParticipant>>>,
    kicked: Mutex<Vec<(ConnectionId, String)>>,
    main_thread: Mutex<Option<ThreadId>>,
    off_thread_calls: AtomicUsize,
}

impl MockSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joined participant
    pub fn join(&self, id: ConnectionId, name: impl Into<String>) -> Arc<MockParticipant> {
        let participant = Arc::new(MockParticipant::new(id, name));
        if let Ok(mut participants) = self.participants.lock() {
            participants.push(participant.clone());
        }
        participant
    }

    /// Record calls made from threads other than `thread`
    pub fn bind_main_thread(&self, thread: ThreadId) {
        if let Ok(mut main) = self.main_thread.lock() {
            *main = Some(thread);
        }
    }

    /// Number of calls that arrived off the bound main thread
    pub fn off_thread_calls(&self) -> usize {
        self.off_thread_calls.load(Ordering::SeqCst)
    }

    /// Kicks performed so far: id and rendered reason
    pub fn kicked(&self) -> Vec<(ConnectionId, String)> {
        self.kicked.lock().map(|k| k.clone()).unwrap_or_default()
    }

    pub fn is_joined(&self, id: ConnectionId) -> bool {
        self.participants
            .lock()
            .map(|p| p.iter().any(|participant| participant.id == id))
            .unwrap_or(false)
    }

    fn check_thread(&self, operation: &str) {
        let bound = self.main_thread.lock().ok().and_then(|main| *main);
        if let Some(main) = bound {
            if std::thread::current().id() != main {
                warn!(operation, "Simulation accessed off the main thread");
                self.off_thread_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl Simulation for MockSimulation {
    fn participants(&self) -> Vec<Arc<dyn Participant>> {
        self.check_thread("participants");
        self.participants
            .lock()
            .map(|p| {
                p.iter()
                    .map(|participant| participant.clone() as Arc<dyn Participant>)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn kick(&self, id: ConnectionId, reason: &RenderedText) -> bool {
        self.check_thread("kick");
        let removed = match self.participants.lock() {
            Ok(mut participants) => {
                let before = participants.len();
                participants.retain(|participant| participant.id != id);
                participants.len() != before
            }
            Err(_) => false,
        };
        if removed {
            if let Ok(mut kicked) = self.kicked.lock() {
                kicked.push((id, reason.as_str().to_string()));
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_kick() {
        let simulation = MockSimulation::new();
        let id = ConnectionId::random();
        simulation.join(id, "alice");

        assert!(simulation.is_joined(id));
        assert_eq!(simulation.participants().len(), 1);
        assert!(simulation.kick(id, &RenderedText::new("bye")));
        assert!(!simulation.kick(id, &RenderedText::new("again")));
        assert_eq!(simulation.kicked(), vec![(id, "bye".to_string())]);
    }

    #[test]
    fn test_participant_permissions() {
        let participant = MockParticipant::new(ConnectionId::random(), "bob");
        assert!(!participant.has_permission("admin"));
        participant.grant("admin");
        assert!(participant.has_permission("admin"));
    }

    #[test]
    fn test_off_thread_calls_are_counted() {
        let simulation = Arc::new(MockSimulation::new());
        simulation.bind_main_thread(std::thread::current().id());
        simulation.participants();
        assert_eq!(simulation.off_thread_calls(), 0);

        let remote = simulation.clone();
        std::thread::spawn(move || remote.participants().len())
            .join()
            .expect("Failed to join thread");
        assert_eq!(simulation.off_thread_calls(), 1);
    }
}
