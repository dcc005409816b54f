//! Interfaces to the main simulation
//!
//! A [`Simulation`] owns fully joined participants. Every method here may only
//! be called on the main execution context; the runtime guarantees that by
//! routing all calls through the main-context queue or the on-context fast
//! paths.

use std::sync::Arc;

use crate::types::{ConnectionId, RenderedText};

/// A participant fully joined to the simulation
pub trait Participant: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn name(&self) -> String;

    /// Whether the participant holds `permission`
    fn has_permission(&self, permission: &str) -> bool;

    fn send_message(&self, text: &RenderedText);
}

/// The live simulation running on the main execution context
pub trait Simulation: Send + Sync + 'static {
    /// Snapshot of every joined participant
    fn participants(&self) -> Vec<Arc<dyn Participant>>;

    /// Look up one joined participant
    fn participant(&self, id: ConnectionId) -> Option<Arc<dyn Participant>> {
        self.participants().into_iter().find(|p| p.id() == id)
    }

    /// Disconnect a joined participant; returns whether one was found and removed
    fn kick(&self, id: ConnectionId, reason: &RenderedText) -> bool;
}
