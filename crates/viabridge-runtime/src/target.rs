//! Command targets
//!
//! Uniform view of "someone a command can address". A target is either a
//! participant joined to the simulation or a lightweight wrapper around a bare
//! connection that has not joined (or whose participant is not reachable from
//! the calling thread).

use std::sync::Arc;

use viabridge_core::{ConnectionId, Participant};

use crate::platform::PlatformFacade;
use crate::registry::Connection;

/// Operations shared by every command target
pub trait Target {
    fn id(&self) -> ConnectionId;

    fn name(&self) -> String;

    fn has_permission(&self, permission: &str) -> bool;

    /// Deliver `text` through the platform
    fn send_message(&self, text: &str);

    /// Remove the target from the simulation. See [`PlatformFacade::kick`].
    fn kick(&self, reason: &str) -> bool;
}

// ----------------------------------------------------------------------------
// Lightweight Target
// ----------------------------------------------------------------------------

/// A connection addressed without touching the simulation
#[derive(Clone)]
pub struct LightweightTarget {
    connection: Arc<Connection>,
    platform: PlatformFacade,
}

impl LightweightTarget {
    pub fn new(connection: Arc<Connection>, platform: PlatformFacade) -> Self {
        Self {
            connection,
            platform,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Target for LightweightTarget {
    fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    fn name(&self) -> String {
        self.connection.name().to_string()
    }

    /// Lightweight targets hold no permissions
    fn has_permission(&self, _permission: &str) -> bool {
        false
    }

    fn send_message(&self, text: &str) {
        self.platform.send_message(self.id(), text);
    }

    fn kick(&self, reason: &str) -> bool {
        self.platform.kick(self.id(), reason)
    }
}

// ----------------------------------------------------------------------------
// Joined Target
// ----------------------------------------------------------------------------

/// A participant joined to the simulation. Only built on the main context.
#[derive(Clone)]
pub struct JoinedTarget {
    participant: Arc<dyn Participant>,
    platform: PlatformFacade,
}

impl JoinedTarget {
    pub fn new(participant: Arc<dyn Participant>, platform: PlatformFacade) -> Self {
        Self {
            participant,
            platform,
        }
    }

    pub fn participant(&self) -> &Arc<dyn Participant> {
        &self.participant
    }
}

impl Target for JoinedTarget {
    fn id(&self) -> ConnectionId {
        self.participant.id()
    }

    fn name(&self) -> String {
        self.participant.name()
    }

    fn has_permission(&self, permission: &str) -> bool {
        self.participant.has_permission(permission)
    }

    fn send_message(&self, text: &str) {
        self.platform.send_message(self.id(), text);
    }

    fn kick(&self, reason: &str) -> bool {
        self.platform.kick(self.id(), reason)
    }
}

// ----------------------------------------------------------------------------
// Command Target
// ----------------------------------------------------------------------------

/// Either kind of target
#[derive(Clone)]
pub enum CommandTarget {
    Lightweight(LightweightTarget),
    Joined(JoinedTarget),
}

impl CommandTarget {
    pub fn is_joined(&self) -> bool {
        matches!(self, CommandTarget::Joined(_))
    }

    fn as_target(&self) -> &dyn Target {
        match self {
            CommandTarget::Lightweight(target) => target,
            CommandTarget::Joined(target) => target,
        }
    }
}

impl Target for CommandTarget {
    fn id(&self) -> ConnectionId {
        self.as_target().id()
    }

    fn name(&self) -> String {
        self.as_target().name()
    }

    fn has_permission(&self, permission: &str) -> bool {
        self.as_target().has_permission(permission)
    }

    fn send_message(&self, text: &str) {
        self.as_target().send_message(text)
    }

    fn kick(&self, reason: &str) -> bool {
        self.as_target().kick(reason)
    }
}

impl std::fmt::Debug for CommandTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_joined() { "joined" } else { "lightweight" };
        f.debug_struct("CommandTarget")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &kind)
            .finish()
    }
}
