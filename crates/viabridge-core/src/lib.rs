//! viabridge core
//!
//! Identifiers, error types, configuration, and the collaborator traits that
//! the runtime talks through. Host integrations implement the traits; the
//! runtime crate composes them.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod errors;
pub mod simulation;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{ConnectionChannel, PlainTextFormatter, TextFormatter};
pub use config::{
    BridgeConfig, ProbeConfig, SchedulerConfig, VersionMode, AUTO_DETECT_VERSION, NATIVE_VERSION,
};
pub use errors::{
    BridgeError, BridgeResult, ConfigError, ProbeError, SchedulerError, TaskError, TaskOutcome,
};
pub use simulation::{Participant, Simulation};
pub use transport::{ProbeConnector, ProbeSession};
pub use types::{ConnectionId, HandlerKind, ProtocolVersion, RenderedText};
