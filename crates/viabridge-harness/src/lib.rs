//! viabridge Test Harness
//!
//! In-memory stand-ins for everything a host normally provides to the
//! platform: client channels, the simulation with its joined participants,
//! and the network connector used by version probes. Each mock records what
//! happened to it so tests can assert on side effects.

pub mod channel;
pub mod connector;
pub mod simulation;

pub use channel::MockChannel;
pub use connector::{ConnectorBehavior, MockConnector};
pub use simulation::{MockParticipant, MockSimulation};
