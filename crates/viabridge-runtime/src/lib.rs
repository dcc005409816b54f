//! viabridge Runtime
//!
//! Runtime bridge between a protocol-translation layer and the host that runs
//! the simulation:
//! - `TaskScheduler`: worker pool plus the serialized main execution context
//! - `ConnectionRegistry`: live client connections keyed by id
//! - `CommandTarget`: uniform addressing of joined and lightweight targets
//! - `ProtocolVersionProbe`: cached, coalescing remote version detection
//! - `PlatformFacade`: the entry point tying them together
//!
//! `viabridge-core` holds the shared types and the traits hosts implement.

pub mod builder;
pub mod platform;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod target;

pub use builder::PlatformBuilder;
pub use platform::{KickReceipt, PlatformFacade};
pub use probe::{
    DisabledConnector, ProbeFuture, ProbeOutcome, ProbeResult, ProbeState, ProtocolVersionProbe,
};
pub use registry::{Connection, ConnectionRegistry, RegistryStats};
pub use resolver::VersionResolver;
pub use scheduler::{
    MainContext, MainQueue, SchedulerStats, TaskHandle, TaskId, TaskScheduler, TaskState,
};
pub use target::{CommandTarget, JoinedTarget, LightweightTarget, Target};

// Re-export core types for convenience
pub use viabridge_core::{
    BridgeConfig, BridgeError, BridgeResult, ConnectionChannel, ConnectionId, HandlerKind,
    Participant, ProbeConfig, ProbeConnector, ProbeError, ProbeSession, ProtocolVersion,
    RenderedText, SchedulerConfig, SchedulerError, Simulation, TaskError, TaskOutcome,
    TextFormatter, VersionMode, AUTO_DETECT_VERSION, NATIVE_VERSION,
};
