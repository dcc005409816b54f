//! Error types for the viabridge platform
//!
//! Each concern gets its own `thiserror` enum; [`BridgeError`] unifies them
//! for callers that do not care which layer failed.

use std::net::SocketAddr;
use std::sync::Arc;

// ----------------------------------------------------------------------------
// Scheduler Errors
// ----------------------------------------------------------------------------

/// Errors returned when submitting work
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Task Errors
// ----------------------------------------------------------------------------

/// Non-success outcome of a scheduled task
///
/// `Cancelled` is a normal outcome and is never reported as a failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Task failed: {cause}")]
    Failed { cause: Arc<anyhow::Error> },
}

impl TaskError {
    pub fn failed(cause: anyhow::Error) -> Self {
        TaskError::Failed {
            cause: Arc::new(cause),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Final outcome recorded on a task handle
pub type TaskOutcome = Result<(), TaskError>;

// ----------------------------------------------------------------------------
// Probe Errors
// ----------------------------------------------------------------------------

/// Errors produced while probing a remote endpoint's protocol version
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Probe connection to {address} failed: {reason}")]
    ConnectionFailed { address: SocketAddr, reason: String },
    #[error("Probe handshake failed: {reason}")]
    Handshake { reason: String },
    #[error("Probe was aborted before completion")]
    Aborted,
}

// ----------------------------------------------------------------------------
// Config Errors
// ----------------------------------------------------------------------------

/// Errors produced while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Top-level error for the viabridge platform
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl BridgeError {
    pub fn channel(message: impl Into<String>) -> Self {
        BridgeError::Channel(message.into())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display_includes_cause() {
        let err = TaskError::failed(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "Task failed: boom");
        assert!(!err.is_cancelled());
        assert!(TaskError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_bridge_error_from_scheduler() {
        let err: BridgeError = SchedulerError::Closed.into();
        assert!(matches!(err, BridgeError::Scheduler(SchedulerError::Closed)));
    }

    #[test]
    fn test_probe_timeout_message() {
        let err = ProbeError::Timeout { duration_ms: 250 };
        assert_eq!(err.to_string(), "Probe timed out after 250ms");
    }
}
