//! Platform Builder API
//!
//! Builder-style setup for hosts and tests: pick the configuration, the text
//! formatter and the probe connector, then start the platform.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use viabridge_core::{
    BridgeConfig, BridgeResult, PlainTextFormatter, ProbeConnector, TextFormatter,
};

use crate::platform::{PlatformFacade, PlatformParts};
use crate::probe::{DisabledConnector, ProtocolVersionProbe};
use crate::registry::ConnectionRegistry;
use crate::scheduler::TaskScheduler;

// ----------------------------------------------------------------------------
// Platform Builder
// ----------------------------------------------------------------------------

/// Builder for a [`PlatformFacade`]
pub struct PlatformBuilder {
    config: BridgeConfig,
    formatter: Arc<dyn TextFormatter>,
    connector: Arc<dyn ProbeConnector>,
    log_level: Option<Level>,
}

impl Default for PlatformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformBuilder {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            formatter: Arc::new(PlainTextFormatter),
            connector: Arc::new(DisabledConnector),
            log_level: None,
        }
    }

    /// Set the platform configuration
    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML file
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> BridgeResult<Self> {
        self.config = BridgeConfig::load_from_file(path)?;
        Ok(self)
    }

    /// Size of the worker pool
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.scheduler.worker_threads = count;
        self
    }

    /// Deadline for one version probe
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Formatter applied to message and kick text before delivery
    pub fn with_formatter(mut self, formatter: impl TextFormatter + 'static) -> Self {
        self.formatter = Arc::new(formatter);
        self
    }

    /// Connector used by version probes
    pub fn with_connector(mut self, connector: impl ProbeConnector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Install a console subscriber at `level`; `RUST_LOG` overrides it
    pub fn with_console_logging(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Disable logging setup
    pub fn with_no_logging(mut self) -> Self {
        self.log_level = None;
        self
    }

    /// Validate the configuration and start the platform
    pub fn start(self) -> BridgeResult<PlatformFacade> {
        if let Some(level) = self.log_level {
            init_console_logging(level);
        }

        self.config.validate()?;
        info!("Starting viabridge platform");

        let scheduler = TaskScheduler::start(&self.config.scheduler)?;
        let probe = ProtocolVersionProbe::new(self.connector, scheduler.clone(), &self.config.probe);

        let platform = PlatformFacade::from_parts(PlatformParts {
            config: self.config,
            scheduler,
            registry: ConnectionRegistry::new(),
            probe,
            formatter: self.formatter,
        });

        info!(
            mode = ?platform.config().probe.version_mode(),
            "viabridge platform started"
        );
        Ok(platform)
    }
}

fn init_console_logging(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    // Another subscriber may already be installed by the host or a test.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
