//! Platform facade
//!
//! Single entry point used by the translation layer: scheduling, connection
//! bookkeeping, command targets, messaging, kicks and version detection.
//! Every operation may be called from any thread. Anything that touches the
//! simulation is routed to the main context first.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use viabridge_core::{
    BridgeConfig, BridgeResult, ConnectionId, HandlerKind, ProtocolVersion, RenderedText,
    SchedulerError, Simulation, TextFormatter,
};

use crate::builder::PlatformBuilder;
use crate::probe::{ProbeFuture, ProtocolVersionProbe};
use crate::registry::{Connection, ConnectionRegistry};
use crate::resolver::VersionResolver;
use crate::scheduler::{MainContext, TaskHandle, TaskScheduler};
use crate::target::{CommandTarget, JoinedTarget, LightweightTarget};

// ----------------------------------------------------------------------------
// Kick Receipt
// ----------------------------------------------------------------------------

/// Resolves to whether a kick removed the participant
#[derive(Debug)]
pub struct KickReceipt {
    receiver: oneshot::Receiver<bool>,
}

impl KickReceipt {
    fn resolved(removed: bool) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(removed);
        Self { receiver }
    }

    /// The result if the kick has already run
    pub fn try_result(&mut self) -> Option<bool> {
        self.receiver.try_recv().ok()
    }
}

impl Future for KickReceipt {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(false))
    }
}

// ----------------------------------------------------------------------------
// Platform Facade
// ----------------------------------------------------------------------------

pub(crate) struct PlatformParts {
    pub(crate) config: BridgeConfig,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) probe: ProtocolVersionProbe,
    pub(crate) formatter: Arc<dyn TextFormatter>,
}

struct PlatformInner {
    config: BridgeConfig,
    scheduler: TaskScheduler,
    registry: ConnectionRegistry,
    probe: ProtocolVersionProbe,
    resolver: VersionResolver,
    formatter: Arc<dyn TextFormatter>,
    simulation: RwLock<Option<Arc<dyn Simulation>>>,
}

/// Handle to a running platform. Cheap to clone.
#[derive(Clone)]
pub struct PlatformFacade {
    inner: Arc<PlatformInner>,
}

impl PlatformFacade {
    /// Start configuring a platform
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::new()
    }

    pub(crate) fn from_parts(parts: PlatformParts) -> Self {
        let resolver = VersionResolver::new(parts.config.probe.clone(), parts.probe.clone());
        Self {
            inner: Arc::new(PlatformInner {
                config: parts.config,
                scheduler: parts.scheduler,
                registry: parts.registry,
                probe: parts.probe,
                resolver,
                formatter: parts.formatter,
                simulation: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn probe(&self) -> &ProtocolVersionProbe {
        &self.inner.probe
    }

    pub fn is_running(&self) -> bool {
        !self.inner.scheduler.is_closed()
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Run `work` on the worker pool
    pub fn run_async<F>(&self, work: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.scheduler.submit_async(work)
    }

    /// Run `work` on the main context, or the pool when no simulation is live
    pub fn run_sync<F>(&self, work: F) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.scheduler.submit_sync(work)
    }

    pub fn run_delayed<F>(&self, work: F, delay: Duration) -> Result<TaskHandle, SchedulerError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.inner.scheduler.submit_delayed(work, delay)
    }

    pub fn run_repeating<F>(&self, work: F, period: Duration) -> Result<TaskHandle, SchedulerError>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.scheduler.submit_repeating(work, period)
    }

    /// Whether the calling thread is the main context
    pub fn is_main_context(&self) -> bool {
        self.inner.scheduler.is_main_context()
    }

    // ------------------------------------------------------------------------
    // Simulation Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn a main-context thread named after `scheduler.main_thread_name`
    pub fn spawn_main_context(&self) -> BridgeResult<MainContext> {
        MainContext::spawn(self.inner.config.scheduler.main_thread_name.clone())
    }

    /// Make a simulation live, served by `main` as its main context
    pub fn attach_simulation(&self, simulation: Arc<dyn Simulation>, main: MainContext) {
        info!(context = %main.name(), "Simulation attached");
        *self
            .inner
            .simulation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(simulation);
        if let Some(previous) = self.inner.scheduler.attach_main_context(main) {
            debug!(context = %previous.name(), "Replaced previous main context");
        }
    }

    /// Take the simulation down. Returns the main context it used so the
    /// host can close it; main-context work falls back to the pool from now on.
    pub fn detach_simulation(&self) -> Option<MainContext> {
        self.inner
            .simulation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let main = self.inner.scheduler.detach_main_context();
        if main.is_some() {
            info!("Simulation detached");
        }
        main
    }

    pub fn has_simulation(&self) -> bool {
        self.simulation().is_some()
    }

    fn simulation(&self) -> Option<Arc<dyn Simulation>> {
        self.inner
            .simulation
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The simulation, but only when called from the main context
    fn simulation_on_main(&self) -> Option<Arc<dyn Simulation>> {
        if self.is_main_context() {
            self.simulation()
        } else {
            None
        }
    }

    // ------------------------------------------------------------------------
    // Connections and Targets
    // ------------------------------------------------------------------------

    pub fn register_connection(&self, connection: impl Into<Arc<Connection>>) -> Arc<Connection> {
        self.inner.registry.register(connection)
    }

    pub fn unregister_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.registry.unregister(id)
    }

    /// Everyone a command could address right now.
    ///
    /// On the main context with a live simulation these are the joined
    /// participants. Anywhere else they are lightweight targets built from
    /// the registry, one per live connection.
    pub fn online_targets(&self) -> Vec<CommandTarget> {
        if let Some(simulation) = self.simulation_on_main() {
            return simulation
                .participants()
                .into_iter()
                .map(|participant| {
                    CommandTarget::Joined(JoinedTarget::new(participant, self.clone()))
                })
                .collect();
        }

        self.inner
            .registry
            .connections()
            .into_iter()
            .map(|connection| {
                CommandTarget::Lightweight(LightweightTarget::new(connection, self.clone()))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Format `text` and deliver it to `id` on the main context.
    ///
    /// Unknown ids are ignored. The returned handle tracks delivery; it is
    /// `None` when nothing was submitted.
    pub fn send_message(&self, id: ConnectionId, text: &str) -> Option<TaskHandle> {
        if !self.inner.registry.contains(id) {
            debug!(connection = %id, "Dropping message for unknown connection");
            return None;
        }

        let rendered = self.inner.formatter.format(text);
        let platform = self.clone();
        match self
            .inner
            .scheduler
            .submit_main_context(move || platform.deliver(id, &rendered))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                debug!(connection = %id, "Message not submitted: {}", err);
                None
            }
        }
    }

    fn deliver(&self, id: ConnectionId, text: &RenderedText) -> anyhow::Result<()> {
        if let Some(simulation) = self.simulation_on_main() {
            if let Some(participant) = simulation.participant(id) {
                participant.send_message(text);
                return Ok(());
            }
        }
        if let Some(connection) = self.inner.registry.get(id) {
            connection.channel().send_text(text)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Kicks
    // ------------------------------------------------------------------------

    /// Remove a participant from the simulation.
    ///
    /// On the main context the kick runs inline and the result is returned.
    /// Anywhere else the kick is queued to the main context and `false` is
    /// returned immediately, whatever the eventual result; use
    /// [`Self::kick_with_confirmation`] to learn it. Without a live
    /// simulation nothing happens and the result is `false`.
    pub fn kick(&self, id: ConnectionId, reason: &str) -> bool {
        if self.simulation().is_none() {
            debug!(connection = %id, "Kick ignored, no simulation attached");
            return false;
        }
        let rendered = self.inner.formatter.format(reason);

        if self.is_main_context() {
            return self.kick_on_main(id, &rendered);
        }

        warn!(connection = %id, "Kick requested off the main context, deferring");
        let platform = self.clone();
        if let Err(err) = self.inner.scheduler.submit_main_context(move || {
            platform.kick_on_main(id, &rendered);
            Ok(())
        }) {
            warn!(connection = %id, "Deferred kick not submitted: {}", err);
        }
        false
    }

    /// Kick and learn the real result, even from off the main context
    pub fn kick_with_confirmation(&self, id: ConnectionId, reason: &str) -> KickReceipt {
        if self.simulation().is_none() {
            return KickReceipt::resolved(false);
        }
        let rendered = self.inner.formatter.format(reason);

        if self.is_main_context() {
            return KickReceipt::resolved(self.kick_on_main(id, &rendered));
        }

        let (sender, receiver) = oneshot::channel();
        let platform = self.clone();
        let submitted = self.inner.scheduler.submit_main_context(move || {
            let _ = sender.send(platform.kick_on_main(id, &rendered));
            Ok(())
        });
        if let Err(err) = submitted {
            warn!(connection = %id, "Kick not submitted: {}", err);
        }
        KickReceipt { receiver }
    }

    /// Unregister a connection and close its channel with `reason`.
    ///
    /// Works for connections that never joined the simulation and never
    /// touches it, so it may run on any thread. Returns whether `id` was known.
    pub fn disconnect(&self, id: ConnectionId, reason: &str) -> bool {
        let Some(connection) = self.inner.registry.unregister(id) else {
            return false;
        };
        let rendered = self.inner.formatter.format(reason);
        connection.channel().close(&rendered);
        info!(connection = %id, "Disconnected: {}", rendered);
        true
    }

    fn kick_on_main(&self, id: ConnectionId, reason: &RenderedText) -> bool {
        let Some(simulation) = self.simulation_on_main() else {
            debug!(connection = %id, "Kick skipped, main context no longer available");
            return false;
        };
        let removed = simulation.kick(id, reason);
        if removed {
            self.inner.registry.unregister(id);
            info!(connection = %id, "Kicked participant: {}", reason);
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Version Detection
    // ------------------------------------------------------------------------

    /// Detect the protocol version spoken at `address`
    pub fn detect_version(&self, address: SocketAddr) -> ProbeFuture {
        self.inner.probe.detect(address, HandlerKind::Native)
    }

    /// Detect the version for a registered connection's remote address,
    /// honouring the handler kind of its channel
    pub fn detect_version_for(&self, id: ConnectionId) -> Option<ProbeFuture> {
        let connection = self.inner.registry.get(id)?;
        let address = connection.remote_address()?;
        Some(self.inner.probe.detect(address, connection.handler_kind()))
    }

    /// Server protocol a registered connection should be translated to
    pub fn closest_server_protocol(&self, id: ConnectionId) -> Option<ProtocolVersion> {
        let connection = self.inner.registry.get(id)?;
        Some(self.inner.resolver.closest_server_protocol(&connection))
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop accepting work, detach the simulation and stop the pool.
    /// Main-context work still queued resolves as cancelled.
    pub fn shutdown(&self) {
        if self.inner.scheduler.is_closed() {
            return;
        }
        info!("Shutting down platform");
        self.inner.scheduler.close();
        if let Some(main) = self.detach_simulation() {
            main.abort();
        }
        self.inner.scheduler.shutdown();
    }
}

impl std::fmt::Debug for PlatformFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformFacade")
            .field("running", &self.is_running())
            .field("simulation", &self.has_simulation())
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}
