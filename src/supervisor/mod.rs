//! Supervisor Module
//!
//! Host-side coordination of every plugin:
//! - Attach: load, instantiate, register, init, run
//! - Stop with timeouts, one plugin or all at once
//! - Detach and reclamation tracking
//! - Host shutdown cascading into plugins

mod reclaim;
pub mod report;

pub use report::{AttachedInfo, PluginPhase, StopReport};

use crate::config::{RuntimeConfig, SupervisorConfig};
use crate::core::{AttachedPluginId, Error, Result};
use crate::lifecycle::{Lifetime, LifetimeHandler, LifetimeState};
use crate::loader::ModuleLoader;
use crate::monitoring::RuntimeMetrics;
use crate::plugin::{
    AttachedPlugin, DetachedPlugin, HostContext, LifetimeMediator, PluginError, PluginRegistry,
    ReclaimState,
};
use parking_lot::Mutex;
use reclaim::ReclaimTracker;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of waiting for one plugin to stop.
struct StopOutcome {
    in_time: bool,
    error: Option<PluginError>,
}

/// Coordinates the plugins of one host process.
pub struct HostSupervisor {
    config: SupervisorConfig,
    loader: Arc<ModuleLoader>,
    registry: Arc<PluginRegistry>,
    host: HostContext,
    host_lifetime: Arc<LifetimeHandler>,
    metrics: Arc<RuntimeMetrics>,
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Serialises registration against the start of shutdown.
    admission: Mutex<()>,
    runtime: Handle,
}

impl HostSupervisor {
    /// Create a supervisor loading plugins with the OS dynamic loader.
    ///
    /// Must be called from within a tokio runtime. Stale shadow directories
    /// from earlier processes are removed.
    pub fn new(config: &RuntimeConfig, host: HostContext) -> Result<Self> {
        config.validate()?;
        let loader = Arc::new(ModuleLoader::native(config.loader.clone()));
        let report = loader.sweep_shadow_root();
        if report.deleted > 0 {
            tracing::info!(deleted = report.deleted, "removed stale shadow directories");
        }
        Self::with_parts(
            config.supervisor.clone(),
            loader,
            Arc::new(PluginRegistry::new()),
            host,
        )
    }

    /// Create a supervisor from its parts.
    pub fn with_parts(
        config: SupervisorConfig,
        loader: Arc<ModuleLoader>,
        registry: Arc<PluginRegistry>,
        host: HostContext,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime: {}", e)))?;

        let host_lifetime = Arc::new(LifetimeHandler::new("host"));
        let weak = Arc::downgrade(&host_lifetime);
        host_lifetime.set_stop_action(Box::new(move || {
            if let Some(handler) = weak.upgrade() {
                handler.move_to_state(LifetimeState::Stopping);
            }
        }));
        host_lifetime.move_to_state(LifetimeState::Running);

        Ok(Self {
            config,
            loader,
            registry,
            host,
            host_lifetime,
            metrics: Arc::new(RuntimeMetrics::new()),
            name_locks: Mutex::new(HashMap::new()),
            admission: Mutex::new(()),
            runtime,
        })
    }

    /// Supervisor settings in effect.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Loader shared with the reclamation trackers.
    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    /// Attached and detached plugin records.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Attach, stop and reclamation counters.
    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// The host's own lifetime. Every attached plugin follows its stop.
    pub fn host_lifetime(&self) -> Lifetime {
        self.host_lifetime.lifetime()
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.name_locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Load, register, initialise and start the plugin at `path`.
    ///
    /// Returns once `init` succeeded. The plugin's `run` continues in the
    /// background; its failure errors the plugin, which is then stopped.
    pub async fn attach(&self, path: &Path) -> Result<AttachedPluginId> {
        self.attach_with_cancel(path, CancellationToken::new()).await
    }

    /// [`attach`](Self::attach) with a token cancelling `init` and `run`.
    ///
    /// If `init` fails or is cancelled, the plugin stays registered in the
    /// errored condition so it can still be stopped and detached.
    pub async fn attach_with_cancel(
        &self,
        path: &Path,
        cancel: CancellationToken,
    ) -> Result<AttachedPluginId> {
        if self.host_lifetime.state().is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let result = self.attach_inner(path, cancel).await;
        match &result {
            Ok(id) => {
                self.metrics.attach_succeeded.inc();
                tracing::info!(path = %path.display(), id = %id, "plugin attached");
            }
            Err(err) => {
                self.metrics.attach_failed.inc();
                tracing::warn!(path = %path.display(), error = %err, "attach failed");
            }
        }
        result
    }

    async fn attach_inner(&self, path: &Path, cancel: CancellationToken) -> Result<AttachedPluginId> {
        let unit = self.loader.load(path)?;
        let lease = unit.instantiate()?;
        drop(unit);

        let name = lease.plugin().descriptor().name.clone();
        let lock = self.name_lock(&name);
        let _guard = lock.lock().await;
        if self.registry.is_attached(&name) {
            return Err(Error::AlreadyAttached(name));
        }

        let mediator = LifetimeMediator::new(lease.clone(), self.runtime.clone());
        let metrics = Arc::clone(&self.metrics);
        mediator.set_error_callback(Box::new(move |_| metrics.plugin_errors.inc()));
        mediator.set_run_drain(self.config.stop_timeout());
        let plugin = Arc::new(AttachedPlugin::new(lease, Arc::clone(&mediator)));
        {
            let _admit = self.admission.lock();
            if self.host_lifetime.state().is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            self.registry.add_attached(Arc::clone(&plugin))?;
        }
        self.metrics.attached.inc();

        plugin.own_task(plugin.lifetime().link_to_parent(&self.host_lifetime()));
        plugin.own_task(self.watch_errors(&plugin));

        mediator
            .init(&self.host, cancel.clone())
            .await
            .map_err(|e| Error::lifecycle(&name, e))?;
        mediator
            .run(cancel)
            .map_err(|e| Error::lifecycle(&name, e))?;
        Ok(plugin.id())
    }

    /// An errored plugin gets its own stop sequence. With
    /// `stop_all_on_fatal_error`, an unrecoverable error also stops the host.
    fn watch_errors(&self, plugin: &AttachedPlugin) -> JoinHandle<()> {
        let lifetime = plugin.lifetime().clone();
        let host = self.host_lifetime();
        let stop_host = self.config.stop_all_on_fatal_error;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = lifetime.errored().wait() => {}
                _ = lifetime.stopped().wait() => return,
                _ = host.stopped().wait() => return,
            }
            let error = lifetime.last_error();
            tracing::warn!(
                plugin = %lifetime.name(),
                error = ?error.as_ref().map(|e| e.to_string()),
                "plugin errored, stopping it"
            );
            lifetime.request_stop();
            if stop_host && error.map(|e| !e.recoverable).unwrap_or(false) {
                tracing::error!(plugin = %lifetime.name(), "fatal plugin error, stopping host");
                host.request_stop();
            }
        })
    }

    async fn stop_plugin(&self, plugin: &AttachedPlugin, timeout: Duration) -> StopOutcome {
        let lifetime = plugin.lifetime();
        let started = Instant::now();
        if lifetime.request_stop() {
            self.metrics.stop_requests.inc();
        }
        let in_time = lifetime.stopped().wait_timeout(timeout).await;
        plugin.record_stop(in_time);
        if in_time {
            self.metrics
                .stop_seconds
                .observe(started.elapsed().as_secs_f64());
        } else {
            self.metrics.stop_timeouts.inc();
            tracing::warn!(
                plugin = %plugin.name(),
                id = %plugin.id(),
                timeout_ms = timeout.as_millis() as u64,
                state = %lifetime.state(),
                "plugin did not stop in time"
            );
        }
        let error = lifetime
            .last_error()
            .or_else(|| plugin.mediator().ok().and_then(|m| m.teardown_error()));
        StopOutcome { in_time, error }
    }

    /// Stop every attached plugin concurrently, waiting at most `timeout`
    /// for each.
    pub async fn stop_all(&self, timeout: Duration) -> StopReport {
        let plugins = self.registry.attached();
        let outcomes =
            futures::future::join_all(plugins.iter().map(|p| self.stop_plugin(p, timeout))).await;

        let mut report = StopReport::default();
        for (plugin, outcome) in plugins.iter().zip(outcomes) {
            report.record(plugin.name(), outcome.in_time, outcome.error);
        }
        tracing::info!(report = %report, "stop_all finished");
        report
    }

    /// Stop one plugin, waiting at most `timeout`.
    pub async fn stop(&self, id: AttachedPluginId, timeout: Duration) -> Result<StopReport> {
        let plugin = self.registry.get_attached_by_id(id)?;
        let outcome = self.stop_plugin(&plugin, timeout).await;
        let mut report = StopReport::default();
        report.record(plugin.name(), outcome.in_time, outcome.error);
        Ok(report)
    }

    /// Refresh a running plugin.
    pub async fn refresh(&self, id: AttachedPluginId, cancel: CancellationToken) -> Result<()> {
        let plugin = self.registry.get_attached_by_id(id)?;
        let mediator = plugin
            .mediator()
            .map_err(|e| Error::lifecycle(plugin.name(), e))?;
        mediator
            .refresh(cancel)
            .await
            .map_err(|e| Error::lifecycle(plugin.name(), e))
    }

    /// Detach a plugin and start tracking its unit's reclamation.
    ///
    /// A plugin that has not stopped yet is stopped first, waiting at most
    /// the configured stop timeout.
    pub async fn detach(&self, id: AttachedPluginId) -> Result<DetachedPlugin> {
        let plugin = self.registry.get_attached_by_id(id)?;
        let lock = self.name_lock(plugin.name());
        let _guard = lock.lock().await;

        if plugin.lifetime().state() < LifetimeState::Stopped {
            self.stop_plugin(&plugin, self.config.stop_timeout()).await;
        }
        self.detach_plugin(&plugin)
    }

    fn detach_plugin(&self, plugin: &AttachedPlugin) -> Result<DetachedPlugin> {
        let (_, handle) = plugin
            .detach()
            .map_err(|e| Error::lifecycle(plugin.name(), e))?;
        let record = self.registry.detach_attached(plugin)?;
        self.metrics.detached.inc();
        self.metrics.attached.dec();
        self.metrics.pending_reclamation.inc();

        let tracker = ReclaimTracker {
            registry: Arc::clone(&self.registry),
            loader: Arc::clone(&self.loader),
            metrics: Arc::clone(&self.metrics),
            config: self.config.clone(),
        };
        self.runtime.spawn(tracker.run(record.id, handle));
        Ok(record)
    }

    /// Poll a detached plugin's unit once.
    pub fn check_reclamation(&self, id: AttachedPluginId) -> Result<ReclaimState> {
        reclaim::observe(
            &self.registry,
            &self.loader,
            &self.metrics,
            self.config.reclaim_grace(),
            id,
        )
        .ok_or_else(|| Error::DetachedNotFound(id.to_string()))
    }

    /// Last recorded reclamation outcome of a detached plugin.
    pub fn reclaim_status(&self, id: AttachedPluginId) -> Result<ReclaimState> {
        Ok(self.registry.get_detached(id)?.record.reclaim_state())
    }

    /// Whole-unit phase of a plugin.
    pub fn phase(&self, id: AttachedPluginId) -> PluginPhase {
        if let Ok(plugin) = self.registry.get_attached_by_id(id) {
            return match plugin.lifetime().state() {
                s if s >= LifetimeState::Stopped => PluginPhase::Stopped,
                LifetimeState::Stopping => PluginPhase::Stopping,
                _ => PluginPhase::Attached,
            };
        }
        match self.registry.get_detached(id) {
            Ok(entry) => match entry.record.reclaim_state() {
                ReclaimState::ReclaimedInTime => PluginPhase::ReclaimedInTime,
                ReclaimState::ReclaimedLate => PluginPhase::ReclaimedLate,
                ReclaimState::Pending if entry.handle.is_reclaimed() => PluginPhase::Detached,
                ReclaimState::Pending => PluginPhase::ReclaimPending,
            },
            Err(_) => PluginPhase::NotLoaded,
        }
    }

    /// Attached plugins, in attach order.
    pub fn list_attached(&self) -> Vec<AttachedInfo> {
        self.registry
            .attached()
            .iter()
            .map(|p| AttachedInfo {
                id: p.id(),
                descriptor: p.descriptor().clone(),
                unit_id: p.unit_id().clone(),
                state: p.lifetime().state(),
                errored: p.lifetime().is_errored(),
                attached_at: p.attached_at(),
            })
            .collect()
    }

    /// Detached plugins not yet forgotten.
    pub fn list_detached(&self) -> Vec<DetachedPlugin> {
        self.registry.detached()
    }

    /// Forget detached plugins whose unit has been reclaimed.
    pub fn prune_reclaimed(&self) -> Vec<DetachedPlugin> {
        self.registry.remove_detached_where(|r| !r.is_pending())
    }

    /// Forget a detached plugin, reclaimed or not.
    pub fn forget_detached(&self, id: AttachedPluginId) -> Result<DetachedPlugin> {
        let record = self.registry.remove_detached(id)?;
        if record.is_pending() {
            self.metrics.pending_reclamation.dec();
        }
        Ok(record)
    }

    /// Stop every plugin, detach them all, and finish the host lifetime.
    pub async fn shutdown(&self, timeout: Duration) -> StopReport {
        tracing::info!(plugins = self.registry.attached_count(), "host shutting down");
        {
            let _admit = self.admission.lock();
            self.host_lifetime.move_to_state(LifetimeState::Stopping);
        }

        // No plugin registers past this point, so stop_all sees them all.
        let report = self.stop_all(timeout).await;
        for plugin in self.registry.attached() {
            let lock = self.name_lock(plugin.name());
            let _guard = lock.lock().await;
            if let Err(err) = self.detach_plugin(&plugin) {
                tracing::warn!(plugin = %plugin.name(), error = %err, "detach during shutdown failed");
            }
        }

        self.host_lifetime.move_to_state(LifetimeState::Stopped);
        self.host_lifetime.move_to_state(LifetimeState::Destroyed);
        tracing::info!(report = %report, "host stopped");
        report
    }
}

impl std::fmt::Debug for HostSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSupervisor")
            .field("state", &self.host_lifetime.state())
            .field("attached", &self.registry.attached_count())
            .field("detached", &self.registry.detached_count())
            .finish()
    }
}
