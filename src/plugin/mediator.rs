//! Lifetime mediator.
//!
//! Drives one plugin through its lifetime: `init`, `run`, `refresh` and
//! the stop sequence triggered by the first `request_stop()`.

use crate::lifecycle::{ErrorCallback, Lifetime, LifetimeHandler, LifetimeState};
use crate::loader::unit::PluginLease;
use crate::plugin::interface::{
    HostContext, PluginContext, PluginError, PluginErrorKind, PluginResult, WorkerSpawner,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// How long the stop sequence waits for `run` to return by default.
pub const DEFAULT_RUN_DRAIN: Duration = Duration::from_secs(30);

/// Owns a plugin's lifetime handler and its instance lease.
pub struct LifetimeMediator {
    name: String,
    handler: LifetimeHandler,
    lease: Mutex<Option<PluginLease>>,
    runtime: Handle,
    run_token: CancellationToken,
    run_task: Mutex<Option<JoinHandle<()>>>,
    draining: Mutex<Option<AbortHandle>>,
    run_drain: Mutex<Duration>,
    teardown_error: Mutex<Option<PluginError>>,
    released: AtomicBool,
}

impl LifetimeMediator {
    /// Create a mediator for a freshly instantiated plugin.
    ///
    /// The stop sequence and the plugin's `run` execute on `runtime`.
    pub fn new(lease: PluginLease, runtime: Handle) -> Arc<Self> {
        let name = lease.plugin().descriptor().name.clone();
        let mediator = Arc::new(Self {
            handler: LifetimeHandler::new(&name),
            name,
            lease: Mutex::new(Some(lease)),
            runtime,
            run_token: CancellationToken::new(),
            run_task: Mutex::new(None),
            draining: Mutex::new(None),
            run_drain: Mutex::new(DEFAULT_RUN_DRAIN),
            teardown_error: Mutex::new(None),
            released: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&mediator);
        let runtime = mediator.runtime.clone();
        mediator.handler.set_stop_action(Box::new(move || {
            runtime.spawn(async move {
                if let Some(mediator) = weak.upgrade() {
                    mediator.stop_sequence().await;
                }
            });
        }));
        mediator
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read-only view of the plugin's lifetime.
    pub fn lifetime(&self) -> Lifetime {
        self.handler.lifetime()
    }

    /// Current phase.
    pub fn state(&self) -> LifetimeState {
        self.handler.state()
    }

    /// Register a callback invoked when the plugin errors.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.handler.set_error_callback(callback);
    }

    /// Bound the stop sequence's wait for `run`. A `run` still going after
    /// this is aborted before teardown.
    pub fn set_run_drain(&self, drain: Duration) {
        *self.run_drain.lock() = drain;
    }

    /// Error returned by the plugin's teardown, if any.
    pub fn teardown_error(&self) -> Option<PluginError> {
        self.teardown_error.lock().clone()
    }

    /// Whether the lease has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn lease(&self) -> PluginResult<PluginLease> {
        self.lease
            .lock()
            .clone()
            .ok_or_else(|| PluginError::detached(&self.name))
    }

    /// Record the outcome of a plugin operation.
    ///
    /// A cancellation caused by a stop request is part of stopping and does
    /// not error the lifetime.
    fn settle(&self, operation: &str, result: PluginResult<()>) -> PluginResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(error)
                if error.kind == PluginErrorKind::Cancelled && self.run_token.is_cancelled() =>
            {
                tracing::debug!(plugin = %self.name, operation, "plugin operation ended by stop");
                Err(error)
            }
            Err(error) => {
                tracing::warn!(plugin = %self.name, operation, error = %error, "plugin operation failed");
                self.handler.move_to_error(&error);
                Err(error)
            }
        }
    }

    async fn guarded<F>(&self, operation: &str, cancel: &CancellationToken, fut: F) -> PluginResult<()>
    where
        F: Future<Output = PluginResult<()>>,
    {
        let result = tokio::select! {
            result = fut => result,
            _ = cancel.cancelled() => Err(PluginError::cancelled(operation)),
            _ = self.run_token.cancelled() => Err(PluginError::cancelled(operation)),
        };
        self.settle(operation, result)
    }

    /// Initialise the plugin: `Startup -> Initializing -> Initialized`.
    pub async fn init(&self, host: &HostContext, cancel: CancellationToken) -> PluginResult<()> {
        let lease = self.lease()?;
        if !self.handler.move_to_state(LifetimeState::Initializing) {
            return Err(PluginError::invalid_state(&format!(
                "init requires startup, plugin `{}` is {}",
                self.name,
                self.state()
            )));
        }

        let unit = lease.pin().downgrade();
        let ctx = PluginContext::new(
            host.clone(),
            self.lifetime(),
            lease.unit().dependencies(),
            WorkerSpawner::pinned(self.runtime.clone(), unit),
        );
        self.guarded("init", &cancel, lease.plugin().init(ctx, cancel.clone()))
            .await?;
        self.handler.move_to_state(LifetimeState::Initialized);
        tracing::debug!(plugin = %self.name, "plugin initialized");
        Ok(())
    }

    /// Start the plugin: `Initialized -> Starting`, then `Running` once its
    /// `run` returns.
    ///
    /// Does not wait for `run`. It executes in a task of its own; a failure
    /// errors the lifetime. The plugin sees the run token and must return
    /// once it is cancelled; `cancel` abandons `run` as a failure.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> PluginResult<()> {
        let lease = self.lease()?;
        if self.state() != LifetimeState::Initialized
            || !self.handler.move_to_state(LifetimeState::Starting)
        {
            return Err(PluginError::invalid_state(&format!(
                "run requires initialized, plugin `{}` is {}",
                self.name,
                self.state()
            )));
        }

        let mediator = Arc::clone(self);
        let token = self.run_token.child_token();
        let task = self.runtime.spawn(async move {
            let result = tokio::select! {
                result = lease.plugin().run(token) => result,
                _ = cancel.cancelled() => Err(PluginError::cancelled("run")),
            };
            drop(lease);
            if mediator.settle("run", result).is_ok()
                && mediator.handler.move_to_state(LifetimeState::Running)
            {
                tracing::info!(plugin = %mediator.name, "plugin running");
            }
        });
        *self.run_task.lock() = Some(task);
        Ok(())
    }

    /// Ask a running plugin to refresh.
    pub async fn refresh(&self, cancel: CancellationToken) -> PluginResult<()> {
        let lease = self.lease()?;
        if self.state() != LifetimeState::Running {
            return Err(PluginError::invalid_state(&format!(
                "refresh requires running, plugin `{}` is {}",
                self.name,
                self.state()
            )));
        }
        self.guarded("refresh", &cancel, lease.plugin().refresh(cancel.clone()))
            .await
    }

    async fn stop_sequence(&self) {
        self.handler.move_to_state(LifetimeState::Stopping);
        self.run_token.cancel();

        let run_task = self.run_task.lock().take();
        if let Some(mut task) = run_task {
            *self.draining.lock() = Some(task.abort_handle());
            if self.is_released() {
                task.abort();
            }
            let drain = *self.run_drain.lock();
            if tokio::time::timeout(drain, &mut task).await.is_err() {
                tracing::warn!(
                    plugin = %self.name,
                    drain_ms = drain.as_millis() as u64,
                    "run ignored the stop request, aborting it"
                );
                task.abort();
            }
            self.draining.lock().take();
        }

        let lease = self.lease.lock().clone();
        if let Some(lease) = lease {
            if let Err(error) = lease.plugin().teardown().await {
                tracing::warn!(plugin = %self.name, error = %error, "plugin teardown failed");
                *self.teardown_error.lock() = Some(error);
            }
        }

        self.handler.move_to_state(LifetimeState::Stopped);
        self.handler.move_to_state(LifetimeState::Destroyed);
        self.release();
        tracing::info!(plugin = %self.name, "plugin stopped");
    }

    /// Drop the plugin lease and the registered callbacks.
    ///
    /// Idempotent. A `run` still in flight is aborted. After release every
    /// plugin operation fails with a detached error.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handler.clear_stop_action();
        self.handler.clear_error_callback();
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.draining.lock().take() {
            task.abort();
        }
        let lease = self.lease.lock().take();
        drop(lease);
        tracing::debug!(plugin = %self.name, "plugin lease released");
    }
}

impl std::fmt::Debug for LifetimeMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifetimeMediator")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("released", &self.is_released())
            .finish()
    }
}
