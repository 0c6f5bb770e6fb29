//! Plugin interface definition.
//!
//! Defines the interface plugins must implement and the context the host
//! hands them.

use crate::lifecycle::Lifetime;
use crate::loader::unit::{DependencyInfo, LoadUnit, UnitPin};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Plugin descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Plugin name
    pub name: String,
    /// Description
    pub description: String,
    /// Version
    pub version: String,
}

impl PluginDescriptor {
    /// Create a new descriptor.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            version: version.to_string(),
        }
    }

    /// Set description.
    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// What kind of failure a [`PluginError`] reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginErrorKind {
    /// Raised by plugin code
    #[default]
    Plugin,
    /// The plugin has been detached
    Detached,
    /// Operation not allowed in the current state
    InvalidState,
    /// The operation was cancelled
    Cancelled,
}

/// Plugin-specific error.
///
/// Plain data only, so an error returned by plugin code can outlive the
/// unit the plugin was loaded from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginError {
    /// Error message
    pub message: String,
    /// Error code
    pub code: i32,
    /// Is recoverable
    pub recoverable: bool,
    /// Error kind
    #[serde(default)]
    pub kind: PluginErrorKind,
}

impl PluginError {
    /// Create a new error.
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            code: -1,
            recoverable: true,
            kind: PluginErrorKind::Plugin,
        }
    }

    /// Create a fatal error.
    pub fn fatal(message: &str) -> Self {
        Self {
            recoverable: false,
            ..Self::new(message)
        }
    }

    /// Set the error code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Access through a detached plugin.
    pub fn detached(plugin: &str) -> Self {
        Self {
            kind: PluginErrorKind::Detached,
            recoverable: false,
            ..Self::new(&format!("plugin `{}` has been detached", plugin))
        }
    }

    /// Operation attempted in the wrong state.
    pub fn invalid_state(message: &str) -> Self {
        Self {
            kind: PluginErrorKind::InvalidState,
            ..Self::new(message)
        }
    }

    /// Operation cancelled by the caller.
    pub fn cancelled(operation: &str) -> Self {
        Self {
            kind: PluginErrorKind::Cancelled,
            ..Self::new(&format!("{} cancelled", operation))
        }
    }

    /// Whether this reports access to a detached plugin.
    pub fn is_detached(&self) -> bool {
        self.kind == PluginErrorKind::Detached
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            PluginErrorKind::Plugin => write!(f, "PluginError: {}", self.message),
            PluginErrorKind::Detached => write!(f, "Detached: {}", self.message),
            PluginErrorKind::InvalidState => write!(f, "InvalidState: {}", self.message),
            PluginErrorKind::Cancelled => write!(f, "Cancelled: {}", self.message),
        }
    }
}

impl std::error::Error for PluginError {}

/// Host-owned context shared by every plugin.
#[derive(Clone, Default)]
pub struct HostContext {
    /// Configuration
    config: Arc<HashMap<String, serde_json::Value>>,
    /// Plugin data directory
    data_dir: PathBuf,
    services: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl HostContext {
    /// Create a new context.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config: Arc::new(HashMap::new()),
            data_dir: data_dir.into(),
            services: Arc::new(HashMap::new()),
        }
    }

    /// Set config value.
    pub fn with_config(mut self, key: &str, value: serde_json::Value) -> Self {
        Arc::make_mut(&mut self.config).insert(key.to_string(), value);
        self
    }

    /// Register a host service, keyed by its type.
    pub fn with_service<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        Arc::make_mut(&mut self.services).insert(TypeId::of::<T>(), service);
        self
    }

    /// Get config value.
    pub fn get_config<T: for<'de> serde::Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.config.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a host service.
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let service = self.services.get(&TypeId::of::<T>())?.clone();
        service.downcast::<T>().ok()
    }

    /// Plugin data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("config", &self.config)
            .field("data_dir", &self.data_dir)
            .field("services", &self.services.len())
            .finish()
    }
}

/// Spawns plugin background work.
///
/// Tasks spawned for a loaded plugin pin its load unit until they finish.
#[derive(Clone)]
pub struct WorkerSpawner {
    runtime: Handle,
    unit: Option<Weak<LoadUnit>>,
    active: Arc<AtomicUsize>,
}

impl WorkerSpawner {
    /// A spawner that pins nothing, for plugins hosted without a loader.
    pub fn unpinned(runtime: Handle) -> Self {
        Self {
            runtime,
            unit: None,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn pinned(runtime: Handle, unit: Weak<LoadUnit>) -> Self {
        Self {
            runtime,
            unit: Some(unit),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) -> PluginResult<JoinHandle<()>> {
        let pin = match &self.unit {
            Some(unit) => Some(
                UnitPin::upgrade(unit)
                    .ok_or_else(|| PluginError::invalid_state("load unit already reclaimed"))?,
            ),
            None => None,
        };
        self.active.fetch_add(1, Ordering::AcqRel);
        let worker = PinnedWorker {
            future,
            _pin: pin,
            _active: ActiveWorker(Arc::clone(&self.active)),
        };
        Ok(self.runtime.spawn(worker))
    }

    /// Number of spawned tasks not yet finished.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

struct ActiveWorker(Arc<AtomicUsize>);

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker future wrapper. Field order is drop order: the plugin future
/// goes before the unit it runs from.
struct PinnedWorker {
    future: BoxFuture<'static, ()>,
    _pin: Option<UnitPin>,
    _active: ActiveWorker,
}

impl Future for PinnedWorker {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.get_mut().future.as_mut().poll(cx)
    }
}

/// Context passed to plugin `init`.
#[derive(Clone)]
pub struct PluginContext {
    host: HostContext,
    lifetime: Lifetime,
    dependencies: Vec<DependencyInfo>,
    spawner: WorkerSpawner,
}

impl PluginContext {
    /// Create a new context.
    pub fn new(
        host: HostContext,
        lifetime: Lifetime,
        dependencies: Vec<DependencyInfo>,
        spawner: WorkerSpawner,
    ) -> Self {
        Self {
            host,
            lifetime,
            dependencies,
            spawner,
        }
    }

    /// Host context.
    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// The plugin's own lifetime.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Private dependencies loaded with the plugin.
    pub fn dependencies(&self) -> &[DependencyInfo] {
        &self.dependencies
    }

    /// Get config value.
    pub fn get_config<T: for<'de> serde::Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.host.get_config(key)
    }

    /// Spawn background work that keeps the plugin's code loaded while it
    /// runs.
    pub fn spawn_worker(&self, future: BoxFuture<'static, ()>) -> PluginResult<JoinHandle<()>> {
        self.spawner.spawn(future)
    }

    /// Worker spawner.
    pub fn spawner(&self) -> &WorkerSpawner {
        &self.spawner
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("host", &self.host)
            .field("lifetime", &self.lifetime)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Plugin trait that all plugins must implement.
///
/// `run` must return quickly; long-running work goes through
/// [`PluginContext::spawn_worker`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Get plugin descriptor.
    fn descriptor(&self) -> &PluginDescriptor;

    /// Initialize the plugin.
    async fn init(&self, ctx: PluginContext, cancel: CancellationToken) -> PluginResult<()>;

    /// Start the plugin. `cancel` fires when the plugin is asked to stop.
    async fn run(&self, cancel: CancellationToken) -> PluginResult<()>;

    /// Reload configuration or state while running.
    async fn refresh(&self, _cancel: CancellationToken) -> PluginResult<()> {
        Ok(())
    }

    /// Release plugin resources on stop.
    async fn teardown(&self) -> PluginResult<()> {
        Ok(())
    }
}

/// A simple plugin that echoes messages back, for testing and as a
/// template for plugin authors.
pub struct EchoPlugin {
    descriptor: PluginDescriptor,
    state: Mutex<EchoState>,
}

#[derive(Default)]
struct EchoState {
    ctx: Option<PluginContext>,
    refreshes: u32,
}

impl EchoPlugin {
    /// Create a new echo plugin.
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("Echo", "1.0.0")
                .with_description("A simple echo plugin for testing"),
            state: Mutex::new(EchoState::default()),
        }
    }

    /// Echo a message.
    pub fn echo(&self, message: &str) -> PluginResult<String> {
        let state = self.state.lock();
        let ctx = state
            .ctx
            .as_ref()
            .ok_or_else(|| PluginError::invalid_state("echo used before init"))?;
        let prefix: String = ctx.get_config("echo.prefix").unwrap_or_default();
        Ok(format!("{}{}", prefix, message))
    }

    /// How many times `refresh` ran.
    pub fn refreshes(&self) -> u32 {
        self.state.lock().refreshes
    }
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn init(&self, ctx: PluginContext, _cancel: CancellationToken) -> PluginResult<()> {
        self.state.lock().ctx = Some(ctx);
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> PluginResult<()> {
        let ctx = self
            .state
            .lock()
            .ctx
            .clone()
            .ok_or_else(|| PluginError::invalid_state("run before init"))?;
        ctx.spawn_worker(Box::pin(async move { cancel.cancelled().await }))?;
        Ok(())
    }

    async fn refresh(&self, _cancel: CancellationToken) -> PluginResult<()> {
        self.state.lock().refreshes += 1;
        Ok(())
    }

    async fn teardown(&self) -> PluginResult<()> {
        self.state.lock().ctx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifetimeHandler;

    fn context(host: HostContext) -> PluginContext {
        let handler = LifetimeHandler::new("echo");
        PluginContext::new(
            host,
            handler.lifetime(),
            Vec::new(),
            WorkerSpawner::unpinned(Handle::current()),
        )
    }

    #[test]
    fn test_plugin_descriptor() {
        let descriptor = PluginDescriptor::new("test", "1.0.0").with_description("A test plugin");
        assert_eq!(descriptor.name, "test");
        assert_eq!(descriptor.description, "A test plugin");
    }

    #[test]
    fn test_plugin_error_kinds() {
        let err = PluginError::detached("echo");
        assert!(err.is_detached());
        assert!(!err.recoverable);
        assert!(err.to_string().starts_with("Detached:"));

        let err = PluginError::new("boom").with_code(7);
        assert_eq!(err.code, 7);
        assert!(err.recoverable);
        assert_eq!(err.to_string(), "PluginError: boom");

        assert!(!PluginError::fatal("bad").recoverable);
        assert_eq!(PluginError::cancelled("init").kind, PluginErrorKind::Cancelled);
    }

    #[test]
    fn test_plugin_error_serde() {
        let err = PluginError::invalid_state("not running");
        let json = serde_json::to_string(&err).unwrap();
        let back: PluginError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);

        let legacy: PluginError =
            serde_json::from_str(r#"{"message":"x","code":1,"recoverable":true}"#).unwrap();
        assert_eq!(legacy.kind, PluginErrorKind::Plugin);
    }

    #[test]
    fn test_host_context() {
        struct Clock(u64);
        let host = HostContext::new("/var/lib/plughost")
            .with_config("key", serde_json::json!("value"))
            .with_service(Arc::new(Clock(42)));

        let value: Option<String> = host.get_config("key");
        assert_eq!(value, Some("value".to_string()));
        assert_eq!(host.service::<Clock>().map(|c| c.0), Some(42));
        assert!(host.service::<String>().is_none());
        assert_eq!(host.data_dir(), Path::new("/var/lib/plughost"));
    }

    #[tokio::test]
    async fn test_echo_plugin() {
        let plugin = EchoPlugin::new();
        assert!(plugin.echo("hi").is_err());

        let host = HostContext::new("/tmp").with_config("echo.prefix", serde_json::json!("> "));
        let ctx = context(host);
        let spawner = ctx.spawner().clone();
        plugin.init(ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(plugin.echo("hi").unwrap(), "> hi");

        let cancel = CancellationToken::new();
        plugin.run(cancel.clone()).await.unwrap();
        assert_eq!(spawner.active_workers(), 1);

        cancel.cancel();
        plugin.teardown().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while spawner.active_workers() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(plugin.echo("hi").is_err());
    }

    #[tokio::test]
    async fn test_spawner_refuses_reclaimed_unit() {
        let spawner = WorkerSpawner::pinned(Handle::current(), Weak::new());
        let ctx = PluginContext::new(
            HostContext::default(),
            LifetimeHandler::new("gone").lifetime(),
            Vec::new(),
            spawner,
        );
        let err = ctx.spawn_worker(Box::pin(async {})).unwrap_err();
        assert_eq!(err.kind, PluginErrorKind::InvalidState);
    }
}
