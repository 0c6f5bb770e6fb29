//! Test support: an image backend that needs no real dynamic libraries and
//! a plugin whose behaviour each test configures.
//!
//! Image files are text. The first line is `<kind>:<name>:<version>`, with
//! kind `plugin`, `module` or `native`. Anything else is malformed.

use crate::config::{LoaderConfig, SupervisorConfig};
use crate::core::{LoadError, LoadResult};
use crate::loader::{
    CodeImage, ImageBackend, ModuleImage, ModuleLoader, NativeHandle, PluginLease,
    DEFAULT_ENTRY_SYMBOL,
};
use crate::plugin::{
    HostContext, Plugin, PluginContext, PluginDescriptor, PluginError, PluginRegistry,
    PluginResult,
};
use crate::supervisor::HostSupervisor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a probe operation behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Behaviour {
    Succeed,
    Fail,
    Hang,
}

/// Background work a probe spawns from `run`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Worker {
    /// Ends when the run token is cancelled
    UntilCancelled,
    /// Ignores cancellation and never ends
    Forever,
    /// Ends this long after the run token is cancelled
    Linger(Duration),
}

#[derive(Default)]
struct ProbeState {
    teardowns: AtomicUsize,
    refreshes: AtomicUsize,
    run_token: Mutex<Option<CancellationToken>>,
    context: Mutex<Option<PluginContext>>,
}

/// A configurable test plugin. Clones share their observed state.
#[derive(Clone)]
pub(crate) struct Probe {
    descriptor: PluginDescriptor,
    init: Behaviour,
    run: Behaviour,
    teardown: Behaviour,
    worker: Worker,
    fatal: bool,
    state: Arc<ProbeState>,
}

impl Probe {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            descriptor: PluginDescriptor::new(name, "1.0.0"),
            init: Behaviour::Succeed,
            run: Behaviour::Succeed,
            teardown: Behaviour::Succeed,
            worker: Worker::UntilCancelled,
            fatal: false,
            state: Arc::new(ProbeState::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn failing_init(mut self) -> Self {
        self.init = Behaviour::Fail;
        self
    }

    pub(crate) fn hanging_init(mut self) -> Self {
        self.init = Behaviour::Hang;
        self
    }

    pub(crate) fn failing_run(mut self) -> Self {
        self.run = Behaviour::Fail;
        self
    }

    /// `run` never returns, even once its token is cancelled.
    pub(crate) fn hanging_run(mut self) -> Self {
        self.run = Behaviour::Hang;
        self
    }

    pub(crate) fn failing_teardown(mut self) -> Self {
        self.teardown = Behaviour::Fail;
        self
    }

    pub(crate) fn hanging_teardown(mut self) -> Self {
        self.teardown = Behaviour::Hang;
        self
    }

    pub(crate) fn with_worker(mut self, worker: Worker) -> Self {
        self.worker = worker;
        self
    }

    /// Failures are unrecoverable.
    pub(crate) fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub(crate) fn teardowns(&self) -> usize {
        self.state.teardowns.load(Ordering::SeqCst)
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.state.refreshes.load(Ordering::SeqCst)
    }

    pub(crate) fn run_token_cancelled(&self) -> bool {
        self.state
            .run_token
            .lock()
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Context received by `init`.
    pub(crate) fn context(&self) -> Option<PluginContext> {
        self.state.context.lock().clone()
    }

    fn error(&self, message: &str) -> PluginError {
        if self.fatal {
            PluginError::fatal(message)
        } else {
            PluginError::new(message)
        }
    }

    async fn behave(&self, behaviour: Behaviour, failure: &str) -> PluginResult<()> {
        match behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(self.error(failure)),
            Behaviour::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Plugin for Probe {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn init(&self, ctx: PluginContext, _cancel: CancellationToken) -> PluginResult<()> {
        *self.state.context.lock() = Some(ctx);
        self.behave(self.init, "init failed").await
    }

    async fn run(&self, cancel: CancellationToken) -> PluginResult<()> {
        *self.state.run_token.lock() = Some(cancel.clone());
        self.behave(self.run, "run failed").await?;

        let ctx = self
            .context()
            .ok_or_else(|| PluginError::invalid_state("run before init"))?;
        match self.worker {
            Worker::UntilCancelled => {
                ctx.spawn_worker(Box::pin(async move { cancel.cancelled().await }))?;
            }
            Worker::Forever => {
                ctx.spawn_worker(Box::pin(std::future::pending::<()>()))?;
            }
            Worker::Linger(delay) => {
                ctx.spawn_worker(Box::pin(async move {
                    cancel.cancelled().await;
                    tokio::time::sleep(delay).await;
                }))?;
            }
        }
        Ok(())
    }

    async fn refresh(&self, _cancel: CancellationToken) -> PluginResult<()> {
        self.state.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> PluginResult<()> {
        self.state.teardowns.fetch_add(1, Ordering::SeqCst);
        self.behave(self.teardown, "teardown failed").await
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Backend mapping image contents to plugin factories.
#[derive(Default)]
pub(crate) struct TestBackend {
    factories: Mutex<HashMap<String, Factory>>,
    opened: Mutex<Vec<PathBuf>>,
}

impl TestBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serve `probe` for images named after it. Returns an observer.
    pub(crate) fn register(&self, probe: Probe) -> Probe {
        let observer = probe.clone();
        let factory: Factory = Arc::new(move || Box::new(probe.clone()) as Box<dyn Plugin>);
        self.factories
            .lock()
            .insert(observer.name().to_string(), factory);
        observer
    }

    /// Paths passed to `open_module`.
    pub(crate) fn opened_paths(&self) -> Vec<PathBuf> {
        self.opened.lock().clone()
    }

    fn parse(image: &CodeImage, shadow_path: &Path) -> LoadResult<(String, String, String)> {
        let malformed = |message: &str| LoadError::MalformedImage {
            path: shadow_path.to_path_buf(),
            message: message.to_string(),
        };
        let text = std::str::from_utf8(&image.bytes).map_err(|_| malformed("not utf-8"))?;
        let header = text.lines().next().unwrap_or_default();
        let mut parts = header.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(name), Some(version)) if !name.is_empty() => {
                Ok((kind.to_string(), name.to_string(), version.to_string()))
            }
            _ => Err(malformed("bad header")),
        }
    }
}

impl ImageBackend for TestBackend {
    fn open_module(
        &self,
        image: &CodeImage,
        shadow_path: &Path,
    ) -> LoadResult<Box<dyn ModuleImage>> {
        let (kind, name, version) = Self::parse(image, shadow_path)?;
        let is_plugin = match kind.as_str() {
            "plugin" => true,
            "module" => false,
            _ => {
                return Err(LoadError::MalformedImage {
                    path: shadow_path.to_path_buf(),
                    message: format!("unknown image kind `{}`", kind),
                })
            }
        };
        self.opened.lock().push(shadow_path.to_path_buf());
        let factory = self.factories.lock().get(&name).cloned();
        Ok(Box::new(TestModule {
            path: shadow_path.to_path_buf(),
            name,
            version,
            is_plugin,
            factory,
        }))
    }

    fn open_native(&self, image: &CodeImage, shadow_path: &Path) -> LoadResult<NativeHandle> {
        Self::parse(image, shadow_path)?;
        Ok(NativeHandle::unbacked(shadow_path.to_path_buf()))
    }
}

struct TestModule {
    path: PathBuf,
    name: String,
    version: String,
    is_plugin: bool,
    factory: Option<Factory>,
}

impl ModuleImage for TestModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn instantiate(&self, entry_symbol: &str) -> LoadResult<Box<dyn Plugin>> {
        if !self.is_plugin {
            return Err(LoadError::NotAPlugin {
                path: self.path.clone(),
            });
        }
        if entry_symbol != DEFAULT_ENTRY_SYMBOL {
            return Err(LoadError::MissingEntry {
                path: self.path.clone(),
                symbol: entry_symbol.to_string(),
            });
        }
        Ok(match &self.factory {
            Some(factory) => factory(),
            None => {
                let mut probe = Probe::new(&self.name);
                probe.descriptor.version = self.version.clone();
                Box::new(probe)
            }
        })
    }
}

/// Write `<root>/<name>/<name>.so`, its manifest and module dependencies.
pub(crate) fn write_plugin(root: &Path, name: &str, version: &str, deps: &[(&str, &str)]) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let image = dir.join(format!("{}.so", name));
    std::fs::write(&image, format!("plugin:{}:{}", name, version)).unwrap();

    let mut dependencies = serde_json::Map::new();
    for (dep, dep_version) in deps {
        std::fs::write(dir.join(dep), format!("module:{}:{}", dep, dep_version)).unwrap();
        dependencies.insert(dep.to_string(), serde_json::json!({ "version": dep_version }));
    }
    let manifest = serde_json::json!({
        "name": name,
        "version": version,
        "dependencies": dependencies,
    });
    std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
    image
}

/// A loader over a fresh test backend, shadowing into `<root>/shadow`.
pub(crate) fn loader_in(root: &Path) -> (ModuleLoader, Arc<TestBackend>) {
    let backend = Arc::new(TestBackend::new());
    let config = LoaderConfig {
        shadow_root: root.join("shadow"),
        ..LoaderConfig::default()
    };
    (ModuleLoader::new(config, backend.clone()), backend)
}

/// Load `probe` into a unit of its own and lease an instance.
pub(crate) fn lease_for(probe: Probe) -> (Probe, PluginLease, tempfile::TempDir) {
    let root = tempfile::tempdir().unwrap();
    let (loader, backend) = loader_in(root.path());
    let name = probe.name().to_string();
    let observer = backend.register(probe);
    let image = write_plugin(root.path(), &name, "1.0.0", &[]);
    let unit = loader.load(&image).unwrap();
    let lease = unit.instantiate().unwrap();
    (observer, lease, root)
}

/// Supervisor timings short enough for tests.
pub(crate) fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        stop_timeout_ms: 1_000,
        reclaim_grace_ms: 200,
        reclaim_fast_interval_ms: 10,
        reclaim_slow_interval_ms: 20,
        reclaim_max_slow_checks: Some(50),
        stop_all_on_fatal_error: false,
    }
}

/// A supervisor over a test backend rooted at `root`.
pub(crate) fn supervisor_in(root: &Path, config: SupervisorConfig) -> (HostSupervisor, Arc<TestBackend>) {
    let (loader, backend) = loader_in(root);
    let supervisor = HostSupervisor::with_parts(
        config,
        Arc::new(loader),
        Arc::new(PluginRegistry::new()),
        HostContext::new(root.join("data")),
    )
    .unwrap();
    (supervisor, backend)
}

/// Wait until `condition` holds, failing the test after two seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within 2s");
}
