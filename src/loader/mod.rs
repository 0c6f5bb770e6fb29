//! Loader Module
//!
//! Isolated module loading:
//! - Plugin manifests and private dependency resolution
//! - In-memory images with shadow copies
//! - Load units and non-owning reclamation handles

pub mod backend;
pub mod image;
pub mod manifest;
pub mod resolver;
pub mod unit;

pub use backend::{ImageBackend, ModuleImage, NativeBackend, NativeHandle, DEFAULT_ENTRY_SYMBOL};
pub use image::CodeImage;
pub use manifest::{DependencyKind, DependencySpec, PluginManifest};
pub use resolver::{DependencyResolver, ResolvedDependency};
pub use unit::{DependencyInfo, LoadUnit, LoadUnitHandle, PluginLease, UnitPin};

use crate::config::LoaderConfig;
use crate::core::{LoadError, LoadResult, UnitId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use unit::{DependencyImage, LoadedDependency, UnitImages};

/// Counts from a shadow directory sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShadowSweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped_live: usize,
}

/// Produces load units from plugin images.
pub struct ModuleLoader {
    config: LoaderConfig,
    backend: Arc<dyn ImageBackend>,
    live: Mutex<Vec<LoadUnitHandle>>,
}

impl ModuleLoader {
    /// Create a loader with a custom backend.
    pub fn new(config: LoaderConfig, backend: Arc<dyn ImageBackend>) -> Self {
        Self {
            config,
            backend,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Create a loader that opens images with the OS dynamic loader.
    pub fn native(config: LoaderConfig) -> Self {
        Self::new(config, Arc::new(NativeBackend))
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load the plugin image at `path` into a fresh unit.
    ///
    /// Fails without leaving anything behind if the image or any required
    /// dependency cannot be loaded.
    pub fn load(&self, path: &Path) -> LoadResult<Arc<LoadUnit>> {
        if !path.is_file() {
            return Err(LoadError::ImageNotFound(path.to_path_buf()));
        }
        let plugin_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest = PluginManifest::discover(path, &self.config.manifest_file_name)?;
        let image = CodeImage::read_with_symbols(path, &self.config.symbol_extensions)?;
        let resolved = DependencyResolver::new(&manifest, plugin_dir).resolve_all()?;

        let unit_id = UnitId::generate();
        let shadow_dir = self
            .config
            .shadow_root
            .join(format!("{}-{}", sanitize(&manifest.name), unit_id));
        std::fs::create_dir_all(&shadow_dir).map_err(|e| LoadError::io_at(&shadow_dir, e))?;
        let guard = ShadowDirGuard::new(shadow_dir.clone());

        let mut dependencies = Vec::with_capacity(resolved.len());
        for dep in &resolved {
            dependencies.push(self.load_dependency(dep, &shadow_dir)?);
        }

        let main_path = image.write_shadow(&shadow_dir)?;
        let main = self.backend.open_module(&image, &main_path)?;
        let entry_symbol = manifest
            .entry
            .clone()
            .unwrap_or_else(|| self.config.entry_symbol.clone());

        let unit = Arc::new(LoadUnit::new(
            unit_id,
            manifest.name.clone(),
            manifest.version.clone(),
            path.to_path_buf(),
            shadow_dir,
            entry_symbol,
            image.symbols.is_some(),
            UnitImages { main, dependencies },
        ));
        guard.disarm();

        tracing::info!(
            plugin = %manifest.name,
            version = %manifest.version,
            unit_id = %unit.id(),
            dependencies = resolved.len(),
            symbols = unit.has_symbols(),
            "load unit created"
        );
        self.live.lock().push(unit.handle());
        Ok(unit)
    }

    fn load_dependency(
        &self,
        dep: &ResolvedDependency,
        shadow_dir: &Path,
    ) -> LoadResult<LoadedDependency> {
        let image = CodeImage::read(&dep.path)?;
        let dep_dir = shadow_dir.join("deps").join(sanitize(&dep.name));
        std::fs::create_dir_all(&dep_dir).map_err(|e| LoadError::io_at(&dep_dir, e))?;
        let shadow_path = image.write_shadow(&dep_dir)?;

        let image = match dep.kind {
            DependencyKind::Module => {
                DependencyImage::Module(self.backend.open_module(&image, &shadow_path)?)
            }
            DependencyKind::Native => {
                DependencyImage::Native(self.backend.open_native(&image, &shadow_path)?)
            }
        };
        tracing::debug!(
            dependency = %dep.name,
            version = %dep.version,
            kind = %dep.kind,
            source = %dep.path.display(),
            "dependency loaded"
        );
        Ok(LoadedDependency {
            info: DependencyInfo {
                name: dep.name.clone(),
                version: dep.version.clone(),
                kind: dep.kind,
                source_path: dep.path.clone(),
                shadow_path,
            },
            image,
        })
    }

    /// Forget reclaimed units. Returns how many units are still resident.
    pub fn collect(&self) -> usize {
        let mut live = self.live.lock();
        live.retain(|handle| !handle.is_reclaimed());
        live.len()
    }

    /// Remove shadow directories that no resident unit owns.
    ///
    /// Leftovers come from units of a previous process. Best effort.
    pub fn sweep_shadow_root(&self) -> ShadowSweepReport {
        let mut report = ShadowSweepReport::default();
        let live_ids: Vec<UnitId> = {
            let mut live = self.live.lock();
            live.retain(|handle| !handle.is_reclaimed());
            live.iter().map(|h| h.id().clone()).collect()
        };

        let Ok(entries) = std::fs::read_dir(&self.config.shadow_root) else {
            return report;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            report.scanned += 1;
            let name = entry.file_name().to_string_lossy().to_string();
            if live_ids.iter().any(|id| name.ends_with(id.as_str())) {
                report.skipped_live += 1;
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(path = %path.display(), error = %err, "stale shadow removal failed");
                }
            }
        }
        if report.deleted > 0 || report.failed > 0 {
            tracing::debug!(
                shadow_scanned = report.scanned,
                shadow_deleted = report.deleted,
                shadow_failed = report.failed,
                shadow_skipped_live = report.skipped_live,
                "shadow sweep completed"
            );
        }
        report
    }
}

/// Removes a half-built shadow directory unless disarmed.
struct ShadowDirGuard {
    path: Option<PathBuf>,
}

impl ShadowDirGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for ShadowDirGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_dir_all(path);
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
