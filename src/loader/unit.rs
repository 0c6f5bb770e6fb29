//! Load units and the handles that observe them.

use crate::core::{now, LoadResult, Timestamp, UnitId};
use crate::loader::backend::{ModuleImage, NativeHandle};
use crate::loader::manifest::DependencyKind;
use crate::plugin::interface::Plugin;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Description of a dependency loaded into a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub name: String,
    pub version: String,
    pub kind: DependencyKind,
    /// Where it was resolved from
    pub source_path: PathBuf,
    /// Private copy it was opened from
    pub shadow_path: PathBuf,
}

/// An opened dependency image.
pub enum DependencyImage {
    Module(Box<dyn ModuleImage>),
    Native(NativeHandle),
}

/// A dependency held by a unit.
pub struct LoadedDependency {
    pub info: DependencyInfo,
    pub image: DependencyImage,
}

/// Images owned by a unit. Field order is the close order: the plugin
/// image goes before the libraries it depends on.
pub(crate) struct UnitImages {
    pub(crate) main: Box<dyn ModuleImage>,
    pub(crate) dependencies: Vec<LoadedDependency>,
}

/// An isolated, independently unloadable container of a plugin's code.
///
/// The unit is unloaded when its last strong reference drops: images are
/// closed and the private shadow directory is removed.
pub struct LoadUnit {
    id: UnitId,
    plugin_name: String,
    version: String,
    source_path: PathBuf,
    shadow_dir: PathBuf,
    entry_symbol: String,
    has_symbols: bool,
    created_at: Timestamp,
    unload_requested: AtomicBool,
    images: Option<UnitImages>,
}

impl LoadUnit {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: UnitId,
        plugin_name: String,
        version: String,
        source_path: PathBuf,
        shadow_dir: PathBuf,
        entry_symbol: String,
        has_symbols: bool,
        images: UnitImages,
    ) -> Self {
        Self {
            id,
            plugin_name,
            version,
            source_path,
            shadow_dir,
            entry_symbol,
            has_symbols,
            created_at: now(),
            unload_requested: AtomicBool::new(false),
            images: Some(images),
        }
    }

    /// Unit identifier.
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    /// Name from the plugin manifest.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Version from the plugin manifest.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Image the unit was loaded from.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Private directory holding the shadow copies.
    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    /// Whether debug symbols were loaded with the image.
    pub fn has_symbols(&self) -> bool {
        self.has_symbols
    }

    /// Creation time.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Dependencies loaded into this unit.
    pub fn dependencies(&self) -> Vec<DependencyInfo> {
        self.images
            .as_ref()
            .map(|images| images.dependencies.iter().map(|d| d.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Look up a dependency by name.
    pub fn dependency(&self, name: &str) -> Option<DependencyInfo> {
        self.dependencies().into_iter().find(|d| d.name == name)
    }

    /// Native handle of a native dependency.
    pub fn native_handle(&self, name: &str) -> Option<&NativeHandle> {
        self.images.as_ref()?.dependencies.iter().find_map(|d| match &d.image {
            DependencyImage::Native(handle) if d.info.name == name => Some(handle),
            _ => None,
        })
    }

    /// Ask for the unit to be unloaded.
    ///
    /// This is only a request: the unit goes away once every strong
    /// reference into it has been dropped.
    pub fn request_unload(&self) {
        if !self.unload_requested.swap(true, Ordering::AcqRel) {
            tracing::debug!(plugin = %self.plugin_name, unit_id = %self.id, "unload requested");
        }
    }

    /// Whether unload has been requested.
    pub fn is_unload_requested(&self) -> bool {
        self.unload_requested.load(Ordering::Acquire)
    }

    /// Construct a plugin instance, leased against this unit.
    pub fn instantiate(self: &Arc<Self>) -> LoadResult<PluginLease> {
        let images = self.images.as_ref().ok_or_else(|| crate::core::LoadError::NotAPlugin {
            path: self.source_path.clone(),
        })?;
        let plugin = images.main.instantiate(&self.entry_symbol)?;
        Ok(PluginLease {
            plugin: Arc::from(plugin),
            unit: Arc::clone(self),
        })
    }

    /// A non-owning handle to this unit.
    pub fn handle(self: &Arc<Self>) -> LoadUnitHandle {
        LoadUnitHandle {
            id: self.id.clone(),
            plugin_name: self.plugin_name.clone(),
            unit: Arc::downgrade(self),
        }
    }
}

impl Drop for LoadUnit {
    fn drop(&mut self) {
        drop(self.images.take());
        if let Err(err) = std::fs::remove_dir_all(&self.shadow_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    unit_id = %self.id,
                    path = %self.shadow_dir.display(),
                    error = %err,
                    "failed to remove shadow directory"
                );
            }
        }
        tracing::debug!(plugin = %self.plugin_name, unit_id = %self.id, "load unit reclaimed");
    }
}

impl std::fmt::Debug for LoadUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadUnit")
            .field("id", &self.id)
            .field("plugin_name", &self.plugin_name)
            .field("version", &self.version)
            .field("shadow_dir", &self.shadow_dir)
            .finish()
    }
}

/// Non-owning handle to a load unit.
///
/// Answers whether the unit has been reclaimed. It deliberately offers no
/// way back into the unit.
#[derive(Clone, Debug)]
pub struct LoadUnitHandle {
    id: UnitId,
    plugin_name: String,
    unit: Weak<LoadUnit>,
}

impl LoadUnitHandle {
    /// Identifier of the observed unit.
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    /// Plugin name of the observed unit.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Whether the unit's memory has been released.
    pub fn is_reclaimed(&self) -> bool {
        self.unit.strong_count() == 0
    }

    /// Number of strong references still holding the unit.
    pub fn strong_count(&self) -> usize {
        self.unit.strong_count()
    }
}

/// A plugin instance together with the unit its code lives in.
///
/// Field order matters: the instance is dropped before the unit, so the
/// instance's drop code still runs from loaded memory.
#[derive(Clone)]
pub struct PluginLease {
    plugin: Arc<dyn Plugin>,
    unit: Arc<LoadUnit>,
}

impl PluginLease {
    /// The plugin instance.
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// The unit holding the plugin's code.
    pub fn unit(&self) -> &LoadUnit {
        &self.unit
    }

    /// Non-owning handle to the unit.
    pub fn unit_handle(&self) -> LoadUnitHandle {
        self.unit.handle()
    }

    /// A strong pin on the unit only.
    pub(crate) fn pin(&self) -> UnitPin {
        UnitPin(Arc::clone(&self.unit))
    }
}

/// Keeps a unit loaded while held. Opaque.
#[derive(Clone)]
pub struct UnitPin(Arc<LoadUnit>);

impl UnitPin {
    /// Try to pin a unit through its weak reference.
    pub(crate) fn upgrade(unit: &Weak<LoadUnit>) -> Option<Self> {
        unit.upgrade().map(UnitPin)
    }

    /// Weak reference to the pinned unit.
    pub(crate) fn downgrade(&self) -> Weak<LoadUnit> {
        Arc::downgrade(&self.0)
    }
}
