//! Plugin registry.
//!
//! Holds the attached set and the detached-but-not-reclaimed set. Writers
//! serialise on one lock and publish a new snapshot; readers load the
//! current snapshot and never block.

use crate::core::{AttachedPluginId, Error, Result};
use crate::loader::unit::LoadUnitHandle;
use crate::plugin::attached::{AttachedPlugin, DetachedPlugin};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// A detached plugin and the handle watching its unit.
#[derive(Clone, Debug)]
pub struct DetachedEntry {
    pub record: DetachedPlugin,
    pub handle: LoadUnitHandle,
}

#[derive(Clone, Default)]
struct RegistrySnapshot {
    attached: Vec<Arc<AttachedPlugin>>,
    detached: Vec<DetachedEntry>,
}

/// Plugin registry.
pub struct PluginRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writer: Mutex::new(()),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let _guard = self.writer.lock();
        let mut next = RegistrySnapshot::clone(&self.snapshot.load());
        let out = f(&mut next)?;
        self.snapshot.store(Arc::new(next));
        Ok(out)
    }

    /// Whether a plugin with `name` is attached.
    pub fn is_attached(&self, name: &str) -> bool {
        self.snapshot.load().attached.iter().any(|p| p.name() == name)
    }

    /// Get an attached plugin by name.
    pub fn get_attached(&self, name: &str) -> Result<Arc<AttachedPlugin>> {
        self.snapshot
            .load()
            .attached
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| Error::NotAttached(name.to_string()))
    }

    /// Get an attached plugin by id.
    pub fn get_attached_by_id(&self, id: AttachedPluginId) -> Result<Arc<AttachedPlugin>> {
        self.snapshot
            .load()
            .attached
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| Error::NotAttached(id.to_string()))
    }

    /// Add a plugin to the attached set.
    ///
    /// Fails if a plugin with the same name is already attached.
    pub fn add_attached(&self, plugin: Arc<AttachedPlugin>) -> Result<()> {
        self.update(|snapshot| {
            if snapshot.attached.iter().any(|p| p.name() == plugin.name()) {
                return Err(Error::AlreadyAttached(plugin.name().to_string()));
            }
            tracing::debug!(plugin = %plugin.name(), id = %plugin.id(), "plugin registered");
            snapshot.attached.push(plugin);
            Ok(())
        })
    }

    /// Move a detached plugin from the attached set to the detached set.
    ///
    /// `plugin.detach()` must have run first.
    pub fn detach_attached(&self, plugin: &AttachedPlugin) -> Result<DetachedPlugin> {
        let (record, handle) = plugin
            .detached_record()
            .ok_or_else(|| Error::NotDetached(plugin.name().to_string()))?;
        self.update(|snapshot| {
            let before = snapshot.attached.len();
            snapshot.attached.retain(|p| p.id() != plugin.id());
            if snapshot.attached.len() == before {
                return Err(Error::NotAttached(plugin.id().to_string()));
            }
            snapshot.detached.push(DetachedEntry {
                record: record.clone(),
                handle,
            });
            Ok(record)
        })
    }

    /// Forget a detached plugin.
    pub fn remove_detached(&self, id: AttachedPluginId) -> Result<DetachedPlugin> {
        self.update(|snapshot| {
            let index = snapshot
                .detached
                .iter()
                .position(|e| e.record.id == id)
                .ok_or_else(|| Error::DetachedNotFound(id.to_string()))?;
            Ok(snapshot.detached.remove(index).record)
        })
    }

    /// Forget every detached plugin matching `predicate`.
    pub fn remove_detached_where(
        &self,
        predicate: impl Fn(&DetachedPlugin) -> bool,
    ) -> Vec<DetachedPlugin> {
        let result = self.update(|snapshot| {
            let (removed, kept) = std::mem::take(&mut snapshot.detached)
                .into_iter()
                .partition::<Vec<_>, _>(|e| predicate(&e.record));
            snapshot.detached = kept;
            Ok(removed.into_iter().map(|e| e.record).collect())
        });
        result.unwrap_or_default()
    }

    /// Modify a detached record in place. Returns the updated record.
    pub fn update_detached(
        &self,
        id: AttachedPluginId,
        f: impl FnOnce(&mut DetachedPlugin),
    ) -> Result<DetachedPlugin> {
        self.update(|snapshot| {
            let entry = snapshot
                .detached
                .iter_mut()
                .find(|e| e.record.id == id)
                .ok_or_else(|| Error::DetachedNotFound(id.to_string()))?;
            f(&mut entry.record);
            Ok(entry.record.clone())
        })
    }

    /// Get a detached entry by id.
    pub fn get_detached(&self, id: AttachedPluginId) -> Result<DetachedEntry> {
        self.snapshot
            .load()
            .detached
            .iter()
            .find(|e| e.record.id == id)
            .cloned()
            .ok_or_else(|| Error::DetachedNotFound(id.to_string()))
    }

    /// Attached plugins, in attach order.
    pub fn attached(&self) -> Vec<Arc<AttachedPlugin>> {
        self.snapshot.load().attached.clone()
    }

    /// Detached plugins, in detach order.
    pub fn detached(&self) -> Vec<DetachedPlugin> {
        self.snapshot
            .load()
            .detached
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    /// Get plugin count.
    pub fn attached_count(&self) -> usize {
        self.snapshot.load().attached.len()
    }

    pub fn detached_count(&self) -> usize {
        self.snapshot.load().detached.len()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::attached::ReclaimState;
    use crate::plugin::mediator::LifetimeMediator;
    use crate::testing::{lease_for, Probe};
    use tokio::runtime::Handle;

    fn attached(name: &str) -> (Arc<AttachedPlugin>, tempfile::TempDir) {
        let (_probe, lease, dir) = lease_for(Probe::new(name));
        let mediator = LifetimeMediator::new(lease.clone(), Handle::current());
        (Arc::new(AttachedPlugin::new(lease, mediator)), dir)
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = PluginRegistry::default();
        assert_eq!(registry.attached_count(), 0);
        assert_eq!(registry.detached_count(), 0);
        assert!(!registry.is_attached("echo"));
    }

    #[tokio::test]
    async fn test_add_attached() {
        let registry = PluginRegistry::new();
        let (plugin, _dir) = attached("echo");
        registry.add_attached(plugin.clone()).unwrap();

        assert!(registry.is_attached("echo"));
        assert_eq!(registry.get_attached("echo").unwrap().id(), plugin.id());
        assert_eq!(registry.get_attached_by_id(plugin.id()).unwrap().name(), "echo");
        assert!(matches!(registry.get_attached("other"), Err(Error::NotAttached(_))));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = PluginRegistry::new();
        let (first, _d1) = attached("echo");
        let (second, _d2) = attached("echo");
        registry.add_attached(first).unwrap();

        let result = registry.add_attached(second);
        assert!(matches!(result, Err(Error::AlreadyAttached(name)) if name == "echo"));
        assert_eq!(registry.attached_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_requires_detach_call() {
        let registry = PluginRegistry::new();
        let (plugin, _dir) = attached("echo");
        registry.add_attached(plugin.clone()).unwrap();

        assert!(matches!(
            registry.detach_attached(&plugin),
            Err(Error::NotDetached(_))
        ));
        assert!(registry.is_attached("echo"));

        plugin.detach().unwrap();
        let record = registry.detach_attached(&plugin).unwrap();
        assert_eq!(record.id, plugin.id());
        assert!(!registry.is_attached("echo"));
        assert_eq!(registry.detached().len(), 1);

        // The same plugin cannot produce a second detached entry.
        assert!(matches!(
            registry.detach_attached(&plugin),
            Err(Error::NotAttached(_))
        ));
        assert_eq!(registry.detached_count(), 1);
    }

    #[tokio::test]
    async fn test_update_and_remove_detached() {
        let registry = PluginRegistry::new();
        let (plugin, _dir) = attached("echo");
        registry.add_attached(plugin.clone()).unwrap();
        plugin.detach().unwrap();
        registry.detach_attached(&plugin).unwrap();

        let updated = registry
            .update_detached(plugin.id(), |r| {
                r.mark_reclaimed(true);
            })
            .unwrap();
        assert_eq!(updated.reclaim_state(), ReclaimState::ReclaimedInTime);
        assert!(registry.get_detached(plugin.id()).unwrap().handle.is_reclaimed());

        registry.remove_detached(plugin.id()).unwrap();
        assert!(matches!(
            registry.remove_detached(plugin.id()),
            Err(Error::DetachedNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_detached_where() {
        let registry = PluginRegistry::new();
        let mut ids = Vec::new();
        let mut dirs = Vec::new();
        for name in ["a", "b", "c"] {
            let (plugin, dir) = attached(name);
            registry.add_attached(plugin.clone()).unwrap();
            plugin.detach().unwrap();
            registry.detach_attached(&plugin).unwrap();
            ids.push(plugin.id());
            dirs.push(dir);
        }
        registry
            .update_detached(ids[1], |r| {
                r.mark_reclaimed(false);
            })
            .unwrap();

        let removed = registry.remove_detached_where(|r| !r.is_pending());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, ids[1]);
        assert_eq!(registry.detached_count(), 2);
    }

    #[tokio::test]
    async fn test_readers_see_consistent_snapshots() {
        let registry = Arc::new(PluginRegistry::new());
        let mut dirs = Vec::new();
        let mut writers = Vec::new();
        for i in 0..8 {
            let (plugin, dir) = attached(&format!("p{}", i));
            dirs.push(dir);
            let registry = registry.clone();
            writers.push(tokio::spawn(async move { registry.add_attached(plugin) }));
        }
        for w in futures::future::join_all(writers).await {
            w.unwrap().unwrap();
        }

        let names: std::collections::HashSet<String> = registry
            .attached()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names.len(), 8);
    }
}
