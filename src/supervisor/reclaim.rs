//! Reclamation tracking for detached plugins.
//!
//! Unloading is only effective once every strong reference into a unit
//! has gone, so the tracker polls: a fast cadence within the grace window,
//! then a slow one.

use crate::config::SupervisorConfig;
use crate::core::{now, AttachedPluginId, Error};
use crate::loader::{LoadUnitHandle, ModuleLoader};
use crate::monitoring::RuntimeMetrics;
use crate::plugin::{DetachedPlugin, PluginRegistry, ReclaimState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Observe one detached unit.
///
/// Marks the record and updates metrics the first time the unit is seen
/// reclaimed. Returns `None` when the record is gone.
pub(crate) fn observe(
    registry: &PluginRegistry,
    loader: &ModuleLoader,
    metrics: &RuntimeMetrics,
    grace: Duration,
    id: AttachedPluginId,
) -> Option<ReclaimState> {
    let entry = registry.get_detached(id).ok()?;
    loader.collect();
    if !entry.handle.is_reclaimed() {
        return Some(entry.record.reclaim_state());
    }

    let in_time = within(&entry.record, grace);
    let mut changed = false;
    let record = match registry.update_detached(id, |r| changed = r.mark_reclaimed(in_time)) {
        Ok(record) => record,
        Err(Error::DetachedNotFound(_)) => return None,
        Err(err) => {
            tracing::warn!(id = %id, error = %err, "failed to record reclamation");
            return Some(entry.record.reclaim_state());
        }
    };
    if changed {
        metrics.pending_reclamation.dec();
        if in_time {
            metrics.reclaimed_in_time.inc();
            tracing::info!(plugin = %record.name(), unit_id = %record.unit_id, "unit reclaimed");
        } else {
            metrics.reclaimed_late.inc();
            tracing::warn!(
                plugin = %record.name(),
                unit_id = %record.unit_id,
                "unit reclaimed after grace window"
            );
        }
    }
    Some(record.reclaim_state())
}

fn within(record: &DetachedPlugin, grace: Duration) -> bool {
    (now() - record.detached_at)
        .to_std()
        .map(|elapsed| elapsed <= grace)
        .unwrap_or(true)
}

/// Polls one detached unit until it is reclaimed, forgotten, or the slow
/// check budget runs out.
pub(crate) struct ReclaimTracker {
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) loader: Arc<ModuleLoader>,
    pub(crate) metrics: Arc<RuntimeMetrics>,
    pub(crate) config: SupervisorConfig,
}

impl ReclaimTracker {
    fn poll(&self, id: AttachedPluginId) -> Option<ReclaimState> {
        observe(
            &self.registry,
            &self.loader,
            &self.metrics,
            self.config.reclaim_grace(),
            id,
        )
    }

    pub(crate) async fn run(self, id: AttachedPluginId, handle: LoadUnitHandle) {
        let deadline = Instant::now() + self.config.reclaim_grace();
        loop {
            tokio::task::yield_now().await;
            match self.poll(id) {
                Some(ReclaimState::Pending) => {}
                _ => return,
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.reclaim_fast_interval()).await;
        }

        tracing::debug!(
            id = %id,
            plugin = %handle.plugin_name(),
            unit_id = %handle.id(),
            references = handle.strong_count(),
            "unit not reclaimed within grace window"
        );

        let mut checks = 0u32;
        loop {
            if let Some(max) = self.config.reclaim_max_slow_checks {
                if checks >= max {
                    tracing::warn!(
                        id = %id,
                        plugin = %handle.plugin_name(),
                        unit_id = %handle.id(),
                        references = handle.strong_count(),
                        "giving up on reclamation, unit stays pending"
                    );
                    return;
                }
            }
            tokio::time::sleep(self.config.reclaim_slow_interval()).await;
            checks += 1;
            match self.poll(id) {
                Some(ReclaimState::Pending) => {}
                _ => return,
            }
        }
    }
}
