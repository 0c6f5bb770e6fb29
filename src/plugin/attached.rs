//! Attached and detached plugin records.

use crate::core::{now, AttachedPluginId, Timestamp, UnitId};
use crate::lifecycle::{Lifetime, LifetimeState};
use crate::loader::unit::{LoadUnitHandle, PluginLease};
use crate::plugin::interface::{PluginDescriptor, PluginError, PluginResult};
use crate::plugin::mediator::LifetimeMediator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Reclamation outcome of a detached plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimState {
    /// The unit is still resident
    Pending,
    /// Reclaimed within the grace window
    ReclaimedInTime,
    /// Reclaimed after the grace window
    ReclaimedLate,
}

impl std::fmt::Display for ReclaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimState::Pending => write!(f, "pending"),
            ReclaimState::ReclaimedInTime => write!(f, "reclaimed_in_time"),
            ReclaimState::ReclaimedLate => write!(f, "reclaimed_late"),
        }
    }
}

/// What remains of a plugin after detach.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetachedPlugin {
    pub id: AttachedPluginId,
    pub descriptor: PluginDescriptor,
    pub unit_id: UnitId,
    pub detached_at: Timestamp,
    /// Lifetime phase at detach
    pub final_state: LifetimeState,
    /// Whether the plugin reached `Stopped` within its stop timeout
    pub stopped_in_time: bool,
    pub destroyed_in_time: bool,
    pub destroyed_late: bool,
    /// Last lifecycle or teardown error
    pub last_error: Option<PluginError>,
    pub reclaimed_at: Option<Timestamp>,
}

impl DetachedPlugin {
    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Reclamation outcome so far.
    pub fn reclaim_state(&self) -> ReclaimState {
        if self.destroyed_in_time {
            ReclaimState::ReclaimedInTime
        } else if self.destroyed_late {
            ReclaimState::ReclaimedLate
        } else {
            ReclaimState::Pending
        }
    }

    /// Neither destroyed flag is set.
    pub fn is_pending(&self) -> bool {
        self.reclaim_state() == ReclaimState::Pending
    }

    /// Record a reclamation observed now. Only the first call counts;
    /// returns whether this one did.
    pub fn mark_reclaimed(&mut self, in_time: bool) -> bool {
        if !self.is_pending() {
            return false;
        }
        if in_time {
            self.destroyed_in_time = true;
        } else {
            self.destroyed_late = true;
        }
        self.reclaimed_at = Some(now());
        true
    }
}

struct Live {
    lease: PluginLease,
    mediator: Arc<LifetimeMediator>,
}

/// A live plugin owned by the host.
pub struct AttachedPlugin {
    id: AttachedPluginId,
    descriptor: PluginDescriptor,
    unit_id: UnitId,
    lifetime: Lifetime,
    attached_at: Timestamp,
    live: Mutex<Option<Live>>,
    stopped_in_time: Mutex<Option<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    detached: Mutex<Option<(DetachedPlugin, LoadUnitHandle)>>,
}

impl AttachedPlugin {
    /// Wrap a plugin lease and its mediator.
    pub fn new(lease: PluginLease, mediator: Arc<LifetimeMediator>) -> Self {
        Self {
            id: AttachedPluginId::next(),
            descriptor: lease.plugin().descriptor().clone(),
            unit_id: lease.unit().id().clone(),
            lifetime: mediator.lifetime(),
            attached_at: now(),
            live: Mutex::new(Some(Live { lease, mediator })),
            stopped_in_time: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            detached: Mutex::new(None),
        }
    }

    pub fn id(&self) -> AttachedPluginId {
        self.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    pub fn attached_at(&self) -> Timestamp {
        self.attached_at
    }

    /// The plugin's lifetime. Stays readable after detach.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// The plugin's mediator.
    pub fn mediator(&self) -> PluginResult<Arc<LifetimeMediator>> {
        self.live
            .lock()
            .as_ref()
            .map(|live| Arc::clone(&live.mediator))
            .ok_or_else(|| PluginError::detached(self.name()))
    }

    /// Non-owning handle to the plugin's load unit.
    pub fn unit_handle(&self) -> PluginResult<LoadUnitHandle> {
        self.live
            .lock()
            .as_ref()
            .map(|live| live.lease.unit_handle())
            .ok_or_else(|| PluginError::detached(self.name()))
    }

    pub fn is_detached(&self) -> bool {
        self.detached.lock().is_some()
    }

    /// Record whether a stop completed within its timeout. The first
    /// outcome wins.
    pub fn record_stop(&self, in_time: bool) {
        let mut outcome = self.stopped_in_time.lock();
        if outcome.is_none() {
            *outcome = Some(in_time);
        }
    }

    /// Recorded stop outcome, if a stop was awaited.
    pub fn stopped_in_time(&self) -> Option<bool> {
        *self.stopped_in_time.lock()
    }

    /// Tie a host task watching this plugin to its attachment. The task is
    /// aborted on detach, or at once if the plugin is already detached.
    pub(crate) fn own_task(&self, task: JoinHandle<()>) {
        let detached = self.detached.lock();
        if detached.is_some() {
            task.abort();
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// The record produced by `detach()`, once it ran.
    pub fn detached_record(&self) -> Option<(DetachedPlugin, LoadUnitHandle)> {
        self.detached.lock().clone()
    }

    /// Release the plugin instance and request unload of its unit.
    ///
    /// One-way and one-time: the first call returns the detached record and
    /// a handle to watch the unit; every later call fails with a detached
    /// error.
    pub fn detach(&self) -> PluginResult<(DetachedPlugin, LoadUnitHandle)> {
        let mut detached = self.detached.lock();
        if detached.is_some() {
            return Err(PluginError::detached(self.name()));
        }
        let live = self
            .live
            .lock()
            .take()
            .ok_or_else(|| PluginError::detached(self.name()))?;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let handle = live.lease.unit_handle();
        live.lease.unit().request_unload();
        live.mediator.release();

        let last_error = self
            .lifetime
            .last_error()
            .or_else(|| live.mediator.teardown_error());
        let stopped = self.lifetime.state() >= LifetimeState::Stopped;
        let record = DetachedPlugin {
            id: self.id,
            descriptor: self.descriptor.clone(),
            unit_id: self.unit_id.clone(),
            detached_at: now(),
            final_state: self.lifetime.state(),
            stopped_in_time: stopped && self.stopped_in_time().unwrap_or(true),
            destroyed_in_time: false,
            destroyed_late: false,
            last_error,
            reclaimed_at: None,
        };
        drop(live);

        tracing::info!(
            plugin = %self.descriptor.name,
            id = %self.id,
            unit_id = %self.unit_id,
            state = %record.final_state,
            "plugin detached"
        );
        *detached = Some((record.clone(), handle.clone()));
        Ok((record, handle))
    }
}

impl std::fmt::Debug for AttachedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedPlugin")
            .field("id", &self.id)
            .field("name", &self.descriptor.name)
            .field("unit_id", &self.unit_id)
            .field("state", &self.lifetime.state())
            .field("detached", &self.is_detached())
            .finish()
    }
}
