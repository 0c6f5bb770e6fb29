//! Supervisor reports and views.

use crate::core::{AttachedPluginId, Error, Result, Timestamp, UnitId};
use crate::lifecycle::LifetimeState;
use crate::plugin::{PluginDescriptor, PluginError};
use serde::{Deserialize, Serialize};

/// Whole-unit phase of a plugin, from load to reclamation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginPhase {
    NotLoaded,
    Attached,
    Stopping,
    Stopped,
    Detached,
    ReclaimPending,
    ReclaimedInTime,
    ReclaimedLate,
}

impl std::fmt::Display for PluginPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginPhase::NotLoaded => "not_loaded",
            PluginPhase::Attached => "attached",
            PluginPhase::Stopping => "stopping",
            PluginPhase::Stopped => "stopped",
            PluginPhase::Detached => "detached",
            PluginPhase::ReclaimPending => "reclaim_pending",
            PluginPhase::ReclaimedInTime => "reclaimed_in_time",
            PluginPhase::ReclaimedLate => "reclaimed_late",
        };
        write!(f, "{}", s)
    }
}

/// Summary of an attached plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachedInfo {
    pub id: AttachedPluginId,
    pub descriptor: PluginDescriptor,
    pub unit_id: UnitId,
    pub state: LifetimeState,
    pub errored: bool,
    pub attached_at: Timestamp,
}

/// Outcome of stopping one or more plugins.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopReport {
    /// Plugins that reached `Stopped` within the timeout
    pub stopped: Vec<String>,
    /// Plugins that did not
    pub timed_out: Vec<String>,
    /// Lifecycle or teardown errors, by plugin
    pub errors: Vec<(String, PluginError)>,
}

impl StopReport {
    /// Record one plugin's outcome.
    pub fn record(&mut self, plugin: &str, in_time: bool, error: Option<PluginError>) {
        if in_time {
            self.stopped.push(plugin.to_string());
        } else {
            self.timed_out.push(plugin.to_string());
        }
        if let Some(error) = error {
            self.errors.push((plugin.to_string(), error));
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: StopReport) {
        self.stopped.extend(other.stopped);
        self.timed_out.extend(other.timed_out);
        self.errors.extend(other.errors);
    }

    /// Every plugin stopped in time without errors.
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.errors.is_empty()
    }

    /// Turn a report with timeouts or errors into [`Error::StopFailed`].
    pub fn into_result(self) -> Result<()> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(Error::StopFailed(self))
        }
    }
}

impl std::fmt::Display for StopReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stopped", self.stopped.len())?;
        if !self.timed_out.is_empty() {
            write!(f, ", {} timed out ({})", self.timed_out.len(), self.timed_out.join(", "))?;
        }
        if !self.errors.is_empty() {
            let errors: Vec<String> = self
                .errors
                .iter()
                .map(|(plugin, error)| format!("{}: {}", plugin, error))
                .collect();
            write!(f, ", {} errors ({})", self.errors.len(), errors.join("; "))?;
        }
        Ok(())
    }
}
