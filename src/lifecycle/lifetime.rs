//! Lifetime state machine.
//!
//! A [`LifetimeHandler`] is the single mutator of a lifetime. Any number of
//! read-only [`Lifetime`] views can be handed out to plugin and host code;
//! they observe state and signals and may request a stop, nothing more.

use crate::lifecycle::signal::Signal;
use crate::lifecycle::state::LifetimeState;
use crate::plugin::interface::PluginError;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Action run by the first `request_stop()` call.
pub type StopAction = Box<dyn FnOnce() + Send>;

/// Callback invoked when a lifetime moves to the errored condition.
pub type ErrorCallback = Box<dyn Fn(&PluginError) + Send + Sync>;

struct StopSlot {
    requested: bool,
    action: Option<StopAction>,
}

struct LifetimeInner {
    name: String,
    state: Mutex<LifetimeState>,
    state_tx: watch::Sender<LifetimeState>,
    started: Signal,
    stopping: Signal,
    stopped: Signal,
    errored: Signal,
    last_error: Mutex<Option<PluginError>>,
    stop: Mutex<StopSlot>,
    on_error: Mutex<Option<ErrorCallback>>,
}

/// Read-only view of a lifetime.
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<LifetimeInner>,
}

impl Lifetime {
    /// Name of the owner, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current phase.
    pub fn state(&self) -> LifetimeState {
        *self.inner.state.lock()
    }

    /// Whether the errored condition has been entered.
    pub fn is_errored(&self) -> bool {
        self.inner.errored.is_fired()
    }

    /// Last error recorded by `move_to_error`.
    pub fn last_error(&self) -> Option<PluginError> {
        self.inner.last_error.lock().clone()
    }

    /// Fires on entering `Running`.
    pub fn started(&self) -> &Signal {
        &self.inner.started
    }

    /// Fires on entering `Stopping`.
    pub fn stopping(&self) -> &Signal {
        &self.inner.stopping
    }

    /// Fires on entering `Stopped`.
    pub fn stopped(&self) -> &Signal {
        &self.inner.stopped
    }

    /// Fires on entering the errored condition.
    pub fn errored(&self) -> &Signal {
        &self.inner.errored
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.lock().requested
    }

    /// Ask the owner to stop.
    ///
    /// Only the first call runs the registered stop action; every later or
    /// concurrent call is a no-op. Returns whether this call triggered it.
    /// A stop requested before an action is registered runs the action as
    /// soon as it is set.
    pub fn request_stop(&self) -> bool {
        let action = {
            let mut slot = self.inner.stop.lock();
            if slot.requested {
                return false;
            }
            slot.requested = true;
            slot.action.take()
        };
        tracing::debug!(lifetime = %self.inner.name, "stop requested");
        if let Some(action) = action {
            action();
        }
        true
    }

    /// Wait until the phase is at least `target`.
    pub async fn wait_for_state(&self, target: LifetimeState) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state >= target).await;
    }

    /// Cascade a parent's shutdown into this lifetime.
    ///
    /// The returned task requests a stop here once `parent` enters
    /// `Stopping`, and exits early if this lifetime stops on its own.
    pub fn link_to_parent(&self, parent: &Lifetime) -> JoinHandle<()> {
        let child = self.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.stopping().wait() => {
                    tracing::debug!(
                        parent = %parent.name(),
                        child = %child.name(),
                        "parent stopping, cascading stop"
                    );
                    child.request_stop();
                }
                _ = child.stopped().wait() => {}
            }
        })
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifetime")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("errored", &self.is_errored())
            .finish()
    }
}

/// Exclusive mutator of a lifetime.
pub struct LifetimeHandler {
    lifetime: Lifetime,
}

impl LifetimeHandler {
    /// Create a lifetime in the `Startup` phase.
    pub fn new(name: &str) -> Self {
        let (state_tx, _rx) = watch::channel(LifetimeState::Startup);
        Self {
            lifetime: Lifetime {
                inner: Arc::new(LifetimeInner {
                    name: name.to_string(),
                    state: Mutex::new(LifetimeState::Startup),
                    state_tx,
                    started: Signal::new("started"),
                    stopping: Signal::new("stopping"),
                    stopped: Signal::new("stopped"),
                    errored: Signal::new("errored"),
                    last_error: Mutex::new(None),
                    stop: Mutex::new(StopSlot {
                        requested: false,
                        action: None,
                    }),
                    on_error: Mutex::new(None),
                }),
            },
        }
    }

    /// A read-only view of this lifetime.
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime.clone()
    }

    /// Current phase.
    pub fn state(&self) -> LifetimeState {
        self.lifetime.state()
    }

    /// Register the action run by the first `request_stop()`.
    pub fn set_stop_action(&self, action: StopAction) {
        let run_now = {
            let mut slot = self.lifetime.inner.stop.lock();
            if slot.requested {
                Some(action)
            } else {
                slot.action = Some(action);
                None
            }
        };
        if let Some(action) = run_now {
            action();
        }
    }

    /// Drop a registered stop action that never ran.
    pub fn clear_stop_action(&self) {
        self.lifetime.inner.stop.lock().action = None;
    }

    /// Register the callback invoked by `move_to_error`.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.lifetime.inner.on_error.lock() = Some(callback);
    }

    /// Drop the error callback.
    pub fn clear_error_callback(&self) {
        *self.lifetime.inner.on_error.lock() = None;
    }

    /// Move forward to `target`.
    ///
    /// A target at or behind the current phase is a no-op. Returns whether
    /// the phase changed.
    pub fn move_to_state(&self, target: LifetimeState) -> bool {
        let inner = &self.lifetime.inner;
        let mut state = inner.state.lock();
        let previous = *state;
        if target <= previous {
            return false;
        }
        *state = target;
        inner.state_tx.send_replace(target);
        // Signals fire under the lock so racing writers cannot reorder them.
        self.fire_crossed(previous, target);
        drop(state);

        tracing::trace!(lifetime = %inner.name, from = %previous, to = %target, "state changed");
        true
    }

    /// Advance by exactly one phase unless already `Destroyed`.
    ///
    /// Returns the phase after the call.
    pub fn next_state(&self) -> LifetimeState {
        let inner = &self.lifetime.inner;
        let mut state = inner.state.lock();
        let previous = *state;
        let Some(target) = previous.next() else {
            return previous;
        };
        *state = target;
        inner.state_tx.send_replace(target);
        self.fire_crossed(previous, target);
        target
    }

    /// Enter the errored condition.
    ///
    /// Invokes the error callback, records the error and fires `Errored`.
    /// The ordered phase is left untouched. Returns whether this call fired
    /// the signal.
    pub fn move_to_error(&self, error: &PluginError) -> bool {
        let inner = &self.lifetime.inner;
        if let Some(callback) = inner.on_error.lock().as_ref() {
            callback(error);
        }
        *inner.last_error.lock() = Some(error.clone());
        let fired = inner.errored.fire();
        if fired {
            tracing::warn!(lifetime = %inner.name, error = %error, "lifetime errored");
        }
        fired
    }

    fn fire_crossed(&self, previous: LifetimeState, target: LifetimeState) {
        let inner = &self.lifetime.inner;
        if target == LifetimeState::Running {
            inner.started.fire();
        }
        if previous < LifetimeState::Stopping && target >= LifetimeState::Stopping {
            inner.stopping.fire();
        }
        if previous < LifetimeState::Stopped && target >= LifetimeState::Stopped {
            inner.stopped.fire();
        }
    }
}
