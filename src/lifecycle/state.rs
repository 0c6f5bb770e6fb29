//! Ordered life-cycle phases.

use serde::{Deserialize, Serialize};

/// Phase of a lifetime.
///
/// Phases are totally ordered and a lifetime only ever moves forward through
/// them. The errored condition is tracked separately and does not take part
/// in the ordering.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LifetimeState {
    /// Created, nothing has run yet
    #[default]
    Startup = 0,
    /// `init` in progress
    Initializing = 1,
    /// `init` completed
    Initialized = 2,
    /// `run` in progress
    Starting = 3,
    /// Running
    Running = 4,
    /// Shutdown has begun
    Stopping = 5,
    /// Teardown completed
    Stopped = 6,
    /// Resources released, terminal
    Destroyed = 7,
}

impl LifetimeState {
    /// All phases in order.
    pub const ALL: [LifetimeState; 8] = [
        LifetimeState::Startup,
        LifetimeState::Initializing,
        LifetimeState::Initialized,
        LifetimeState::Starting,
        LifetimeState::Running,
        LifetimeState::Stopping,
        LifetimeState::Stopped,
        LifetimeState::Destroyed,
    ];

    /// The phase one step after this one, `None` at the terminal phase.
    pub fn next(self) -> Option<LifetimeState> {
        Self::ALL.get(self as usize + 1).copied()
    }

    /// Whether this is the terminal phase.
    pub fn is_terminal(self) -> bool {
        self == LifetimeState::Destroyed
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(self) -> bool {
        self >= LifetimeState::Stopping
    }
}

impl std::fmt::Display for LifetimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifetimeState::Startup => write!(f, "startup"),
            LifetimeState::Initializing => write!(f, "initializing"),
            LifetimeState::Initialized => write!(f, "initialized"),
            LifetimeState::Starting => write!(f, "starting"),
            LifetimeState::Running => write!(f, "running"),
            LifetimeState::Stopping => write!(f, "stopping"),
            LifetimeState::Stopped => write!(f, "stopped"),
            LifetimeState::Destroyed => write!(f, "destroyed"),
        }
    }
}
