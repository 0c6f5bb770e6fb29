//! Lifecycle Module
//!
//! Life-cycle signal model shared by the host and every plugin:
//! - Ordered lifetime phases
//! - One-shot broadcast signals
//! - Lifetime views and their single mutator

pub mod lifetime;
pub mod signal;
pub mod state;

pub use lifetime::{ErrorCallback, Lifetime, LifetimeHandler, StopAction};
pub use signal::Signal;
pub use state::LifetimeState;
