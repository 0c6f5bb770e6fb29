//! Plugin Module
//!
//! Provides the plugin side of the runtime:
//! - Plugin interface and context
//! - Lifetime mediator
//! - Attached and detached records
//! - Plugin registry

pub mod attached;
pub mod interface;
pub mod mediator;
pub mod registry;

pub use attached::{AttachedPlugin, DetachedPlugin, ReclaimState};
pub use interface::{
    EchoPlugin, HostContext, Plugin, PluginContext, PluginDescriptor, PluginError,
    PluginErrorKind, PluginResult, WorkerSpawner,
};
pub use mediator::LifetimeMediator;
pub use registry::{DetachedEntry, PluginRegistry};
