//! # plughost - Plugin Host Runtime
//!
//! Hosts hot-swappable plugins inside one long-running process:
//! - **Lifecycle**: ordered lifetime phases with one-shot signals
//! - **Loader**: isolated load units with private dependency versions
//! - **Supervisor**: attach, stop, detach and verified reclamation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plughost::config::RuntimeConfig;
//! use plughost::plugin::HostContext;
//! use plughost::supervisor::HostSupervisor;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> plughost::Result<()> {
//!     let config = RuntimeConfig::default();
//!     let host = HostSupervisor::new(&config, HostContext::new("/var/lib/host"))?;
//!
//!     let id = host.attach(Path::new("plugins/echo/libecho.so")).await?;
//!     let record = host.detach(id).await?;
//!     println!("{} detached, reclamation {}", record.name(), record.reclaim_state());
//!
//!     host.shutdown(Duration::from_secs(30)).await.into_result()
//! }
//! ```

pub mod config;
pub mod core;
pub mod lifecycle;
pub mod loader;
pub mod monitoring;
pub mod plugin;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use core::error::{Error, LoadError, Result};
pub use lifecycle::{Lifetime, LifetimeState};
pub use plugin::{Plugin, PluginContext, PluginDescriptor, PluginError};
pub use supervisor::HostSupervisor;
