//! Error types for plughost.

use crate::plugin::interface::PluginError;
use crate::supervisor::StopReport;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for module loading.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Errors raised while producing a load unit.
///
/// Fatal to a single attach attempt only.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("plugin image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("io failed at `{path}`: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest at `{path}`: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("dependency `{name}` ({version}) of plugin `{plugin}` could not be resolved")]
    UnresolvedDependency {
        plugin: String,
        name: String,
        version: String,
    },

    #[error("malformed code image `{path}`: {message}")]
    MalformedImage { path: PathBuf, message: String },

    #[error("entry symbol `{symbol}` missing in `{path}`")]
    MissingEntry { path: PathBuf, symbol: String },

    #[error("image `{path}` is a native library and cannot construct a plugin")]
    NotAPlugin { path: PathBuf },
}

impl LoadError {
    /// Wrap an io error with the path it happened at.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LoadError::IoAt {
            path: path.into(),
            source,
        }
    }
}

/// Errors that can occur in runtime operations.
#[derive(Error, Debug)]
pub enum Error {
    // Loading errors
    #[error(transparent)]
    Load(#[from] LoadError),

    // Lifecycle errors
    #[error("plugin `{plugin}` failed: {source}")]
    Lifecycle {
        plugin: String,
        #[source]
        source: PluginError,
    },

    // Registry errors
    #[error("plugin not attached: {0}")]
    NotAttached(String),

    #[error("plugin already attached: {0}")]
    AlreadyAttached(String),

    #[error("plugin `{0}` has not been detached yet")]
    NotDetached(String),

    #[error("detached plugin not found: {0}")]
    DetachedNotFound(String),

    // Supervisor errors
    #[error("stopping plugins failed: {0}")]
    StopFailed(StopReport),

    #[error("host is shutting down")]
    ShuttingDown,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a lifecycle error for a named plugin.
    pub fn lifecycle(plugin: &str, source: PluginError) -> Self {
        Error::Lifecycle {
            plugin: plugin.to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
