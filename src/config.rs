//! Runtime configuration.
//!
//! Plain serde structs with defaults for every field, so a partial JSON
//! document is a valid configuration.

use crate::core::{Error, Result};
use crate::loader::DEFAULT_ENTRY_SYMBOL;
use crate::monitoring::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Module loader settings
    pub loader: LoaderConfig,
    /// Supervisor settings
    pub supervisor: SupervisorConfig,
    /// Logging settings
    pub logging: LoggerConfig,
}

impl RuntimeConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.loader.validate()?;
        self.supervisor.validate()
    }
}

/// Module loader configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directory holding every unit's shadow directory
    pub shadow_root: PathBuf,
    /// Manifest file looked up next to each plugin image
    pub manifest_file_name: String,
    /// Constructor symbol used when the manifest names none
    pub entry_symbol: String,
    /// Debug symbol extensions, in lookup order
    pub symbol_extensions: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            shadow_root: std::env::temp_dir().join("plughost-shadow"),
            manifest_file_name: "plugin.json".to_string(),
            entry_symbol: DEFAULT_ENTRY_SYMBOL.to_string(),
            symbol_extensions: vec!["debug".to_string(), "pdb".to_string(), "sym".to_string()],
        }
    }
}

impl LoaderConfig {
    fn validate(&self) -> Result<()> {
        if self.manifest_file_name.trim().is_empty() {
            return Err(Error::Config("loader.manifest_file_name must not be empty".to_string()));
        }
        if self.entry_symbol.trim().is_empty() {
            return Err(Error::Config("loader.entry_symbol must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Supervisor configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Default stop timeout
    pub stop_timeout_ms: u64,
    /// Window in which reclamation counts as in time
    pub reclaim_grace_ms: u64,
    /// Poll interval inside the grace window
    pub reclaim_fast_interval_ms: u64,
    /// Poll interval after the grace window
    pub reclaim_slow_interval_ms: u64,
    /// Slow polls before giving up, `None` polls forever
    pub reclaim_max_slow_checks: Option<u32>,
    /// Stop the whole host when a plugin fails unrecoverably
    pub stop_all_on_fatal_error: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 30_000,
            reclaim_grace_ms: 2_000,
            reclaim_fast_interval_ms: 100,
            reclaim_slow_interval_ms: 5_000,
            reclaim_max_slow_checks: None,
            stop_all_on_fatal_error: false,
        }
    }
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn reclaim_grace(&self) -> Duration {
        Duration::from_millis(self.reclaim_grace_ms)
    }

    pub fn reclaim_fast_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_fast_interval_ms)
    }

    pub fn reclaim_slow_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_slow_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.reclaim_fast_interval_ms == 0 || self.reclaim_slow_interval_ms == 0 {
            return Err(Error::Config("reclaim intervals must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::LogFormat;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.supervisor.reclaim_grace(), Duration::from_secs(2));
        assert_eq!(config.supervisor.reclaim_max_slow_checks, None);
        assert_eq!(config.loader.manifest_file_name, "plugin.json");
        assert_eq!(config.loader.entry_symbol, DEFAULT_ENTRY_SYMBOL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "supervisor": { "stop_timeout_ms": 500, "reclaim_max_slow_checks": 3 },
                "logging": { "format": "json" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.supervisor.stop_timeout_ms, 500);
        assert_eq!(config.supervisor.reclaim_max_slow_checks, Some(3));
        assert_eq!(config.supervisor.reclaim_grace_ms, 2_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.loader, LoaderConfig::default());
    }

    #[test]
    fn test_invalid_values() {
        let result = RuntimeConfig::from_json_str(r#"{"supervisor": {"reclaim_fast_interval_ms": 0}}"#);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RuntimeConfig::from_json_str(r#"{"loader": {"entry_symbol": ""}}"#);
        assert!(matches!(result, Err(Error::Config(_))));

        let result = RuntimeConfig::from_json_str("{not json");
        assert!(matches!(result, Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plughost.json");
        std::fs::write(&path, r#"{"loader": {"shadow_root": "/var/tmp/shadow"}}"#).unwrap();

        let config = RuntimeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.loader.shadow_root, PathBuf::from("/var/tmp/shadow"));

        let missing = RuntimeConfig::from_json_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
