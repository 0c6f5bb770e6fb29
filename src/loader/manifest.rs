//! Plugin manifest.
//!
//! Produced by the packaging step and placed next to the plugin image. It
//! pins every private dependency to a version and, optionally, a path.

use crate::core::{LoadError, LoadResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How a dependency is opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// A Rust module built against the host (opened like a plugin image)
    #[default]
    Module,
    /// A plain native library, exposed as a native handle
    Native,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Module => write!(f, "module"),
            DependencyKind::Native => write!(f, "native"),
        }
    }
}

/// A pinned dependency entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Pinned version
    pub version: String,
    /// Path to the file, relative to the plugin directory when not absolute
    #[serde(default)]
    pub path: Option<String>,
    /// Dependency kind
    #[serde(default)]
    pub kind: DependencyKind,
    /// Skip instead of failing when unresolved
    #[serde(default)]
    pub optional: bool,
}

impl DependencySpec {
    /// Create a required module dependency.
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            path: None,
            kind: DependencyKind::Module,
            optional: false,
        }
    }

    /// Pin to a path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Set the kind.
    pub fn with_kind(mut self, kind: DependencyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Mark optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// Per-plugin manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name
    pub name: String,
    /// Plugin version
    #[serde(default = "default_version")]
    pub version: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Entry symbol override
    #[serde(default)]
    pub entry: Option<String>,
    /// Dependencies by name
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySpec>,
}

impl PluginManifest {
    /// Manifest for an image that ships without one.
    pub fn implicit(image_path: &Path) -> Self {
        let name = image_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .map(|s| s.strip_prefix("lib").map(str::to_string).unwrap_or(s))
            .unwrap_or_else(|| "plugin".to_string());
        Self {
            name,
            version: default_version(),
            description: String::new(),
            entry: None,
            dependencies: BTreeMap::new(),
        }
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, name: &str, spec: DependencySpec) -> Self {
        self.dependencies.insert(name.to_string(), spec);
        self
    }

    /// Parse a manifest from JSON.
    pub fn from_json(path: &Path, json: &str) -> LoadResult<Self> {
        let manifest: PluginManifest =
            serde_json::from_str(json).map_err(|e| LoadError::InvalidManifest {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if manifest.name.trim().is_empty() {
            return Err(LoadError::InvalidManifest {
                path: path.to_path_buf(),
                message: "name must not be empty".to_string(),
            });
        }
        Ok(manifest)
    }

    /// Read `file_name` from the image's directory, falling back to an
    /// implicit manifest when the file does not exist.
    pub fn discover(image_path: &Path, file_name: &str) -> LoadResult<Self> {
        let dir = image_path.parent().unwrap_or_else(|| Path::new("."));
        let manifest_path = dir.join(file_name);
        if !manifest_path.is_file() {
            return Ok(Self::implicit(image_path));
        }
        let json = std::fs::read_to_string(&manifest_path)
            .map_err(|e| LoadError::io_at(&manifest_path, e))?;
        Self::from_json(&manifest_path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let json = r#"{
            "name": "echo",
            "version": "1.0.0",
            "dependencies": {
                "codec": { "version": "2.1.0", "path": "deps/libcodec.so" },
                "zlib": { "version": "1.3", "kind": "native", "optional": true }
            }
        }"#;
        let manifest = PluginManifest::from_json(Path::new("plugin.json"), json).unwrap();

        assert_eq!(manifest.name, "echo");
        assert_eq!(manifest.dependencies.len(), 2);
        let codec = &manifest.dependencies["codec"];
        assert_eq!(codec.kind, DependencyKind::Module);
        assert_eq!(codec.path.as_deref(), Some("deps/libcodec.so"));
        let zlib = &manifest.dependencies["zlib"];
        assert_eq!(zlib.kind, DependencyKind::Native);
        assert!(zlib.optional);
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = PluginManifest::from_json(Path::new("plugin.json"), r#"{"name": " "}"#);
        assert!(matches!(result, Err(LoadError::InvalidManifest { .. })));
    }

    #[test]
    fn test_implicit_manifest_strips_lib_prefix() {
        let manifest = PluginManifest::implicit(Path::new("/plugins/echo/libecho.so"));
        assert_eq!(manifest.name, "echo");
        assert_eq!(manifest.version, "0.0.0");
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn test_discover_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = PluginManifest::discover(&dir.path().join("echo.so"), "plugin.json").unwrap();
        assert_eq!(manifest.name, "echo");
    }

    #[test]
    fn test_discover_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            r#"{"name": "greeter", "version": "3.0.0"}"#,
        )
        .unwrap();
        let manifest = PluginManifest::discover(&dir.path().join("x.so"), "plugin.json").unwrap();
        assert_eq!(manifest.name, "greeter");
        assert_eq!(manifest.version, "3.0.0");
    }
}
