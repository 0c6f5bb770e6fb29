//! Private dependency resolution.
//!
//! Lookup order for each dependency: the manifest's pinned path, then a
//! same-named file in the plugin's own directory. There is no global search
//! path, so one plugin never picks up another plugin's copy of a library.

use crate::core::{LoadError, LoadResult};
use crate::loader::manifest::{DependencyKind, DependencySpec, PluginManifest};
use std::path::{Path, PathBuf};

/// Where a dependency was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedFrom {
    /// Path pinned in the manifest
    Manifest,
    /// Same-named file in the plugin directory
    PluginDirectory,
}

/// A dependency located on disk.
#[derive(Clone, Debug)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    pub kind: DependencyKind,
    pub path: PathBuf,
    pub from: ResolvedFrom,
}

/// Resolves the dependencies of one plugin.
pub struct DependencyResolver<'a> {
    manifest: &'a PluginManifest,
    plugin_dir: &'a Path,
}

impl<'a> DependencyResolver<'a> {
    /// Create a resolver scoped to `plugin_dir`.
    pub fn new(manifest: &'a PluginManifest, plugin_dir: &'a Path) -> Self {
        Self {
            manifest,
            plugin_dir,
        }
    }

    /// Resolve a single dependency.
    pub fn resolve(&self, name: &str, spec: &DependencySpec) -> Option<ResolvedDependency> {
        let found = |path: PathBuf, from| ResolvedDependency {
            name: name.to_string(),
            version: spec.version.clone(),
            kind: spec.kind,
            path,
            from,
        };

        if let Some(pinned) = &spec.path {
            let pinned = Path::new(pinned);
            let path = if pinned.is_absolute() {
                pinned.to_path_buf()
            } else {
                self.plugin_dir.join(pinned)
            };
            if path.is_file() {
                return Some(found(path, ResolvedFrom::Manifest));
            }
            tracing::debug!(
                plugin = %self.manifest.name,
                dependency = name,
                path = %path.display(),
                "pinned dependency path missing, trying plugin directory"
            );
        }

        [
            self.plugin_dir.join(libloading::library_filename(name)),
            self.plugin_dir.join(name),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .map(|path| found(path, ResolvedFrom::PluginDirectory))
    }

    /// Resolve every dependency in the manifest.
    ///
    /// Any unresolved required dependency aborts the whole resolution.
    /// Unresolved optional dependencies are skipped.
    pub fn resolve_all(&self) -> LoadResult<Vec<ResolvedDependency>> {
        let mut resolved = Vec::with_capacity(self.manifest.dependencies.len());
        for (name, spec) in &self.manifest.dependencies {
            match self.resolve(name, spec) {
                Some(dep) => resolved.push(dep),
                None if spec.optional => {
                    tracing::warn!(
                        plugin = %self.manifest.name,
                        dependency = %name,
                        version = %spec.version,
                        "optional dependency unresolved, skipping"
                    );
                }
                None => {
                    return Err(LoadError::UnresolvedDependency {
                        plugin: self.manifest.name.clone(),
                        name: name.clone(),
                        version: spec.version.clone(),
                    })
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> PluginManifest {
        PluginManifest::implicit(Path::new("echo.so"))
    }

    #[test]
    fn test_pinned_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("v2")).unwrap();
        std::fs::write(dir.path().join("v2").join("codec.bin"), b"v2").unwrap();
        std::fs::write(dir.path().join("codec"), b"local").unwrap();

        let m = manifest()
            .with_dependency("codec", DependencySpec::new("2.0.0").with_path("v2/codec.bin"));
        let resolver = DependencyResolver::new(&m, dir.path());
        let deps = resolver.resolve_all().unwrap();

        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].from, ResolvedFrom::Manifest);
        assert!(deps[0].path.ends_with("v2/codec.bin"));
    }

    #[test]
    fn test_falls_back_to_plugin_directory() {
        let dir = tempfile::tempdir().unwrap();
        let lib_name = libloading::library_filename("codec");
        std::fs::write(dir.path().join(&lib_name), b"local").unwrap();

        let m = manifest()
            .with_dependency("codec", DependencySpec::new("1.0.0").with_path("missing.so"));
        let resolver = DependencyResolver::new(&m, dir.path());
        let dep = resolver.resolve("codec", &m.dependencies["codec"]).unwrap();

        assert_eq!(dep.from, ResolvedFrom::PluginDirectory);
        assert_eq!(dep.path, dir.path().join(lib_name));
    }

    #[test]
    fn test_unresolved_required_fails() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest().with_dependency("ghost", DependencySpec::new("1.0.0"));
        let result = DependencyResolver::new(&m, dir.path()).resolve_all();

        match result {
            Err(LoadError::UnresolvedDependency { name, .. }) => assert_eq!(name, "ghost"),
            other => panic!("unexpected: {:?}", other.map(|d| d.len())),
        }
    }

    #[test]
    fn test_unresolved_optional_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest().with_dependency("ghost", DependencySpec::new("1.0.0").optional());
        let deps = DependencyResolver::new(&m, dir.path()).resolve_all().unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn test_never_searches_outside_plugin_dir() {
        let root = tempfile::tempdir().unwrap();
        let plugin_dir = root.path().join("echo");
        std::fs::create_dir(&plugin_dir).unwrap();
        // Sibling of the plugin directory, not inside it.
        std::fs::write(root.path().join("codec"), b"shared").unwrap();

        let m = manifest().with_dependency("codec", DependencySpec::new("1.0.0"));
        let result = DependencyResolver::new(&m, &plugin_dir).resolve_all();
        assert!(result.is_err());
    }
}
