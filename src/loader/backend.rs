//! Image backends.
//!
//! A backend turns a shadow-copied image into something the host can use:
//! a module that can construct plugin instances, or a native handle.

use crate::core::{LoadError, LoadResult};
use crate::loader::image::CodeImage;
use crate::plugin::interface::Plugin;
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};

/// Default symbol a plugin library exports to construct its instance.
pub const DEFAULT_ENTRY_SYMBOL: &str = "plughost_plugin_create";

/// Signature of the plugin constructor symbol.
///
/// Plugins are Rust libraries built with the same toolchain and crate
/// versions as the host; use [`declare_plugin!`](crate::declare_plugin).
pub type PluginConstructor = unsafe fn() -> Box<dyn Plugin>;

/// An opened module image.
pub trait ModuleImage: Send + Sync {
    /// Path the image was opened from.
    fn path(&self) -> &Path;

    /// Construct a plugin instance through `entry_symbol`.
    fn instantiate(&self, entry_symbol: &str) -> LoadResult<Box<dyn Plugin>>;
}

/// An opened native library.
pub struct NativeHandle {
    path: PathBuf,
    library: Option<Library>,
}

impl NativeHandle {
    /// Wrap an opened library.
    pub fn from_library(path: PathBuf, library: Library) -> Self {
        Self {
            path,
            library: Some(library),
        }
    }

    /// A handle with no library behind it, for backends that do not
    /// dlopen (embedded or test images).
    pub fn unbacked(path: PathBuf) -> Self {
        Self {
            path,
            library: None,
        }
    }

    /// Path the library was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an OS library is open behind this handle.
    pub fn is_backed(&self) -> bool {
        self.library.is_some()
    }

    /// Look up a symbol.
    ///
    /// # Safety
    ///
    /// `T` must match the symbol's real type, and the returned symbol must
    /// not outlive the load unit owning this handle.
    pub unsafe fn symbol<T>(&self, name: &[u8]) -> Option<Symbol<'_, T>> {
        self.library.as_ref().and_then(|lib| lib.get(name).ok())
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        close_library(&self.path, self.library.take());
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("path", &self.path)
            .field("backed", &self.is_backed())
            .finish()
    }
}

/// Opens shadow-copied images.
pub trait ImageBackend: Send + Sync {
    /// Open a plugin or module image.
    fn open_module(&self, image: &CodeImage, shadow_path: &Path)
        -> LoadResult<Box<dyn ModuleImage>>;

    /// Open a native library.
    fn open_native(&self, image: &CodeImage, shadow_path: &Path) -> LoadResult<NativeHandle>;
}

/// Backend that opens images with the OS dynamic loader.
///
/// Libraries are opened with local symbol visibility. Only manifest
/// dependencies reached through [`NativeHandle::symbol`] are the unit's
/// private copies; link-time dependencies of a plugin are still resolved by
/// the system linker and may be shared between units.
#[derive(Clone, Debug, Default)]
pub struct NativeBackend;

impl NativeBackend {
    fn open(shadow_path: &Path) -> LoadResult<Library> {
        // SAFETY: running a library's initialisers is inherent to loading it;
        // the image comes from an operator-installed plugin directory.
        unsafe { Library::new(shadow_path) }.map_err(|e| LoadError::MalformedImage {
            path: shadow_path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

impl ImageBackend for NativeBackend {
    fn open_module(
        &self,
        _image: &CodeImage,
        shadow_path: &Path,
    ) -> LoadResult<Box<dyn ModuleImage>> {
        let library = Self::open(shadow_path)?;
        Ok(Box::new(NativeModule {
            path: shadow_path.to_path_buf(),
            library: Some(library),
        }))
    }

    fn open_native(&self, _image: &CodeImage, shadow_path: &Path) -> LoadResult<NativeHandle> {
        let library = Self::open(shadow_path)?;
        Ok(NativeHandle::from_library(shadow_path.to_path_buf(), library))
    }
}

struct NativeModule {
    path: PathBuf,
    library: Option<Library>,
}

impl ModuleImage for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn instantiate(&self, entry_symbol: &str) -> LoadResult<Box<dyn Plugin>> {
        let Some(library) = self.library.as_ref() else {
            return Err(LoadError::NotAPlugin {
                path: self.path.clone(),
            });
        };
        // SAFETY: the constructor type is the contract `declare_plugin!`
        // generates; plugins are built against this crate.
        let constructor: Symbol<PluginConstructor> = unsafe {
            library
                .get(entry_symbol.as_bytes())
                .map_err(|_| LoadError::MissingEntry {
                    path: self.path.clone(),
                    symbol: entry_symbol.to_string(),
                })?
        };
        // SAFETY: see above; the library outlives the instance because the
        // owning load unit is released only after every instance lease.
        Ok(unsafe { constructor() })
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        close_library(&self.path, self.library.take());
    }
}

fn close_library(path: &Path, library: Option<Library>) {
    let Some(library) = library else {
        return;
    };
    match library.close() {
        Ok(()) => tracing::trace!(path = %path.display(), "library closed"),
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "library close failed"),
    }
}

/// Export a plugin constructor from a plugin library.
///
/// ```rust,ignore
/// plughost::declare_plugin!(EchoPlugin, EchoPlugin::new);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:path) => {
        #[no_mangle]
        pub fn plughost_plugin_create() -> ::std::boxed::Box<dyn $crate::plugin::Plugin> {
            let constructor: fn() -> $plugin_type = $constructor;
            ::std::boxed::Box::new(constructor())
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_backend_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(libloading::library_filename("garbage"));
        std::fs::write(&path, b"not a shared object").unwrap();
        let image = CodeImage::read(&path).unwrap();

        let result = NativeBackend.open_module(&image, &path);
        assert!(matches!(result, Err(LoadError::MalformedImage { .. })));
        let result = NativeBackend.open_native(&image, &path);
        assert!(matches!(result, Err(LoadError::MalformedImage { .. })));
    }

    #[test]
    fn test_unbacked_handle() {
        let handle = NativeHandle::unbacked(PathBuf::from("/tmp/x.so"));
        assert!(!handle.is_backed());
        assert!(unsafe { handle.symbol::<fn()>(b"anything") }.is_none());
    }
}
