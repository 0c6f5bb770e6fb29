//! In-memory code images.
//!
//! Images are read fully into memory so the file on disk can be replaced or
//! deleted while a previous version keeps running from its shadow copy.

use crate::core::{LoadError, LoadResult};
use std::path::{Path, PathBuf};

/// Debug symbols read next to an image.
#[derive(Clone, Debug)]
pub struct SymbolFile {
    /// Where the symbols were read from
    pub path: PathBuf,
    /// File contents
    pub bytes: Vec<u8>,
}

/// A code image held in memory.
#[derive(Clone, Debug)]
pub struct CodeImage {
    /// Original location on disk
    pub source_path: PathBuf,
    /// Full image contents
    pub bytes: Vec<u8>,
    /// Debug symbols, when present and readable
    pub symbols: Option<SymbolFile>,
}

impl CodeImage {
    /// Read an image without looking for symbols.
    pub fn read(path: &Path) -> LoadResult<Self> {
        if !path.is_file() {
            return Err(LoadError::ImageNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|e| LoadError::io_at(path, e))?;
        if bytes.is_empty() {
            return Err(LoadError::MalformedImage {
                path: path.to_path_buf(),
                message: "image is empty".to_string(),
            });
        }
        Ok(Self {
            source_path: path.to_path_buf(),
            bytes,
            symbols: None,
        })
    }

    /// Read an image and the first symbol file found for `extensions`.
    ///
    /// Failing to read symbols is not an error; the image loads without them.
    pub fn read_with_symbols(path: &Path, extensions: &[String]) -> LoadResult<Self> {
        let mut image = Self::read(path)?;
        image.symbols = find_symbols(path, extensions);
        Ok(image)
    }

    /// File name of the original image.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string())
    }

    /// Write the image (and its symbols) into `dir`.
    ///
    /// Returns the path of the written image. Symbol write failures are
    /// logged and ignored.
    pub fn write_shadow(&self, dir: &Path) -> LoadResult<PathBuf> {
        let shadow_path = dir.join(self.file_name());
        std::fs::write(&shadow_path, &self.bytes).map_err(|e| LoadError::io_at(&shadow_path, e))?;

        if let Some(symbols) = &self.symbols {
            if let Some(name) = symbols.path.file_name() {
                let target = dir.join(name);
                if let Err(err) = std::fs::write(&target, &symbols.bytes) {
                    tracing::warn!(
                        path = %target.display(),
                        error = %err,
                        "failed to shadow debug symbols, continuing without them"
                    );
                }
            }
        }
        Ok(shadow_path)
    }
}

fn find_symbols(path: &Path, extensions: &[String]) -> Option<SymbolFile> {
    for ext in extensions {
        let candidate = path.with_extension(ext);
        if candidate == path || !candidate.is_file() {
            continue;
        }
        match std::fs::read(&candidate) {
            Ok(bytes) => {
                return Some(SymbolFile {
                    path: candidate,
                    bytes,
                })
            }
            Err(err) => {
                tracing::warn!(
                    path = %candidate.display(),
                    error = %err,
                    "debug symbols unreadable, loading without them"
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_image() {
        let result = CodeImage::read(Path::new("/definitely/not/here.so"));
        assert!(matches!(result, Err(LoadError::ImageNotFound(_))));
    }

    #[test]
    fn test_read_empty_image_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.so");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            CodeImage::read(&path),
            Err(LoadError::MalformedImage { .. })
        ));
    }

    #[test]
    fn test_symbols_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.so");
        std::fs::write(&path, b"image").unwrap();

        let exts = vec!["pdb".to_string(), "debug".to_string()];
        let image = CodeImage::read_with_symbols(&path, &exts).unwrap();
        assert!(image.symbols.is_none());

        std::fs::write(dir.path().join("echo.debug"), b"dwarf").unwrap();
        let image = CodeImage::read_with_symbols(&path, &exts).unwrap();
        assert_eq!(image.symbols.unwrap().bytes, b"dwarf");
    }

    #[test]
    fn test_shadow_survives_source_overwrite() {
        let src = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let path = src.path().join("echo.so");
        std::fs::write(&path, b"v1").unwrap();

        let image = CodeImage::read(&path).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        let shadow_path = image.write_shadow(shadow.path()).unwrap();

        assert_eq!(std::fs::read(shadow_path).unwrap(), b"v1");
    }
}
