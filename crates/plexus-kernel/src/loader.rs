//! Dynamic library loader
//!
//! A [`ModuleLoader`] owns the mapping of exactly one shared library path.
//! Two load modes are supported:
//!
//! - [`LoadMode::Shadow`] maps a private copy of the file. The next version
//!   can then be mapped ([`ModuleLoader::stage`]) while the current one is
//!   still in use, and only swapped in ([`ModuleLoader::commit`]) once the
//!   caller has finished resolving symbols from it.
//! - [`LoadMode::InPlace`] maps the file itself; [`ModuleLoader::reload`]
//!   is close-then-open.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use libloading::{Library, Symbol};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::api::RegisterApiFn;

/// Loader error types
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to load library {}: {reason}", .path.display())]
    LibraryLoad { path: PathBuf, reason: String },

    #[error("Symbol not found: {symbol}: {reason}")]
    SymbolNotFound { symbol: String, reason: String },

    #[error("Library not loaded: {}", .0.display())]
    NotLoaded(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a loader maps its library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Map a private copy of the file
    #[default]
    Shadow,
    /// Map the file itself
    InPlace,
}

/// A mapped library
pub struct LoadedLibrary {
    library: Library,
    /// Path handed to the OS loader
    mapped_path: PathBuf,
    /// Whether `mapped_path` is a private copy owned by the loader
    shadow: bool,
    /// SHA-256 of the file contents that were mapped
    hash: String,
    loaded_at: Instant,
}

impl LoadedLibrary {
    /// Path the OS loader mapped
    pub fn mapped_path(&self) -> &Path {
        &self.mapped_path
    }

    /// SHA-256 of the mapped file contents
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// When the library was mapped
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// Resolve a registration entry point.
    ///
    /// The returned pointer is only valid while this library stays mapped.
    pub fn resolve(&self, symbol: &str) -> Result<RegisterApiFn, LoadError> {
        let entry: Symbol<'_, RegisterApiFn> = unsafe { self.library.get(symbol.as_bytes()) }
            .map_err(|e| {
                error!(symbol, path = %self.mapped_path.display(), error = %e, "Symbol resolution failed");
                LoadError::SymbolNotFound {
                    symbol: symbol.to_string(),
                    reason: e.to_string(),
                }
            })?;

        debug!(symbol, path = %self.mapped_path.display(), "Resolved entry symbol");
        Ok(*entry)
    }

    pub(crate) fn close(self) {
        let LoadedLibrary {
            library,
            mapped_path,
            shadow,
            ..
        } = self;

        match library.close() {
            Ok(()) => debug!(path = %mapped_path.display(), "Closed library"),
            Err(e) => error!(path = %mapped_path.display(), error = %e, "Failed to close library"),
        }

        if still_resident(&mapped_path) {
            warn!(path = %mapped_path.display(), "Library stays resident after close");
        }

        if shadow {
            if let Err(e) = std::fs::remove_file(&mapped_path) {
                debug!(path = %mapped_path.display(), error = %e, "Could not remove shadow copy");
            }
        }
    }
}

impl fmt::Debug for LoadedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedLibrary")
            .field("mapped_path", &self.mapped_path)
            .field("shadow", &self.shadow)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Loader for a single shared library path
pub struct ModuleLoader {
    path: PathBuf,
    mode: LoadMode,
    current: Option<LoadedLibrary>,
    /// Directory holding shadow copies, created on first use
    shadow_dir: Option<TempDir>,
    /// Counter used to give every shadow copy a distinct file name
    copies: u64,
}

impl ModuleLoader {
    /// Create a loader for `path`. Nothing is mapped until [`open`](Self::open).
    pub fn new(path: impl Into<PathBuf>, mode: LoadMode) -> Self {
        Self {
            path: path.into(),
            mode,
            current: None,
            shadow_dir: None,
            copies: 0,
        }
    }

    /// Library path this loader manages
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load mode
    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    /// Whether a library is currently mapped
    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    /// Currently mapped library
    pub fn library(&self) -> Option<&LoadedLibrary> {
        self.current.as_ref()
    }

    /// Hash of the currently mapped library
    pub fn hash(&self) -> Option<&str> {
        self.current.as_ref().map(LoadedLibrary::hash)
    }

    /// Map the library. Does nothing if it is already mapped.
    pub fn open(&mut self) -> Result<(), LoadError> {
        if self.current.is_some() {
            return Ok(());
        }

        let library = self.stage()?;
        info!(
            path = %self.path.display(),
            mapped = %library.mapped_path.display(),
            "Loaded module library"
        );
        self.current = Some(library);
        Ok(())
    }

    /// Unmap the library. Safe to call when nothing is mapped.
    pub fn close(&mut self) {
        if let Some(library) = self.current.take() {
            info!(path = %self.path.display(), "Closing module library");
            library.close();
        }
    }

    /// Replace the mapped library with the current contents of the file.
    ///
    /// In [`LoadMode::InPlace`] the old library is closed first, so on
    /// failure nothing is mapped afterwards. In [`LoadMode::Shadow`] the old
    /// library is only closed once the new one mapped successfully.
    pub fn reload(&mut self) -> Result<(), LoadError> {
        if self.mode == LoadMode::InPlace {
            self.close();
        }

        let library = self.stage()?;
        self.commit(library);
        info!(path = %self.path.display(), "Reloaded module library");
        Ok(())
    }

    /// Map the current contents of the file without touching the mapped
    /// library.
    ///
    /// In [`LoadMode::InPlace`] the OS loader hands back the already mapped
    /// library while it is still open, so staging only yields a new version
    /// after [`close`](Self::close).
    pub fn stage(&mut self) -> Result<LoadedLibrary, LoadError> {
        let bytes = std::fs::read(&self.path).map_err(|e| self.load_failed(e.to_string()))?;
        let hash = hash_bytes(&bytes);

        let (mapped_path, shadow) = match self.mode {
            LoadMode::InPlace => (self.path.clone(), false),
            LoadMode::Shadow => (self.write_shadow_copy(&bytes)?, true),
        };

        let library = match unsafe { Library::new(&mapped_path) } {
            Ok(library) => library,
            Err(e) => {
                if shadow {
                    let _ = std::fs::remove_file(&mapped_path);
                }
                return Err(self.load_failed(e.to_string()));
            }
        };

        Ok(LoadedLibrary {
            library,
            mapped_path,
            shadow,
            hash,
            loaded_at: Instant::now(),
        })
    }

    /// Install a staged library, closing the previously mapped one.
    pub fn commit(&mut self, library: LoadedLibrary) {
        if let Some(previous) = self.current.replace(library) {
            previous.close();
        }
    }

    /// Resolve a registration entry point in the mapped library
    pub fn resolve(&self, symbol: &str) -> Result<RegisterApiFn, LoadError> {
        self.current
            .as_ref()
            .ok_or_else(|| LoadError::NotLoaded(self.path.clone()))?
            .resolve(symbol)
    }

    /// Whether the file on disk differs from the mapped library.
    ///
    /// Reports `true` when nothing is mapped.
    pub fn has_changed(&self) -> Result<bool, LoadError> {
        match &self.current {
            Some(library) => Ok(file_hash(&self.path)? != library.hash),
            None => Ok(true),
        }
    }

    fn write_shadow_copy(&mut self, bytes: &[u8]) -> Result<PathBuf, LoadError> {
        if self.shadow_dir.is_none() {
            self.shadow_dir = Some(self.create_shadow_dir()?);
        }
        let dir = match &self.shadow_dir {
            Some(dir) => dir.path().to_path_buf(),
            None => return Err(self.load_failed("no shadow directory".to_string())),
        };

        self.copies += 1;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let mapped_path = dir.join(format!("{}-{}", self.copies, file_name));

        std::fs::write(&mapped_path, bytes)?;
        debug!(path = %mapped_path.display(), "Wrote shadow copy");
        Ok(mapped_path)
    }

    fn create_shadow_dir(&self) -> Result<TempDir, LoadError> {
        // Next to the library first: the system temp dir may be mounted noexec.
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        match tempfile::Builder::new()
            .prefix(".plexus-shadow-")
            .tempdir_in(parent)
        {
            Ok(dir) => Ok(dir),
            Err(e) => {
                debug!(dir = %parent.display(), error = %e, "Falling back to system temp dir");
                Ok(tempfile::Builder::new().prefix("plexus-shadow-").tempdir()?)
            }
        }
    }

    fn load_failed(&self, reason: String) -> LoadError {
        error!(path = %self.path.display(), %reason, "Failed to load module library");
        LoadError::LibraryLoad {
            path: self.path.clone(),
            reason,
        }
    }
}

impl Drop for ModuleLoader {
    fn drop(&mut self) {
        // The shadow directory must outlive the mapping.
        self.close();
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("current", &self.current)
            .finish()
    }
}

/// A library mapped for the life of the process.
///
/// Modules often link against libraries whose symbols resolve lazily; mapping
/// those up front and flagging them non-deletable keeps them from being torn
/// down and re-initialised whenever a dependent module reloads.
pub struct PersistentLibrary {
    name: String,
    _library: Library,
}

impl PersistentLibrary {
    /// Name or path the library was loaded by
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PersistentLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentLibrary")
            .field("name", &self.name)
            .finish()
    }
}

/// Map a library persistently, making its symbols globally available
pub fn load_persistent(name: &str) -> Result<PersistentLibrary, LoadError> {
    let library = open_persistent(name).map_err(|e| {
        error!(library = name, error = %e, "Failed to load library persistently");
        LoadError::LibraryLoad {
            path: PathBuf::from(name),
            reason: e.to_string(),
        }
    })?;

    debug!(library = name, "Keeping library resident");
    Ok(PersistentLibrary {
        name: name.to_string(),
        _library: library,
    })
}

#[cfg(unix)]
fn open_persistent(name: &str) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

    let library = unsafe { UnixLibrary::open(Some(name), RTLD_NOW | RTLD_GLOBAL | libc::RTLD_NODELETE) }?;
    Ok(library.into())
}

#[cfg(not(unix))]
fn open_persistent(name: &str) -> Result<Library, libloading::Error> {
    unsafe { Library::new(name) }
}

#[cfg(unix)]
fn still_resident(path: &Path) -> bool {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY};

    // RTLD_NOLOAD only succeeds for an object that is still mapped.
    unsafe { UnixLibrary::open(Some(path), RTLD_LAZY | libc::RTLD_NOLOAD) }.is_ok()
}

#[cfg(not(unix))]
fn still_resident(_path: &Path) -> bool {
    false
}

fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of a file's contents
pub fn file_hash(path: &Path) -> Result<String, LoadError> {
    Ok(hash_bytes(&std::fs::read(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new(dir.path().join("libmissing.so"), LoadMode::Shadow);

        let err = loader.open().unwrap_err();
        assert!(matches!(err, LoadError::LibraryLoad { .. }));
        assert!(!loader.is_loaded());
        assert!(loader.has_changed().unwrap());
    }

    #[test]
    fn test_resolve_requires_library() {
        let loader = ModuleLoader::new("libnothing.so", LoadMode::InPlace);

        let err = loader.resolve("plexus_module_register_nothing").unwrap_err();
        assert!(matches!(err, LoadError::NotLoaded(_)));
    }

    #[test]
    fn test_close_without_library_is_noop() {
        let mut loader = ModuleLoader::new("libnothing.so", LoadMode::Shadow);
        loader.close();
        loader.close();
        assert!(!loader.is_loaded());
    }

    #[test]
    fn test_failed_stage_removes_shadow_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libgarbage.so");
        std::fs::write(&path, b"definitely not an object file").unwrap();

        let mut loader = ModuleLoader::new(&path, LoadMode::Shadow);
        assert!(loader.stage().is_err());

        let shadow_dir = loader.shadow_dir.as_ref().unwrap().path().to_path_buf();
        assert_eq!(std::fs::read_dir(shadow_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_file_hash_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module.bin");

        std::fs::write(&path, b"first").unwrap();
        let first = file_hash(&path).unwrap();
        assert_eq!(first, file_hash(&path).unwrap());
        assert_eq!(first.len(), 64);

        std::fs::write(&path, b"second").unwrap();
        assert_ne!(first, file_hash(&path).unwrap());
    }

    #[test]
    fn test_load_mode_serde_names() {
        assert_eq!(serde_json::to_string(&LoadMode::InPlace).unwrap(), "\"in_place\"");
        assert_eq!(
            serde_json::from_str::<LoadMode>("\"shadow\"").unwrap(),
            LoadMode::Shadow
        );
    }
}
