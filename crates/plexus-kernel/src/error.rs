//! Crate-level error types for `plexus-kernel`.
//!
//! Each component keeps its own typed error ([`LoadError`], [`WatchError`],
//! [`ConfigError`]); [`RegistryError`] composes them via `#[from]` so `?`
//! converts automatically. Registry operations hand back
//! [`error_stack::Report<RegistryError>`] (via [`RegistryReport`]) so that
//! module names and paths travel with the error as attachments.
//!
//! # Usage
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use plexus_kernel::error::{IntoRegistryReport, RegistryError, RegistryReport};
//!
//! fn open(loader: &mut ModuleLoader) -> RegistryReport<()> {
//!     loader
//!         .open()
//!         .map_err(RegistryError::from)
//!         .into_report()
//!         .attach("opening greeter")
//! }
//! ```

use error_stack::Report;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::loader::LoadError;
pub use crate::watcher::WatchError;

/// Plain result alias for registry operations.
pub type RegistryResult<T> = ::std::result::Result<T, RegistryError>;

/// Error-stack–backed result alias for registry operations.
///
/// Equivalent to `Result<T, error_stack::Report<RegistryError>>`.
pub type RegistryReport<T> = ::std::result::Result<T, Report<RegistryError>>;

/// Extension trait to convert [`RegistryResult<T>`] into [`RegistryReport<T>`].
pub trait IntoRegistryReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> RegistryReport<T>;
}

impl<T> IntoRegistryReport<T> for RegistryResult<T> {
    #[inline]
    fn into_report(self) -> RegistryReport<T> {
        self.map_err(Report::new)
    }
}

/// Errors surfaced by the module registry and reload orchestration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The shared library could not be opened, resolved or reloaded.
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// The file watcher could not be created or could not watch a path.
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Two different module names hash to the same identity.
    #[error("Module name hash collision: '{name}' and '{existing}' share hash {hash:#018x}")]
    HashCollision {
        /// Name being registered.
        name: &'static str,
        /// Name already holding the hash.
        existing: &'static str,
        /// The shared hash value.
        hash: u64,
    },

    /// The identity is already bound to a table of another Rust type.
    #[error("Module '{module}' is already registered with a different interface type")]
    TypeMismatch {
        /// Module name.
        module: &'static str,
    },

    /// No dynamic module is registered under this identity.
    #[error("Module not found: {0}")]
    NotFound(String),
}
