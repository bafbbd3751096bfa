//! Live module registry
//!
//! Lets a long-running process pull functionality out of separately built
//! shared libraries, call it through flat tables of function pointers, and
//! swap the code behind those tables when a library is rebuilt:
//! - Address-stable interface tables keyed by compile-time module identities
//! - Static (compiled-in) and dynamic (shared library) provisioning
//! - Close-after-write file watching with per-poll coalescing
//! - Staged reloads that keep the previous version alive on failure
//!
//! ```rust,ignore
//! use plexus_kernel::prelude::*;
//!
//! let registry = ModuleRegistry::new(RegistryConfig::from_env()?);
//! let greeter = registry.load_dynamic::<GreeterApi>(true)?;
//!
//! loop {
//!     registry.poll_for_reloads();
//!     if let Some(greeting) = greeter.read().greeting {
//!         println!("{:?}", unsafe { std::ffi::CStr::from_ptr(greeting()) });
//!     }
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod loader;
pub mod registry;
pub mod reload;
pub mod watcher;

pub use api::{ApiTable, ModuleApi, RegisterApiFn};
pub use config::RegistryConfig;
pub use error::{IntoRegistryReport, RegistryError, RegistryReport, RegistryResult};
pub use identity::{ModuleId, fnv1a_64};
pub use loader::{LoadMode, ModuleLoader};
pub use registry::{ModuleRegistry, PollSummary, StateSlot};
pub use reload::{ModuleState, ModuleStatus, Provisioning, ReloadPolicy};
pub use watcher::{FileWatcher, WatchId};

pub mod prelude {
    pub use crate::api::{ApiTable, ModuleApi};
    pub use crate::config::RegistryConfig;
    pub use crate::error::{RegistryError, RegistryReport};
    pub use crate::identity::ModuleId;
    pub use crate::registry::{ModuleRegistry, PollSummary};
    pub use crate::reload::{ModuleState, ReloadPolicy};
    pub use crate::{export_module, module_api};
}
