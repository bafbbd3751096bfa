//! Reload orchestration
//!
//! Every dynamically provisioned module owns a [`DynamicModule`] record
//! binding its identity to a loader, the registry's table and the entry
//! symbol. Watch callbacks and manual requests both end up in
//! [`DynamicModule::reload`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::RebindTarget;
use crate::identity::ModuleId;
use crate::loader::{LoadError, LoadMode, ModuleLoader};
use crate::watcher::WatchId;

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Table populated from the current library
    Loaded,
    /// Reload in progress
    Reloading,
    /// Last load or reload attempt failed
    Failed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Loaded => write!(f, "Loaded"),
            ModuleState::Reloading => write!(f, "Reloading"),
            ModuleState::Failed => write!(f, "Failed"),
        }
    }
}

/// How a module's table got populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provisioning {
    /// Compiled into the host
    Static,
    /// Loaded from a shared library
    Dynamic,
}

/// What happens to a module whose reload fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Stage the new library next to the old one; on failure the table
    /// keeps pointing into the still mapped previous version.
    #[default]
    KeepPrevious,
    /// Close, then reopen; on failure the table is left zeroed and the
    /// module is unavailable.
    FailFast,
}

impl ReloadPolicy {
    pub(crate) fn load_mode(self) -> LoadMode {
        match self {
            ReloadPolicy::KeepPrevious => LoadMode::Shadow,
            ReloadPolicy::FailFast => LoadMode::InPlace,
        }
    }
}

/// Why a reload was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// The watched library file was written
    FileChanged,
    /// Requested through [`ModuleRegistry::request_reload`](crate::ModuleRegistry::request_reload)
    Requested,
}

/// Result of one reload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// New code is bound into the table
    Reloaded,
    /// File contents matched the mapped library; nothing was done
    Unchanged,
    /// The attempt failed; see [`ModuleStatus::last_error`]
    Failed,
}

/// Point-in-time view of a module
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    /// Module name
    pub name: String,
    /// Module name hash
    pub id: u64,
    pub provisioning: Provisioning,
    pub state: ModuleState,
    /// Library the module loads from
    pub library_path: Option<PathBuf>,
    /// Entry symbol resolved from the library
    pub entry_symbol: Option<String>,
    /// Whether a file watch drives reloads
    pub watching: bool,
    /// File whose writes trigger reloads
    pub watch_path: Option<PathBuf>,
    /// Successful reloads after the initial load
    pub reload_count: u64,
    /// Successful registrations into the table
    pub generation: u64,
    pub last_error: Option<String>,
    /// Unix seconds of the last successful (re)load
    pub last_reload: Option<u64>,
    /// SHA-256 of the mapped library file
    pub file_hash: Option<String>,
}

impl ModuleStatus {
    pub(crate) fn for_static(id: ModuleId, generation: u64) -> Self {
        Self {
            name: id.name().to_string(),
            id: id.hash(),
            provisioning: Provisioning::Static,
            state: ModuleState::Loaded,
            library_path: None,
            entry_symbol: None,
            watching: false,
            watch_path: None,
            reload_count: 0,
            generation,
            last_error: None,
            last_reload: None,
            file_hash: None,
        }
    }
}

/// Registration record of a dynamically provisioned module
pub(crate) struct DynamicModule {
    id: ModuleId,
    table: Arc<dyn RebindTarget>,
    loader: ModuleLoader,
    entry_symbol: String,
    policy: ReloadPolicy,
    skip_unchanged: bool,
    state: ModuleState,
    watch: Option<(WatchId, PathBuf)>,
    reload_count: u64,
    last_error: Option<String>,
    last_reload: Option<SystemTime>,
}

impl DynamicModule {
    pub(crate) fn new(
        id: ModuleId,
        table: Arc<dyn RebindTarget>,
        library_path: PathBuf,
        entry_symbol: String,
        policy: ReloadPolicy,
        skip_unchanged: bool,
    ) -> Self {
        Self {
            id,
            table,
            loader: ModuleLoader::new(library_path, policy.load_mode()),
            entry_symbol,
            policy,
            skip_unchanged,
            state: ModuleState::Failed,
            watch: None,
            reload_count: 0,
            last_error: None,
            last_reload: None,
        }
    }

    pub(crate) fn id(&self) -> ModuleId {
        self.id
    }

    pub(crate) fn state(&self) -> ModuleState {
        self.state
    }

    pub(crate) fn library_path(&self) -> &Path {
        self.loader.path()
    }

    pub(crate) fn set_watch(&mut self, watch: WatchId, path: PathBuf) {
        self.watch = Some((watch, path));
    }

    /// First load. On failure the table stays zeroed and the record is
    /// left in [`ModuleState::Failed`].
    pub(crate) fn load(&mut self) -> Result<(), LoadError> {
        let result = self.bind_current();
        match &result {
            Ok(()) => {
                self.mark_loaded();
                info!(
                    module = %self.id,
                    path = %self.loader.path().display(),
                    "Loaded dynamic module"
                );
            }
            Err(e) => {
                self.loader.close();
                self.mark_failed(e);
            }
        }
        result
    }

    /// Attempt a reload. Never panics and never propagates: the outcome is
    /// reflected in the record's state.
    pub(crate) fn reload(&mut self, trigger: ReloadTrigger) -> ReloadOutcome {
        // A failed module retries even when the file is the build it still runs.
        if trigger == ReloadTrigger::FileChanged
            && self.skip_unchanged
            && self.state == ModuleState::Loaded
            && self.loader.is_loaded()
        {
            if let Ok(false) = self.loader.has_changed() {
                debug!(module = %self.id, "Library unchanged, skipping reload");
                return ReloadOutcome::Unchanged;
            }
        }

        info!(module = %self.id, ?trigger, policy = ?self.policy, "Reloading module");
        let started = Instant::now();
        let initial = self.last_reload.is_none();
        self.state = ModuleState::Reloading;

        let result = match self.policy {
            ReloadPolicy::KeepPrevious => self.reload_staged(),
            ReloadPolicy::FailFast => self.reload_in_place(),
        };

        match result {
            Ok(()) => {
                if !initial {
                    self.reload_count += 1;
                }
                self.mark_loaded();
                info!(
                    module = %self.id,
                    generation = self.table.generation(),
                    elapsed = ?started.elapsed(),
                    "Module reloaded"
                );
                ReloadOutcome::Reloaded
            }
            Err(e) => {
                self.mark_failed(&e);
                ReloadOutcome::Failed
            }
        }
    }

    /// Zero the table, then unmap the library
    pub(crate) fn unload(&mut self) {
        self.table.reset();
        self.loader.close();
        debug!(module = %self.id, "Unloaded dynamic module");
    }

    pub(crate) fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.id.name().to_string(),
            id: self.id.hash(),
            provisioning: Provisioning::Dynamic,
            state: self.state,
            library_path: Some(self.loader.path().to_path_buf()),
            entry_symbol: Some(self.entry_symbol.clone()),
            watching: self.watch.is_some(),
            watch_path: self.watch.as_ref().map(|(_, path)| path.clone()),
            reload_count: self.reload_count,
            generation: self.table.generation(),
            last_error: self.last_error.clone(),
            last_reload: self
                .last_reload
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            file_hash: self.loader.hash().map(str::to_string),
        }
    }

    fn bind_current(&mut self) -> Result<(), LoadError> {
        self.loader.open()?;
        let entry = self.loader.resolve(&self.entry_symbol)?;
        // The loader keeps the library mapped until the next commit or close.
        unsafe { self.table.rebind(entry) };
        Ok(())
    }

    fn reload_staged(&mut self) -> Result<(), LoadError> {
        let staged = self.loader.stage()?;
        let entry = match staged.resolve(&self.entry_symbol) {
            Ok(entry) => entry,
            Err(e) => {
                staged.close();
                return Err(e);
            }
        };

        // Publish the new pointers before the old library goes away.
        unsafe { self.table.rebind(entry) };
        self.loader.commit(staged);
        Ok(())
    }

    fn reload_in_place(&mut self) -> Result<(), LoadError> {
        self.table.reset();
        self.loader.reload()?;

        match self.loader.resolve(&self.entry_symbol) {
            Ok(entry) => {
                unsafe { self.table.rebind(entry) };
                Ok(())
            }
            Err(e) => {
                self.loader.close();
                Err(e)
            }
        }
    }

    fn mark_loaded(&mut self) {
        self.state = ModuleState::Loaded;
        self.last_error = None;
        self.last_reload = Some(SystemTime::now());
    }

    fn mark_failed(&mut self, error: &LoadError) {
        warn!(
            module = %self.id,
            path = %self.loader.path().display(),
            error = %error,
            "Module load failed"
        );
        self.state = ModuleState::Failed;
        self.last_error = Some(error.to_string());
    }
}

impl fmt::Debug for DynamicModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicModule")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("loader", &self.loader)
            .field("watch", &self.watch)
            .finish()
    }
}
