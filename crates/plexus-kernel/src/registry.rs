//! Module registry
//!
//! The registry maps every [`ModuleId`] to one [`ApiTable`] for its whole
//! life. Tables are handed out as `Arc`s and never replaced; reloads only
//! rewrite their contents.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicPtr;

use error_stack::ResultExt;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::{ApiTable, ModuleApi, RebindTarget};
use crate::config::RegistryConfig;
use crate::error::{IntoRegistryReport, RegistryError, RegistryReport, RegistryResult};
use crate::identity::{ModuleId, NameTable};
use crate::loader::{PersistentLibrary, load_persistent};
use crate::reload::{DynamicModule, ModuleStatus, Provisioning, ReloadOutcome, ReloadTrigger};
use crate::watcher::{FileWatcher, WatchError, WatchId};

type SharedRecord = Arc<Mutex<DynamicModule>>;
type OutcomeLog = Arc<Mutex<Vec<(ModuleId, ReloadOutcome)>>>;
/// Held by the thread populating a table until registration has run
type ProvisionLock = Arc<ReentrantMutex<()>>;

/// Process-wide pointer slot that outlives module reloads.
///
/// The registry never interprets or frees what the slot points at.
/// [`AtomicPtr::as_ptr`] gives the `void**` form for handing to C code.
pub type StateSlot = Arc<AtomicPtr<c_void>>;

struct Entry {
    table: Arc<dyn Any + Send + Sync>,
    target: Arc<dyn RebindTarget>,
    provisioning: Provisioning,
    ready: ProvisionLock,
}

impl Entry {
    fn new<T: ModuleApi>(
        table: &Arc<ApiTable<T>>,
        ready: &ProvisionLock,
        provisioning: Provisioning,
    ) -> Self {
        Self {
            table: table.clone(),
            target: table.clone(),
            provisioning,
            ready: ready.clone(),
        }
    }

    fn downcast<T: ModuleApi>(&self) -> RegistryResult<Arc<ApiTable<T>>> {
        self.table
            .clone()
            .downcast::<ApiTable<T>>()
            .map_err(|_| RegistryError::TypeMismatch { module: T::NAME })
    }
}

/// What one [`ModuleRegistry::poll_for_reloads`] call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Watch callbacks fired
    pub events: usize,
    /// Modules now running new code
    pub reloaded: Vec<ModuleId>,
    /// Modules whose file turned out unchanged
    pub unchanged: Vec<ModuleId>,
    /// Modules whose reload failed
    pub failed: Vec<ModuleId>,
}

impl PollSummary {
    fn record(&mut self, id: ModuleId, outcome: ReloadOutcome) {
        match outcome {
            ReloadOutcome::Reloaded => self.reloaded.push(id),
            ReloadOutcome::Unchanged => self.unchanged.push(id),
            ReloadOutcome::Failed => self.failed.push(id),
        }
    }

    /// Whether nothing happened
    pub fn is_empty(&self) -> bool {
        self.events == 0 && self.attempted() == 0
    }

    /// Number of reload attempts
    pub fn attempted(&self) -> usize {
        self.reloaded.len() + self.unchanged.len() + self.failed.len()
    }
}

/// Process-wide map from module identity to interface table.
///
/// Construct one at startup and hand it (usually in an `Arc`) to whatever
/// needs module interfaces. Lookups and provisioning may happen from any
/// thread; [`poll_for_reloads`](Self::poll_for_reloads) should be driven
/// from a single loop.
///
/// Registration functions run without any registry lock held, so they may
/// provision the modules they depend on. A thread asking for a module that
/// another thread is still provisioning waits for it; the provisioning
/// thread itself gets the table back immediately.
///
/// Locks are always taken in the order tables, records, watcher. Watch
/// callbacks run under the watcher lock and only lock their own record.
pub struct ModuleRegistry {
    // Fields drop in order: watches go before the records they reference.
    watcher: Mutex<Option<FileWatcher>>,
    pending: Mutex<Vec<ModuleId>>,
    outcomes: OutcomeLog,
    records: RwLock<HashMap<ModuleId, SharedRecord>>,
    apis: Mutex<HashMap<ModuleId, Entry>>,
    names: NameTable,
    slots: Mutex<HashMap<u64, StateSlot>>,
    persistent: Mutex<Vec<PersistentLibrary>>,
    config: RegistryConfig,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            watcher: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            outcomes: Arc::new(Mutex::new(Vec::new())),
            records: RwLock::new(HashMap::new()),
            apis: Mutex::new(HashMap::new()),
            names: NameTable::new(),
            slots: Mutex::new(HashMap::new()),
            persistent: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Table of a module compiled into the host.
    ///
    /// `register` runs once, on first request. Later calls return the same
    /// table, whichever way it was provisioned.
    pub fn get_or_create_static<T: ModuleApi>(
        &self,
        register: fn(&mut T),
    ) -> RegistryReport<Arc<ApiTable<T>>> {
        let table = Arc::new(ApiTable::<T>::new());
        let ready: ProvisionLock = Arc::new(ReentrantMutex::new(()));
        let _provisioning = ready.lock();

        let claimed = self
            .claim::<T>(Entry::new(&table, &ready, Provisioning::Static))
            .attach(format!("registering static module '{}'", T::NAME))?;
        if let Some(existing) = claimed {
            return Ok(existing);
        }

        table.populate(register);
        info!(module = %T::ID, "Registered static module");
        Ok(table)
    }

    /// Table of a module loaded from `library_path`.
    ///
    /// On first request the library is loaded, `entry_symbol` resolved and
    /// called with a fresh table. With `want_auto_reload` the library file is
    /// watched and reloaded on change from
    /// [`poll_for_reloads`](Self::poll_for_reloads).
    ///
    /// If loading fails an error is returned, but the module stays
    /// registered: [`get`](Self::get) returns its zeroed table and a watched
    /// module retries on the next change.
    pub fn get_or_create_dynamic<T: ModuleApi>(
        &self,
        library_path: impl AsRef<Path>,
        entry_symbol: &str,
        want_auto_reload: bool,
    ) -> RegistryReport<Arc<ApiTable<T>>> {
        let library_path = library_path.as_ref().to_path_buf();
        let table = Arc::new(ApiTable::<T>::new());
        let ready: ProvisionLock = Arc::new(ReentrantMutex::new(()));
        let _provisioning = ready.lock();

        let claimed = self
            .claim::<T>(Entry::new(&table, &ready, Provisioning::Dynamic))
            .attach(format!("registering dynamic module '{}'", T::NAME))?;
        if let Some(existing) = claimed {
            return Ok(existing);
        }

        let record: SharedRecord = Arc::new(Mutex::new(DynamicModule::new(
            T::ID,
            table.clone(),
            library_path.clone(),
            entry_symbol.to_string(),
            self.config.reload_policy,
            self.config.skip_unchanged,
        )));

        self.records.write().insert(T::ID, record.clone());

        let loaded = record.lock().load();

        if want_auto_reload {
            let target = self.config.watch_target(&library_path, T::NAME);
            match self.watch_record(&record, &target) {
                Ok(watch) => record.lock().set_watch(watch, target),
                Err(e) => warn!(
                    module = %T::ID,
                    path = %target.display(),
                    error = %e,
                    "Could not watch module library, auto reload disabled"
                ),
            }
        }

        loaded
            .map_err(RegistryError::from)
            .into_report()
            .attach(format!("loading module '{}'", T::NAME))
            .attach(format!("library: {}", library_path.display()))?;

        Ok(table)
    }

    /// Dynamic module located through the configured naming convention
    pub fn load_dynamic<T: ModuleApi>(
        &self,
        want_auto_reload: bool,
    ) -> RegistryReport<Arc<ApiTable<T>>> {
        let path = self.config.library_path(T::NAME);
        let symbol = self.config.entry_symbol(T::NAME);
        self.get_or_create_dynamic::<T>(path, &symbol, want_auto_reload)
    }

    /// Dynamic with auto reload when the config prefers dynamic modules,
    /// static otherwise
    pub fn load_default<T: ModuleApi>(
        &self,
        register: fn(&mut T),
    ) -> RegistryReport<Arc<ApiTable<T>>> {
        if self.config.prefer_dynamic {
            self.load_dynamic::<T>(true)
        } else {
            self.get_or_create_static::<T>(register)
        }
    }

    /// Table of a module, without provisioning it
    pub fn get<T: ModuleApi>(&self) -> Option<Arc<ApiTable<T>>> {
        self.apis
            .lock()
            .get(&T::ID)
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Whether a module is registered
    pub fn contains(&self, id: ModuleId) -> bool {
        self.apis.lock().contains_key(&id)
    }

    /// Drain file change notifications and queued reload requests.
    ///
    /// Reloads run one after another on the calling thread; each is complete
    /// before the next starts.
    pub fn poll_for_reloads(&self) -> PollSummary {
        let mut summary = PollSummary::default();

        summary.events = match self.watcher.lock().as_mut() {
            Some(watcher) => watcher.poll(),
            None => 0,
        };

        let watched = std::mem::take(&mut *self.outcomes.lock());
        for (id, outcome) in watched {
            summary.record(id, outcome);
        }

        let requested = std::mem::take(&mut *self.pending.lock());
        for id in requested {
            let record = self.records.read().get(&id).cloned();
            match record {
                Some(record) => {
                    let outcome = record.lock().reload(ReloadTrigger::Requested);
                    summary.record(id, outcome);
                }
                None => warn!(module = %id, "Dropping reload request for unknown module"),
            }
        }

        if !summary.is_empty() {
            debug!(
                events = summary.events,
                reloaded = summary.reloaded.len(),
                failed = summary.failed.len(),
                "Polled for reloads"
            );
        }
        summary
    }

    /// Queue a reload of a dynamic module for the next poll.
    ///
    /// Requested reloads ignore `skip_unchanged`.
    pub fn request_reload(&self, id: ModuleId) -> RegistryReport<()> {
        if !self.records.read().contains_key(&id) {
            return Err(RegistryError::NotFound(id.name().to_string())).into_report();
        }

        let mut pending = self.pending.lock();
        if !pending.contains(&id) {
            pending.push(id);
        }
        debug!(module = %id, "Reload requested");
        Ok(())
    }

    /// Status of one module
    pub fn module_status(&self, id: ModuleId) -> Option<ModuleStatus> {
        let apis = self.apis.lock();
        let entry = apis.get(&id)?;

        match entry.provisioning {
            Provisioning::Static => Some(ModuleStatus::for_static(id, entry.target.generation())),
            Provisioning::Dynamic => {
                let record = self.records.read().get(&id).cloned()?;
                let status = record.lock().status();
                Some(status)
            }
        }
    }

    /// Status of every module, ordered by name
    pub fn modules(&self) -> Vec<ModuleStatus> {
        let ids: Vec<ModuleId> = self.apis.lock().keys().copied().collect();
        let mut statuses: Vec<ModuleStatus> =
            ids.into_iter().filter_map(|id| self.module_status(id)).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Name of the module with the given identity hash
    pub fn module_name(&self, hash: u64) -> Option<&'static str> {
        self.names.lookup(hash)
    }

    /// Map a library for the life of the registry.
    ///
    /// Its symbols become globally visible and it is never unloaded, so
    /// modules depending on it can be reloaded without re-initialising it.
    pub fn load_library_persistently(&self, name: &str) -> RegistryReport<()> {
        let library = load_persistent(name)
            .map_err(RegistryError::from)
            .into_report()
            .attach(format!("loading persistent library '{name}'"))?;

        info!(library = name, "Loaded persistent library");
        self.persistent.lock().push(library);
        Ok(())
    }

    /// Names of persistently loaded libraries
    pub fn persistent_libraries(&self) -> Vec<String> {
        self.persistent
            .lock()
            .iter()
            .map(|l| l.name().to_string())
            .collect()
    }

    /// Slot for process-wide state keyed by `key`, created null on first use.
    ///
    /// Module code is replaced on reload and its statics start over; state a
    /// module needs to keep across reloads goes here instead. Every call with
    /// the same key returns the same slot. Keys are usually
    /// [`fnv1a_64`](crate::fnv1a_64) hashes of a name.
    pub fn produce_entry(&self, key: u64) -> StateSlot {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key).or_insert_with(|| {
            debug!(key, "Created state slot");
            Arc::new(AtomicPtr::new(std::ptr::null_mut()))
        });
        Arc::clone(slot)
    }

    /// Insert `entry` unless its module is already registered, in which
    /// case the existing table is returned once it has been provisioned.
    fn claim<T: ModuleApi>(&self, entry: Entry) -> RegistryReport<Option<Arc<ApiTable<T>>>> {
        let mut apis = self.apis.lock();
        self.record_name(T::ID).into_report()?;

        if !apis.contains_key(&T::ID) {
            apis.insert(T::ID, entry);
            return Ok(None);
        }

        let existing = &apis[&T::ID];
        let table = existing.downcast::<T>().into_report()?;
        let ready = existing.ready.clone();
        drop(apis);

        // Re-entrant: a registration function asking for its own module
        // gets the table it is filling.
        let _ready = ready.lock();
        Ok(Some(table))
    }

    fn record_name(&self, id: ModuleId) -> RegistryResult<()> {
        self.names
            .record(id)
            .map_err(|existing| RegistryError::HashCollision {
                name: id.name(),
                existing,
                hash: id.hash(),
            })
    }

    fn watch_record(&self, record: &SharedRecord, target: &Path) -> Result<WatchId, WatchError> {
        let mut slot = self.watcher.lock();
        let watcher = match slot.take() {
            Some(watcher) => watcher,
            None => FileWatcher::new()?,
        };
        let watcher = slot.insert(watcher);

        let record = Arc::clone(record);
        let outcomes = Arc::clone(&self.outcomes);
        watcher.add_watch(target, move |_: &Path| {
            let mut record = record.lock();
            let outcome = record.reload(ReloadTrigger::FileChanged);
            outcomes.lock().push((record.id(), outcome));
        })
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for ModuleRegistry {
    fn drop(&mut self) {
        *self.watcher.get_mut() = None;

        // Callers may still hold tables; leave them unavailable rather than
        // pointing into unmapped code.
        for record in self.records.get_mut().values() {
            record.lock().unload();
        }
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.apis.lock().len())
            .field("dynamic", &self.records.read().len())
            .field("config", &self.config)
            .finish()
    }
}
