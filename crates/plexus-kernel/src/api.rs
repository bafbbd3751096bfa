//! Interface tables
//!
//! A module exposes its callable surface as a flat `#[repr(C)]` struct of
//! function pointers (possibly nesting further such structs). The registry
//! owns one [`ApiTable`] per module; its address never changes for the life
//! of the registry, only the function pointers inside it do.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::identity::ModuleId;

/// Entry symbol every dynamic module exports.
///
/// It receives a pointer to a zero-initialised interface struct of the
/// module's type and must fill in every function pointer. It must not keep,
/// free or replace the pointer.
pub type RegisterApiFn = unsafe extern "C" fn(api: *mut c_void);

/// A module interface table.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` and contain only `Option` wrapped
/// `extern "C"` function pointers or nested structs that satisfy the same
/// rules, so that a plugin compiled separately agrees on the layout.
/// `Default` must produce the all-`None` state.
///
/// Use [`module_api!`](crate::module_api) rather than implementing this by hand.
pub unsafe trait ModuleApi: Copy + Default + Send + Sync + 'static {
    /// Module name, also used to derive library path and entry symbol
    const NAME: &'static str;

    /// Module identity
    const ID: ModuleId = ModuleId::new(Self::NAME);
}

/// The registry-owned storage for one module interface.
///
/// Reloads never write into the live table field by field: the new
/// pointers are collected in a staging copy and stored with a single write,
/// so readers observe either the complete old set or the complete new one.
pub struct ApiTable<T> {
    id: ModuleId,
    slot: RwLock<T>,
    generation: AtomicU64,
}

impl<T: ModuleApi> ApiTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            id: T::ID,
            slot: RwLock::new(T::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Identity of the module this table belongs to
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Copy of the current function pointers.
    ///
    /// The copy must not be kept across a call to
    /// [`ModuleRegistry::poll_for_reloads`](crate::ModuleRegistry::poll_for_reloads):
    /// its pointers may refer to a library that has since been closed.
    pub fn load(&self) -> T {
        *self.slot.read()
    }

    /// Read guard over the current function pointers.
    ///
    /// Reloads block while the guard is held, so a call made through it
    /// always runs against a mapped library.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.slot.read()
    }

    /// Number of successful registrations into this table
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether a registration function has filled this table at least once
    pub fn is_populated(&self) -> bool {
        self.generation() > 0
    }

    pub(crate) fn populate(&self, register: impl FnOnce(&mut T)) {
        let mut staged = T::default();
        register(&mut staged);

        let mut slot = self.slot.write();
        *slot = staged;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reset(&self) {
        *self.slot.write() = T::default();
    }
}

impl<T> fmt::Debug for ApiTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiTable")
            .field("module", &self.id)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

/// Type-erased view of an [`ApiTable`] used by reload orchestration.
pub(crate) trait RebindTarget: Send + Sync {
    /// Run `entry` against a staging copy and publish the result.
    ///
    /// # Safety
    ///
    /// `entry` must come from a library that is still mapped and must
    /// expect this table's layout.
    unsafe fn rebind(&self, entry: RegisterApiFn);

    /// Return every function pointer to `None`.
    fn reset(&self);

    /// Number of successful registrations
    fn generation(&self) -> u64;
}

impl<T: ModuleApi> RebindTarget for ApiTable<T> {
    unsafe fn rebind(&self, entry: RegisterApiFn) {
        self.populate(|staged| unsafe { entry((staged as *mut T).cast::<c_void>()) });
    }

    fn reset(&self) {
        ApiTable::reset(self);
    }

    fn generation(&self) -> u64 {
        ApiTable::generation(self)
    }
}

/// Implement [`ModuleApi`] for an interface struct.
///
/// ```rust,ignore
/// #[repr(C)]
/// #[derive(Clone, Copy, Default)]
/// pub struct CounterApi {
///     pub next: Option<extern "C" fn() -> u64>,
/// }
///
/// plexus_kernel::module_api!(CounterApi, "counter");
/// ```
#[macro_export]
macro_rules! module_api {
    ($api:ty, $name:literal) => {
        unsafe impl $crate::api::ModuleApi for $api {
            const NAME: &'static str = $name;
        }
    };
}

/// Export the C entry symbol of a dynamic module.
///
/// The symbol name must match the registry's naming convention
/// (`plexus_module_register_<name>` by default). `$register` is a plain
/// `fn(&mut Api)` which is also what a host passes when linking the module
/// statically.
///
/// ```rust,ignore
/// fn register(api: &mut CounterApi) {
///     api.next = Some(next);
/// }
///
/// plexus_kernel::export_module!(plexus_module_register_counter, CounterApi, register);
/// ```
#[macro_export]
macro_rules! export_module {
    ($symbol:ident, $api:ty, $register:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $symbol(api: *mut ::std::ffi::c_void) {
            let api = api.cast::<$api>();
            if let Some(api) = unsafe { api.as_mut() } {
                $register(api);
            }
        }
    };
}
