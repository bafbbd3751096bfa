//! End-to-end reload behaviour against real shared libraries.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::Duration;

use common::{CounterApi, build_counter, build_counter_without_entry, call_bar, install, library_file, poll_until};
use plexus_kernel::prelude::*;
use plexus_kernel::reload::Provisioning;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct FooApi {
    foo: Option<extern "C" fn() -> i32>,
}

plexus_kernel::module_api!(FooApi, "static_foo");

static FOO_REGISTRATIONS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn foo() -> i32 {
    42
}

fn register_foo(api: &mut FooApi) {
    FOO_REGISTRATIONS.fetch_add(1, Ordering::SeqCst);
    api.foo = Some(foo);
}

struct Workspace {
    _root: tempfile::TempDir,
    build: std::path::PathBuf,
    modules: std::path::PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let build = root.path().join("build");
        let modules = root.path().join("modules");
        std::fs::create_dir_all(&modules).unwrap();
        Self {
            _root: root,
            build,
            modules,
        }
    }

    fn library(&self) -> std::path::PathBuf {
        self.modules.join(library_file("counter"))
    }

    fn registry(&self, policy: ReloadPolicy) -> ModuleRegistry {
        ModuleRegistry::new(
            RegistryConfig::new()
                .with_modules_dir(&self.modules)
                .with_watch_flag_files(false)
                .with_reload_policy(policy),
        )
    }
}

const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_end_to_end_hot_reload() {
    let ws = Workspace::new();
    install(&build_counter(&ws.build, 1), &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);

    // (1) static module
    let foo_table = registry.get_or_create_static::<FooApi>(register_foo).unwrap();
    assert!(foo_table.load().foo.is_some());

    // (2) dynamic module
    let counter = registry.load_dynamic::<CounterApi>(true).unwrap();
    assert_eq!(call_bar(&counter), 1);

    // (3) rebuild and install over the watched file
    install(&build_counter(&ws.build, 2), &ws.library());
    let reloaded = poll_until(&registry, RELOAD_TIMEOUT, |r| {
        r.module_status(CounterApi::ID).unwrap().reload_count >= 1
    });
    assert!(reloaded, "reload was not observed");

    let same = registry.get::<CounterApi>().unwrap();
    assert!(Arc::ptr_eq(&counter, &same));
    assert_eq!(call_bar(&counter), 2);
    assert_eq!(registry.module_status(CounterApi::ID).unwrap().state, ModuleState::Loaded);

    // (4) remove the library and reload again
    std::fs::remove_file(ws.library()).unwrap();
    registry.request_reload(CounterApi::ID).unwrap();
    let summary = registry.poll_for_reloads();

    assert_eq!(summary.failed, vec![CounterApi::ID]);
    let status = registry.module_status(CounterApi::ID).unwrap();
    assert_eq!(status.state, ModuleState::Failed);
    assert!(status.last_error.is_some());
    assert_eq!(call_bar(&counter), 2);
}

#[test]
fn test_dynamic_registration_is_idempotent() {
    let ws = Workspace::new();
    install(&build_counter(&ws.build, 1), &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);

    let first = registry.load_dynamic::<CounterApi>(false).unwrap();
    for _ in 0..5 {
        let again = registry
            .get_or_create_dynamic::<CounterApi>(ws.library(), "plexus_module_register_counter", false)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    assert_eq!(first.generation(), 1);
    let status = registry.module_status(CounterApi::ID).unwrap();
    assert_eq!(status.provisioning, Provisioning::Dynamic);
    assert!(!status.watching);
}

#[test]
fn test_static_registration_runs_once() {
    let registry = ModuleRegistry::default();
    let before = FOO_REGISTRATIONS.load(Ordering::SeqCst);

    let tables: Vec<_> = (0..8)
        .map(|_| registry.get_or_create_static::<FooApi>(register_foo).unwrap())
        .collect();

    assert!(tables.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(tables[0].generation(), 1);
    assert!(FOO_REGISTRATIONS.load(Ordering::SeqCst) > before);
}

#[test]
fn test_concurrent_provisioning_creates_one_table() {
    let registry = Arc::new(ModuleRegistry::default());
    let before = FOO_REGISTRATIONS.load(Ordering::SeqCst);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.get_or_create_static::<FooApi>(register_foo).unwrap())
        })
        .collect();
    let tables: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(tables.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(tables[0].generation(), 1);
    assert!(FOO_REGISTRATIONS.load(Ordering::SeqCst) > before);
}

#[test]
fn test_failed_reload_keeps_previous_pointers() {
    let ws = Workspace::new();
    install(&build_counter(&ws.build, 1), &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);
    let counter = registry.load_dynamic::<CounterApi>(false).unwrap();
    let before = counter.load().bar;

    // Unloadable file
    std::fs::write(ws.library(), b"not a shared library").unwrap();
    registry.request_reload(CounterApi::ID).unwrap();
    assert_eq!(registry.poll_for_reloads().failed, vec![CounterApi::ID]);
    assert_eq!(counter.load().bar.map(|f| f as usize), before.map(|f| f as usize));
    assert_eq!(call_bar(&counter), 1);

    // Loadable library without the entry symbol
    install(&build_counter_without_entry(&ws.build), &ws.library());
    registry.request_reload(CounterApi::ID).unwrap();
    assert_eq!(registry.poll_for_reloads().failed, vec![CounterApi::ID]);
    assert_eq!(call_bar(&counter), 1);

    // A good build recovers the module
    install(&build_counter(&ws.build, 3), &ws.library());
    registry.request_reload(CounterApi::ID).unwrap();
    assert_eq!(registry.poll_for_reloads().reloaded, vec![CounterApi::ID]);
    assert_eq!(call_bar(&counter), 3);
    assert_eq!(registry.module_status(CounterApi::ID).unwrap().state, ModuleState::Loaded);
}

#[test]
fn test_fail_fast_leaves_module_unavailable() {
    let ws = Workspace::new();
    install(&build_counter(&ws.build, 1), &ws.library());
    let registry = ws.registry(ReloadPolicy::FailFast);
    let counter = registry.load_dynamic::<CounterApi>(false).unwrap();
    assert_eq!(call_bar(&counter), 1);

    std::fs::remove_file(ws.library()).unwrap();
    registry.request_reload(CounterApi::ID).unwrap();
    registry.poll_for_reloads();

    assert_eq!(registry.module_status(CounterApi::ID).unwrap().state, ModuleState::Failed);
    assert!(counter.load().bar.is_none());
}

#[test]
fn test_failed_initial_load_recovers_on_change() {
    let ws = Workspace::new();
    let registry = ws.registry(ReloadPolicy::KeepPrevious);

    assert!(registry.load_dynamic::<CounterApi>(true).is_err());
    let counter = registry.get::<CounterApi>().unwrap();
    assert!(counter.load().bar.is_none());

    install(&build_counter(&ws.build, 5), &ws.library());
    let loaded = poll_until(&registry, RELOAD_TIMEOUT, |r| {
        r.module_status(CounterApi::ID).unwrap().state == ModuleState::Loaded
    });
    assert!(loaded, "module did not recover");
    assert_eq!(call_bar(&counter), 5);

    let status = registry.module_status(CounterApi::ID).unwrap();
    assert_eq!(status.reload_count, 0);
    assert_eq!(status.generation, 1);
}

#[test]
fn test_reinstalling_running_build_clears_failure() {
    let ws = Workspace::new();
    let v1 = build_counter(&ws.build, 1);
    install(&v1, &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);
    let counter = registry.load_dynamic::<CounterApi>(true).unwrap();

    std::fs::write(ws.library(), b"truncated build").unwrap();
    let failed = poll_until(&registry, RELOAD_TIMEOUT, |r| {
        r.module_status(CounterApi::ID).unwrap().state == ModuleState::Failed
    });
    assert!(failed, "broken build was not picked up");
    assert_eq!(call_bar(&counter), 1);

    // Same bytes as the mapped library
    install(&v1, &ws.library());
    let recovered = poll_until(&registry, RELOAD_TIMEOUT, |r| {
        r.module_status(CounterApi::ID).unwrap().state == ModuleState::Loaded
    });
    assert!(recovered, "module stayed failed");

    let status = registry.module_status(CounterApi::ID).unwrap();
    assert!(status.last_error.is_none());
    assert_eq!(call_bar(&counter), 1);
}

#[test]
fn test_state_slot_survives_reload() {
    let ws = Workspace::new();
    install(&build_counter(&ws.build, 1), &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);
    let counter = registry.load_dynamic::<CounterApi>(false).unwrap();

    let key = plexus_kernel::fnv1a_64(b"counter.totals");
    let totals = Box::into_raw(Box::new(AtomicUsize::new(0)));
    let slot = registry.produce_entry(key);
    slot.store(totals.cast(), Ordering::SeqCst);
    unsafe { &*totals }.fetch_add(call_bar(&counter) as usize, Ordering::SeqCst);

    install(&build_counter(&ws.build, 2), &ws.library());
    registry.request_reload(CounterApi::ID).unwrap();
    assert_eq!(registry.poll_for_reloads().reloaded, vec![CounterApi::ID]);

    let slot: Arc<AtomicPtr<_>> = registry.produce_entry(key);
    let kept = slot.load(Ordering::SeqCst).cast::<AtomicUsize>();
    assert_eq!(kept, totals);

    let kept = unsafe { Box::from_raw(kept) };
    kept.fetch_add(call_bar(&counter) as usize, Ordering::SeqCst);
    assert_eq!(kept.load(Ordering::SeqCst), 3);
}

#[test]
fn test_unchanged_file_is_skipped() {
    let ws = Workspace::new();
    let v1 = build_counter(&ws.build, 1);
    install(&v1, &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);
    let counter = registry.load_dynamic::<CounterApi>(true).unwrap();

    // Same bytes written again
    install(&v1, &ws.library());
    let skipped = poll_until(&registry, Duration::from_millis(500), |_| false);
    assert!(!skipped);

    let status = registry.module_status(CounterApi::ID).unwrap();
    assert_eq!(status.reload_count, 0);
    assert_eq!(counter.generation(), 1);
    assert_eq!(call_bar(&counter), 1);
}

#[test]
fn test_status_snapshot_serializes() {
    let ws = Workspace::new();
    install(&build_counter(&ws.build, 1), &ws.library());
    let registry = ws.registry(ReloadPolicy::KeepPrevious);
    registry.load_dynamic::<CounterApi>(false).unwrap();
    registry.get_or_create_static::<FooApi>(register_foo).unwrap();

    let modules = registry.modules();
    let json = serde_json::to_value(&modules).unwrap();

    assert_eq!(json[0]["name"], "counter");
    assert_eq!(json[0]["provisioning"], "dynamic");
    assert_eq!(json[0]["file_hash"].as_str().unwrap().len(), 64);
    assert_eq!(json[1]["name"], "static_foo");
    assert_eq!(registry.module_name(CounterApi::ID.hash()), Some("counter"));
}

#[cfg(unix)]
#[test]
fn test_persistent_library_is_tracked() {
    let ws = Workspace::new();
    let library = build_counter(&ws.build, 9);
    let registry = ModuleRegistry::default();

    registry
        .load_library_persistently(library.to_str().unwrap())
        .unwrap();
    assert_eq!(registry.persistent_libraries().len(), 1);
}
