//! Shared helpers for kernel integration tests.
//!
//! Fixture modules are real shared libraries compiled with `rustc` at test
//! time, so reload tests can swap genuinely different code under a table.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use plexus_kernel::{ApiTable, ModuleRegistry};

/// Interface of the `counter` fixture module
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct CounterApi {
    pub bar: Option<extern "C" fn() -> i32>,
}

plexus_kernel::module_api!(CounterApi, "counter");

const COUNTER_SOURCE: &str = r#"
#[repr(C)]
pub struct CounterApi {
    pub bar: Option<extern "C" fn() -> i32>,
}

extern "C" fn bar() -> i32 {
    __VALUE__
}

#[no_mangle]
pub unsafe extern "C" fn __SYMBOL__(api: *mut core::ffi::c_void) {
    let api = api as *mut CounterApi;
    (*api).bar = Some(bar);
}
"#;

/// Platform file name of a module library
pub fn library_file(name: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        name,
        std::env::consts::DLL_SUFFIX
    )
}

/// Build a `counter` module whose `bar()` returns `value`
pub fn build_counter(out_dir: &Path, value: i32) -> PathBuf {
    build_fixture(out_dir, value, "plexus_module_register_counter")
}

/// Build a `counter` library exporting its entry point under another name
pub fn build_counter_without_entry(out_dir: &Path) -> PathBuf {
    build_fixture(out_dir, -1, "some_other_symbol")
}

fn build_fixture(out_dir: &Path, value: i32, symbol: &str) -> PathBuf {
    std::fs::create_dir_all(out_dir).expect("create fixture dir");

    let tag = format!("{}_{}", symbol, value.unsigned_abs());
    let source_path = out_dir.join(format!("{tag}.rs"));
    let output = out_dir.join(library_file(&format!("counter_{tag}")));

    let source = COUNTER_SOURCE
        .replace("__VALUE__", &value.to_string())
        .replace("__SYMBOL__", symbol);
    std::fs::write(&source_path, source).expect("write fixture source");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let status = Command::new(rustc)
        .args(["--crate-type", "cdylib", "--edition", "2021", "--crate-name"])
        .arg(format!("counter_fixture_{}", value.unsigned_abs()))
        .arg("-o")
        .arg(&output)
        .arg(&source_path)
        .status()
        .expect("run rustc");
    assert!(status.success(), "fixture build failed for {}", source_path.display());

    output
}

/// Replace `dest` with `src`, producing a single close-after-write
pub fn install(src: &Path, dest: &Path) {
    std::fs::copy(src, dest).expect("install library");
}

/// Call `bar` through the table
pub fn call_bar(table: &ApiTable<CounterApi>) -> i32 {
    let bar = table.read().bar.expect("bar is bound");
    bar()
}

/// Poll until `done` holds or `timeout` passes
pub fn poll_until(
    registry: &ModuleRegistry,
    timeout: Duration,
    mut done: impl FnMut(&ModuleRegistry) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        registry.poll_for_reloads();
        if done(registry) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}
