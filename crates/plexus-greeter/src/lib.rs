//! Greeter module
//!
//! A small module exposing a [`GreeterApi`] table with a nested
//! [`CounterInterface`]. The same code serves two ways:
//! - linked into a host and registered with
//!   [`ModuleRegistry::get_or_create_static`](plexus_kernel::ModuleRegistry::get_or_create_static)
//!   using [`register`]
//! - built as a shared library exporting `plexus_module_register_greeter`,
//!   loaded with [`ModuleRegistry::load_dynamic`](plexus_kernel::ModuleRegistry::load_dynamic)
//!   and reloaded whenever it is rebuilt
//!
//! Counters are created by the module and owned by the caller; their layout
//! must stay the same across reloads.

use std::ffi::{CStr, c_char};

/// Interface version reported by [`GreeterApi::version`]
pub const VERSION: u32 = 1;

static GREETING: &CStr = c"Hello from plexus-greeter";

/// Counter object handed out by [`CounterInterface::create`]
#[repr(C)]
pub struct Counter {
    value: u64,
}

/// Nested interface managing [`Counter`]s
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct CounterInterface {
    pub create: Option<extern "C" fn(start: u64) -> *mut Counter>,
    pub increment: Option<extern "C" fn(counter: *mut Counter) -> u64>,
    pub destroy: Option<extern "C" fn(counter: *mut Counter)>,
}

/// Greeter interface table
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GreeterApi {
    /// NUL-terminated greeting, valid while the module stays loaded
    pub greeting: Option<extern "C" fn() -> *const c_char>,
    pub version: Option<extern "C" fn() -> u32>,
    pub counter: CounterInterface,
}

plexus_kernel::module_api!(GreeterApi, "greeter");

extern "C" fn greeting() -> *const c_char {
    GREETING.as_ptr()
}

extern "C" fn version() -> u32 {
    VERSION
}

extern "C" fn counter_create(start: u64) -> *mut Counter {
    Box::into_raw(Box::new(Counter { value: start }))
}

extern "C" fn counter_increment(counter: *mut Counter) -> u64 {
    match unsafe { counter.as_mut() } {
        Some(counter) => {
            counter.value += 1;
            counter.value
        }
        None => 0,
    }
}

extern "C" fn counter_destroy(counter: *mut Counter) {
    if !counter.is_null() {
        drop(unsafe { Box::from_raw(counter) });
    }
}

/// Fill in every function pointer of the greeter table
pub fn register(api: &mut GreeterApi) {
    api.greeting = Some(greeting);
    api.version = Some(version);
    api.counter.create = Some(counter_create);
    api.counter.increment = Some(counter_increment);
    api.counter.destroy = Some(counter_destroy);
}

plexus_kernel::export_module!(plexus_module_register_greeter, GreeterApi, register);

/// Read the greeting through a table, if the module is available
pub fn read_greeting(api: &GreeterApi) -> Option<String> {
    let greeting = api.greeting?;
    let ptr = greeting();
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
