//! Module identities
//!
//! A [`ModuleId`] is a compile-time token naming a pluggable module. It is
//! derived from the module name with a 64-bit FNV-1a hash, so call sites
//! compiled separately (host binary, plugin libraries, tests) agree on the
//! identity without sharing any runtime state.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

const FNV1A_OFFSET_64: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A_PRIME_64: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a hash, usable in `const` context.
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET_64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV1A_PRIME_64);
        i += 1;
    }
    hash
}

/// Process-unique identity of a module.
///
/// Equality and hashing only look at the name hash; the name is kept for
/// diagnostics.
#[derive(Clone, Copy)]
pub struct ModuleId {
    hash: u64,
    name: &'static str,
}

impl ModuleId {
    /// Create the identity for a module name
    pub const fn new(name: &'static str) -> Self {
        Self {
            hash: fnv1a_64(name.as_bytes()),
            name,
        }
    }

    /// Name hash
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Module name
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ModuleId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ModuleId {}

impl Hash for ModuleId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({:?}, {:#018x})", self.name, self.hash)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Reverse lookup table from name hash to name.
///
/// Every identity the registry provisions passes through here, which is
/// also where two names hashing to the same value get caught.
#[derive(Debug, Default)]
pub struct NameTable {
    names: RwLock<HashMap<u64, &'static str>>,
}

impl NameTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identity.
    ///
    /// Returns the name already stored under the same hash when it differs
    /// from `id.name()`.
    pub fn record(&self, id: ModuleId) -> Result<(), &'static str> {
        let mut names = self.names.write();
        match names.get(&id.hash()) {
            Some(existing) if *existing != id.name() => Err(*existing),
            Some(_) => Ok(()),
            None => {
                names.insert(id.hash(), id.name());
                Ok(())
            }
        }
    }

    /// Look up the name recorded for a hash
    pub fn lookup(&self, hash: u64) -> Option<&'static str> {
        self.names.read().get(&hash).copied()
    }

    /// Number of recorded identities
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}
