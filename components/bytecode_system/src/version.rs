//! Version tags guarding inline caches and tier-2 executors
//!
//! Values come from one process-wide counter, so a version identifies both
//! the entity and its shape: two distinct entities never share a live
//! version. Version `0` is reserved and never validates a guard.

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_VERSION: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh, never-before-seen version number
pub fn next_version() -> u32 {
    loop {
        let version = NEXT_VERSION.fetch_add(1, Ordering::Relaxed);
        if version != 0 {
            return version;
        }
    }
}

/// Shape counter of one guarded entity (type, namespace, instrumentation)
#[derive(Debug)]
pub struct VersionTag {
    value: AtomicU32,
}

impl VersionTag {
    /// Create a tag holding a fresh version
    pub fn new() -> Self {
        Self {
            value: AtomicU32::new(next_version()),
        }
    }

    /// Current version
    #[inline]
    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Move to a fresh version; call before the mutation becomes observable
    pub fn bump(&self) -> u32 {
        let version = next_version();
        self.value.store(version, Ordering::Release);
        version
    }

    /// Whether a guard recorded against `expected` still holds
    #[inline]
    pub fn matches(&self, expected: u32) -> bool {
        expected != 0 && self.get() == expected
    }
}

impl Default for VersionTag {
    fn default() -> Self {
        Self::new()
    }
}
