//! Common types for the modelsync environment abstraction.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EUID: AtomicU64 = AtomicU64::new(1);

/// Ephemeral identifier of a record, collection or store.
///
/// Unique for the lifetime of the process and never reused. Allocated from
/// a monotonic counter rather than a random source so a seeded simulation
/// allocates ids in the same order on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Euid(u64);

impl Euid {
    /// Allocates the next process-unique Euid.
    pub fn next() -> Self {
        Self(NEXT_EUID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value (for tests and exported frames).
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Euid {
    fn default() -> Self {
        Self::next()
    }
}

impl std::fmt::Display for Euid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}
