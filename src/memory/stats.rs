//! Process-wide diagnostic gauges for freelist storage.
//!
//! All counters use `Relaxed` ordering and are only touched at init and
//! teardown, never on the push/pop path. Cross-counter snapshots may be
//! transiently inconsistent while another thread builds or tears down a
//! pool. Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Bytes of shard storage currently held by all freelists.
crate::sync::static_atomic! {
    pub static BACKING_BYTES: Counter = Counter::new();
}
// Subset of BACKING_BYTES that came from anonymous mappings.
crate::sync::static_atomic! {
    pub static MAPPED_BYTES: Counter = Counter::new();
}
// Freelists initialised and not yet finalized/dropped.
crate::sync::static_atomic! {
    pub static LIVE_FREELISTS: Counter = Counter::new();
}

/// Point-in-time copy of the global gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreelistStats {
    pub backing_bytes: usize,
    pub mapped_bytes: usize,
    pub live_freelists: usize,
}

#[must_use]
pub fn snapshot() -> FreelistStats {
    FreelistStats {
        backing_bytes: BACKING_BYTES.get(),
        mapped_bytes: MAPPED_BYTES.get(),
        live_freelists: LIVE_FREELISTS.get(),
    }
}
