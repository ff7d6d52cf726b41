//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-subsystem counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
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
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Total address space reserved by the code page pools
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Total physical memory committed by the code page pools
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Committed bytes currently dedicated to code pages (excludes unwind slabs)
crate::sync::static_atomic! {
    pub static CODE_COMMITTED: Counter = Counter::new();
}
// Bytes handed out to live code allocations (chunk-rounded)
crate::sync::static_atomic! {
    pub static CODE_LIVE: Counter = Counter::new();
}
// Committed bytes held by per-segment unwind slabs
crate::sync::static_atomic! {
    pub static UNWIND_COMMITTED: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time snapshot of the heap's diagnostic counters.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub code_committed: usize,
    pub code_live: usize,
    pub unwind_committed: usize,
}

/// Snapshot the global counters.
#[must_use]
pub fn snapshot() -> HeapStats {
    HeapStats {
        total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: TOTAL_COMMITTED.load(Ordering::Relaxed),
        code_committed: CODE_COMMITTED.load(Ordering::Relaxed),
        code_live: CODE_LIVE.load(Ordering::Relaxed),
        unwind_committed: UNWIND_COMMITTED.load(Ordering::Relaxed),
    }
}
