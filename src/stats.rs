//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., chunks handed out may briefly disagree with chunks
//! returned plus chunks live). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
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
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Event counters for one chunk pool instance. Kept per instance rather than
/// in statics so that independent pools (and tests) do not observe each other.
pub struct InternalStats {
    pub(crate) chunks_handed_out: Counter,
    pub(crate) chunks_returned: Counter,
    pub(crate) chunks_split: Counter,
    pub(crate) chunks_merged: Counter,
    pub(crate) chunks_enlarged: Counter,
    pub(crate) commit_denials: Counter,
}

impl InternalStats {
    pub(crate) fn new() -> Self {
        Self {
            chunks_handed_out: Counter::new(),
            chunks_returned: Counter::new(),
            chunks_split: Counter::new(),
            chunks_merged: Counter::new(),
            chunks_enlarged: Counter::new(),
            commit_denials: Counter::new(),
        }
    }

    /// Chunks handed to arenas over the pool's lifetime.
    pub fn chunks_handed_out(&self) -> usize {
        self.chunks_handed_out.get()
    }

    /// Chunks given back by arenas (before merging).
    pub fn chunks_returned(&self) -> usize {
        self.chunks_returned.get()
    }

    /// Buddy splits performed.
    pub fn chunks_split(&self) -> usize {
        self.chunks_split.get()
    }

    /// Buddy merges performed on return.
    pub fn chunks_merged(&self) -> usize {
        self.chunks_merged.get()
    }

    /// In-place chunk enlargements that stuck (rolled-back ones are
    /// subtracted again).
    pub fn chunks_enlarged(&self) -> usize {
        self.chunks_enlarged.get()
    }

    /// Commit requests denied by the limiter.
    pub fn commit_denials(&self) -> usize {
        self.commit_denials.get()
    }
}
