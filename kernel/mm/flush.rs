//! Translation-cache flush accounting
//!
//! Every p2m table defers its flush until the outermost write guard is
//! released. These counters record how often that actually reaches the
//! backend versus how often it was absorbed by nesting or had nothing to do.

use core::sync::atomic::{AtomicU64, Ordering};

/// Statistics for p2m flushes (for debugging/profiling)
/// Uses atomics for SMP-safety (relaxed ordering is sufficient for stats)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2mFlushStats {
    /// Flushes issued to a backend
    pub flushes: u64,
    /// Unlocks that left the flush to an outer holder
    pub deferred: u64,
    /// Outermost unlocks with no modified entries
    pub clean_unlocks: u64,
}

static STATS_FLUSHES: AtomicU64 = AtomicU64::new(0);
static STATS_DEFERRED: AtomicU64 = AtomicU64::new(0);
static STATS_CLEAN_UNLOCKS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub(crate) fn record_flush() {
    STATS_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_deferred() {
    STATS_DEFERRED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn record_clean_unlock() {
    STATS_CLEAN_UNLOCKS.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of the global flush counters.
pub fn get_stats() -> P2mFlushStats {
    P2mFlushStats {
        flushes: STATS_FLUSHES.load(Ordering::Relaxed),
        deferred: STATS_DEFERRED.load(Ordering::Relaxed),
        clean_unlocks: STATS_CLEAN_UNLOCKS.load(Ordering::Relaxed),
    }
}
