//! Execution-unit context
//!
//! Every hypervisor code path runs on behalf of exactly one execution unit
//! (a physical CPU servicing one vCPU at a time). State that the memory
//! management code would otherwise keep in per-CPU globals lives here and
//! is threaded explicitly through every call that needs it:
//!
//! - the unit's identity token ([`UnitId`]), used as the owner of recursive
//!   locks;
//! - the currently tracked mm lock level;
//! - the preemption request flag polled by long-running hypercalls;
//! - preempt/irq nesting counters.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cpu_local::ExecUnit;
//!
//! let unit = ExecUnit::new();
//! let signal = unit.preempt_signal();
//!
//! // Timer interrupt on another CPU:
//! signal.request();
//!
//! // Hypercall loop:
//! if unit.preempt_check() {
//!     return Ok(Continuation(start));
//! }
//! ```
//!
//! An `ExecUnit` is deliberately `!Sync`: the tracked level is only ever
//! touched by the unit that owns it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lock level of a unit holding no mm locks.
pub const LOCK_LEVEL_NONE: i32 = 0;

/// Owner value stored in a lock that nobody holds.
const NO_UNIT: usize = usize::MAX;

/// Next identity handed out by [`ExecUnit::new`].
static NEXT_UNIT_ID: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// Unit identity
// ============================================================================

/// Identity token of an execution unit.
///
/// Locks record the token of their owner and compare it by value; tokens are
/// never reused within one boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(usize);

impl UnitId {
    /// Raw value, as stored in a lock's owner word.
    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }

    /// Decode an owner word. `None` means "no owner".
    #[inline]
    pub const fn from_raw(raw: usize) -> Option<UnitId> {
        if raw == NO_UNIT {
            None
        } else {
            Some(UnitId(raw))
        }
    }

    /// Owner word meaning "no owner".
    #[inline]
    pub const fn none_raw() -> usize {
        NO_UNIT
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

// ============================================================================
// Preemption request
// ============================================================================

/// Cross-unit handle used to ask a unit to yield at its next checkpoint.
///
/// Cloned out of the unit so timer/IPI code running elsewhere can raise the
/// request without touching the unit's private state.
#[derive(Clone)]
pub struct PreemptSignal {
    need_resched: Arc<AtomicBool>,
}

impl PreemptSignal {
    /// Mark that a reschedule is needed on the target unit.
    #[inline]
    pub fn request(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Withdraw a pending request.
    #[inline]
    pub fn cancel(&self) {
        self.need_resched.store(false, Ordering::Release);
    }
}

// ============================================================================
// Execution unit
// ============================================================================

/// Per-execution-unit context.
pub struct ExecUnit {
    id: UnitId,
    /// Highest (biased) mm lock level currently held.
    lock_level: Cell<i32>,
    /// Preemption disable nesting counter (non-zero = preemption disabled)
    preempt_count: Cell<u32>,
    /// Interrupt handler nesting counter
    irq_count: Cell<u32>,
    /// Set by the scheduler/timer to trigger a reschedule
    need_resched: Arc<AtomicBool>,
}

impl ExecUnit {
    /// Bring up a new execution unit with a fresh identity and no locks held.
    pub fn new() -> Self {
        let raw = NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(raw != NO_UNIT, "execution unit ids exhausted");
        Self {
            id: UnitId(raw),
            lock_level: Cell::new(LOCK_LEVEL_NONE),
            preempt_count: Cell::new(0),
            irq_count: Cell::new(0),
            need_resched: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identity token of this unit.
    #[inline]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Currently tracked mm lock level.
    #[inline]
    pub fn lock_level(&self) -> i32 {
        self.lock_level.get()
    }

    /// Overwrite the tracked mm lock level.
    ///
    /// Only the lock primitives call this; everyone else reads.
    #[inline]
    pub fn set_lock_level(&self, level: i32) {
        self.lock_level.set(level);
    }

    /// Disable preemption on this unit. Returns the new nesting count.
    #[inline]
    pub fn preempt_disable(&self) -> u32 {
        let count = self.preempt_count.get() + 1;
        self.preempt_count.set(count);
        count
    }

    /// Enable preemption on this unit. Panics if the count would go negative.
    #[inline]
    pub fn preempt_enable(&self) -> u32 {
        let old = self.preempt_count.get();
        assert!(old > 0, "preempt_enable called with count already 0");
        self.preempt_count.set(old - 1);
        old - 1
    }

    /// Check if preemption is enabled on this unit.
    #[inline]
    pub fn preemptible(&self) -> bool {
        self.preempt_count.get() == 0 && self.irq_count.get() == 0
    }

    /// Enter an IRQ handler context.
    #[inline]
    pub fn irq_enter(&self) {
        self.irq_count.set(self.irq_count.get() + 1);
    }

    /// Exit an IRQ handler context.
    #[inline]
    pub fn irq_exit(&self) {
        let old = self.irq_count.get();
        assert!(old > 0, "irq_exit called with count already 0");
        self.irq_count.set(old - 1);
    }

    /// Check if we're currently in an IRQ handler.
    #[inline]
    pub fn in_irq(&self) -> bool {
        self.irq_count.get() > 0
    }

    /// Mark that a reschedule is needed on this unit.
    #[inline]
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Clear and return the need_resched flag.
    #[inline]
    pub fn clear_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    /// Handle other units use to request preemption of this one.
    pub fn preempt_signal(&self) -> PreemptSignal {
        PreemptSignal {
            need_resched: Arc::clone(&self.need_resched),
        }
    }

    /// Continuation checkpoint for long-running hypercalls.
    ///
    /// Returns `true` when the scheduler wants this unit back and the unit
    /// is preemptible. The flag is not consumed here; the scheduler clears
    /// it when it actually runs.
    #[inline]
    pub fn preempt_check(&self) -> bool {
        self.preemptible() && self.need_resched.load(Ordering::Acquire)
    }
}

impl Default for ExecUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecUnit")
            .field("id", &self.id)
            .field("lock_level", &self.lock_level.get())
            .field("preempt_count", &self.preempt_count.get())
            .finish()
    }
}
