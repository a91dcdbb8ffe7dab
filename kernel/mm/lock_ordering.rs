//! Memory-management lock ordering
//!
//! All locks taken by the second-level translation code must be acquired in
//! the order listed below. The primitives in this module enforce the order at
//! runtime against the level tracked by the acquiring [`ExecUnit`].
//!
//! # Lock Ordering (acquire top to bottom, release in reverse)
//!
//! ```text
//! NestedP2m       8   per-domain: nested-p2m array and its LRU
//! P2m            16   per host p2m table (rw, recursive write)
//! PerPageSharing 24   external: page-sharing per-page lock
//! AltP2mList     32   per-domain: list of alternate p2m views
//! AltP2m         40   per alternate p2m table (rw, recursive write)
//! Pod            48   per p2m: populate-on-demand bookkeeping
//! PageAlloc      56   external: per-domain page allocator lock
//! Paging         64   per-domain: paging/shadow state
//! ```
//!
//! The host p2m and the alternate p2m tables use separate tiers with the
//! list lock between them: a change to the host table is propagated to the
//! alternate views while the host lock is held, which takes the list lock
//! and then each alternate table lock.
//!
//! # Control-domain bias
//!
//! Locks belonging to a control domain are shifted up by
//! [`MM_LOCK_ORDER_MAX`]. A control domain servicing a hypercall may take a
//! subject domain's locks and then copy to/from its own memory, which takes
//! its own (biased, therefore higher) locks.
//!
//! # Violations
//!
//! An ordering violation is a logic error in the caller. It is reported with
//! [`klog_force!`] and then panics; there is no recoverable path. Releasing a
//! hold that is not the most recent one is a violation as well.
//!
//! # Example
//!
//! ```rust,ignore
//! let unit = ExecUnit::new();
//! let host = OrderedRwLock::new(LockClassKey::new("p2m"), LockLevel::P2m, false);
//! let list = OrderedLock::new(LockClassKey::new("altp2m_list"), LockLevel::AltP2mList, false);
//!
//! let w = host.write(&unit, "p2m_set_mem_access");  // level 16
//! let l = list.lock(&unit, "altp2m_propagate");      // level 32
//! drop(l);                                           // back to 16
//! drop(w);                                           // back to 0
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{compiler_fence, AtomicUsize, Ordering};
use cpu_local::{ExecUnit, UnitId};
use spin::Mutex as RawMutex;
use spin::RwLock as RawRwLock;

/// Highest unbiased tier; also the size of the control-domain bias.
pub const MM_LOCK_ORDER_MAX: i32 = 64;

/// Ordering tiers of the mm locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum LockLevel {
    /// Nested p2m array (per domain)
    NestedP2m = 8,
    /// Host p2m table
    P2m = 16,
    /// Page-sharing per-page lock (external)
    PerPageSharing = 24,
    /// Alternate p2m list (per domain)
    AltP2mList = 32,
    /// Alternate p2m table
    AltP2m = 40,
    /// Populate-on-demand state (per p2m)
    Pod = 48,
    /// Page allocator (external, per domain)
    PageAlloc = 56,
    /// Paging state (per domain)
    Paging = 64,
}

impl LockLevel {
    /// All tiers in acquisition order.
    pub const ALL: [LockLevel; 8] = [
        LockLevel::NestedP2m,
        LockLevel::P2m,
        LockLevel::PerPageSharing,
        LockLevel::AltP2mList,
        LockLevel::AltP2m,
        LockLevel::Pod,
        LockLevel::PageAlloc,
        LockLevel::Paging,
    ];

    /// Numeric tier.
    #[inline]
    pub const fn value(self) -> i32 {
        self as i32
    }

    /// Get the name of this lock level
    pub fn name(self) -> &'static str {
        match self {
            LockLevel::NestedP2m => "nestedp2m",
            LockLevel::P2m => "p2m",
            LockLevel::PerPageSharing => "per_page_sharing",
            LockLevel::AltP2mList => "altp2mlist",
            LockLevel::AltP2m => "altp2m",
            LockLevel::Pod => "pod",
            LockLevel::PageAlloc => "page_alloc",
            LockLevel::Paging => "paging",
        }
    }
}

/// Tier after applying the control-domain bias.
#[inline]
pub const fn biased_level(level: LockLevel, privileged: bool) -> i32 {
    level.value() + if privileged { MM_LOCK_ORDER_MAX } else { 0 }
}

/// Identifier for a lock class, used in diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockClassKey(pub &'static str);

impl LockClassKey {
    /// Create a new lock class key with the given name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the name of this lock class.
    pub const fn name(self) -> &'static str {
        self.0
    }
}

/// Acquirer tag recorded while a lock is free.
const NOBODY: &str = "nobody";

// ============================================================================
// Level tracking
// ============================================================================

/// Panic if `unit` may not take a lock at biased tier `level`.
#[inline]
fn check_lock_level(unit: &ExecUnit, level: i32) {
    let current = unit.lock_level();
    if current > level {
        klog_force!("mm locking order violation: {} > {}", current, level);
        panic!("mm locking order violation: {} > {}", current, level);
    }
}

/// Panic unless the hold at biased tier `level` is the most recent one.
#[inline]
fn check_unlock_level(unit: &ExecUnit, level: i32, class: LockClassKey) {
    let current = unit.lock_level();
    if current != level {
        klog_force!(
            "mm lock {} released out of order: {} != {}",
            class.name(),
            current,
            level
        );
        panic!("mm lock released out of order: {} != {}", current, level);
    }
}

/// Speculation barrier and pause on the self-recursive path, which skips
/// the physical acquisition.
#[inline]
fn block_lock_speculation() {
    compiler_fence(Ordering::SeqCst);
    core::hint::spin_loop();
}

/// Bookkeeping owned by whoever holds the lock.
struct HolderState {
    locker: &'static str,
    unlock_level: i32,
    recurse_count: u32,
}

impl HolderState {
    const fn new() -> Self {
        Self {
            locker: NOBODY,
            unlock_level: 0,
            recurse_count: 0,
        }
    }
}

// ============================================================================
// OrderedLock: exclusive, optionally recursive
// ============================================================================

/// Exclusive mm lock with ordering enforcement and optional recursion.
pub struct OrderedLock {
    class: LockClassKey,
    order: i32,
    raw: RawMutex<()>,
    owner: AtomicUsize,
    holder: UnsafeCell<HolderState>,
}

// Safety: `holder` is only touched by the unit recorded in `owner`, and only
// while `raw` is held.
unsafe impl Sync for OrderedLock {}

impl OrderedLock {
    /// Create a lock at `level`; `privileged` applies the control-domain bias.
    pub const fn new(class: LockClassKey, level: LockLevel, privileged: bool) -> Self {
        Self {
            class,
            order: biased_level(level, privileged),
            raw: RawMutex::new(()),
            owner: AtomicUsize::new(UnitId::none_raw()),
            holder: UnsafeCell::new(HolderState::new()),
        }
    }

    /// Biased tier of this lock.
    #[inline]
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Lock class key.
    #[inline]
    pub fn class(&self) -> LockClassKey {
        self.class
    }

    /// Is `unit` the current owner?
    #[inline]
    pub fn locked_by(&self, unit: &ExecUnit) -> bool {
        self.owner.load(Ordering::Acquire) == unit.id().as_raw()
    }

    /// Acquire the lock. Re-entry by the owner is fatal.
    #[inline]
    pub fn lock<'a>(&'a self, unit: &'a ExecUnit, func: &'static str) -> OrderedLockGuard<'a> {
        self.acquire(unit, func, false)
    }

    /// Acquire the lock, allowing the owner to re-enter.
    #[inline]
    pub fn lock_recursive<'a>(
        &'a self,
        unit: &'a ExecUnit,
        func: &'static str,
    ) -> OrderedLockGuard<'a> {
        self.acquire(unit, func, true)
    }

    fn acquire<'a>(
        &'a self,
        unit: &'a ExecUnit,
        func: &'static str,
        recursive: bool,
    ) -> OrderedLockGuard<'a> {
        if self.locked_by(unit) {
            // Safety: we are the owner.
            let holder = unsafe { &mut *self.holder.get() };
            if !recursive {
                klog_force!(
                    "mm lock {} already held by {}",
                    self.class.name(),
                    holder.locker
                );
                panic!("mm lock already held by {}", holder.locker);
            }
            block_lock_speculation();
            holder.recurse_count += 1;
        } else {
            check_lock_level(unit, self.order);
            core::mem::forget(self.raw.lock());
            self.owner.store(unit.id().as_raw(), Ordering::Release);
            // Safety: we just became the owner.
            let holder = unsafe { &mut *self.holder.get() };
            holder.locker = func;
            holder.unlock_level = unit.lock_level();
            holder.recurse_count = 1;
            unit.set_lock_level(self.order);
        }
        OrderedLockGuard { lock: self, unit }
    }

    fn release(&self, unit: &ExecUnit) {
        assert!(
            self.locked_by(unit),
            "mm unlock of {} by non-owner",
            self.class.name()
        );
        // Safety: we are the owner.
        let holder = unsafe { &mut *self.holder.get() };
        holder.recurse_count -= 1;
        if holder.recurse_count == 0 {
            check_unlock_level(unit, self.order, self.class);
            holder.locker = NOBODY;
            unit.set_lock_level(holder.unlock_level);
            self.owner.store(UnitId::none_raw(), Ordering::Release);
            // Safety: the raw mutex was leaked locked in `acquire` by this owner.
            unsafe { self.raw.force_unlock() };
        }
    }
}

impl fmt::Debug for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedLock")
            .field("class", &self.class.name())
            .field("order", &self.order)
            .field("owner", &UnitId::from_raw(self.owner.load(Ordering::Relaxed)))
            .finish()
    }
}

/// Proof that the current unit holds an [`OrderedLock`].
///
/// Dropping the guard undoes one level of recursion.
pub struct OrderedLockGuard<'a> {
    lock: &'a OrderedLock,
    unit: &'a ExecUnit,
}

impl<'a> OrderedLockGuard<'a> {
    /// Recursively re-acquire the lock this guard already holds.
    pub fn reenter(&self) -> OrderedLockGuard<'a> {
        block_lock_speculation();
        // Safety: holding `self` proves ownership.
        unsafe { (*self.lock.holder.get()).recurse_count += 1 };
        OrderedLockGuard {
            lock: self.lock,
            unit: self.unit,
        }
    }

    /// Current recursion depth.
    pub fn depth(&self) -> u32 {
        // Safety: holding `self` proves ownership.
        unsafe { (*self.lock.holder.get()).recurse_count }
    }

    /// Tag of the function that first took the lock.
    pub fn locker(&self) -> &'static str {
        // Safety: holding `self` proves ownership.
        unsafe { (*self.lock.holder.get()).locker }
    }

    /// Execution unit holding the lock.
    pub fn unit(&self) -> &'a ExecUnit {
        self.unit
    }
}

impl Drop for OrderedLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.unit);
    }
}

// ============================================================================
// OrderedRwLock: shared/exclusive, recursive on the write side
// ============================================================================

/// Reader/writer mm lock. The write side is recursive for its owner.
///
/// Queries may be made under the read lock; all modifications need the
/// write lock. A read guard stores the level it replaced, so readers restore
/// the tracked level on release exactly like writers do.
///
/// Writers are preferred: a new reader waits while any writer is waiting.
pub struct OrderedRwLock {
    class: LockClassKey,
    order: i32,
    raw: RawRwLock<()>,
    writer: AtomicUsize,
    writers_waiting: AtomicUsize,
    holder: UnsafeCell<HolderState>,
}

// Safety: `holder` is only touched by the unit recorded in `writer`, and only
// while the write side of `raw` is held.
unsafe impl Sync for OrderedRwLock {}

impl OrderedRwLock {
    /// Create a lock at `level`; `privileged` applies the control-domain bias.
    pub const fn new(class: LockClassKey, level: LockLevel, privileged: bool) -> Self {
        Self {
            class,
            order: biased_level(level, privileged),
            raw: RawRwLock::new(()),
            writer: AtomicUsize::new(UnitId::none_raw()),
            writers_waiting: AtomicUsize::new(0),
            holder: UnsafeCell::new(HolderState::new()),
        }
    }

    /// Biased tier of this lock.
    #[inline]
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Lock class key.
    #[inline]
    pub fn class(&self) -> LockClassKey {
        self.class
    }

    /// Is `unit` the current writer?
    #[inline]
    pub fn write_locked_by(&self, unit: &ExecUnit) -> bool {
        self.writer.load(Ordering::Acquire) == unit.id().as_raw()
    }

    /// Is some unit waiting for the write side?
    #[inline]
    pub fn writer_waiting(&self) -> bool {
        self.writers_waiting.load(Ordering::Acquire) != 0
    }

    /// Take the write side. The current writer re-enters without a level
    /// check.
    pub fn write<'a>(&'a self, unit: &'a ExecUnit, func: &'static str) -> OrderedWriteGuard<'a> {
        if !self.write_locked_by(unit) {
            check_lock_level(unit, self.order);
            self.writers_waiting.fetch_add(1, Ordering::AcqRel);
            core::mem::forget(self.raw.write());
            self.writers_waiting.fetch_sub(1, Ordering::AcqRel);
            self.writer.store(unit.id().as_raw(), Ordering::Release);
            // Safety: we just became the writer.
            let holder = unsafe { &mut *self.holder.get() };
            holder.locker = func;
            holder.unlock_level = unit.lock_level();
            holder.recurse_count = 0;
            unit.set_lock_level(self.order);
        } else {
            block_lock_speculation();
        }
        // Safety: we are the writer.
        unsafe { (*self.holder.get()).recurse_count += 1 };
        OrderedWriteGuard { lock: self, unit }
    }

    /// Take the read side.
    pub fn read<'a>(&'a self, unit: &'a ExecUnit) -> OrderedReadGuard<'a> {
        if self.write_locked_by(unit) {
            klog_force!("mm rwlock {} read-locked by its writer", self.class.name());
            panic!("mm rwlock {} read-locked by its writer", self.class.name());
        }
        check_lock_level(unit, self.order);
        while self.writer_waiting() {
            core::hint::spin_loop();
        }
        core::mem::forget(self.raw.read());
        let unlock_level = unit.lock_level();
        unit.set_lock_level(self.order);
        OrderedReadGuard {
            lock: self,
            unit,
            unlock_level,
        }
    }

    fn write_release(&self, unit: &ExecUnit) {
        assert!(
            self.write_locked_by(unit),
            "mm write unlock of {} by non-owner",
            self.class.name()
        );
        // Safety: we are the writer.
        let holder = unsafe { &mut *self.holder.get() };
        holder.recurse_count -= 1;
        if holder.recurse_count != 0 {
            return;
        }
        check_unlock_level(unit, self.order, self.class);
        holder.locker = NOBODY;
        unit.set_lock_level(holder.unlock_level);
        self.writer.store(UnitId::none_raw(), Ordering::Release);
        // Safety: the write side was leaked locked in `write` by this owner.
        unsafe { self.raw.force_write_unlock() };
    }
}

impl fmt::Debug for OrderedRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedRwLock")
            .field("class", &self.class.name())
            .field("order", &self.order)
            .field("writer", &UnitId::from_raw(self.writer.load(Ordering::Relaxed)))
            .field("readers", &self.raw.reader_count())
            .field("writer_waiting", &self.writer_waiting())
            .finish()
    }
}

/// Proof that the current unit holds the write side of an [`OrderedRwLock`].
pub struct OrderedWriteGuard<'a> {
    lock: &'a OrderedRwLock,
    unit: &'a ExecUnit,
}

impl<'a> OrderedWriteGuard<'a> {
    /// Recursively re-acquire the write side this guard already holds.
    pub fn reenter(&self) -> OrderedWriteGuard<'a> {
        block_lock_speculation();
        // Safety: holding `self` proves ownership.
        unsafe { (*self.lock.holder.get()).recurse_count += 1 };
        OrderedWriteGuard {
            lock: self.lock,
            unit: self.unit,
        }
    }

    /// Current recursion depth.
    pub fn depth(&self) -> u32 {
        // Safety: holding `self` proves ownership.
        unsafe { (*self.lock.holder.get()).recurse_count }
    }

    /// Tag of the function that first took the write side.
    pub fn locker(&self) -> &'static str {
        // Safety: holding `self` proves ownership.
        unsafe { (*self.lock.holder.get()).locker }
    }

    /// Execution unit holding the lock.
    pub fn unit(&self) -> &'a ExecUnit {
        self.unit
    }
}

impl Drop for OrderedWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_release(self.unit);
    }
}

/// Shared hold on an [`OrderedRwLock`].
pub struct OrderedReadGuard<'a> {
    lock: &'a OrderedRwLock,
    unit: &'a ExecUnit,
    unlock_level: i32,
}

impl<'a> OrderedReadGuard<'a> {
    /// Execution unit holding the lock.
    pub fn unit(&self) -> &'a ExecUnit {
        self.unit
    }
}

impl Drop for OrderedReadGuard<'_> {
    fn drop(&mut self) {
        check_unlock_level(self.unit, self.lock.order, self.lock.class);
        self.unit.set_lock_level(self.unlock_level);
        // Safety: one read hold was leaked in `read` on behalf of this guard.
        unsafe { self.lock.raw.force_read_decrement() };
    }
}

// ============================================================================
// External order constraints
// ============================================================================

/// Ordering constraint for a lock implemented outside this module.
///
/// The owner of the real lock calls [`pre_lock`](Self::pre_lock) before
/// taking it, [`post_lock`](Self::post_lock) right after, and
/// [`unlock`](Self::unlock) right before releasing it.
#[derive(Debug, Clone, Copy)]
pub struct ExternalOrder {
    order: i32,
}

/// Saved state of one [`ExternalOrder`] hold, kept next to the real lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalOrderState {
    unlock_level: i32,
    recurse_count: Option<u16>,
}

impl ExternalOrderState {
    /// State for a non-recursive lock.
    pub const fn new() -> Self {
        Self {
            unlock_level: 0,
            recurse_count: None,
        }
    }

    /// State for a recursive lock.
    pub const fn recursive() -> Self {
        Self {
            unlock_level: 0,
            recurse_count: Some(0),
        }
    }

    /// Recursion count, `None` for non-recursive locks.
    pub fn recurse_count(&self) -> Option<u16> {
        self.recurse_count
    }
}

/// Page-sharing per-page lock. Not tied to a domain, so never biased.
pub const PAGE_SHARING_ORDER: ExternalOrder = ExternalOrder::new(LockLevel::PerPageSharing, false);

impl ExternalOrder {
    /// Constraint at `level`; `privileged` applies the control-domain bias.
    pub const fn new(level: LockLevel, privileged: bool) -> Self {
        Self {
            order: biased_level(level, privileged),
        }
    }

    /// Page-allocator lock of a domain.
    pub const fn page_alloc(privileged: bool) -> Self {
        Self::new(LockLevel::PageAlloc, privileged)
    }

    /// Biased tier.
    #[inline]
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Ordering check, before the real lock is taken.
    #[inline]
    pub fn pre_lock(&self, unit: &ExecUnit) {
        check_lock_level(unit, self.order);
    }

    /// Record the hold, after the real lock is taken.
    pub fn post_lock(&self, unit: &ExecUnit, state: &mut ExternalOrderState) {
        match state.recurse_count.as_mut() {
            Some(count) => {
                if *count == 0 {
                    state.unlock_level = unit.lock_level();
                }
                *count += 1;
            }
            None => state.unlock_level = unit.lock_level(),
        }
        unit.set_lock_level(self.order);
    }

    /// Undo one hold, before the real lock is released.
    pub fn unlock(unit: &ExecUnit, state: &mut ExternalOrderState) {
        match state.recurse_count.as_mut() {
            Some(count) => {
                assert!(*count != 0, "mm external unlock with no holds");
                *count -= 1;
                if *count == 0 {
                    unit.set_lock_level(state.unlock_level);
                }
            }
            None => unit.set_lock_level(state.unlock_level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn rw(level: LockLevel) -> OrderedRwLock {
        OrderedRwLock::new(LockClassKey::new(level.name()), level, false)
    }

    fn excl(level: LockLevel) -> OrderedLock {
        OrderedLock::new(LockClassKey::new(level.name()), level, false)
    }

    #[test]
    fn test_tiers_strictly_increase() {
        for pair in LockLevel::ALL.windows(2) {
            assert!(pair[0].value() < pair[1].value());
        }
        assert_eq!(LockLevel::Paging.value(), MM_LOCK_ORDER_MAX);
    }

    #[test]
    fn test_bias_bands_are_disjoint() {
        for a in LockLevel::ALL {
            for b in LockLevel::ALL {
                assert_ne!(biased_level(a, false), biased_level(b, true));
            }
            assert_eq!(biased_level(a, true) - biased_level(a, false), MM_LOCK_ORDER_MAX);
        }
    }

    #[test]
    fn test_in_order_acquisition() {
        let unit = ExecUnit::new();
        let p2m = rw(LockLevel::P2m);
        let list = excl(LockLevel::AltP2mList);
        let alt = rw(LockLevel::AltP2m);
        let pod = excl(LockLevel::Pod);
        let paging = excl(LockLevel::Paging);

        {
            let _a = p2m.write(&unit, "test");
            assert_eq!(unit.lock_level(), 16);
            let _b = list.lock(&unit, "test");
            let _c = alt.write(&unit, "test");
            let _d = pod.lock(&unit, "test");
            let _e = paging.lock(&unit, "test");
            assert_eq!(unit.lock_level(), 64);
        }
        assert_eq!(unit.lock_level(), 0);
    }

    #[test]
    fn test_same_tier_is_allowed() {
        let unit = ExecUnit::new();
        let a = rw(LockLevel::AltP2m);
        let b = rw(LockLevel::AltP2m);
        let _ga = a.write(&unit, "test");
        let _gb = b.write(&unit, "test");
        assert_eq!(unit.lock_level(), 40);
    }

    #[test]
    #[should_panic(expected = "mm locking order violation: 40 > 16")]
    fn test_out_of_order_panics() {
        let unit = ExecUnit::new();
        let alt = rw(LockLevel::AltP2m);
        let host = rw(LockLevel::P2m);
        let _a = alt.write(&unit, "test");
        let _h = host.write(&unit, "test");
    }

    #[test]
    #[should_panic(expected = "mm locking order violation: 32 > 8")]
    fn test_exclusive_out_of_order_panics() {
        let unit = ExecUnit::new();
        let list = excl(LockLevel::AltP2mList);
        let nested = excl(LockLevel::NestedP2m);
        let _l = list.lock(&unit, "test");
        let _n = nested.lock(&unit, "test");
    }

    #[test]
    #[should_panic(expected = "mm lock already held by first_taker")]
    fn test_non_recursive_reentry_panics() {
        let unit = ExecUnit::new();
        let paging = excl(LockLevel::Paging);
        let _a = paging.lock(&unit, "first_taker");
        let _b = paging.lock(&unit, "second_taker");
    }

    #[test]
    fn test_recursive_exclusive_needs_n_releases() {
        let unit = ExecUnit::new();
        let paging = excl(LockLevel::Paging);
        let pod = excl(LockLevel::Pod);

        let g1 = paging.lock_recursive(&unit, "outer");
        let g2 = paging.lock_recursive(&unit, "inner");
        let g3 = g2.reenter();
        assert_eq!(g3.depth(), 3);
        assert_eq!(g3.locker(), "outer");

        drop(g3);
        drop(g1);
        assert!(paging.locked_by(&unit));
        assert_eq!(unit.lock_level(), 64);
        drop(g2);
        assert!(!paging.locked_by(&unit));
        assert_eq!(unit.lock_level(), 0);

        // A lower tier is available again once the lock is fully released.
        let _p = pod.lock(&unit, "after");
    }

    #[test]
    fn test_recursive_skips_level_check() {
        let unit = ExecUnit::new();
        let host = rw(LockLevel::P2m);
        let paging = excl(LockLevel::Paging);

        let outer = host.write(&unit, "outer");
        let paging_guard = paging.lock(&unit, "test");
        assert_eq!(unit.lock_level(), 64);
        // Owner re-enters a lower tier without tripping the check, and the
        // tracked level is left alone.
        let inner = host.write(&unit, "inner");
        assert_eq!(inner.depth(), 2);
        assert_eq!(unit.lock_level(), 64);
        drop(inner);
        assert!(host.write_locked_by(&unit));
        drop(paging_guard);
        drop(outer);
        assert_eq!(unit.lock_level(), 0);
    }

    #[test]
    fn test_write_recursion_restores_level_once() {
        let unit = ExecUnit::new();
        let host = rw(LockLevel::P2m);

        let guards: Vec<_> = (0..4).map(|_| host.write(&unit, "test")).collect();
        assert_eq!(guards[0].depth(), 4);
        assert_eq!(unit.lock_level(), 16);

        let mut guards = guards;
        while guards.len() > 1 {
            guards.pop();
            assert!(host.write_locked_by(&unit));
            assert_eq!(unit.lock_level(), 16);
        }
        guards.pop();
        assert!(!host.write_locked_by(&unit));
        assert_eq!(unit.lock_level(), 0);

        // Free for another unit.
        let other = ExecUnit::new();
        let g = host.write(&other, "other");
        assert_eq!(g.depth(), 1);
    }

    #[test]
    fn test_readers_share_and_restore_level() {
        let a = ExecUnit::new();
        let b = ExecUnit::new();
        let host = rw(LockLevel::P2m);

        let ra = host.read(&a);
        let rb = host.read(&b);
        assert_eq!(a.lock_level(), 16);
        assert_eq!(b.lock_level(), 16);
        drop(ra);
        drop(rb);
        assert_eq!(a.lock_level(), 0);
        assert_eq!(b.lock_level(), 0);
    }

    #[test]
    #[should_panic(expected = "mm locking order violation: 40 > 16")]
    fn test_reader_order_checked() {
        let unit = ExecUnit::new();
        let alt = rw(LockLevel::AltP2m);
        let host = rw(LockLevel::P2m);
        let _a = alt.write(&unit, "test");
        let _r = host.read(&unit);
    }

    #[test]
    #[should_panic(expected = "read-locked by its writer")]
    fn test_read_while_writing_panics() {
        let unit = ExecUnit::new();
        let host = rw(LockLevel::P2m);
        let _w = host.write(&unit, "test");
        let _r = host.read(&unit);
    }

    #[test]
    #[should_panic(expected = "mm lock released out of order: 40 != 16")]
    fn test_write_released_under_higher_hold_panics() {
        let unit = ExecUnit::new();
        let host = rw(LockLevel::P2m);
        let alt = rw(LockLevel::AltP2m);
        let h = host.write(&unit, "test");
        let _a = alt.write(&unit, "test");
        drop(h);
    }

    #[test]
    #[should_panic(expected = "mm lock released out of order: 40 != 32")]
    fn test_exclusive_released_under_higher_hold_panics() {
        let unit = ExecUnit::new();
        let list = excl(LockLevel::AltP2mList);
        let alt = rw(LockLevel::AltP2m);
        let l = list.lock(&unit, "test");
        let _a = alt.write(&unit, "test");
        drop(l);
    }

    #[test]
    #[should_panic(expected = "mm lock released out of order: 40 != 16")]
    fn test_reader_released_under_higher_hold_panics() {
        let unit = ExecUnit::new();
        let host = rw(LockLevel::P2m);
        let alt = rw(LockLevel::AltP2m);
        let r = host.read(&unit);
        let _a = alt.write(&unit, "test");
        drop(r);
    }

    #[test]
    fn test_control_domain_bias() {
        let unit = ExecUnit::new();
        let subject_paging = OrderedLock::new(LockClassKey::new("paging"), LockLevel::Paging, false);
        let control_p2m = OrderedRwLock::new(LockClassKey::new("p2m"), LockLevel::P2m, true);

        let _s = subject_paging.lock(&unit, "test");
        let _c = control_p2m.write(&unit, "copy_to_guest");
        assert_eq!(unit.lock_level(), 16 + MM_LOCK_ORDER_MAX);
    }

    #[test]
    #[should_panic(expected = "mm locking order violation: 80 > 16")]
    fn test_control_then_subject_panics() {
        let unit = ExecUnit::new();
        let control_p2m = OrderedRwLock::new(LockClassKey::new("p2m"), LockLevel::P2m, true);
        let subject_p2m = OrderedRwLock::new(LockClassKey::new("p2m"), LockLevel::P2m, false);
        let _c = control_p2m.write(&unit, "test");
        let _s = subject_p2m.write(&unit, "test");
    }

    #[test]
    fn test_external_order_recursive() {
        let unit = ExecUnit::new();
        let host = rw(LockLevel::P2m);
        let mut state = ExternalOrderState::recursive();

        let _h = host.write(&unit, "test");
        PAGE_SHARING_ORDER.pre_lock(&unit);
        PAGE_SHARING_ORDER.post_lock(&unit, &mut state);
        // Second page of a share operation.
        PAGE_SHARING_ORDER.pre_lock(&unit);
        PAGE_SHARING_ORDER.post_lock(&unit, &mut state);
        assert_eq!(state.recurse_count(), Some(2));
        assert_eq!(unit.lock_level(), 24);

        ExternalOrder::unlock(&unit, &mut state);
        assert_eq!(unit.lock_level(), 24);
        ExternalOrder::unlock(&unit, &mut state);
        assert_eq!(unit.lock_level(), 16);
    }

    #[test]
    #[should_panic(expected = "mm locking order violation: 56 > 40")]
    fn test_external_order_violation() {
        let unit = ExecUnit::new();
        let alt = rw(LockLevel::AltP2m);
        let page_alloc = ExternalOrder::page_alloc(false);
        let mut state = ExternalOrderState::new();

        page_alloc.pre_lock(&unit);
        page_alloc.post_lock(&unit, &mut state);
        let _a = alt.write(&unit, "test");
    }

    #[test]
    fn test_writers_serialize_across_units() {
        let lock = Arc::new(rw(LockLevel::P2m));
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let unit = ExecUnit::new();
                    for _ in 0..500 {
                        let outer = lock.write(&unit, "writer");
                        let _inner = outer.reenter();
                        // Non-atomic read-modify-write made safe by the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                    assert_eq!(unit.lock_level(), 0);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(rw(LockLevel::P2m));
        let events = Arc::new(Mutex::new(Vec::new()));

        let first = ExecUnit::new();
        let held = lock.read(&first);

        let writer = {
            let (lock, events) = (Arc::clone(&lock), Arc::clone(&events));
            thread::spawn(move || {
                let unit = ExecUnit::new();
                let _w = lock.write(&unit, "writer");
                events.lock().unwrap().push("write");
            })
        };
        while !lock.writer_waiting() {
            thread::yield_now();
        }

        let late_reader = {
            let (lock, events) = (Arc::clone(&lock), Arc::clone(&events));
            thread::spawn(move || {
                let unit = ExecUnit::new();
                let _r = lock.read(&unit);
                events.lock().unwrap().push("read");
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(events.lock().unwrap().is_empty());

        drop(held);
        writer.join().unwrap();
        late_reader.join().unwrap();
        assert_eq!(*events.lock().unwrap(), ["write", "read"]);
        assert!(!lock.writer_waiting());
    }

    #[test]
    fn test_readers_never_overlap_writer() {
        let lock = Arc::new(rw(LockLevel::P2m));
        let readers = Arc::new(AtomicU64::new(0));
        let writing = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let readers = Arc::clone(&readers);
                let writing = Arc::clone(&writing);
                thread::spawn(move || {
                    let unit = ExecUnit::new();
                    for _ in 0..500 {
                        if i < 2 {
                            let _w = lock.write(&unit, "writer");
                            writing.store(true, Ordering::SeqCst);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            writing.store(false, Ordering::SeqCst);
                        } else {
                            let _r = lock.read(&unit);
                            readers.fetch_add(1, Ordering::SeqCst);
                            assert!(!writing.load(Ordering::SeqCst));
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    assert_eq!(unit.lock_level(), 0);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
