//! Alternate p2m views
//!
//! A domain may carry up to [`MAX_ALTP2M`] alternate translation tables next
//! to its host table. Each vCPU runs on one view at a time; introspection
//! tools use the views to give different vCPUs different permissions for the
//! same frames.
//!
//! Index 0 always names the host view and never occupies a slot here.
//! Slots are installed and removed under the `AltP2mList` lock, which sits
//! between the host and alternate table tiers.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use cpu_local::ExecUnit;

use crate::lock_ordering::{LockClassKey, LockLevel, OrderedLock, OrderedLockGuard};
use crate::p2m::{Gfn, P2mEntry, P2mError, P2mKind, P2mLockGuard, P2mTable, PAGE_ORDER_4K};

/// Alternate view slots per domain.
pub const MAX_ALTP2M: usize = 10;
/// Entries in the hardware EPTP list.
pub const MAX_EPTP: usize = 512;

const VIEW_LIMIT: usize = if MAX_ALTP2M < MAX_EPTP {
    MAX_ALTP2M
} else {
    MAX_EPTP
};

/// Errors from view management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltP2mError {
    /// Index 0, out of range, empty, or not matching the table
    InvalidIndex,
    /// Slot already populated
    SlotBusy,
    /// Domain must be paused
    NotPaused,
}

impl AltP2mError {
    /// Convert to a negative errno.
    pub fn to_errno(self) -> i32 {
        match self {
            AltP2mError::InvalidIndex => -22, // EINVAL
            AltP2mError::SlotBusy => -16,     // EBUSY
            AltP2mError::NotPaused => -16,    // EBUSY
        }
    }
}

impl fmt::Display for AltP2mError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AltP2mError::InvalidIndex => write!(f, "invalid alternate view index"),
            AltP2mError::SlotBusy => write!(f, "alternate view slot in use"),
            AltP2mError::NotPaused => write!(f, "domain not paused"),
        }
    }
}

/// Could `idx` name an alternate view? Says nothing about population.
#[inline]
pub const fn index_in_range(idx: usize) -> bool {
    idx != 0 && idx < VIEW_LIMIT
}

type Slots = [Option<Arc<P2mTable>>; MAX_ALTP2M];

/// Per-domain registry of alternate views.
pub struct AltP2mSet {
    list_lock: OrderedLock,
    slots: UnsafeCell<Slots>,
}

// Safety: `slots` is only accessed through `slots_mut`, which requires a
// guard on `list_lock`.
unsafe impl Sync for AltP2mSet {}

impl AltP2mSet {
    /// Empty registry. `privileged` biases the list lock for control domains.
    pub fn new(privileged: bool) -> Self {
        Self {
            list_lock: OrderedLock::new(
                LockClassKey::new("altp2m_list"),
                LockLevel::AltP2mList,
                privileged,
            ),
            slots: UnsafeCell::new(Default::default()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn slots_mut<'g>(&'g self, guard: &'g OrderedLockGuard<'_>) -> &'g mut Slots {
        debug_assert!(self.list_lock.locked_by(guard.unit()));
        // Safety: the guard proves the list lock is held by this unit.
        unsafe { &mut *self.slots.get() }
    }

    /// Install `table` at `idx`.
    pub fn init_view(
        &self,
        unit: &ExecUnit,
        idx: usize,
        table: Arc<P2mTable>,
    ) -> Result<(), AltP2mError> {
        if !index_in_range(idx) || table.kind() != P2mKind::Alternate(idx as u16) {
            return Err(AltP2mError::InvalidIndex);
        }
        let guard = self.list_lock.lock(unit, "altp2m_init_view");
        let slot = &mut self.slots_mut(&guard)[idx];
        if slot.is_some() {
            return Err(AltP2mError::SlotBusy);
        }
        *slot = Some(table);
        klog!(Info, "altp2m: view {} installed", idx);
        Ok(())
    }

    /// Remove the view at `idx`. The domain must be paused.
    pub fn destroy_view(
        &self,
        unit: &ExecUnit,
        idx: usize,
        domain_paused: bool,
    ) -> Result<Arc<P2mTable>, AltP2mError> {
        if !index_in_range(idx) {
            return Err(AltP2mError::InvalidIndex);
        }
        if !domain_paused {
            return Err(AltP2mError::NotPaused);
        }
        let guard = self.list_lock.lock(unit, "altp2m_destroy_view");
        let table = self.slots_mut(&guard)[idx]
            .take()
            .ok_or(AltP2mError::InvalidIndex)?;
        klog!(Info, "altp2m: view {} destroyed", idx);
        Ok(table)
    }

    /// Validated lookup of a populated view.
    pub fn get(&self, unit: &ExecUnit, idx: usize) -> Result<Arc<P2mTable>, AltP2mError> {
        if !index_in_range(idx) {
            return Err(AltP2mError::InvalidIndex);
        }
        let guard = self.list_lock.lock(unit, "altp2m_get");
        self.slots_mut(&guard)[idx]
            .clone()
            .ok_or(AltP2mError::InvalidIndex)
    }

    /// Call `f` on every populated view, holding the list lock.
    pub fn for_each_view(&self, unit: &ExecUnit, mut f: impl FnMut(&Arc<P2mTable>)) {
        let guard = self.list_lock.lock(unit, "altp2m_for_each_view");
        for table in self.slots_mut(&guard).iter().flatten() {
            f(table);
        }
    }

    /// Number of populated views.
    pub fn count(&self, unit: &ExecUnit) -> usize {
        let mut n = 0;
        self.for_each_view(unit, |_| n += 1);
        n
    }
}

impl fmt::Debug for AltP2mSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AltP2mSet")
            .field("list_lock", &self.list_lock)
            .finish_non_exhaustive()
    }
}

/// Entry for `gfn` as seen through an alternate view.
///
/// Falls back to the host table when the view has no translation; with
/// `prepopulate` the host entry is copied into the view. Both tables must be
/// write-locked by the caller.
pub fn get_effective_entry(
    host: &P2mLockGuard<'_>,
    view: &P2mLockGuard<'_>,
    gfn: Gfn,
    prepopulate: bool,
) -> Result<P2mEntry, P2mError> {
    if let Some(entry) = view.get_entry(gfn).filter(P2mEntry::is_present) {
        return Ok(entry);
    }
    let entry = host
        .get_entry(gfn)
        .filter(P2mEntry::is_present)
        .ok_or(P2mError::NotPresent)?;
    if prepopulate {
        view.set_entry(gfn, entry, PAGE_ORDER_4K)?;
    }
    Ok(entry)
}
