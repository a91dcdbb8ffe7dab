//! Guest-physical to machine translation tables (p2m)
//!
//! A [`P2mTable`] is one view of a domain's GFN → MFN translation: the host
//! view, or one of the alternate views. The hardware encoding lives behind
//! the [`P2mBackend`] trait; this module owns the locking, the per-table
//! default access, and flush deferral.
//!
//! # Locking
//!
//! Entries may only be read or written through a guard:
//!
//! - [`P2mTable::lock`] returns a [`P2mLockGuard`] holding the write side at
//!   the table's tier (`P2m` for the host view, `AltP2m` for alternate views).
//!   Nested guards share one deferred flush, issued when the outermost guard
//!   is dropped and only if an entry was changed.
//! - [`P2mTable::read_lock`] returns a [`P2mReadGuard`] for pure queries.
//!
//! # Access codes
//!
//! ```text
//! n=0 r=1 w=2 rw=3 x=4 rx=5 wx=6 rwx=7 rx2rw=8 n2rwx=9   (stored / wire)
//! default=10                                             (control interface only)
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use cpu_local::ExecUnit;
use x86_64::PhysAddr;

use crate::flush;
use crate::lock_ordering::{
    LockClassKey, LockLevel, OrderedReadGuard, OrderedRwLock, OrderedWriteGuard,
};

/// log2 of the guest frame size
pub const PAGE_SHIFT: u32 = 12;
/// Guest frame size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mapping order of a single 4 KiB frame
pub const PAGE_ORDER_4K: u32 = 0;

/// Domain identifier
pub type DomainId = u16;

// ============================================================================
// Frame numbers
// ============================================================================

/// Guest frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gfn(pub u64);

impl Gfn {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Gfn(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Frame containing guest-physical address `gpa`.
    #[inline]
    pub fn containing(gpa: PhysAddr) -> Self {
        Gfn(gpa.as_u64() >> PAGE_SHIFT)
    }

    /// Guest-physical address of the first byte of the frame.
    #[inline]
    pub fn start_address(self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 << PAGE_SHIFT)
    }

    /// Frame `n` frames after this one.
    #[inline]
    pub const fn offset(self, n: u64) -> Self {
        Gfn(self.0.wrapping_add(n))
    }
}

impl fmt::Debug for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gfn({:#x})", self.0)
    }
}

impl fmt::Display for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Machine frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mfn(pub u64);

impl Mfn {
    /// No backing frame.
    pub const INVALID: Mfn = Mfn(u64::MAX);

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl fmt::Debug for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Mfn({:#x})", self.0)
        } else {
            f.write_str("Mfn(INVALID)")
        }
    }
}

/// Type of a p2m entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mType {
    /// Nothing mapped
    Invalid,
    /// Normal read/write guest RAM
    Ram,
    /// Read-only guest RAM
    RamReadOnly,
}

// ============================================================================
// Access rights
// ============================================================================

bitflags! {
    /// Concrete per-frame permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perms: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// Transient permission that widens itself on the first fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// Read/execute until the first write fault, then read/write.
    Rx2Rw,
    /// No access until the first fault, then full access.
    N2Rwx,
}

impl Sentinel {
    /// Permission the sentinel turns into.
    #[inline]
    pub const fn upgraded(self) -> Perms {
        match self {
            Sentinel::Rx2Rw => Perms::READ.union(Perms::WRITE),
            Sentinel::N2Rwx => Perms::all(),
        }
    }

    /// Permission enforced while the sentinel is in place.
    #[inline]
    pub const fn effective(self) -> Perms {
        match self {
            Sentinel::Rx2Rw => Perms::READ.union(Perms::EXEC),
            Sentinel::N2Rwx => Perms::empty(),
        }
    }
}

/// Access permission of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessRights {
    Concrete(Perms),
    Sentinel(Sentinel),
}

/// Control-interface code meaning "the table's current default access".
pub const ACCESS_CODE_DEFAULT: u8 = 10;

impl AccessRights {
    pub const N: AccessRights = AccessRights::Concrete(Perms::empty());
    pub const R: AccessRights = AccessRights::Concrete(Perms::READ);
    pub const W: AccessRights = AccessRights::Concrete(Perms::WRITE);
    pub const RW: AccessRights = AccessRights::Concrete(Perms::READ.union(Perms::WRITE));
    pub const X: AccessRights = AccessRights::Concrete(Perms::EXEC);
    pub const RX: AccessRights = AccessRights::Concrete(Perms::READ.union(Perms::EXEC));
    pub const WX: AccessRights = AccessRights::Concrete(Perms::WRITE.union(Perms::EXEC));
    pub const RWX: AccessRights = AccessRights::Concrete(Perms::all());
    pub const RX2RW: AccessRights = AccessRights::Sentinel(Sentinel::Rx2Rw);
    pub const N2RWX: AccessRights = AccessRights::Sentinel(Sentinel::N2Rwx);

    /// Decode a stored/wire access code. `None` for anything outside 0..=9.
    pub const fn from_code(code: u8) -> Option<AccessRights> {
        match code {
            0..=7 => Some(AccessRights::Concrete(Perms::from_bits_truncate(code))),
            8 => Some(AccessRights::RX2RW),
            9 => Some(AccessRights::N2RWX),
            _ => None,
        }
    }

    /// Stored/wire access code.
    pub const fn code(self) -> u8 {
        match self {
            AccessRights::Concrete(perms) => perms.bits(),
            AccessRights::Sentinel(Sentinel::Rx2Rw) => 8,
            AccessRights::Sentinel(Sentinel::N2Rwx) => 9,
        }
    }

    /// Sentinel kind, if any.
    #[inline]
    pub const fn sentinel(self) -> Option<Sentinel> {
        match self {
            AccessRights::Sentinel(s) => Some(s),
            AccessRights::Concrete(_) => None,
        }
    }

    /// Permissions currently enforced by hardware for this access.
    #[inline]
    pub const fn effective(self) -> Perms {
        match self {
            AccessRights::Concrete(perms) => perms,
            AccessRights::Sentinel(s) => s.effective(),
        }
    }

    pub fn name(self) -> &'static str {
        match self.code() {
            0 => "n",
            1 => "r",
            2 => "w",
            3 => "rw",
            4 => "x",
            5 => "rx",
            6 => "wx",
            7 => "rwx",
            8 => "rx2rw",
            _ => "n2rwx",
        }
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Entries and backend
// ============================================================================

/// One translation: (mfn, type, access) for a GFN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2mEntry {
    pub mfn: Mfn,
    pub p2m_type: P2mType,
    access: u8,
}

impl P2mEntry {
    pub const fn new(mfn: Mfn, p2m_type: P2mType, access: AccessRights) -> Self {
        Self {
            mfn,
            p2m_type,
            access: access.code(),
        }
    }

    /// Entry carrying an access but no backing frame.
    pub const fn placeholder(access: AccessRights) -> Self {
        Self::new(Mfn::INVALID, P2mType::Invalid, access)
    }

    /// Entry with an undecoded access code, as read back from hardware.
    pub const fn from_raw(mfn: Mfn, p2m_type: P2mType, access: u8) -> Self {
        Self {
            mfn,
            p2m_type,
            access,
        }
    }

    /// Decoded access, `None` if the stored code is unknown.
    #[inline]
    pub const fn access(&self) -> Option<AccessRights> {
        AccessRights::from_code(self.access)
    }

    #[inline]
    pub const fn raw_access(&self) -> u8 {
        self.access
    }

    /// Copy of this entry with a different access.
    #[inline]
    pub const fn with_access(self, access: AccessRights) -> Self {
        Self {
            access: access.code(),
            ..self
        }
    }

    /// Is there a backing frame?
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.mfn.is_valid()
    }
}

/// Backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mError {
    /// No translation for the frame
    NotPresent,
    /// Intermediate table allocation failed
    NoMemory,
    /// Entry rejected by the backend
    InvalidEntry,
}

impl P2mError {
    /// Convert to a negative errno.
    pub fn to_errno(self) -> i32 {
        match self {
            P2mError::NotPresent => -3,   // ESRCH
            P2mError::NoMemory => -12,    // ENOMEM
            P2mError::InvalidEntry => -22, // EINVAL
        }
    }
}

impl fmt::Display for P2mError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            P2mError::NotPresent => write!(f, "no translation for frame"),
            P2mError::NoMemory => write!(f, "out of memory for p2m tables"),
            P2mError::InvalidEntry => write!(f, "entry rejected by p2m backend"),
        }
    }
}

/// Hardware (or software) implementation of one translation table.
///
/// Callers always hold the owning [`P2mTable`]'s lock, so implementations
/// only need interior mutability, not their own ordering.
pub trait P2mBackend: Send + Sync {
    /// Current entry for `gfn`, if any was ever written.
    fn get_entry(&self, gfn: Gfn) -> Option<P2mEntry>;

    /// Write `entry` for the `1 << order` frames starting at `gfn`.
    fn set_entry(&self, gfn: Gfn, entry: P2mEntry, order: u32) -> Result<(), P2mError>;

    /// Invalidate cached translations derived from this table.
    fn flush(&self);
}

impl<T: P2mBackend + ?Sized> P2mBackend for Arc<T> {
    fn get_entry(&self, gfn: Gfn) -> Option<P2mEntry> {
        (**self).get_entry(gfn)
    }

    fn set_entry(&self, gfn: Gfn, entry: P2mEntry, order: u32) -> Result<(), P2mError> {
        (**self).set_entry(gfn, entry, order)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

// ============================================================================
// Tables
// ============================================================================

/// Which view of the domain a table is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mKind {
    Host,
    Alternate(u16),
}

impl P2mKind {
    /// Ordering tier of the table lock.
    pub const fn lock_level(self) -> LockLevel {
        match self {
            P2mKind::Host => LockLevel::P2m,
            P2mKind::Alternate(_) => LockLevel::AltP2m,
        }
    }

    /// Index in the alternate-view set; 0 for the host view.
    pub const fn view_index(self) -> u16 {
        match self {
            P2mKind::Host => 0,
            P2mKind::Alternate(idx) => idx,
        }
    }
}

/// One translation table of a domain.
pub struct P2mTable {
    domain_id: DomainId,
    kind: P2mKind,
    lock: OrderedRwLock,
    default_access: AtomicU8,
    access_required: AtomicBool,
    /// Nesting depth of write guards; flush runs when it drops to zero.
    defer_flush: AtomicU32,
    need_flush: AtomicBool,
    flushes: AtomicU64,
    backend: Box<dyn P2mBackend>,
}

impl P2mTable {
    /// Create a table. `privileged` is set for tables owned by a control
    /// domain and biases the lock tier.
    pub fn new(
        domain_id: DomainId,
        privileged: bool,
        kind: P2mKind,
        backend: Box<dyn P2mBackend>,
    ) -> Self {
        let class = match kind {
            P2mKind::Host => LockClassKey::new("p2m"),
            P2mKind::Alternate(_) => LockClassKey::new("altp2m"),
        };
        Self {
            domain_id,
            kind,
            lock: OrderedRwLock::new(class, kind.lock_level(), privileged),
            default_access: AtomicU8::new(AccessRights::RWX.code()),
            access_required: AtomicBool::new(false),
            defer_flush: AtomicU32::new(0),
            need_flush: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            backend,
        }
    }

    #[inline]
    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    #[inline]
    pub fn kind(&self) -> P2mKind {
        self.kind
    }

    #[inline]
    pub fn is_alternate(&self) -> bool {
        matches!(self.kind, P2mKind::Alternate(_))
    }

    /// Access given to frames that have no explicit setting.
    pub fn default_access(&self) -> AccessRights {
        AccessRights::from_code(self.default_access.load(Ordering::Acquire))
            .unwrap_or(AccessRights::RWX)
    }

    pub fn set_default_access(&self, access: AccessRights) {
        self.default_access.store(access.code(), Ordering::Release);
    }

    /// Must a listener be present for access faults on this table?
    #[inline]
    pub fn access_required(&self) -> bool {
        self.access_required.load(Ordering::Acquire)
    }

    pub fn set_access_required(&self, required: bool) {
        self.access_required.store(required, Ordering::Release);
    }

    /// Flushes this table has issued to its backend.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Does `unit` hold the write side?
    #[inline]
    pub fn locked_by(&self, unit: &ExecUnit) -> bool {
        self.lock.write_locked_by(unit)
    }

    /// Biased tier of the table lock.
    #[inline]
    pub fn lock_order(&self) -> i32 {
        self.lock.order()
    }

    /// Take the write side and defer flushes until the outermost guard drops.
    ///
    /// Recursive for the current writer.
    pub fn lock<'a>(&'a self, unit: &'a ExecUnit, func: &'static str) -> P2mLockGuard<'a> {
        let inner = self.lock.write(unit, func);
        self.defer_flush.fetch_add(1, Ordering::Relaxed);
        P2mLockGuard { table: self, inner }
    }

    /// Take the read side for queries.
    pub fn read_lock<'a>(&'a self, unit: &'a ExecUnit) -> P2mReadGuard<'a> {
        P2mReadGuard {
            table: self,
            _inner: self.lock.read(unit),
        }
    }

    fn flush(&self) {
        self.backend.flush();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        flush::record_flush();
        klog!(
            Trace,
            "d{}: p2m view {} flushed",
            self.domain_id,
            self.kind.view_index()
        );
    }
}

impl fmt::Debug for P2mTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2mTable")
            .field("domain_id", &self.domain_id)
            .field("kind", &self.kind)
            .field("default_access", &self.default_access())
            .field("access_required", &self.access_required())
            .field("lock", &self.lock)
            .finish()
    }
}

/// Write hold on a [`P2mTable`].
///
/// The translation-cache flush is issued when the outermost guard of a
/// nest is dropped, before the lock itself is released.
pub struct P2mLockGuard<'a> {
    table: &'a P2mTable,
    // Dropped after `Drop::drop` has flushed.
    inner: OrderedWriteGuard<'a>,
}

impl<'a> P2mLockGuard<'a> {
    #[inline]
    pub fn table(&self) -> &'a P2mTable {
        self.table
    }

    #[inline]
    pub fn unit(&self) -> &'a ExecUnit {
        self.inner.unit()
    }

    pub fn get_entry(&self, gfn: Gfn) -> Option<P2mEntry> {
        self.table.backend.get_entry(gfn)
    }

    pub fn set_entry(&self, gfn: Gfn, entry: P2mEntry, order: u32) -> Result<(), P2mError> {
        self.table.backend.set_entry(gfn, entry, order)?;
        self.table.need_flush.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Nested hold sharing this guard's deferred flush.
    pub fn reenter(&self) -> P2mLockGuard<'a> {
        let inner = self.inner.reenter();
        self.table.defer_flush.fetch_add(1, Ordering::Relaxed);
        P2mLockGuard {
            table: self.table,
            inner,
        }
    }

    /// Nesting depth of write guards on this table.
    pub fn depth(&self) -> u32 {
        self.table.defer_flush.load(Ordering::Relaxed)
    }
}

impl Drop for P2mLockGuard<'_> {
    fn drop(&mut self) {
        if self.table.defer_flush.fetch_sub(1, Ordering::Relaxed) != 1 {
            flush::record_deferred();
            return;
        }
        if self.table.need_flush.swap(false, Ordering::Relaxed) {
            self.table.flush();
        } else {
            flush::record_clean_unlock();
        }
    }
}

/// Read hold on a [`P2mTable`].
pub struct P2mReadGuard<'a> {
    table: &'a P2mTable,
    _inner: OrderedReadGuard<'a>,
}

impl<'a> P2mReadGuard<'a> {
    #[inline]
    pub fn table(&self) -> &'a P2mTable {
        self.table
    }

    pub fn get_entry(&self, gfn: Gfn) -> Option<P2mEntry> {
        self.table.backend.get_entry(gfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftP2m;

    fn host_table(backend: Arc<SoftP2m>) -> P2mTable {
        P2mTable::new(1, false, P2mKind::Host, Box::new(backend))
    }

    #[test]
    fn test_access_codes() {
        for code in 0..=9u8 {
            let access = AccessRights::from_code(code).unwrap();
            assert_eq!(access.code(), code);
        }
        assert_eq!(AccessRights::from_code(ACCESS_CODE_DEFAULT), None);
        assert_eq!(AccessRights::from_code(0xff), None);
        assert_eq!(AccessRights::from_code(5), Some(AccessRights::RX));
        assert_eq!(AccessRights::RX2RW.name(), "rx2rw");
        assert_eq!(AccessRights::WX.name(), "wx");
    }

    #[test]
    fn test_sentinel_upgrades() {
        assert_eq!(
            AccessRights::Concrete(Sentinel::Rx2Rw.upgraded()),
            AccessRights::RW
        );
        assert_eq!(
            AccessRights::Concrete(Sentinel::N2Rwx.upgraded()),
            AccessRights::RWX
        );
        assert_eq!(AccessRights::RX2RW.effective(), Perms::READ | Perms::EXEC);
        assert!(AccessRights::N2RWX.effective().is_empty());
    }

    #[test]
    fn test_gfn_address_math() {
        let gpa = PhysAddr::new(0x1234_5678);
        let gfn = Gfn::containing(gpa);
        assert_eq!(gfn, Gfn(0x12345));
        assert_eq!(gfn.start_address().as_u64(), 0x1234_5000);
        assert_eq!(gfn.offset(3), Gfn(0x12348));
    }

    #[test]
    fn test_entry_access_decode() {
        let e = P2mEntry::new(Mfn(7), P2mType::Ram, AccessRights::RX);
        assert!(e.is_present());
        assert_eq!(e.access(), Some(AccessRights::RX));
        assert_eq!(e.with_access(AccessRights::N).raw_access(), 0);

        let bad = P2mEntry::from_raw(Mfn(7), P2mType::Ram, 42);
        assert_eq!(bad.access(), None);
        assert!(!P2mEntry::placeholder(AccessRights::R).is_present());
    }

    #[test]
    fn test_tier_by_kind() {
        let host = host_table(Arc::new(SoftP2m::new()));
        let alt = P2mTable::new(1, false, P2mKind::Alternate(2), Box::new(SoftP2m::new()));
        let ctl = P2mTable::new(0, true, P2mKind::Host, Box::new(SoftP2m::new()));
        assert_eq!(host.lock_order(), 16);
        assert_eq!(alt.lock_order(), 40);
        assert_eq!(ctl.lock_order(), 80);
        assert_eq!(alt.kind().view_index(), 2);
    }

    #[test]
    fn test_nested_guards_flush_once() {
        let backend = Arc::new(SoftP2m::new());
        let table = host_table(Arc::clone(&backend));
        let unit = ExecUnit::new();

        {
            let outer = table.lock(&unit, "outer");
            {
                let inner = outer.reenter();
                let third = table.lock(&unit, "third");
                assert_eq!(third.depth(), 3);
                inner
                    .set_entry(Gfn(1), P2mEntry::new(Mfn(10), P2mType::Ram, AccessRights::RW), 0)
                    .unwrap();
                drop(third);
            }
            assert_eq!(table.flush_count(), 0);
            assert!(table.locked_by(&unit));
        }
        assert_eq!(table.flush_count(), 1);
        assert_eq!(backend.flush_count(), 1);
        assert!(!table.locked_by(&unit));
        assert_eq!(unit.lock_level(), 0);
    }

    #[test]
    fn test_clean_unlock_does_not_flush() {
        let table = host_table(Arc::new(SoftP2m::new()));
        let unit = ExecUnit::new();
        {
            let g = table.lock(&unit, "query");
            assert!(g.get_entry(Gfn(5)).is_none());
        }
        assert_eq!(table.flush_count(), 0);
    }

    #[test]
    fn test_read_guard_sees_writes() {
        let table = host_table(Arc::new(SoftP2m::new()));
        let unit = ExecUnit::new();
        let entry = P2mEntry::new(Mfn(3), P2mType::RamReadOnly, AccessRights::R);
        table
            .lock(&unit, "writer")
            .set_entry(Gfn(9), entry, PAGE_ORDER_4K)
            .unwrap();

        let reader = ExecUnit::new();
        let r = table.read_lock(&reader);
        assert_eq!(r.get_entry(Gfn(9)), Some(entry));
        assert_eq!(reader.lock_level(), 16);
        drop(r);
        assert_eq!(reader.lock_level(), 0);
    }

    #[test]
    fn test_default_access_roundtrip() {
        let table = host_table(Arc::new(SoftP2m::new()));
        assert_eq!(table.default_access(), AccessRights::RWX);
        table.set_default_access(AccessRights::RX2RW);
        assert_eq!(table.default_access(), AccessRights::RX2RW);
        assert!(!table.access_required());
        table.set_access_required(true);
        assert!(table.access_required());
    }
}
