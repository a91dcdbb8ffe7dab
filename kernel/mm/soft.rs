//! Software p2m backend.
//!
//! Keeps entries in a sorted map instead of hardware tables. Used for
//! shadow-style views that are never walked by hardware, and by the tests
//! of every crate built on top of [`P2mTable`](crate::p2m::P2mTable).

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::p2m::{AccessRights, Gfn, Mfn, P2mBackend, P2mEntry, P2mError, P2mType};

/// Largest mapping order accepted by [`SoftP2m::set_entry`] (1 GiB).
pub const SOFT_MAX_ORDER: u32 = 18;

/// In-memory translation table.
#[derive(Debug, Default)]
pub struct SoftP2m {
    entries: Mutex<BTreeMap<u64, P2mEntry>>,
    flushes: AtomicU64,
}

impl SoftP2m {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `count` frames of RAM at `first`, backed by consecutive
    /// machine frames starting at `first_mfn`.
    pub fn with_ram(first: Gfn, count: u64, first_mfn: Mfn, access: AccessRights) -> Self {
        let table = Self::new();
        {
            let mut entries = table.entries.lock();
            for i in 0..count {
                entries.insert(
                    first.offset(i).raw(),
                    P2mEntry::new(Mfn(first_mfn.0 + i), P2mType::Ram, access),
                );
            }
        }
        table
    }

    /// Number of entries ever written.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Flushes received.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl P2mBackend for SoftP2m {
    fn get_entry(&self, gfn: Gfn) -> Option<P2mEntry> {
        self.entries.lock().get(&gfn.raw()).copied()
    }

    fn set_entry(&self, gfn: Gfn, entry: P2mEntry, order: u32) -> Result<(), P2mError> {
        if order > SOFT_MAX_ORDER {
            return Err(P2mError::InvalidEntry);
        }
        let mut entries = self.entries.lock();
        for i in 0..(1u64 << order) {
            let mfn = if entry.mfn.is_valid() {
                Mfn(entry.mfn.0 + i)
            } else {
                Mfn::INVALID
            };
            entries.insert(
                gfn.offset(i).raw(),
                P2mEntry::from_raw(mfn, entry.p2m_type, entry.raw_access()),
            );
        }
        Ok(())
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_ram_populates_range() {
        let p2m = SoftP2m::with_ram(Gfn(0x100), 4, Mfn(0x8000), AccessRights::RWX);
        assert_eq!(p2m.len(), 4);
        let e = p2m.get_entry(Gfn(0x103)).unwrap();
        assert_eq!(e.mfn, Mfn(0x8003));
        assert_eq!(e.access(), Some(AccessRights::RWX));
        assert!(p2m.get_entry(Gfn(0x104)).is_none());
    }

    #[test]
    fn test_superpage_set() {
        let p2m = SoftP2m::new();
        let e = P2mEntry::new(Mfn(0x200), P2mType::Ram, AccessRights::R);
        p2m.set_entry(Gfn(0x400), e, 2).unwrap();
        assert_eq!(p2m.len(), 4);
        assert_eq!(p2m.get_entry(Gfn(0x402)).unwrap().mfn, Mfn(0x202));
        assert_eq!(
            p2m.set_entry(Gfn(0), e, SOFT_MAX_ORDER + 1),
            Err(P2mError::InvalidEntry)
        );
    }

    #[test]
    fn test_placeholder_keeps_invalid_mfn() {
        let p2m = SoftP2m::new();
        p2m.set_entry(Gfn(1), P2mEntry::placeholder(AccessRights::N), 1)
            .unwrap();
        assert!(!p2m.get_entry(Gfn(2)).unwrap().is_present());
    }
}
