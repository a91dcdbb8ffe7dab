#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[macro_use]
extern crate klog;

pub mod altp2m;
pub mod flush;
pub mod lock_ordering;
pub mod p2m;
pub mod soft;

pub use altp2m::{get_effective_entry, AltP2mError, AltP2mSet, MAX_ALTP2M, MAX_EPTP};
pub use flush::{get_stats as get_flush_stats, P2mFlushStats};
pub use lock_ordering::{
    biased_level, ExternalOrder, ExternalOrderState, LockClassKey, LockLevel, OrderedLock,
    OrderedLockGuard, OrderedReadGuard, OrderedRwLock, OrderedWriteGuard, MM_LOCK_ORDER_MAX,
    PAGE_SHARING_ORDER,
};
pub use p2m::{
    AccessRights, DomainId, Gfn, Mfn, P2mBackend, P2mEntry, P2mError, P2mKind, P2mLockGuard,
    P2mReadGuard, P2mTable, P2mType, Perms, Sentinel, ACCESS_CODE_DEFAULT, PAGE_ORDER_4K,
    PAGE_SHIFT, PAGE_SIZE,
};
pub use soft::SoftP2m;
