//! Privileged mem-access control interface.
//!
//! [`do_mem_access_op`] is the single entry point for the control domain.
//! The return value follows the hypercall convention: negative errno on
//! failure, `0` when done, a positive continuation offset when preempted
//! (re-issue the op with `start` set to it), or the access code for
//! [`MemAccessOp::GetAccess`].

use cpu_local::ExecUnit;

use crate::access::{get_access, set_access_multi, set_access_range, AccessTarget, SetAccessProgress};
use crate::domain::Domain;
use crate::error::MemAccessError;
use crate::guest::GuestArray;

/// Frames between preemption checks in bulk operations.
pub const MEMOP_PREEMPT_MASK: u32 = (1 << 6) - 1;

/// One control operation.
pub enum MemAccessOp<'a> {
    /// Set `nr` frames from `pfn` (or the default, for `u64::MAX`).
    SetAccess {
        pfn: u64,
        nr: u32,
        start: u32,
        access: u8,
        altp2m_idx: u16,
    },
    /// Set each frame in `pfn_list` to the matching code in `access_list`.
    SetAccessMulti {
        pfn_list: &'a dyn GuestArray<u64>,
        access_list: &'a dyn GuestArray<u8>,
        nr: u32,
        start: u32,
        altp2m_idx: u16,
    },
    /// Read the access of `pfn` (or the default, for `u64::MAX`).
    GetAccess { pfn: u64, altp2m_idx: u16 },
}

fn progress_to_rc(progress: SetAccessProgress) -> i64 {
    match progress {
        SetAccessProgress::Done => 0,
        SetAccessProgress::Preempted(start) => start as i64,
    }
}

fn check_range(domain: &Domain, pfn: u64, nr: u32, start: u32) -> Result<(), MemAccessError> {
    if pfn == AccessTarget::DEFAULT_RAW {
        return Ok(());
    }
    if nr < start {
        return Err(MemAccessError::InvalidArgument);
    }
    if nr == 0 {
        return Ok(());
    }
    let last = pfn
        .checked_add(nr as u64 - 1)
        .ok_or(MemAccessError::InvalidArgument)?;
    if last > domain.config().max_gpfn {
        return Err(MemAccessError::InvalidArgument);
    }
    Ok(())
}

fn dispatch(unit: &ExecUnit, domain: &Domain, op: &MemAccessOp<'_>) -> Result<i64, MemAccessError> {
    if !domain.mem_access_sanity_check() {
        return Err(MemAccessError::NotSupported);
    }

    match *op {
        MemAccessOp::SetAccess {
            pfn,
            nr,
            start,
            access,
            altp2m_idx,
        } => {
            check_range(domain, pfn, nr, start)?;
            set_access_range(
                unit,
                domain,
                AccessTarget::from_raw(pfn),
                nr,
                start,
                MEMOP_PREEMPT_MASK,
                access,
                altp2m_idx as usize,
            )
            .map(progress_to_rc)
        }
        MemAccessOp::SetAccessMulti {
            pfn_list,
            access_list,
            nr,
            start,
            altp2m_idx,
        } => set_access_multi(
            unit,
            domain,
            pfn_list,
            access_list,
            nr,
            start,
            MEMOP_PREEMPT_MASK,
            altp2m_idx as usize,
        )
        .map(progress_to_rc),
        MemAccessOp::GetAccess { pfn, altp2m_idx } => {
            if pfn != AccessTarget::DEFAULT_RAW && pfn > domain.config().max_gpfn {
                return Err(MemAccessError::InvalidArgument);
            }
            get_access(unit, domain, AccessTarget::from_raw(pfn), altp2m_idx as usize)
                .map(|access| access.code() as i64)
        }
    }
}

/// Run `op` against `domain`.
pub fn do_mem_access_op(unit: &ExecUnit, domain: &Domain, op: &MemAccessOp<'_>) -> i64 {
    match dispatch(unit, domain, op) {
        Ok(rc) => rc,
        Err(e) => {
            klog!(Debug, "d{}: mem_access op failed: {}", domain.id(), e);
            e.to_errno() as i64
        }
    }
}
