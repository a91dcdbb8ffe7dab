//! Per-frame access queries and updates.
//!
//! Updates always lock the host table first and then, for an alternate
//! view, the view's table (`P2m` before `AltP2m`). View lookups take the
//! `AltP2mList` lock and release it before either table lock is taken.
//!
//! Bulk updates poll the execution unit for a pending preemption request
//! every `mask + 1` frames and hand back the offset to continue from.

use alloc::sync::Arc;
use cpu_local::ExecUnit;
use mm::{
    get_effective_entry, AccessRights, Gfn, P2mEntry, P2mError, P2mLockGuard, P2mTable,
    ACCESS_CODE_DEFAULT, PAGE_ORDER_4K,
};

use crate::domain::Domain;
use crate::error::MemAccessError;
use crate::guest::GuestArray;

/// Frame selector of the control interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTarget {
    /// The table's default access
    Default,
    Frame(Gfn),
}

impl AccessTarget {
    /// Raw GFN value that selects the default access.
    pub const DEFAULT_RAW: u64 = u64::MAX;

    pub const fn from_raw(raw: u64) -> Self {
        if raw == Self::DEFAULT_RAW {
            AccessTarget::Default
        } else {
            AccessTarget::Frame(Gfn(raw))
        }
    }
}

/// Outcome of a bulk update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAccessProgress {
    /// Every frame was processed
    Done,
    /// Stopped for preemption; resume with this `start`
    Preempted(u32),
}

/// Decode a control-interface access code against `table`'s default.
pub fn convert_access(table: &P2mTable, code: u8) -> Result<AccessRights, MemAccessError> {
    if code == ACCESS_CODE_DEFAULT {
        return Ok(table.default_access());
    }
    AccessRights::from_code(code).ok_or(MemAccessError::InvalidArgument)
}

/// Current access of `target` in `table`.
///
/// Reuses the write side when `unit` already holds it.
pub fn p2m_get_access(
    unit: &ExecUnit,
    table: &P2mTable,
    target: AccessTarget,
) -> Result<AccessRights, MemAccessError> {
    let gfn = match target {
        AccessTarget::Default => return Ok(table.default_access()),
        AccessTarget::Frame(gfn) => gfn,
    };

    let entry = if table.locked_by(unit) {
        table.lock(unit, "p2m_get_mem_access").get_entry(gfn)
    } else {
        table.read_lock(unit).get_entry(gfn)
    };

    let entry = entry
        .filter(P2mEntry::is_present)
        .ok_or(MemAccessError::NotPresent)?;
    entry.access().ok_or(MemAccessError::OutOfRange)
}

/// Current access of `target` in the host table or view `altp2m_idx`.
pub fn get_access(
    unit: &ExecUnit,
    domain: &Domain,
    target: AccessTarget,
    altp2m_idx: usize,
) -> Result<AccessRights, MemAccessError> {
    let table = if !domain.altp2m_active() {
        if altp2m_idx != 0 {
            return Err(MemAccessError::InvalidArgument);
        }
        Arc::clone(domain.host_p2m())
    } else if altp2m_idx != 0 {
        domain.alternate_view(unit, altp2m_idx)?
    } else {
        Arc::clone(domain.host_p2m())
    };
    p2m_get_access(unit, &table, target)
}

/// Apply `access` to one frame. Frames unknown to both the view and the host
/// are skipped for alternate views.
fn set_one(
    host: &P2mLockGuard<'_>,
    view: Option<&P2mLockGuard<'_>>,
    gfn: Gfn,
    access: AccessRights,
) -> Result<(), MemAccessError> {
    match view {
        Some(view) => match get_effective_entry(host, view, gfn, true) {
            Ok(entry) => view.set_entry(gfn, entry.with_access(access), PAGE_ORDER_4K)?,
            Err(P2mError::NotPresent) => return Ok(()),
            Err(e) => return Err(e.into()),
        },
        None => {
            let entry = host
                .get_entry(gfn)
                .unwrap_or(P2mEntry::placeholder(access));
            host.set_entry(gfn, entry.with_access(access), PAGE_ORDER_4K)?;
        }
    }
    klog!(
        Debug,
        "d{}: gfn {} view {} access -> {}",
        host.table().domain_id(),
        gfn,
        view.map_or(0, |v| v.table().kind().view_index()),
        access
    );
    Ok(())
}

/// Alternate view to update, `None` for the host table.
fn target_view(
    unit: &ExecUnit,
    domain: &Domain,
    altp2m_idx: usize,
) -> Result<Option<Arc<P2mTable>>, MemAccessError> {
    if altp2m_idx == 0 {
        return Ok(None);
    }
    domain.alternate_view(unit, altp2m_idx).map(Some)
}

/// Set the access of `nr` frames from `first`, starting at offset `start`.
///
/// With [`AccessTarget::Default`] only the host table's default is changed.
#[allow(clippy::too_many_arguments)]
pub fn set_access_range(
    unit: &ExecUnit,
    domain: &Domain,
    target: AccessTarget,
    nr: u32,
    start: u32,
    mask: u32,
    access_code: u8,
    altp2m_idx: usize,
) -> Result<SetAccessProgress, MemAccessError> {
    let view = target_view(unit, domain, altp2m_idx)?;
    let host = domain.host_p2m();
    let access = convert_access(host, access_code)?;

    let first = match target {
        AccessTarget::Default => {
            host.set_default_access(access);
            klog!(Debug, "d{}: default access -> {}", domain.id(), access);
            return Ok(SetAccessProgress::Done);
        }
        AccessTarget::Frame(gfn) => gfn,
    };

    let host_guard = host.lock(unit, "p2m_set_mem_access");
    let view_guard = view.as_ref().map(|v| v.lock(unit, "p2m_set_mem_access"));

    let mut start = start;
    while nr > start {
        set_one(
            &host_guard,
            view_guard.as_ref(),
            first.offset(start as u64),
            access,
        )?;
        start += 1;
        if nr > start && start & mask == 0 && unit.preempt_check() {
            return Ok(SetAccessProgress::Preempted(start));
        }
    }
    Ok(SetAccessProgress::Done)
}

/// Set the access of a single frame, or of the default.
pub fn set_access(
    unit: &ExecUnit,
    domain: &Domain,
    target: AccessTarget,
    access_code: u8,
    altp2m_idx: usize,
) -> Result<(), MemAccessError> {
    set_access_range(unit, domain, target, 1, 0, 0, access_code, altp2m_idx).map(|_| ())
}

/// Set the access of the frames in `gfns[start..nr]` to the matching entries
/// of `accesses`.
///
/// A copy failure stops the walk with [`MemAccessError::Fault`]; frames
/// already processed keep their new access.
#[allow(clippy::too_many_arguments)]
pub fn set_access_multi<G, A>(
    unit: &ExecUnit,
    domain: &Domain,
    gfns: &G,
    accesses: &A,
    nr: u32,
    start: u32,
    mask: u32,
    altp2m_idx: usize,
) -> Result<SetAccessProgress, MemAccessError>
where
    G: GuestArray<u64> + ?Sized,
    A: GuestArray<u8> + ?Sized,
{
    let view = target_view(unit, domain, altp2m_idx)?;
    let host = domain.host_p2m();

    let host_guard = host.lock(unit, "p2m_set_mem_access_multi");
    let view_guard = view
        .as_ref()
        .map(|v| v.lock(unit, "p2m_set_mem_access_multi"));

    let mut start = start;
    while start < nr {
        let gfn = Gfn(gfns.copy_from_guest_offset(start)?);
        let code = accesses.copy_from_guest_offset(start)?;
        let access = convert_access(host, code)?;
        set_one(&host_guard, view_guard.as_ref(), gfn, access)?;
        start += 1;
        if nr > start && start & mask == 0 && unit.preempt_check() {
            return Ok(SetAccessProgress::Preempted(start));
        }
    }
    Ok(SetAccessProgress::Done)
}

/// Require (or stop requiring) a listener for access faults.
///
/// Applies to the host table and, while alternate views are active, to
/// every populated view. The domain must be paused.
pub fn set_access_required(unit: &ExecUnit, domain: &Domain, required: bool) {
    assert!(
        domain.is_paused(),
        "d{}: set_access_required on running domain",
        domain.id()
    );
    domain.host_p2m().set_access_required(required);
    if domain.altp2m_active() {
        domain
            .altp2m()
            .for_each_view(unit, |view| view.set_access_required(required));
    }
}
