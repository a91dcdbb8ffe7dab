//! Access-fault handling.
//!
//! [`resolve_fault`] runs on the faulting vCPU after a second-level
//! translation fault that the p2m type allowed but the access did not.
//!
//! # Flow
//!
//! ```text
//! lock view ─► rx2rw + write?  ── yes ─► set rw, Resolved
//!     │
//!     ├─► n2rwx? ── yes ─► set rwx (continue)
//! unlock
//!     │
//!     ├─► no monitor ─► access_required? ─► crash domain
//!     │                  └─ else relax to rwx, Resolved
//!     ├─► in-guest page walk with walk events disabled ─► emulate
//!     └─► Notify { request, pause: access != n2rwx }
//! ```

use bitflags::bitflags;
use cpu_local::ExecUnit;
use mm::{AccessRights, Gfn, P2mEntry, P2mLockGuard, Perms, PAGE_ORDER_4K, PAGE_SIZE};
use x86_64::{PhysAddr, VirtAddr};

use crate::domain::{Domain, Vcpu};

bitflags! {
    /// Flags of a mem-access event, in both directions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemAccessFlags: u32 {
        const R              = 1 << 0;
        const W              = 1 << 1;
        const X              = 1 << 2;
        const GLA_VALID      = 1 << 3;
        const FAULT_WITH_GLA = 1 << 4;
        const FAULT_IN_GPT   = 1 << 5;
    }
}

impl MemAccessFlags {
    /// Attempted access as permission bits.
    pub fn attempted(self) -> Perms {
        let mut perms = Perms::empty();
        perms.set(Perms::READ, self.contains(Self::R));
        perms.set(Perms::WRITE, self.contains(Self::W));
        perms.set(Perms::EXEC, self.contains(Self::X));
        perms
    }
}

/// What the CPU was doing when the fault was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No linear-address information
    Unknown,
    /// Access to the final linear address
    WithGla,
    /// Access made while walking the guest's page tables
    InGpt,
}

/// Decoded nested page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultDescriptor {
    pub read: bool,
    pub write: bool,
    pub insn_fetch: bool,
    pub gla_valid: bool,
    pub kind: FaultKind,
}

impl FaultDescriptor {
    fn flags(&self) -> MemAccessFlags {
        let mut flags = MemAccessFlags::empty();
        flags.set(MemAccessFlags::R, self.read);
        flags.set(MemAccessFlags::W, self.write);
        flags.set(MemAccessFlags::X, self.insn_fetch);
        flags.set(MemAccessFlags::GLA_VALID, self.gla_valid);
        match self.kind {
            FaultKind::WithGla => flags |= MemAccessFlags::FAULT_WITH_GLA,
            FaultKind::InGpt => flags |= MemAccessFlags::FAULT_IN_GPT,
            FaultKind::Unknown => {}
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEventReason {
    MemAccess,
}

/// Event handed to the monitor for an access violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationRequest {
    pub reason: VmEventReason,
    pub vcpu_id: u32,
    pub altp2m_idx: u16,
    pub gfn: Gfn,
    /// Byte offset of the access within the frame
    pub offset: u64,
    pub gla: Option<VirtAddr>,
    pub flags: MemAccessFlags,
}

/// Result of [`resolve_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Permissions were widened; retry the access.
    Resolved,
    /// The instruction was emulated.
    Emulated,
    /// Policy could not be enforced; the domain was crashed.
    DomainCrashed,
    /// Send `request` to the monitor; pause the vCPU until it answers if
    /// `pause` is set.
    Notify {
        request: ViolationRequest,
        pause: bool,
    },
}

impl FaultDisposition {
    /// Was the fault dealt with without monitor involvement?
    pub fn handled(&self) -> bool {
        matches!(self, FaultDisposition::Resolved | FaultDisposition::Emulated)
    }

    pub fn pause_required(&self) -> bool {
        matches!(self, FaultDisposition::Notify { pause: true, .. })
    }

    pub fn request(&self) -> Option<&ViolationRequest> {
        match self {
            FaultDisposition::Notify { request, .. } => Some(request),
            _ => None,
        }
    }
}

/// Instruction emulator used when events from guest page walks are
/// suppressed.
pub trait Emulator {
    /// Emulate the current instruction of `vcpu`, injecting #UD if it cannot
    /// be emulated.
    fn emulate_one(&self, vcpu: &Vcpu);
}

/// Write an entry that was just read under the same lock.
fn update_locked(guard: &P2mLockGuard<'_>, gfn: Gfn, entry: P2mEntry) {
    if let Err(e) = guard.set_entry(gfn, entry, PAGE_ORDER_4K) {
        klog_force!(
            "d{}: p2m update of locked gfn {} failed: {}",
            guard.table().domain_id(),
            gfn,
            e
        );
        panic!("p2m update of locked gfn {} failed: {}", gfn, e);
    }
}

/// Handle an access fault on `gpa` taken by `vcpu`.
pub fn resolve_fault(
    unit: &ExecUnit,
    domain: &Domain,
    vcpu: &Vcpu,
    gpa: PhysAddr,
    gla: VirtAddr,
    fault: &FaultDescriptor,
    emulator: &dyn Emulator,
) -> FaultDisposition {
    let gfn = Gfn::containing(gpa);
    let table = domain.vcpu_p2m(unit, vcpu);

    let access = {
        let guard = table.lock(unit, "p2m_mem_access_check");
        let entry = guard.get_entry(gfn);
        let access = entry.and_then(|e| e.access());
        if let Some(entry) = entry {
            if fault.write && access == Some(AccessRights::RX2RW) {
                update_locked(&guard, gfn, entry.with_access(AccessRights::RW));
                klog!(Debug, "d{}v{}: gfn {} rx2rw -> rw", domain.id(), vcpu.id(), gfn);
                return FaultDisposition::Resolved;
            }
            if access == Some(AccessRights::N2RWX) {
                debug_assert!(fault.read || fault.write || fault.insn_fetch);
                update_locked(&guard, gfn, entry.with_access(AccessRights::RWX));
                klog!(Debug, "d{}v{}: gfn {} n2rwx -> rwx", domain.id(), vcpu.id(), gfn);
            }
        }
        access
    };

    if !domain.monitor_attached() {
        if table.access_required() {
            klog!(
                Warn,
                "d{}v{}: mem_access fault at gfn {} with no vm_event listener",
                domain.id(),
                vcpu.id(),
                gfn
            );
            domain.crash();
            return FaultDisposition::DomainCrashed;
        }
        // No listener and none required: drop the restriction.
        let guard = table.lock(unit, "p2m_mem_access_check");
        if let Some(entry) = guard.get_entry(gfn) {
            if entry.access() != Some(AccessRights::N2RWX) {
                update_locked(&guard, gfn, entry.with_access(AccessRights::RWX));
            }
        }
        return FaultDisposition::Resolved;
    }

    if domain.inguest_pagefault_disabled() && fault.kind == FaultKind::InGpt {
        vcpu.set_send_event(true);
        emulator.emulate_one(vcpu);
        vcpu.set_send_event(false);
        return FaultDisposition::Emulated;
    }

    let request = ViolationRequest {
        reason: VmEventReason::MemAccess,
        vcpu_id: vcpu.id(),
        altp2m_idx: table.kind().view_index(),
        gfn,
        offset: gpa.as_u64() & (PAGE_SIZE - 1),
        gla: fault.gla_valid.then_some(gla),
        flags: fault.flags(),
    };
    FaultDisposition::Notify {
        request,
        pause: access != Some(AccessRights::N2RWX),
    }
}
