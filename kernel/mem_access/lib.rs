//! Second-level memory access control.
//!
//! Per-frame permissions on top of the p2m tables in [`mm`], used by
//! introspection monitors to watch guest memory:
//!
//! - [`access`]: get/set of single frames, ranges and lists, with
//!   cooperative preemption for the bulk forms
//! - [`fault`]: resolution of access faults, including the self-upgrading
//!   `rx2rw`/`n2rwx` permissions and violation requests for the monitor
//! - [`check`]: violation checks for monitor-requested emulation
//! - [`control`]: the privileged control entry point
//!
//! Every entry point takes the calling [`cpu_local::ExecUnit`], which
//! carries the mm lock level checked by [`mm::lock_ordering`].

#![cfg_attr(not(test), no_std)]
extern crate alloc;

#[macro_use]
extern crate klog;

pub mod access;
pub mod check;
pub mod control;
pub mod domain;
pub mod error;
pub mod fault;
pub mod guest;

pub use access::{
    convert_access, get_access, p2m_get_access, set_access, set_access_multi, set_access_range,
    set_access_required, AccessTarget, SetAccessProgress,
};
pub use check::{emulate_check, is_violation, is_violation_code, VmEventResponse};
pub use control::{do_mem_access_op, MemAccessOp, MEMOP_PREEMPT_MASK};
pub use domain::{Domain, DomainConfig, Vcpu};
pub use error::MemAccessError;
pub use fault::{
    resolve_fault, Emulator, FaultDescriptor, FaultDisposition, FaultKind, MemAccessFlags,
    VmEventReason, ViolationRequest,
};
pub use guest::{GuestArray, GuestCopyError};
