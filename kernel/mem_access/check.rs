//! Violation checks for the emulation path.
//!
//! When the monitor asks for an instruction to be emulated, the emulator
//! must still raise events for accesses the current permissions forbid.

use cpu_local::ExecUnit;
use mm::{AccessRights, Gfn, Perms};

use crate::access::{p2m_get_access, AccessTarget};
use crate::domain::{Domain, Vcpu};
use crate::fault::MemAccessFlags;

/// Monitor reply to a mem-access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmEventResponse {
    pub vcpu_id: u32,
    pub gfn: Gfn,
    pub flags: MemAccessFlags,
}

/// Would an access of kind `attempted` violate `access`?
pub fn is_violation(access: AccessRights, attempted: MemAccessFlags) -> bool {
    attempted.attempted().intersects(!access.effective())
}

/// [`is_violation`] on a raw access code. Unknown codes forbid everything.
pub fn is_violation_code(code: u8, attempted: MemAccessFlags) -> bool {
    match AccessRights::from_code(code) {
        Some(access) => is_violation(access, attempted),
        None => attempted.attempted().intersects(Perms::all()),
    }
}

/// Does the access described by `rsp` violate the current permissions of
/// its frame in the view `vcpu` runs on? A failed lookup counts as a
/// violation.
pub fn emulate_check(
    unit: &ExecUnit,
    domain: &Domain,
    vcpu: &Vcpu,
    rsp: &VmEventResponse,
) -> bool {
    let table = domain.vcpu_p2m(unit, vcpu);
    match p2m_get_access(unit, &table, AccessTarget::Frame(rsp.gfn)) {
        Ok(access) => is_violation(access, rsp.flags),
        Err(_) => true,
    }
}
