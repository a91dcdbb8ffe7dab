//! Domain and vCPU state consumed by the mem-access engine.
//!
//! Only the parts of a domain that access control reads or flips live here:
//! the host table, the alternate views, monitor/altp2m toggles, pause
//! counting and the crash flag.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use cpu_local::ExecUnit;
use mm::{AltP2mSet, DomainId, P2mBackend, P2mKind, P2mTable};

use crate::error::MemAccessError;

/// Static configuration of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainConfig {
    pub id: DomainId,
    /// Control domain; its mm locks are biased above every guest's.
    pub is_control: bool,
    /// Hardware virtualized guest
    pub hvm: bool,
    /// Hardware-assisted paging enabled
    pub hap: bool,
    /// Host CPU is VMX-capable
    pub vmx: bool,
    /// Highest GFN the guest may have mapped.
    pub max_gpfn: u64,
}

impl DomainConfig {
    /// HVM guest with HAP on a VMX host.
    pub const fn hvm_guest(id: DomainId, max_gpfn: u64) -> Self {
        Self {
            id,
            is_control: false,
            hvm: true,
            hap: true,
            vmx: true,
            max_gpfn,
        }
    }
}

/// A guest domain.
pub struct Domain {
    config: DomainConfig,
    host: Arc<P2mTable>,
    altp2m: AltP2mSet,
    altp2m_active: AtomicBool,
    monitor_attached: AtomicBool,
    inguest_pagefault_disabled: AtomicBool,
    pause_count: AtomicU32,
    crashed: AtomicBool,
}

impl Domain {
    pub fn new(config: DomainConfig, host_backend: Box<dyn P2mBackend>) -> Self {
        Self {
            config,
            host: Arc::new(P2mTable::new(
                config.id,
                config.is_control,
                P2mKind::Host,
                host_backend,
            )),
            altp2m: AltP2mSet::new(config.is_control),
            altp2m_active: AtomicBool::new(false),
            monitor_attached: AtomicBool::new(false),
            inguest_pagefault_disabled: AtomicBool::new(false),
            pause_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.config.id
    }

    #[inline]
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.config.is_control
    }

    #[inline]
    pub fn host_p2m(&self) -> &Arc<P2mTable> {
        &self.host
    }

    #[inline]
    pub fn altp2m(&self) -> &AltP2mSet {
        &self.altp2m
    }

    pub fn altp2m_active(&self) -> bool {
        self.altp2m_active.load(Ordering::Acquire)
    }

    pub fn set_altp2m_active(&self, active: bool) {
        if self.altp2m_active.swap(active, Ordering::AcqRel) != active {
            klog_always!(
                "d{}: altp2m {}",
                self.id(),
                if active { "enabled" } else { "disabled" }
            );
        }
    }

    /// Is a vm_event monitor listening on this domain?
    pub fn monitor_attached(&self) -> bool {
        self.monitor_attached.load(Ordering::Acquire)
    }

    pub fn set_monitor_attached(&self, attached: bool) {
        self.monitor_attached.store(attached, Ordering::Release);
    }

    /// Are access events raised while walking guest page tables suppressed?
    pub fn inguest_pagefault_disabled(&self) -> bool {
        self.inguest_pagefault_disabled.load(Ordering::Acquire)
    }

    pub fn set_inguest_pagefault_disabled(&self, disabled: bool) {
        self.inguest_pagefault_disabled
            .store(disabled, Ordering::Release);
    }

    pub fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpause(&self) {
        let old = self.pause_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "d{}: unpause with pause count already 0", self.id());
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::Acquire) > 0
    }

    /// Mark the domain crashed. The host keeps running.
    pub fn crash(&self) {
        if !self.crashed.swap(true, Ordering::AcqRel) {
            klog!(Error, "d{}: domain crashed", self.id());
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Can mem-access be used on this domain at all?
    pub fn mem_access_sanity_check(&self) -> bool {
        self.config.hvm && self.config.hap && self.config.vmx
    }

    /// Create alternate view `idx` on top of `backend`.
    ///
    /// The view starts out with the host table's default access and
    /// `access_required` setting.
    pub fn altp2m_init_view(
        &self,
        unit: &ExecUnit,
        idx: usize,
        backend: Box<dyn P2mBackend>,
    ) -> Result<(), MemAccessError> {
        if !mm::altp2m::index_in_range(idx) {
            return Err(MemAccessError::InvalidArgument);
        }
        let table = P2mTable::new(
            self.id(),
            self.is_control(),
            P2mKind::Alternate(idx as u16),
            backend,
        );
        table.set_default_access(self.host.default_access());
        table.set_access_required(self.host.access_required());
        self.altp2m.init_view(unit, idx, Arc::new(table))?;
        Ok(())
    }

    /// Remove alternate view `idx`. The domain must be paused.
    pub fn altp2m_destroy_view(&self, unit: &ExecUnit, idx: usize) -> Result<(), MemAccessError> {
        self.altp2m.destroy_view(unit, idx, self.is_paused())?;
        Ok(())
    }

    /// Populated alternate view `idx` (never the host view).
    pub fn alternate_view(
        &self,
        unit: &ExecUnit,
        idx: usize,
    ) -> Result<Arc<P2mTable>, MemAccessError> {
        Ok(self.altp2m.get(unit, idx)?)
    }

    /// Table `vcpu` currently translates through.
    pub fn vcpu_p2m(&self, unit: &ExecUnit, vcpu: &Vcpu) -> Arc<P2mTable> {
        if self.altp2m_active() {
            if let Ok(view) = self.altp2m.get(unit, vcpu.active_view()) {
                return view;
            }
        }
        Arc::clone(&self.host)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("config", &self.config)
            .field("altp2m_active", &self.altp2m_active())
            .field("monitor_attached", &self.monitor_attached())
            .field("paused", &self.is_paused())
            .field("crashed", &self.is_crashed())
            .finish()
    }
}

/// A virtual CPU of a domain.
#[derive(Debug)]
pub struct Vcpu {
    id: u32,
    view: AtomicUsize,
    send_event: AtomicBool,
}

impl Vcpu {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            view: AtomicUsize::new(0),
            send_event: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Index of the view this vCPU runs on; 0 is the host view.
    #[inline]
    pub fn active_view(&self) -> usize {
        self.view.load(Ordering::Acquire)
    }

    /// Move this vCPU onto view `idx` of `domain`.
    pub fn switch_view(
        &self,
        unit: &ExecUnit,
        domain: &Domain,
        idx: usize,
    ) -> Result<(), MemAccessError> {
        if !domain.altp2m_active() {
            return Err(MemAccessError::InvalidArgument);
        }
        if idx != 0 {
            domain.alternate_view(unit, idx)?;
        }
        self.view.store(idx, Ordering::Release);
        Ok(())
    }

    /// Is an emulation in progress that must still raise access events?
    pub fn send_event(&self) -> bool {
        self.send_event.load(Ordering::Acquire)
    }

    pub(crate) fn set_send_event(&self, send: bool) {
        self.send_event.store(send, Ordering::Release);
    }
}
