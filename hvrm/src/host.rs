//! Per hardware thread state and the global HV activity counter.

use crate::{
    addressing::Hpa,
    vcore::{SplitMode, VcoreExitState},
};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// State a hardware thread keeps while it runs a guest.
pub struct HostThreadState {
    cpu: usize,
    ptid: u32,
    vcore: Arc<VcoreExitState>,
    split: Option<Arc<SplitMode>>,
    host_ipi: AtomicBool,
    xics_phys: Option<Hpa>,
    saved_xirr: AtomicU32,
}

impl HostThreadState {
    /// Create the state of thread `ptid` of `vcore`, running on `cpu`.
    pub fn new(cpu: usize, ptid: u32, vcore: Arc<VcoreExitState>) -> Self {
        Self {
            cpu,
            ptid,
            vcore,
            split: None,
            host_ipi: AtomicBool::new(false),
            xics_phys: None,
            saved_xirr: AtomicU32::new(0),
        }
    }

    /// Set the split-core layout this thread runs in.
    pub fn with_split(mut self, split: Arc<SplitMode>) -> Self {
        self.split = Some(split);
        self
    }

    /// Set the base address of this thread's interrupt controller.
    pub fn with_xics(mut self, base: Hpa) -> Self {
        self.xics_phys = Some(base);
        self
    }

    /// Physical CPU number.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Thread index within the vcore.
    pub fn ptid(&self) -> u32 {
        self.ptid
    }

    /// The vcore this thread runs.
    pub fn vcore(&self) -> &VcoreExitState {
        &self.vcore
    }

    /// Split-core layout, if the core is split.
    pub fn split(&self) -> Option<&SplitMode> {
        self.split.as_deref()
    }

    /// Interrupt controller base address.
    pub fn xics_phys(&self) -> Option<Hpa> {
        self.xics_phys
    }

    /// Returns whether the host has an IPI pending for this thread.
    pub fn host_ipi(&self) -> bool {
        self.host_ipi.load(Ordering::SeqCst)
    }

    /// Set or clear the pending host IPI flag.
    pub fn set_host_ipi(&self, pending: bool) {
        self.host_ipi.store(pending, Ordering::SeqCst);
    }

    /// XIRR saved for the host interrupt handler.
    pub fn saved_xirr(&self) -> u32 {
        self.saved_xirr.load(Ordering::Relaxed)
    }

    pub(crate) fn save_xirr(&self, xirr: u32) {
        self.saved_xirr.store(xirr, Ordering::Relaxed);
    }
}

/// Number of HV-mode VMs in the system.
///
/// Some host operations, such as onlining secondary threads, must be
/// refused while any VM exists.
pub struct HvActivity(AtomicUsize);

/// Activity of the host.
pub static HV_ACTIVITY: HvActivity = HvActivity::new();

impl HvActivity {
    /// Create a counter with no VM.
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// A VM was created.
    pub fn vm_activated(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// A VM was destroyed.
    pub fn vm_deactivated(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Returns whether any VM exists.
    pub fn mode_active(&self) -> bool {
        self.0.load(Ordering::SeqCst) != 0
    }
}

impl Default for HvActivity {
    fn default() -> Self {
        Self::new()
    }
}
