//! Classification of a pending external interrupt.
//!
//! When a thread leaves the guest because of an external interrupt, it
//! accepts the interrupt from its ICP and decides who handles it: the host,
//! the guest (a wakeup IPI), or a passthrough device's guest directly.

use crate::{
    host::HostThreadState,
    icp::{IcpAccess, IPI_PRIORITY, MFRR_NONE, XICS_IPI, XICS_MFRR, XICS_XIRR, XISR_MASK},
    rcu::RcuList,
};
use core::sync::atomic::{fence, Ordering};
use crossbeam_epoch as epoch;

/// What kind of external interrupt is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(i64)]
pub enum PendingIntr {
    /// Nothing is pending.
    None = 0,
    /// The host must handle it.
    Host = 1,
    /// Delivered to a passthrough device's guest, but the host must complete
    /// it.
    PassthruNeedsHost = 2,
    /// A guest wakeup IPI, already cleared.
    GuestWakeup = -1,
    /// Delivered to a passthrough device's guest.
    PassthruDelivered = -2,
}

/// Route of a host interrupt to a guest interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqMapping {
    /// Host interrupt source number.
    pub r_hwirq: u32,
    /// Guest interrupt number.
    pub v_hwirq: u32,
}

/// Interrupts of passthrough devices routed straight to the guest.
///
/// Lookups take no lock. A lookup racing with [`PassthruMap::unmap`] may
/// miss the entry; the interrupt then takes the host's default path.
#[derive(Default)]
pub struct PassthruMap {
    irqs: RcuList<IrqMapping>,
}

impl PassthruMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route host source `r_hwirq` to guest interrupt `v_hwirq`.
    ///
    /// Returns `false` if `r_hwirq` is already routed.
    pub fn map(&self, r_hwirq: u32, v_hwirq: u32) -> bool {
        self.irqs
            .push_unless(IrqMapping { r_hwirq, v_hwirq }, |m| m.r_hwirq == r_hwirq)
            .is_ok()
    }

    /// Remove the route of `r_hwirq`.
    pub fn unmap(&self, r_hwirq: u32) -> bool {
        self.irqs.remove(|m| m.r_hwirq == r_hwirq)
    }

    /// Find the route of `xisr`.
    pub fn lookup(&self, xisr: u32) -> Option<IrqMapping> {
        let guard = epoch::pin();
        let found = self.irqs.iter(&guard).find(|m| m.r_hwirq == xisr).copied();
        found
    }
}

/// Injects a passthrough interrupt into the guest.
pub trait IrqDeliver {
    /// Deliver `irq`, accepted as `xirr`.
    ///
    /// Returns `true` if the interrupt was fully handled, `false` if the host
    /// still has to complete it.
    fn deliver(&self, xirr: u32, irq: &IrqMapping, path: u32) -> bool;
}

/// Accept and classify the external interrupt pending on `thread`.
pub fn read_intr(
    thread: &HostThreadState,
    icp: &dyn IcpAccess,
    passthru: Option<(&PassthruMap, &dyn IrqDeliver)>,
    path: u32,
) -> PendingIntr {
    if thread.host_ipi() {
        return PendingIntr::Host;
    }
    let Some(base) = thread.xics_phys() else {
        return PendingIntr::Host;
    };

    // Keep the accepted XIRR for the host's interrupt handler.
    let xirr = icp.read_u32(base + XICS_XIRR);
    thread.save_xirr(xirr);
    let xisr = xirr & XISR_MASK;
    fence(Ordering::SeqCst);

    if xisr == 0 {
        return PendingIntr::None;
    }

    if xisr == XICS_IPI {
        icp.write_u8(base + XICS_MFRR, MFRR_NONE);
        icp.write_u32(base + XICS_XIRR, xirr);
        fence(Ordering::SeqCst);

        // A host IPI may have been raised while we cleared ours.
        if thread.host_ipi() {
            log::warn!("cpu {}: raced with a host IPI, resending", thread.cpu());
            icp.write_u8(base + XICS_MFRR, IPI_PRIORITY);
            fence(Ordering::SeqCst);
            return PendingIntr::Host;
        }
        thread.save_xirr(0);
        return PendingIntr::GuestWakeup;
    }

    if let Some((pmap, deliverer)) = passthru {
        if let Some(irq) = pmap.lookup(xisr) {
            return if deliverer.deliver(xirr, &irq, path) {
                PendingIntr::PassthruDelivered
            } else {
                PendingIntr::PassthruNeedsHost
            };
        }
    }
    PendingIntr::Host
}
