//! Waking other hardware threads from real mode.
//!
//! Threads of the same core can be reached with a doorbell message when the
//! processor supports it. Any other thread is poked by raising an IPI in its
//! ICP. Callers order their memory updates before the notification.

use crate::{
    config::PlatformConfig,
    icp::{IcpAccess, IPI_PRIORITY, XICS_MFRR},
};

/// Doorbell message type addressing a thread of the same core.
pub const DBELL_TYPE_SERVER: u64 = 5;

/// Build a server doorbell message for `thread` of the current core.
#[inline]
pub const fn dbell_server_msg(thread: usize) -> u64 {
    (DBELL_TYPE_SERVER << 27) | thread as u64
}

/// Sends a notification to another hardware thread.
pub trait IpiSender {
    /// Interrupt `cpu`.
    fn send_ipi(&self, cpu: usize);
}

/// Same-core doorbell instruction.
pub trait Doorbell: Send + Sync {
    /// Send doorbell message `msg`.
    fn msgsnd(&self, msg: u64);
}

/// Sends IPIs the way the host platform can from real mode.
pub struct PlatformIpi<'a> {
    config: &'a PlatformConfig,
    icp: &'a dyn IcpAccess,
    doorbell: &'a dyn Doorbell,
    this_cpu: usize,
}

impl<'a> PlatformIpi<'a> {
    /// Create a sender running on `this_cpu`.
    pub fn new(
        config: &'a PlatformConfig,
        icp: &'a dyn IcpAccess,
        doorbell: &'a dyn Doorbell,
        this_cpu: usize,
    ) -> Self {
        Self {
            config,
            icp,
            doorbell,
            this_cpu,
        }
    }
}

impl IpiSender for PlatformIpi<'_> {
    fn send_ipi(&self, cpu: usize) {
        let cfg = self.config;
        if cfg.has_doorbells()
            && cfg.first_thread_sibling(cpu) == cfg.first_thread_sibling(self.this_cpu)
        {
            self.doorbell.msgsnd(dbell_server_msg(cfg.thread_in_core(cpu)));
            return;
        }
        match cfg.xics_base(cpu) {
            Some(base) => self.icp.write_u8(base + XICS_MFRR, IPI_PRIORITY),
            None => log::warn!("cpu {cpu}: no interrupt controller to send an IPI to"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::Hpa,
        icp::{IcpWrite, SoftIcp},
    };
    use spin_lock::SpinLock;

    #[derive(Default)]
    struct Msgs(SpinLock<Vec<u64>>);

    impl Doorbell for Msgs {
        fn msgsnd(&self, msg: u64) {
            self.0.lock().push(msg);
        }
    }

    #[test]
    fn doorbell_within_core() {
        let cfg = PlatformConfig::default()
            .threads_per_core(4)
            .xics_phys((0..8).map(|c| Some(Hpa::new(0x1000_0000 + c * 0x1000))).collect());
        let icp = SoftIcp::new();
        let msgs = Msgs::default();
        let ipi = PlatformIpi::new(&cfg, &icp, &msgs, 1);

        ipi.send_ipi(3);
        ipi.send_ipi(5);
        assert_eq!(*msgs.0.lock(), [dbell_server_msg(3)]);
        assert_eq!(
            icp.writes(),
            [IcpWrite::U8(Hpa::new(0x1000_500c), IPI_PRIORITY)]
        );

        let cfg = cfg.doorbells(false);
        let ipi = PlatformIpi::new(&cfg, &icp, &msgs, 1);
        ipi.send_ipi(2);
        assert_eq!(icp.writes().len(), 2);
        assert_eq!(msgs.0.lock().len(), 1);
    }
}
