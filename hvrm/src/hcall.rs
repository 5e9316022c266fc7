//! Hypercall ABI of the real-mode handlers.
//!
//! The guest issues a hypercall with the opcode in r3 and the arguments in
//! r4 onwards. On return r3 holds the [`HcallStatus`] and r4 an optional
//! result value.
//!
//! Only the hypercalls listed in [`HcallOpcode`] are served in real mode.
//! Anything else, and anything a handler reports as
//! [`HvError::TooHard`], goes back to the caller to be handled in virtual
//! mode.

use crate::{
    host::HostThreadState,
    tce_hcalls::{h_get_tce, h_put_tce, h_put_tce_indirect, h_stuff_tce, TceContext},
    vcore::{h_confer, Timebase},
    HcallStatus, HvError,
};

/// Opcodes handled in real mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u64)]
pub enum HcallOpcode {
    /// H_GET_TCE.
    GetTce = 0x1c,
    /// H_PUT_TCE.
    PutTce = 0x20,
    /// H_CONFER.
    Confer = 0xe4,
    /// H_PUT_TCE_INDIRECT.
    PutTceIndirect = 0x134,
    /// H_STUFF_TCE.
    StuffTce = 0x138,
    /// H_RANDOM.
    Random = 0x300,
}

/// Returns whether `cmd` has a real-mode handler.
pub fn is_realmode_hcall(cmd: u64) -> bool {
    HcallOpcode::try_from(cmd).is_ok()
}

/// Hardware random number generator.
pub trait HwRng {
    /// Read a random number, or `None` if the generator is unavailable.
    fn get_random(&self) -> Option<u64>;
}

/// Supported hypercalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hypercall {
    /// Read one TCE.
    ///
    /// r3 = 0x1c.
    GetTce {
        /// Bus number. Provides on r4.
        liobn: u64,
        /// I/O address. Provides on r5.
        ioba: u64,
    },
    /// Write one TCE.
    ///
    /// r3 = 0x20.
    PutTce {
        /// Bus number. Provides on r4.
        liobn: u64,
        /// I/O address. Provides on r5.
        ioba: u64,
        /// New entry. Provides on r6.
        tce: u64,
    },
    /// Yield to another thread of the vcore.
    ///
    /// r3 = 0xe4.
    Confer {
        /// Target vcpu, -1 for any. Provides on r4.
        target: i64,
        /// Dispatch count of the target. Provides on r5.
        yield_count: u32,
    },
    /// Write TCEs from a list in guest memory.
    ///
    /// r3 = 0x134.
    PutTceIndirect {
        /// Bus number. Provides on r4.
        liobn: u64,
        /// I/O address of the first entry. Provides on r5.
        ioba: u64,
        /// Guest physical address of the list. Provides on r6.
        tce_list: u64,
        /// Number of entries. Provides on r7.
        npages: u64,
    },
    /// Clear a range of TCEs.
    ///
    /// r3 = 0x138.
    StuffTce {
        /// Bus number. Provides on r4.
        liobn: u64,
        /// I/O address of the first entry. Provides on r5.
        ioba: u64,
        /// Value to store. Provides on r6.
        tce_value: u64,
        /// Number of entries. Provides on r7.
        npages: u64,
    },
    /// Read a hardware random number.
    ///
    /// r3 = 0x300.
    Random,
}

impl Hypercall {
    /// Resolve the requested hypercall from the guest's registers.
    pub fn resolve(gprs: &[u64; 32]) -> Option<Self> {
        let hc = match HcallOpcode::try_from(gprs[3]).ok()? {
            HcallOpcode::GetTce => Hypercall::GetTce {
                liobn: gprs[4],
                ioba: gprs[5],
            },
            HcallOpcode::PutTce => Hypercall::PutTce {
                liobn: gprs[4],
                ioba: gprs[5],
                tce: gprs[6],
            },
            HcallOpcode::Confer => Hypercall::Confer {
                target: gprs[4] as i64,
                yield_count: gprs[5] as u32,
            },
            HcallOpcode::PutTceIndirect => Hypercall::PutTceIndirect {
                liobn: gprs[4],
                ioba: gprs[5],
                tce_list: gprs[6],
                npages: gprs[7],
            },
            HcallOpcode::StuffTce => Hypercall::StuffTce {
                liobn: gprs[4],
                ioba: gprs[5],
                tce_value: gprs[6],
                npages: gprs[7],
            },
            HcallOpcode::Random => Hypercall::Random,
        };
        Some(hc)
    }
}

/// Everything a real-mode hypercall may touch.
pub struct RealMode<'a> {
    /// TCE state of the VM.
    pub tce: TceContext<'a>,
    /// The hardware thread running the hypercall.
    pub thread: &'a HostThreadState,
    /// Processor timebase.
    pub timebase: &'a dyn Timebase,
    /// Hardware RNG, if the platform has one.
    pub rng: Option<&'a dyn HwRng>,
}

impl RealMode<'_> {
    /// Run `hc` and return the value destined for r4, if any.
    pub fn handle(&self, hc: Hypercall) -> Result<Option<u64>, HvError> {
        match hc {
            Hypercall::GetTce { liobn, ioba } => h_get_tce(&self.tce, liobn, ioba).map(Some),
            Hypercall::PutTce { liobn, ioba, tce } => {
                h_put_tce(&self.tce, liobn, ioba, tce).map(|_| None)
            }
            Hypercall::PutTceIndirect {
                liobn,
                ioba,
                tce_list,
                npages,
            } => h_put_tce_indirect(&self.tce, liobn, ioba, tce_list, npages).map(|_| None),
            Hypercall::StuffTce {
                liobn,
                ioba,
                tce_value,
                npages,
            } => h_stuff_tce(&self.tce, liobn, ioba, tce_value, npages).map(|_| None),
            Hypercall::Confer { .. } => h_confer(self.thread, self.timebase).map(|_| None),
            Hypercall::Random => self
                .rng
                .and_then(|rng| rng.get_random())
                .map(Some)
                .ok_or(HvError::Hardware),
        }
    }
}

/// Serve the hypercall in `gprs` and write back its result.
///
/// Unknown opcodes are reported as [`HcallStatus::TooHard`] without
/// touching the registers, so virtual mode sees the original request.
pub fn dispatch(rm: &RealMode, gprs: &mut [u64; 32]) -> HcallStatus {
    let Some(hc) = Hypercall::resolve(gprs) else {
        log::debug!("hcall {:#x} has no real-mode handler", gprs[3]);
        return HcallStatus::TooHard;
    };
    let r = rm.handle(hc);
    let status = HcallStatus::from_result(&r);
    if let Err(HvError::TooHard) = r {
        log::debug!("{hc:?} left to virtual mode");
        return status;
    }
    if let Ok(Some(v)) = r {
        gprs[4] = v;
    }
    gprs[3] = i64::from(status) as u64;
    status
}
