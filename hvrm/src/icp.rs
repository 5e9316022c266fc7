//! Interrupt controller presentation (ICP) registers.
//!
//! Each hardware thread has its own ICP, reached with cache-inhibited
//! accesses at a physical base address. Only three registers matter here.

use crate::addressing::Hpa;
use spin_lock::SpinLock;
use std::collections::BTreeMap;

/// Offset of the XIRR word: reading it accepts the pending interrupt,
/// writing it back signals end of interrupt.
pub const XICS_XIRR: u64 = 4;
/// Offset of the MFRR byte: the priority of the pending IPI, 0xff for none.
pub const XICS_MFRR: u64 = 0xc;
/// Interrupt source number of an IPI.
pub const XICS_IPI: u32 = 2;
/// Priority written to MFRR to raise an IPI.
pub const IPI_PRIORITY: u8 = 4;
/// MFRR value that retracts an IPI.
pub const MFRR_NONE: u8 = 0xff;
/// Mask of the source number within XIRR.
pub const XISR_MASK: u32 = 0xff_ffff;

/// Cache-inhibited access to ICP registers.
pub trait IcpAccess: Send + Sync {
    /// Load a word.
    fn read_u32(&self, pa: Hpa) -> u32;
    /// Store a byte.
    fn write_u8(&self, pa: Hpa, val: u8);
    /// Store a word.
    fn write_u32(&self, pa: Hpa, val: u32);
}

/// A store observed by [`SoftIcp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IcpWrite {
    /// Byte store.
    U8(Hpa, u8),
    /// Word store.
    U32(Hpa, u32),
}

/// ICP model that records every store.
///
/// Reading XIRR returns the interrupt queued with [`SoftIcp::raise`] and
/// clears it, like accepting an interrupt does.
#[derive(Default)]
pub struct SoftIcp {
    pending: SpinLock<BTreeMap<u64, u32>>,
    writes: SpinLock<Vec<IcpWrite>>,
}

impl SoftIcp {
    /// Create an ICP model with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `xirr` on the ICP at `base`.
    pub fn raise(&self, base: Hpa, xirr: u32) {
        self.pending.lock().insert(base.into_u64(), xirr);
    }

    /// Stores observed so far.
    pub fn writes(&self) -> Vec<IcpWrite> {
        self.writes.lock().clone()
    }
}

impl IcpAccess for SoftIcp {
    fn read_u32(&self, pa: Hpa) -> u32 {
        let base = pa.into_u64() - XICS_XIRR;
        self.pending.lock().remove(&base).unwrap_or(0)
    }

    fn write_u8(&self, pa: Hpa, val: u8) {
        self.writes.lock().push(IcpWrite::U8(pa, val));
    }

    fn write_u32(&self, pa: Hpa, val: u32) {
        self.writes.lock().push(IcpWrite::U32(pa, val));
    }
}
