//! Hardware IOMMU tables of device groups attached to a virtual bus.
//!
//! A passthrough device sits behind a real IOMMU table. When the guest
//! updates a TCE on a bus that has such groups attached, the new mapping must
//! be installed into every group's table as well. [`IommuTable`] is the seam
//! to that platform table; [`SoftIommuTable`] is an in-memory implementation.

use crate::{
    addressing::{Hpa, Ua},
    tce::{DmaDirection, TceFlags},
};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Failures reported by an IOMMU table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IommuError {
    /// The request does not fit the table's geometry.
    #[error("request does not fit the iommu window")]
    Invalid,
    /// The table could not perform the exchange right now.
    #[error("iommu entry exchange failed")]
    Busy,
}

/// A hardware translation table shared by one or more device groups.
pub trait IommuTable: Send + Sync {
    /// Page shift of one IOMMU page.
    fn page_shift(&self) -> u32;

    /// Atomically install `hpa`/`dir` at `entry` and return the previous
    /// mapping.
    fn exchange(
        &self,
        entry: u64,
        hpa: Hpa,
        dir: DmaDirection,
    ) -> Result<(Hpa, DmaDirection), IommuError>;

    /// Check that `tce_value` may be stuffed into `npages` entries at `ioba`.
    fn clear_param_check(&self, ioba: u64, tce_value: u64, npages: u64)
        -> Result<(), IommuError>;

    /// Check that `gpa` may be mapped at `ioba`.
    fn put_param_check(&self, ioba: u64, gpa: u64) -> Result<(), IommuError>;

    /// Slot recording the userspace address currently mapped at `entry`.
    ///
    /// Returns `None` if the table keeps no such record.
    fn userspace_entry(&self, entry: u64) -> Option<&AtomicU64>;
}

/// IOMMU table kept entirely in memory.
///
/// Each entry packs the host physical address with the direction bits, and is
/// swapped with a single atomic exchange.
pub struct SoftIommuTable {
    page_shift: u32,
    offset: u64,
    entries: Box<[AtomicU64]>,
    userspace: Box<[AtomicU64]>,
    reject_puts: AtomicBool,
    fail_exchange: AtomicBool,
}

impl SoftIommuTable {
    /// Create a table covering entries `[offset, offset + size)`.
    pub fn new(page_shift: u32, offset: u64, size: u64) -> Self {
        Self {
            page_shift,
            offset,
            entries: (0..size).map(|_| AtomicU64::new(0)).collect(),
            userspace: (0..size).map(|_| AtomicU64::new(0)).collect(),
            reject_puts: AtomicBool::new(false),
            fail_exchange: AtomicBool::new(false),
        }
    }

    /// Make every subsequent [`IommuTable::put_param_check`] fail.
    pub fn reject_puts(&self, reject: bool) {
        self.reject_puts.store(reject, Ordering::SeqCst);
    }

    /// Make every subsequent [`IommuTable::exchange`] fail.
    pub fn fail_exchange(&self, fail: bool) {
        self.fail_exchange.store(fail, Ordering::SeqCst);
    }

    /// Current mapping at `entry`.
    pub fn mapping(&self, entry: u64) -> Option<(Hpa, DmaDirection)> {
        self.slot(entry)
            .map(|e| Self::unpack(e.load(Ordering::Acquire)))
    }

    /// Userspace address recorded at `entry`.
    pub fn recorded_ua(&self, entry: u64) -> Option<Ua> {
        self.userspace_entry(entry)
            .map(|ua| Ua::new(ua.load(Ordering::Acquire)))
    }

    fn slot(&self, entry: u64) -> Option<&AtomicU64> {
        entry
            .checked_sub(self.offset)
            .and_then(|i| self.entries.get(i as usize))
    }

    fn unpack(v: u64) -> (Hpa, DmaDirection) {
        (
            Hpa::new(v & !TceFlags::all().bits()),
            TceFlags::from_bits_truncate(v).into(),
        )
    }

    fn window_check(&self, ioba: u64, npages: u64) -> Result<(), IommuError> {
        let mask = (1u64 << self.page_shift) - 1;
        if ioba & mask != 0 {
            return Err(IommuError::Invalid);
        }
        let idx = ioba >> self.page_shift;
        if idx < self.offset || idx + npages > self.offset + self.entries.len() as u64 {
            return Err(IommuError::Invalid);
        }
        Ok(())
    }
}

impl IommuTable for SoftIommuTable {
    fn page_shift(&self) -> u32 {
        self.page_shift
    }

    fn exchange(
        &self,
        entry: u64,
        hpa: Hpa,
        dir: DmaDirection,
    ) -> Result<(Hpa, DmaDirection), IommuError> {
        if self.fail_exchange.load(Ordering::SeqCst) {
            return Err(IommuError::Busy);
        }
        let slot = self.slot(entry).ok_or(IommuError::Invalid)?;
        let new = if dir.is_none() {
            0
        } else {
            hpa.into_u64() | dir.flags().bits()
        };
        Ok(Self::unpack(slot.swap(new, Ordering::AcqRel)))
    }

    fn clear_param_check(
        &self,
        ioba: u64,
        tce_value: u64,
        npages: u64,
    ) -> Result<(), IommuError> {
        if tce_value != 0 {
            return Err(IommuError::Invalid);
        }
        self.window_check(ioba, npages)
    }

    fn put_param_check(&self, ioba: u64, gpa: u64) -> Result<(), IommuError> {
        if self.reject_puts.load(Ordering::SeqCst) {
            return Err(IommuError::Invalid);
        }
        if gpa & ((1u64 << self.page_shift) - 1) != 0 {
            return Err(IommuError::Invalid);
        }
        self.window_check(ioba, 1)
    }

    fn userspace_entry(&self, entry: u64) -> Option<&AtomicU64> {
        entry
            .checked_sub(self.offset)
            .and_then(|i| self.userspace.get(i as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_returns_previous() {
        let tbl = SoftIommuTable::new(12, 0, 16);
        assert_eq!(
            tbl.exchange(3, Hpa::new(0x8000), DmaDirection::Bidirectional),
            Ok((Hpa::ZERO, DmaDirection::None))
        );
        assert_eq!(
            tbl.exchange(3, Hpa::ZERO, DmaDirection::None),
            Ok((Hpa::new(0x8000), DmaDirection::Bidirectional))
        );
        assert_eq!(tbl.mapping(3), Some((Hpa::ZERO, DmaDirection::None)));
        assert_eq!(
            tbl.exchange(16, Hpa::ZERO, DmaDirection::None),
            Err(IommuError::Invalid)
        );
    }

    #[test]
    fn param_checks() {
        let tbl = SoftIommuTable::new(12, 4, 8);
        assert!(tbl.put_param_check(4 << 12, 0x2000).is_ok());
        assert!(tbl.put_param_check(3 << 12, 0x2000).is_err());
        assert!(tbl.put_param_check(12 << 12, 0x2000).is_err());
        assert!(tbl.put_param_check(4 << 12, 0x2001).is_err());
        assert!(tbl.put_param_check((4 << 12) + 8, 0x2000).is_err());

        assert!(tbl.clear_param_check(4 << 12, 0, 8).is_ok());
        assert!(tbl.clear_param_check(4 << 12, 0, 9).is_err());
        assert!(tbl.clear_param_check(4 << 12, 1, 1).is_err());

        tbl.reject_puts(true);
        assert_eq!(tbl.put_param_check(4 << 12, 0x2000), Err(IommuError::Invalid));
    }
}
