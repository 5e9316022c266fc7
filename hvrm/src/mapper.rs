//! Mirroring TCE updates into device-group IOMMU tables.
//!
//! A passthrough mapping points the hardware table at a pinned host page.
//! Each live mapping holds a reference on the [`PinnedRegion`] it points
//! into, and the userspace address it was made from is recorded next to the
//! IOMMU entry so the reference can be found again on unmap.
//!
//! [`PinnedRegion`]: crate::pinned::PinnedRegion

use crate::{
    addressing::{Gpa, Ua},
    iommu::IommuTable,
    memslot::Memslots,
    pinned::PinnedMemory,
    tce::DmaDirection,
    HvError,
};
use core::sync::atomic::{AtomicU64, Ordering};

/// Counters of anomalies the mapper tolerates.
#[derive(Debug, Default)]
pub struct TceStats {
    unmap_missing_region: AtomicU64,
}

impl TceStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            unmap_missing_region: AtomicU64::new(0),
        }
    }

    /// Unmaps that found no pinned region for the recorded address.
    pub fn unmap_missing_region(&self) -> u64 {
        self.unmap_missing_region.load(Ordering::Relaxed)
    }
}

/// Installs and removes passthrough mappings for one VM.
pub struct Mapper<'a> {
    memslots: &'a Memslots,
    mm: Option<&'a PinnedMemory>,
    stats: &'a TceStats,
}

impl<'a> Mapper<'a> {
    /// Create a mapper over the VM's memory slots and pinned memory.
    ///
    /// `mm` is `None` when the VMM process has no pinned memory context.
    pub fn new(memslots: &'a Memslots, mm: Option<&'a PinnedMemory>, stats: &'a TceStats) -> Self {
        Self { memslots, mm, stats }
    }

    /// Map guest page `gpa` at `entry` of `tbl`.
    ///
    /// The new mapping takes its reference before the exchange; the
    /// reference of the mapping it replaces is dropped only after it.
    pub fn map(
        &self,
        tbl: &dyn IommuTable,
        entry: u64,
        gpa: Gpa,
        dir: DmaDirection,
    ) -> Result<(), HvError> {
        let pgsize = 1u64 << tbl.page_shift();
        let (ua, _) = self
            .memslots
            .gpa_to_ua(gpa, false)
            .map_err(|_| HvError::Hardware)?;
        let mem = self
            .mm
            .and_then(|mm| mm.lookup(ua, pgsize))
            .ok_or(HvError::Hardware)?;
        let hpa = mem.ua_to_hpa(ua).map_err(|_| HvError::Hardware)?;
        let pua = tbl.userspace_entry(entry).ok_or(HvError::Hardware)?;
        mem.mapped_inc().map_err(|_| HvError::Hardware)?;

        let (_, old_dir) = match tbl.exchange(entry, hpa, dir) {
            Ok(old) => old,
            Err(e) => {
                mem.mapped_dec();
                log::debug!("exchange of entry {entry:#x} failed: {e}");
                return Err(HvError::TooHard);
            }
        };
        if !old_dir.is_none() {
            self.mapped_dec(tbl, entry)?;
        }
        pua.store(ua.into_u64(), Ordering::Release);
        Ok(())
    }

    /// Clear `entry` of `tbl`, dropping the reference of the old mapping.
    pub fn unmap(&self, tbl: &dyn IommuTable, entry: u64) -> Result<(), HvError> {
        let (_, old_dir) = tbl
            .exchange(entry, Default::default(), DmaDirection::None)
            .map_err(|_| HvError::Hardware)?;
        if old_dir.is_none() {
            return Ok(());
        }
        self.mapped_dec(tbl, entry)
    }

    /// Drop the reference held by the mapping recorded at `entry`.
    ///
    /// A region that vanished meanwhile cannot be unpinned early, so this is
    /// counted and reported as success.
    fn mapped_dec(&self, tbl: &dyn IommuTable, entry: u64) -> Result<(), HvError> {
        let Some(pua) = tbl.userspace_entry(entry) else {
            return Ok(());
        };
        let ua = Ua::new(pua.load(Ordering::Acquire));
        match self.mm.and_then(|mm| mm.lookup(ua, 1u64 << tbl.page_shift())) {
            Some(mem) => mem.mapped_dec(),
            None => {
                self.stats.unmap_missing_region.fetch_add(1, Ordering::Relaxed);
                log::warn!("entry {entry:#x}: no pinned region for {ua}");
            }
        }
        pua.store(0, Ordering::Release);
        Ok(())
    }
}
