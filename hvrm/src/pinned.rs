//! Guest memory pre-registered for passthrough DMA.
//!
//! The VMM pins ranges of its address space before handing devices to the
//! guest. For each pinned page the host physical address is recorded up
//! front, so the hypercall path can translate without walking page tables.
//!
//! Every IOMMU entry that points into a region holds a reference on it.
//! The counter starts at one for the registration itself; a region can only
//! be unregistered when it drops from one straight to zero, and once it is
//! zero no new mapping may take a reference.

use crate::{
    addressing::{Hpa, Ua, PAGE_MASK, PAGE_SHIFT},
    rcu::RcuList,
};
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_epoch as epoch;
use crossbeam_utils::Backoff;
use std::sync::Arc;

/// Failures of the pinned memory registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PinnedError {
    /// The range overlaps an existing registration.
    #[error("range overlaps a registered region")]
    Overlap,
    /// No region is registered at this address.
    #[error("no region registered here")]
    NotFound,
    /// IOMMU entries still point into the region.
    #[error("region still has live mappings")]
    Busy,
    /// The address is outside the region.
    #[error("address outside the region")]
    Fault,
    /// The region is being released.
    #[error("region is being released")]
    Released,
}

/// A pinned range of the VMM's address space.
pub struct PinnedRegion {
    ua: Ua,
    hpas: Box<[Hpa]>,
    mapped: AtomicU64,
}

impl PinnedRegion {
    /// Start of the range.
    pub fn ua(&self) -> Ua {
        self.ua
    }

    /// Number of pinned pages.
    pub fn entries(&self) -> u64 {
        self.hpas.len() as u64
    }

    fn end(&self) -> u64 {
        self.ua.into_u64() + (self.entries() << PAGE_SHIFT)
    }

    fn covers(&self, ua: Ua, size: u64) -> bool {
        self.ua <= ua && ua.into_u64() + size <= self.end()
    }

    fn overlaps(&self, ua: Ua, entries: u64) -> bool {
        let end = ua.into_u64() + (entries << PAGE_SHIFT);
        ua.into_u64() < self.end() && self.ua.into_u64() < end
    }

    /// Translate `ua` into the host physical address of the pinned page.
    pub fn ua_to_hpa(&self, ua: Ua) -> Result<Hpa, PinnedError> {
        let entry = ua
            .into_u64()
            .checked_sub(self.ua.into_u64())
            .ok_or(PinnedError::Fault)?
            >> PAGE_SHIFT;
        let hpa = self.hpas.get(entry as usize).ok_or(PinnedError::Fault)?;
        Ok(*hpa | (ua.into_u64() & PAGE_MASK))
    }

    /// Take a reference for a new mapping.
    ///
    /// Fails once the region started being released.
    pub fn mapped_inc(&self) -> Result<(), PinnedError> {
        self.mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v != 0).then_some(v + 1)
            })
            .map(|_| ())
            .map_err(|_| PinnedError::Released)
    }

    /// Drop a mapping reference.
    ///
    /// Never drops the registration's own reference.
    pub fn mapped_dec(&self) {
        let _ = self
            .mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > 1).then_some(v - 1)
            });
    }

    /// Number of live mappings into this region.
    pub fn mappings(&self) -> u64 {
        self.mapped.load(Ordering::Acquire).saturating_sub(1)
    }

    fn retire(&self) -> Result<(), PinnedError> {
        self.mapped
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| PinnedError::Busy)
    }
}

impl core::fmt::Debug for PinnedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PinnedRegion")
            .field("ua", &self.ua)
            .field("entries", &self.entries())
            .field("mapped", &self.mapped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pinned regions of one VMM process.
#[derive(Default)]
pub struct PinnedMemory {
    regions: RcuList<Arc<PinnedRegion>>,
}

impl PinnedMemory {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the pages starting at `ua`, pinned at `hpas`.
    pub fn register(&self, ua: Ua, hpas: Vec<Hpa>) -> Result<Arc<PinnedRegion>, PinnedError> {
        let entries = hpas.len() as u64;
        let region = Arc::new(PinnedRegion {
            ua,
            hpas: hpas.into_boxed_slice(),
            mapped: AtomicU64::new(1),
        });
        self.regions
            .push_unless(region.clone(), |r| r.overlaps(ua, entries))
            .map_err(|_| PinnedError::Overlap)?;
        Ok(region)
    }

    /// Unregister the region starting at `ua`.
    ///
    /// Fails with [`PinnedError::Busy`] while IOMMU entries still point into
    /// it. Once retired, no new mapping can take a reference.
    pub fn unregister(&self, ua: Ua) -> Result<(), PinnedError> {
        let region = {
            let guard = epoch::pin();
            let found = self.regions.iter(&guard).find(|r| r.ua == ua).cloned();
            found.ok_or(PinnedError::NotFound)?
        };
        region.retire()?;
        self.regions.remove(|r| Arc::ptr_eq(r, &region));
        Ok(())
    }

    /// Find the region that fully covers `[ua, ua + size)`.
    pub fn lookup(&self, ua: Ua, size: u64) -> Option<Arc<PinnedRegion>> {
        let guard = epoch::pin();
        let found = self.regions.iter(&guard).find(|r| r.covers(ua, size)).cloned();
        found
    }

    /// Returns whether any memory was pre-registered.
    pub fn preregistered(&self) -> bool {
        !self.regions.is_empty()
    }

    /// Unregister the region at `ua`, waiting for its mappings to drain.
    ///
    /// Only for teardown paths that know all mappings are being removed.
    pub fn unregister_wait(&self, ua: Ua) -> Result<(), PinnedError> {
        let backoff = Backoff::new();
        loop {
            match self.unregister(ua) {
                Err(PinnedError::Busy) => backoff.snooze(),
                r => return r,
            }
        }
    }
}
