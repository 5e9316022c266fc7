//! Walk of the VMM's host page table.
//!
//! When guest memory was not pre-registered, the page holding an indirect
//! TCE list is found by walking the host page table of the VMM process.
//! Real mode only follows translations that are trivially safe: a present,
//! recently accessed, base-size page. Anything else is left to virtual mode.

use crate::{
    addressing::{Hpa, Ua, PAGE_MASK, PAGE_SHIFT},
    HvError,
};
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags of a host page table entry.
    pub struct PteFlags: u64 {
        /// The entry maps a page.
        const PRESENT = 1 << 0;
        /// The page may be read.
        const READ = 1 << 1;
        /// The page may be written.
        const WRITE = 1 << 2;
        /// The page may be executed.
        const EXEC = 1 << 3;
        /// The page was accessed since the flag was last cleared.
        const ACCESSED = 1 << 8;
        /// The page was written since the flag was last cleared.
        const DIRTY = 1 << 7;
    }
}

/// Host page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl Pte {
    /// Build an entry that maps frame `pfn`.
    #[inline]
    pub const fn new(pfn: u64, flags: PteFlags) -> Self {
        Self((pfn << PAGE_SHIFT) | flags.bits())
    }

    /// Get the page frame number of this entry.
    #[inline]
    pub const fn pfn(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns whether the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Returns whether the page was recently accessed.
    #[inline]
    pub const fn is_young(&self) -> bool {
        self.flags().contains(PteFlags::ACCESSED)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte(pfn: 0x{:x}, {:?})", self.pfn(), self.flags())
    }
}

/// Page table of the VMM process.
pub trait HostPageTable: Send + Sync {
    /// Find the entry translating `ua`.
    ///
    /// Returns the entry with the shift of the page it maps, or `None` when
    /// no entry exists. A shift of 0 means a base page.
    fn find_pte(&self, ua: Ua) -> Option<(Pte, u32)>;
}

/// Translate `ua` by walking `pgdir`.
///
/// Only base pages that are present and young are translated; everything
/// else is [`HvError::TooHard`].
pub fn ua_to_hpa(pgdir: &dyn HostPageTable, ua: Ua) -> Result<Hpa, HvError> {
    let (pte, shift) = pgdir.find_pte(ua).ok_or(HvError::TooHard)?;
    if !pte.is_present() {
        return Err(HvError::TooHard);
    }
    let shift = if shift == 0 { PAGE_SHIFT } else { shift };
    if shift > PAGE_SHIFT {
        log::debug!("{ua}: huge page (shift {shift}) left to virtual mode");
        return Err(HvError::TooHard);
    }
    if !pte.is_young() {
        return Err(HvError::TooHard);
    }
    Ok(Hpa::new(pte.pfn() << PAGE_SHIFT) | (ua.into_u64() & PAGE_MASK))
}

/// Host page table held in a map, keyed by page-aligned address.
#[derive(Default)]
pub struct MapPageTable {
    entries: BTreeMap<u64, (Pte, u32)>,
}

impl MapPageTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `pte` for the page at `ua`.
    pub fn insert(&mut self, ua: Ua, pte: Pte, shift: u32) {
        self.entries.insert(ua.into_u64() & !PAGE_MASK, (pte, shift));
    }
}

impl HostPageTable for MapPageTable {
    fn find_pte(&self, ua: Ua) -> Option<(Pte, u32)> {
        self.entries.get(&(ua.into_u64() & !PAGE_MASK)).copied()
    }
}
