//! Guest memory slots and their reverse-map words.
//!
//! A memory slot describes one contiguous range of guest frames and where
//! the VMM mapped it in its own address space. Each guest frame also owns a
//! reverse-map word. Bit 63 of that word is a lock: holding it keeps the host
//! from tearing down the translation of that frame.

use crate::{
    addressing::{Gpa, Ua, PAGE_MASK, PAGE_SHIFT},
    tce::TceFlags,
    HvError,
};
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::Backoff;

/// Lock bit of a reverse-map word.
pub const RMAP_LOCK_BIT: u64 = 1 << 63;

/// One contiguous range of guest memory.
pub struct Memslot {
    base_gfn: u64,
    npages: u64,
    userspace_addr: Ua,
    rmap: Box<[AtomicU64]>,
}

impl Memslot {
    /// Create a slot of `npages` frames at `base_gfn`, backed by the VMM
    /// mapping at `userspace_addr`.
    pub fn new(base_gfn: u64, npages: u64, userspace_addr: Ua) -> Self {
        Self {
            base_gfn,
            npages,
            userspace_addr,
            rmap: (0..npages).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// First guest frame.
    pub fn base_gfn(&self) -> u64 {
        self.base_gfn
    }

    /// Number of guest frames.
    pub fn npages(&self) -> u64 {
        self.npages
    }

    #[inline]
    fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn - self.base_gfn < self.npages
    }

    /// Userspace address backing `gfn`.
    #[inline]
    pub fn gfn_to_ua(&self, gfn: u64) -> Ua {
        self.userspace_addr + ((gfn - self.base_gfn) << PAGE_SHIFT)
    }

    /// Reverse-map word of `gfn`.
    pub fn rmap(&self, gfn: u64) -> Option<Rmap<'_>> {
        if self.contains(gfn) {
            Some(Rmap(&self.rmap[(gfn - self.base_gfn) as usize]))
        } else {
            None
        }
    }
}

/// The memory slots of a VM.
#[derive(Default)]
pub struct Memslots {
    slots: Vec<Memslot>,
}

impl Memslots {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `slot`.
    pub fn add(&mut self, slot: Memslot) {
        self.slots.push(slot);
    }

    /// Slot that holds `gfn`.
    pub fn search(&self, gfn: u64) -> Option<&Memslot> {
        self.slots.iter().find(|s| s.contains(gfn))
    }

    /// Translate a TCE's target into the VMM's address space.
    ///
    /// The page offset of `gpa` is kept, minus the TCE permission bits. If
    /// `want_rmap` is set, also returns the reverse-map word of the frame.
    pub fn gpa_to_ua(&self, gpa: Gpa, want_rmap: bool) -> Result<(Ua, Option<Rmap<'_>>), HvError> {
        let gfn = gpa.gfn();
        let slot = self.search(gfn).ok_or(HvError::Parameter)?;
        let offset = gpa.into_u64() & PAGE_MASK & !TceFlags::all().bits();
        let ua = slot.gfn_to_ua(gfn) | offset;
        Ok((ua, if want_rmap { slot.rmap(gfn) } else { None }))
    }
}

/// Reverse-map word of one guest frame.
#[derive(Clone, Copy)]
pub struct Rmap<'a>(&'a AtomicU64);

impl<'a> Rmap<'a> {
    /// Try to take the lock bit, spinning a bounded number of times.
    ///
    /// Returns `None` if the bit stayed taken; the caller must not wait any
    /// longer from real mode.
    pub fn try_lock_bounded(self) -> Option<RmapGuard<'a>> {
        let backoff = Backoff::new();
        loop {
            if self.0.load(Ordering::Relaxed) & RMAP_LOCK_BIT == 0
                && self.0.fetch_or(RMAP_LOCK_BIT, Ordering::Acquire) & RMAP_LOCK_BIT == 0
            {
                return Some(RmapGuard(self.0));
            }
            if backoff.is_completed() {
                return None;
            }
            backoff.spin();
        }
    }

    /// Returns whether someone holds the lock bit.
    pub fn is_locked(self) -> bool {
        self.0.load(Ordering::Relaxed) & RMAP_LOCK_BIT != 0
    }
}

/// Holds the lock bit of a reverse-map word until dropped.
pub struct RmapGuard<'a>(&'a AtomicU64);

impl Drop for RmapGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_and(!RMAP_LOCK_BIT, Ordering::Release);
    }
}
