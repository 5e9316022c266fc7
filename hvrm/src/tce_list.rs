//! Locating the guest page that holds an indirect TCE list.
//!
//! How the page is found depends on how the VMM registered guest memory,
//! which is decided once per hypercall:
//!
//! - With pre-registered memory the pinned region already knows the host
//!   physical address of the page.
//! - Otherwise the VMM's page table is walked while the reverse-map lock of
//!   the guest frame is held, so the host cannot invalidate the translation
//!   while the list is read. The lock is released when the [`TceList`] is
//!   dropped. A lock held elsewhere is not waited for.

use crate::{
    addressing::{Gpa, PAGE_SIZE},
    memslot::{Memslots, RmapGuard},
    page_table::{self, HostPageTable},
    pinned::PinnedMemory,
    table::TCES_PER_PAGE,
    HvError,
};
use core::sync::atomic::{AtomicU64, Ordering};

/// Where the list page is resolved from.
#[derive(Clone, Copy)]
pub enum TceListSource<'a> {
    /// Guest memory was pre-registered and pinned.
    Preregistered(&'a PinnedMemory),
    /// Walk the VMM's host page table.
    PageWalk(&'a dyn HostPageTable),
}

impl<'a> TceListSource<'a> {
    /// Pick the source for this VM.
    pub fn select(mm: Option<&'a PinnedMemory>, pgdir: &'a dyn HostPageTable) -> Self {
        match mm {
            Some(mm) if mm.preregistered() => TceListSource::Preregistered(mm),
            _ => TceListSource::PageWalk(pgdir),
        }
    }

    /// Map the list page at guest address `tce_list`.
    ///
    /// Every failure is [`HvError::TooHard`], including a reverse-map lock
    /// that stays busy.
    pub fn resolve(self, memslots: &'a Memslots, tce_list: Gpa) -> Result<TceList<'a>, HvError> {
        match self {
            TceListSource::Preregistered(mm) => {
                let (ua, _) = memslots
                    .gpa_to_ua(tce_list, false)
                    .map_err(|_| HvError::TooHard)?;
                let hpa = mm
                    .lookup(ua, PAGE_SIZE)
                    .and_then(|mem| mem.ua_to_hpa(ua).ok())
                    .ok_or(HvError::TooHard)?;
                // Safety: the page is pinned for as long as the region is
                // registered.
                let entries = unsafe { hpa.as_ref() }.ok_or(HvError::TooHard)?;
                Ok(TceList {
                    entries,
                    _rmap: None,
                })
            }
            TceListSource::PageWalk(pgdir) => {
                let (ua, rmap) = memslots
                    .gpa_to_ua(tce_list, true)
                    .map_err(|_| HvError::TooHard)?;
                let rmap = match rmap {
                    Some(r) => Some(r.try_lock_bounded().ok_or_else(|| {
                        log::debug!("{tce_list:?}: reverse map busy");
                        HvError::TooHard
                    })?),
                    None => None,
                };
                let hpa = page_table::ua_to_hpa(pgdir, ua)?;
                // Safety: the translation cannot change while the reverse
                // map lock is held, and the guard lives in the returned list.
                let entries = unsafe { hpa.as_ref() }.ok_or(HvError::TooHard)?;
                Ok(TceList {
                    entries,
                    _rmap: rmap,
                })
            }
        }
    }
}

/// A page of big-endian TCEs written by the guest.
pub struct TceList<'a> {
    entries: &'a [AtomicU64; TCES_PER_PAGE as usize],
    _rmap: Option<RmapGuard<'a>>,
}

impl TceList<'_> {
    /// Read the `i`-th TCE.
    ///
    /// The guest may rewrite the page at any time, so two reads of the same
    /// index can differ.
    #[inline]
    pub fn get(&self, i: usize) -> u64 {
        u64::from_be(self.entries[i].load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::{Hpa, Ua},
        memslot::Memslot,
        page_table::{MapPageTable, Pte, PteFlags},
    };

    #[repr(align(4096))]
    struct ListPage([AtomicU64; TCES_PER_PAGE as usize]);

    fn list_page() -> Box<ListPage> {
        Box::new(ListPage(core::array::from_fn(|i| {
            AtomicU64::new((i as u64 * 0x1000 + 1).to_be())
        })))
    }

    fn memslots() -> Memslots {
        let mut memslots = Memslots::new();
        memslots.add(Memslot::new(0x100, 1, Ua::new(0x7000_0000)));
        memslots
    }

    #[test]
    fn preregistered() {
        let page = list_page();
        let hpa = &*page as *const ListPage as u64;
        let memslots = memslots();
        let mm = PinnedMemory::new();
        mm.register(Ua::new(0x7000_0000), vec![Hpa::new(hpa)]).unwrap();
        let pgdir = MapPageTable::new();

        let src = TceListSource::select(Some(&mm), &pgdir);
        assert!(matches!(src, TceListSource::Preregistered(_)));
        let list = src.resolve(&memslots, Gpa::new(0x100_000)).unwrap();
        assert_eq!(list.get(0), 1);
        assert_eq!(list.get(3), 0x3001);
        assert_eq!(
            src.resolve(&memslots, Gpa::new(0x200_000)).err(),
            Some(HvError::TooHard)
        );
    }

    #[test]
    fn page_walk_holds_rmap() {
        let page = list_page();
        let hpa = &*page as *const ListPage as u64;
        let memslots = memslots();
        let mut pgdir = MapPageTable::new();
        pgdir.insert(
            Ua::new(0x7000_0000),
            Pte::new(hpa >> 12, PteFlags::PRESENT | PteFlags::ACCESSED),
            0,
        );

        let src = TceListSource::select(None, &pgdir);
        assert!(matches!(src, TceListSource::PageWalk(_)));
        let rmap = memslots.search(0x100).unwrap().rmap(0x100).unwrap();
        {
            let list = src.resolve(&memslots, Gpa::new(0x100_000)).unwrap();
            assert!(rmap.is_locked());
            assert_eq!(list.get(2), 0x2001);
        }
        assert!(!rmap.is_locked());

        // Contended reverse map.
        let held = rmap.try_lock_bounded().unwrap();
        assert_eq!(
            src.resolve(&memslots, Gpa::new(0x100_000)).err(),
            Some(HvError::TooHard)
        );
        drop(held);
        assert!(!rmap.is_locked());

        // A cold page is left to virtual mode and the lock is released.
        pgdir.insert(Ua::new(0x7000_0000), Pte::new(hpa >> 12, PteFlags::PRESENT), 0);
        let src = TceListSource::select(None, &pgdir);
        assert_eq!(
            src.resolve(&memslots, Gpa::new(0x100_000)).err(),
            Some(HvError::TooHard)
        );
        assert!(!rmap.is_locked());
    }
}
