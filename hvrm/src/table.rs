//! Guest-visible TCE table of one virtual I/O bus.
//!
//! The table stores the raw TCEs exactly as the guest wrote them, in
//! page-sized chunks allocated when the bus is created. The real-mode
//! handlers never allocate: they only index into these chunks.

use crate::{addressing::PAGE_SIZE, iommu::IommuTable, rcu::RcuList, tce::Tce};
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_epoch::Guard;
use std::sync::Arc;

/// Number of TCEs held by one backing page.
pub const TCES_PER_PAGE: u64 = PAGE_SIZE / core::mem::size_of::<u64>() as u64;

#[repr(C, align(4096))]
struct TcePage([AtomicU64; TCES_PER_PAGE as usize]);

impl TcePage {
    fn new() -> Box<Self> {
        Box::new(Self(core::array::from_fn(|_| AtomicU64::new(0))))
    }
}

/// TCE table of a virtual I/O bus, identified by its LIOBN.
pub struct TceTable {
    liobn: u64,
    page_shift: u32,
    offset: u64,
    size: u64,
    pages: Box<[Box<TcePage>]>,
    groups: RcuList<Arc<dyn IommuTable>>,
}

impl TceTable {
    /// Create a table of `size` entries starting at index `offset`.
    ///
    /// Geometry is fixed for the lifetime of the table.
    pub fn new(liobn: u64, page_shift: u32, offset: u64, size: u64) -> Self {
        let npages = size.div_ceil(TCES_PER_PAGE);
        Self {
            liobn,
            page_shift,
            offset,
            size,
            pages: (0..npages).map(|_| TcePage::new()).collect(),
            groups: RcuList::new(),
        }
    }

    /// Logical I/O bus number.
    #[inline]
    pub fn liobn(&self) -> u64 {
        self.liobn
    }

    /// Shift of one I/O page.
    #[inline]
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// First valid index.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of valid indices.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    fn slot(&self, idx: u64) -> &AtomicU64 {
        let idx = idx - self.offset;
        &self.pages[(idx / TCES_PER_PAGE) as usize].0[(idx % TCES_PER_PAGE) as usize]
    }

    /// Store `tce` at absolute index `idx`.
    ///
    /// Cannot fail: the caller must have validated `idx` and `tce` first.
    #[inline]
    pub fn put(&self, idx: u64, tce: Tce) {
        self.slot(idx).store(tce.raw(), Ordering::Release);
    }

    /// Load the TCE at absolute index `idx`.
    ///
    /// Same precondition as [`TceTable::put`].
    #[inline]
    pub fn get(&self, idx: u64) -> Tce {
        Tce::from_raw(self.slot(idx).load(Ordering::Acquire))
    }

    /// Attach the IOMMU table of a device group.
    pub fn attach_group(&self, tbl: Arc<dyn IommuTable>) {
        self.groups.push(tbl);
    }

    /// Detach the first attachment of `tbl`.
    pub fn detach_group(&self, tbl: &Arc<dyn IommuTable>) -> bool {
        self.groups.remove(|g| Arc::ptr_eq(g, tbl))
    }

    /// Returns whether any device group is attached.
    pub fn has_groups(&self) -> bool {
        !self.groups.is_empty()
    }

    /// Iterate the attached IOMMU tables.
    ///
    /// Several groups may share one table; consecutive attachments of the
    /// same table are reported once.
    pub fn iommu_tables<'g>(&'g self, guard: &'g Guard) -> IommuTables<'g> {
        IommuTables {
            inner: self.groups.iter(guard),
            last: None,
        }
    }
}

impl core::fmt::Debug for TceTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TceTable")
            .field("liobn", &format_args!("0x{:x}", self.liobn))
            .field("page_shift", &self.page_shift)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Iterator returned by [`TceTable::iommu_tables`].
pub struct IommuTables<'g> {
    inner: crate::rcu::Iter<'g, Arc<dyn IommuTable>>,
    last: Option<&'g Arc<dyn IommuTable>>,
}

impl<'g> Iterator for IommuTables<'g> {
    type Item = &'g dyn IommuTable;

    fn next(&mut self) -> Option<Self::Item> {
        for tbl in self.inner.by_ref() {
            if matches!(self.last, Some(last) if Arc::ptr_eq(last, tbl)) {
                continue;
            }
            self.last = Some(tbl);
            return Some(&**tbl);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::SoftIommuTable;
    use crossbeam_epoch as epoch;

    #[test]
    fn chunked_storage() {
        let stt = TceTable::new(0x8000_0001, 12, 0x10, 1500);
        assert_eq!(stt.pages.len(), 3);
        for idx in [0x10, 0x10 + 511, 0x10 + 512, 0x10 + 1499] {
            stt.put(idx, Tce::from_raw(idx << 12 | 3));
        }
        assert_eq!(stt.get(0x10 + 512).raw(), (0x10 + 512) << 12 | 3);
        assert_eq!(stt.get(0x10 + 1499).raw(), (0x10 + 1499) << 12 | 3);
        assert_eq!(stt.get(0x11).raw(), 0);
    }

    #[test]
    fn duplicate_tables_reported_once() {
        let stt = TceTable::new(1, 12, 0, 64);
        let a: Arc<dyn IommuTable> = Arc::new(SoftIommuTable::new(12, 0, 64));
        let b: Arc<dyn IommuTable> = Arc::new(SoftIommuTable::new(12, 0, 64));
        stt.attach_group(a.clone());
        stt.attach_group(a.clone());
        stt.attach_group(b.clone());
        let guard = epoch::pin();
        assert_eq!(stt.iommu_tables(&guard).count(), 2);
        assert!(stt.detach_group(&a));
        assert!(stt.detach_group(&a));
        assert!(!stt.detach_group(&a));
        assert_eq!(stt.iommu_tables(&guard).count(), 1);
        assert!(stt.has_groups());
    }
}
