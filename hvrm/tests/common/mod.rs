//! A small VM shared by the integration tests.
#![allow(dead_code)]

use hvrm::{
    addressing::{Hpa, Ua, PAGE_SHIFT},
    mapper::TceStats,
    memslot::{Memslot, Memslots},
    page_table::MapPageTable,
    table::TCES_PER_PAGE,
    tce_hcalls::TceContext,
    PinnedMemory, PinnedRegion, SoftIommuTable, TableRegistry, TceTable,
};
use std::sync::{atomic::AtomicU64, atomic::Ordering, Arc};

pub const LIOBN: u64 = 0x8000_0001;
/// Entries of the test bus.
pub const TABLE_SIZE: u64 = 1024;
/// Guest frames of RAM.
pub const RAM_PAGES: u64 = 256;
/// Guest address of the indirect list page.
pub const LIST_GPA: u64 = 0x1000 << PAGE_SHIFT;

const RAM_UA: u64 = 0x1_0000_0000;
const LIST_UA: u64 = 0x2_0000_0000;
const RAM_HPA: u64 = 0x80_0000_0000;

#[repr(align(4096))]
pub struct ListPage(pub [AtomicU64; TCES_PER_PAGE as usize]);

pub struct Vm {
    pub tables: TableRegistry,
    pub memslots: Memslots,
    pub mm: PinnedMemory,
    pub pgdir: MapPageTable,
    pub stats: TceStats,
    pub list: Arc<ListPage>,
}

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl Vm {
    pub fn new() -> Self {
        init_log();
        let tables = TableRegistry::new();
        tables
            .insert(Arc::new(TceTable::new(LIOBN, PAGE_SHIFT, 0, TABLE_SIZE)))
            .unwrap();

        let mut memslots = Memslots::new();
        memslots.add(Memslot::new(0, RAM_PAGES, Ua::new(RAM_UA)));
        memslots.add(Memslot::new(LIST_GPA >> PAGE_SHIFT, 1, Ua::new(LIST_UA)));

        let list = Arc::new(ListPage(core::array::from_fn(|_| AtomicU64::new(0))));
        let mm = PinnedMemory::new();
        mm.register(
            Ua::new(RAM_UA),
            (0..RAM_PAGES)
                .map(|i| Hpa::new(RAM_HPA + (i << PAGE_SHIFT)))
                .collect(),
        )
        .unwrap();
        mm.register(
            Ua::new(LIST_UA),
            vec![Hpa::new(&*list as *const ListPage as u64)],
        )
        .unwrap();

        Self {
            tables,
            memslots,
            mm,
            pgdir: MapPageTable::new(),
            stats: TceStats::new(),
            list,
        }
    }

    pub fn ctx(&self) -> TceContext<'_> {
        TceContext {
            tables: &self.tables,
            memslots: &self.memslots,
            mm: Some(&self.mm),
            pgdir: &self.pgdir,
            stats: &self.stats,
        }
    }

    pub fn table(&self) -> Arc<TceTable> {
        self.tables.find(LIOBN).unwrap()
    }

    /// Attach a fresh device group covering the whole bus.
    pub fn attach(&self) -> Arc<SoftIommuTable> {
        let tbl = Arc::new(SoftIommuTable::new(PAGE_SHIFT, 0, TABLE_SIZE));
        self.table().attach_group(tbl.clone());
        tbl
    }

    /// The pinned region backing guest RAM.
    pub fn ram(&self) -> Arc<PinnedRegion> {
        self.mm.lookup(Ua::new(RAM_UA), 1).unwrap()
    }

    /// Host physical address a guest RAM address is pinned at.
    pub fn ram_hpa(gpa: u64) -> Hpa {
        Hpa::new(RAM_HPA + gpa)
    }

    /// Fill the indirect list page.
    pub fn write_list(&self, tces: &[u64]) {
        for (slot, tce) in self.list.0.iter().zip(tces) {
            slot.store(tce.to_be(), Ordering::Relaxed);
        }
    }
}
