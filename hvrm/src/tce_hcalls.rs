//! Real-mode handlers of the TCE hypercalls.
//!
//! Each handler validates the guest's arguments, mirrors the update into
//! every device group attached to the bus, and only then stores the new
//! entries. A failure in one group aborts the call without undoing what was
//! done to groups already updated; the guest sees the error and the retry in
//! virtual mode cleans up.

use crate::{
    addressing::Gpa,
    iommu::IommuTable,
    mapper::{Mapper, TceStats},
    memslot::Memslots,
    page_table::HostPageTable,
    pinned::PinnedMemory,
    registry::TableRegistry,
    table::{TceTable, TCES_PER_PAGE},
    tce::{Tce, TceFlags},
    tce_list::TceListSource,
    validate::{ioba_validate, tce_validate},
    HvError,
};
use crossbeam_epoch as epoch;
use std::sync::Arc;

/// Alignment mask of an indirect TCE list address.
const TCE_LIST_MASK: u64 = 0xfff;

/// The parts of a VM the TCE hypercalls work on.
pub struct TceContext<'a> {
    /// TCE tables of the VM.
    pub tables: &'a TableRegistry,
    /// Guest memory layout.
    pub memslots: &'a Memslots,
    /// Pinned memory of the VMM process, if it has a memory context.
    pub mm: Option<&'a PinnedMemory>,
    /// Page table of the VMM process.
    pub pgdir: &'a dyn HostPageTable,
    /// Diagnostic counters.
    pub stats: &'a TceStats,
}

impl<'a> TceContext<'a> {
    fn mapper(&self) -> Mapper<'a> {
        Mapper::new(self.memslots, self.mm, self.stats)
    }

    fn find_table(&self, liobn: u64) -> Result<Arc<TceTable>, HvError> {
        self.tables.find(liobn).ok_or_else(|| {
            log::debug!("liobn {liobn:#x}: no table in real mode");
            HvError::TooHard
        })
    }

    /// Check that a non-clearing `tce` targets guest memory.
    fn tce_mappable(&self, tce: Tce) -> Result<(), HvError> {
        if tce.direction().is_none() {
            return Ok(());
        }
        self.memslots
            .gpa_to_ua(tce.gpa(), false)
            .map(|_| ())
            .map_err(|_| HvError::Parameter)
    }
}

/// Ask `tbl` whether `tce` may be installed at `ioba`.
fn group_param_check(tbl: &dyn IommuTable, ioba: u64, tce: Tce) -> Result<(), HvError> {
    let r = if tce.direction().is_none() {
        tbl.clear_param_check(ioba, 0, 1)
    } else {
        tbl.put_param_check(ioba, tce.gpa().into_u64())
    };
    r.map_err(|_| HvError::Parameter)
}

/// Install or clear `tce` at `entry` of `tbl`.
fn group_update(mapper: &Mapper, tbl: &dyn IommuTable, entry: u64, tce: Tce) -> Result<(), HvError> {
    let dir = tce.direction();
    if dir.is_none() {
        mapper.unmap(tbl, entry)
    } else {
        mapper.map(tbl, entry, tce.gpa(), dir)
    }
}

/// H_PUT_TCE: set the entry for `ioba` of bus `liobn` to `tce`.
pub fn h_put_tce(ctx: &TceContext, liobn: u64, ioba: u64, tce: u64) -> Result<(), HvError> {
    log::trace!("H_PUT_TCE liobn={liobn:#x} ioba={ioba:#x} tce={tce:#x}");
    let stt = ctx.find_table(liobn)?;
    ioba_validate(&stt, ioba, 1)?;
    tce_validate(&stt, tce)?;
    let tce = Tce::from_raw(tce);
    ctx.tce_mappable(tce)?;

    let guard = epoch::pin();
    for tbl in stt.iommu_tables(&guard) {
        group_param_check(tbl, ioba, tce)?;
    }
    let mapper = ctx.mapper();
    for tbl in stt.iommu_tables(&guard) {
        group_update(&mapper, tbl, ioba >> tbl.page_shift(), tce)?;
    }

    stt.put(ioba >> stt.page_shift(), tce);
    Ok(())
}

/// H_PUT_TCE_INDIRECT: set `npages` entries starting at `ioba` from the
/// list of big-endian TCEs at guest address `tce_list`.
pub fn h_put_tce_indirect(
    ctx: &TceContext,
    liobn: u64,
    ioba: u64,
    tce_list: u64,
    npages: u64,
) -> Result<(), HvError> {
    log::trace!(
        "H_PUT_TCE_INDIRECT liobn={liobn:#x} ioba={ioba:#x} list={tce_list:#x} npages={npages}"
    );
    let stt = ctx.find_table(liobn)?;
    // The whole list must fit in one 4K page.
    if npages > TCES_PER_PAGE {
        return Err(HvError::Parameter);
    }
    if tce_list & TCE_LIST_MASK != 0 {
        return Err(HvError::Parameter);
    }
    ioba_validate(&stt, ioba, npages)?;

    // The guest can rewrite the list page at any time; both passes work on
    // one snapshot of it.
    let mut tces = [0u64; TCES_PER_PAGE as usize];
    let tces = &mut tces[..npages as usize];
    {
        let list = TceListSource::select(ctx.mm, ctx.pgdir)
            .resolve(ctx.memslots, Gpa::new(tce_list))
            .inspect_err(|_| {
                log::debug!("tce list {tce_list:#x} not resolvable in real mode")
            })?;
        for (i, slot) in tces.iter_mut().enumerate() {
            *slot = list.get(i);
        }
    }
    let guard = epoch::pin();

    for (i, &raw) in (0u64..).zip(tces.iter()) {
        tce_validate(&stt, raw)?;
        let tce = Tce::from_raw(raw);
        ctx.tce_mappable(tce)?;
        for tbl in stt.iommu_tables(&guard) {
            group_param_check(tbl, ioba + (i << tbl.page_shift()), tce)?;
        }
    }

    let mapper = ctx.mapper();
    let entry = ioba >> stt.page_shift();
    for (i, &raw) in (0u64..).zip(tces.iter()) {
        let tce = Tce::from_raw(raw);
        for tbl in stt.iommu_tables(&guard) {
            group_update(&mapper, tbl, (ioba >> tbl.page_shift()) + i, tce)?;
        }
        stt.put(entry + i, tce);
    }
    Ok(())
}

/// H_STUFF_TCE: set `npages` entries starting at `ioba` to `tce_value`,
/// which must clear them.
pub fn h_stuff_tce(
    ctx: &TceContext,
    liobn: u64,
    ioba: u64,
    tce_value: u64,
    npages: u64,
) -> Result<(), HvError> {
    log::trace!(
        "H_STUFF_TCE liobn={liobn:#x} ioba={ioba:#x} tce={tce_value:#x} npages={npages}"
    );
    let stt = ctx.find_table(liobn)?;
    ioba_validate(&stt, ioba, npages)?;
    tce_validate(&stt, tce_value)?;
    if tce_value & TceFlags::all().bits() != 0 {
        return Err(HvError::Parameter);
    }

    let guard = epoch::pin();
    for tbl in stt.iommu_tables(&guard) {
        tbl.clear_param_check(ioba, tce_value, npages)
            .map_err(|_| HvError::Parameter)?;
    }
    let mapper = ctx.mapper();
    for tbl in stt.iommu_tables(&guard) {
        let entry = ioba >> tbl.page_shift();
        for i in 0..npages {
            mapper.unmap(tbl, entry + i)?;
        }
    }

    let entry = ioba >> stt.page_shift();
    for i in 0..npages {
        stt.put(entry + i, Tce::from_raw(tce_value));
    }
    Ok(())
}

/// H_GET_TCE: read the entry for `ioba` of bus `liobn`.
pub fn h_get_tce(ctx: &TceContext, liobn: u64, ioba: u64) -> Result<u64, HvError> {
    log::trace!("H_GET_TCE liobn={liobn:#x} ioba={ioba:#x}");
    let stt = ctx.find_table(liobn)?;
    ioba_validate(&stt, ioba, 1)?;
    Ok(stt.get(ioba >> stt.page_shift()).raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::{Hpa, Ua, PAGE_SHIFT},
        iommu::SoftIommuTable,
        memslot::Memslot,
        page_table::MapPageTable,
        tce::DmaDirection,
    };

    const LIOBN: u64 = 0x8000_0000;

    struct Vm {
        tables: TableRegistry,
        memslots: Memslots,
        mm: PinnedMemory,
        pgdir: MapPageTable,
        stats: TceStats,
    }

    impl Vm {
        fn new() -> Self {
            let tables = TableRegistry::new();
            tables
                .insert(Arc::new(TceTable::new(LIOBN, 12, 0, 64)))
                .unwrap();
            let mut memslots = Memslots::new();
            memslots.add(Memslot::new(0, 64, Ua::new(0x1_0000_0000)));
            let mm = PinnedMemory::new();
            mm.register(
                Ua::new(0x1_0000_0000),
                (0..64).map(|i| Hpa::new(0x80_0000_0000 + (i << PAGE_SHIFT))).collect(),
            )
            .unwrap();
            Self {
                tables,
                memslots,
                mm,
                pgdir: MapPageTable::new(),
                stats: TceStats::new(),
            }
        }

        fn ctx(&self) -> TceContext<'_> {
            TceContext {
                tables: &self.tables,
                memslots: &self.memslots,
                mm: Some(&self.mm),
                pgdir: &self.pgdir,
                stats: &self.stats,
            }
        }

        fn attach(&self) -> Arc<SoftIommuTable> {
            let tbl = Arc::new(SoftIommuTable::new(12, 0, 64));
            self.tables.find(LIOBN).unwrap().attach_group(tbl.clone());
            tbl
        }
    }

    #[test]
    fn put_get_emulated() {
        let vm = Vm::new();
        let ctx = vm.ctx();
        h_put_tce(&ctx, LIOBN, 0x3000, 0x5003).unwrap();
        assert_eq!(h_get_tce(&ctx, LIOBN, 0x3000), Ok(0x5003));
        assert_eq!(h_get_tce(&ctx, LIOBN, 0x4000), Ok(0));
        assert_eq!(h_put_tce(&ctx, LIOBN + 1, 0, 0), Err(HvError::TooHard));
        assert_eq!(h_get_tce(&ctx, LIOBN + 1, 0), Err(HvError::TooHard));
        assert_eq!(h_put_tce(&ctx, LIOBN, 0x3001, 0), Err(HvError::Parameter));
        assert_eq!(h_put_tce(&ctx, LIOBN, 0x3000, 0x5004), Err(HvError::Parameter));
        // Target outside guest memory.
        assert_eq!(
            h_put_tce(&ctx, LIOBN, 0x3000, 0x100_0001),
            Err(HvError::Parameter)
        );
    }

    #[test]
    fn put_mirrors_into_groups() {
        let vm = Vm::new();
        let ctx = vm.ctx();
        let tbl = vm.attach();
        h_put_tce(&ctx, LIOBN, 0x2000, 0x7001).unwrap();
        assert_eq!(
            tbl.mapping(2),
            Some((Hpa::new(0x80_0000_7000), DmaDirection::ToDevice))
        );
        h_put_tce(&ctx, LIOBN, 0x2000, 0).unwrap();
        assert_eq!(tbl.mapping(2), Some((Hpa::ZERO, DmaDirection::None)));
        assert_eq!(vm.mm.lookup(Ua::new(0x1_0000_0000), 1).unwrap().mappings(), 0);
    }

    #[test]
    fn stuff_requires_clear_value() {
        let vm = Vm::new();
        let ctx = vm.ctx();
        assert_eq!(h_stuff_tce(&ctx, LIOBN, 0, 1, 4), Err(HvError::Parameter));
        h_put_tce(&ctx, LIOBN, 0x1000, 0x1003).unwrap();
        h_stuff_tce(&ctx, LIOBN, 0, 0, 4).unwrap();
        assert_eq!(h_get_tce(&ctx, LIOBN, 0x1000), Ok(0));
        assert_eq!(h_stuff_tce(&ctx, LIOBN, 0, 0, 65), Err(HvError::Parameter));
    }

    #[test]
    fn indirect_rejects_before_reading() {
        let vm = Vm::new();
        let ctx = vm.ctx();
        assert_eq!(
            h_put_tce_indirect(&ctx, LIOBN, 0, 0x1000, 513),
            Err(HvError::Parameter)
        );
        assert_eq!(
            h_put_tce_indirect(&ctx, LIOBN, 0, 0x1008, 1),
            Err(HvError::Parameter)
        );
        assert_eq!(
            h_put_tce_indirect(&ctx, LIOBN + 1, 0, 0x1000, 1),
            Err(HvError::TooHard)
        );
        // The list page is not pinned host memory a real-mode walk can reach.
        let bare = TceContext { mm: None, ..vm.ctx() };
        assert_eq!(
            h_put_tce_indirect(&bare, LIOBN, 0, 0x1000, 1),
            Err(HvError::TooHard)
        );
    }
}
