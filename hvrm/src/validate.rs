//! Checks run on guest-supplied hypercall arguments.
//!
//! Both checks are pure and allocation free. They only look at the shape of
//! the request; whether an address names real guest memory is left to
//! whoever dereferences it later.

use crate::{table::TceTable, tce::TceFlags, HvError};

/// Check that `npages` I/O pages starting at `ioba` lie inside `stt`.
pub fn ioba_validate(stt: &TceTable, ioba: u64, npages: u64) -> Result<(), HvError> {
    let mask = (1u64 << stt.page_shift()) - 1;
    if ioba & mask != 0 {
        return Err(HvError::Parameter);
    }
    let idx = ioba >> stt.page_shift();
    if idx < stt.offset() {
        return Err(HvError::Parameter);
    }
    // Reject wrap-around before comparing against the window end.
    match idx.checked_add(npages) {
        Some(end) if end <= stt.offset() + stt.size() => Ok(()),
        _ => Err(HvError::Parameter),
    }
}

/// Check that `tce` has no bits set below the page size besides the
/// permission bits.
pub fn tce_validate(stt: &TceTable, tce: u64) -> Result<(), HvError> {
    let mask = ((1u64 << stt.page_shift()) - 1) & !TceFlags::all().bits();
    if tce & mask != 0 {
        Err(HvError::Parameter)
    } else {
        Ok(())
    }
}
