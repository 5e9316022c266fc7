//! Per-VM set of TCE tables.
//!
//! Lookups run on the hypercall path and never lock. Tables are added and
//! removed from the ioctl path when the VMM creates or releases a bus.

use crate::{rcu::RcuList, table::TceTable};
use crossbeam_epoch as epoch;
use std::sync::Arc;

/// Failures of [`TableRegistry::insert`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A table with the same LIOBN is already registered.
    #[error("liobn 0x{0:x} is already registered")]
    Exists(u64),
}

/// The TCE tables of one VM, keyed by LIOBN.
#[derive(Default)]
pub struct TableRegistry {
    tables: RcuList<Arc<TceTable>>,
}

impl TableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stt`.
    pub fn insert(&self, stt: Arc<TceTable>) -> Result<(), RegistryError> {
        let liobn = stt.liobn();
        self.tables
            .push_unless(stt, |t| t.liobn() == liobn)
            .map_err(|_| RegistryError::Exists(liobn))
    }

    /// Unregister the table of `liobn`.
    ///
    /// The table stays alive while a hypercall in flight still holds it.
    pub fn remove(&self, liobn: u64) -> Option<Arc<TceTable>> {
        let found = self.find(liobn)?;
        self.tables
            .remove(|t| Arc::ptr_eq(t, &found))
            .then_some(found)
    }

    /// Find the table of `liobn`.
    ///
    /// May miss a table that is concurrently inserted or removed.
    pub fn find(&self, liobn: u64) -> Option<Arc<TceTable>> {
        let guard = epoch::pin();
        let found = self
            .tables
            .iter(&guard)
            .find(|t| t.liobn() == liobn)
            .cloned();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let reg = TableRegistry::new();
        reg.insert(Arc::new(TceTable::new(0x1001, 12, 0, 16))).unwrap();
        reg.insert(Arc::new(TceTable::new(0x1002, 16, 0, 16))).unwrap();
        assert!(matches!(
            reg.insert(Arc::new(TceTable::new(0x1001, 12, 0, 16))),
            Err(RegistryError::Exists(0x1001))
        ));
        assert_eq!(reg.find(0x1002).unwrap().page_shift(), 16);
        assert!(reg.find(0x1003).is_none());

        let held = reg.find(0x1001).unwrap();
        let removed = reg.remove(0x1001).unwrap();
        assert!(Arc::ptr_eq(&held, &removed));
        assert!(reg.find(0x1001).is_none());
        assert!(reg.remove(0x1001).is_none());
    }
}
