//! Translation control entries.
//!
//! A TCE is the 64-bit value a guest stores per I/O page: the target guest
//! physical address with two permission bits in the low bits. An entry with
//! neither bit set is cleared.

use crate::addressing::Gpa;

bitflags::bitflags! {
    /// Permission bits of a TCE.
    pub struct TceFlags: u64 {
        /// The device may read the target page.
        const READ = 1 << 0;
        /// The device may write the target page.
        const WRITE = 1 << 1;
    }
}

/// DMA direction derived from the permission bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    /// No access, the entry is cleared.
    None,
    /// Device reads memory.
    ToDevice,
    /// Device writes memory.
    FromDevice,
    /// Device reads and writes memory.
    Bidirectional,
}

impl DmaDirection {
    /// Permission bits that encode this direction.
    pub const fn flags(self) -> TceFlags {
        match self {
            DmaDirection::None => TceFlags::empty(),
            DmaDirection::ToDevice => TceFlags::READ,
            DmaDirection::FromDevice => TceFlags::WRITE,
            DmaDirection::Bidirectional => TceFlags::all(),
        }
    }

    /// Returns whether this direction maps anything.
    #[inline]
    pub const fn is_none(self) -> bool {
        matches!(self, DmaDirection::None)
    }
}

impl From<TceFlags> for DmaDirection {
    fn from(flags: TceFlags) -> Self {
        match (flags.contains(TceFlags::READ), flags.contains(TceFlags::WRITE)) {
            (true, true) => DmaDirection::Bidirectional,
            (true, false) => DmaDirection::ToDevice,
            (false, true) => DmaDirection::FromDevice,
            (false, false) => DmaDirection::None,
        }
    }
}

/// A raw TCE value as written by the guest.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Tce(u64);

impl Tce {
    /// The cleared entry.
    pub const CLEAR: Self = Self(0);

    /// Wrap a raw guest-supplied value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Build an entry pointing at `gpa` with `dir` permissions.
    #[inline]
    pub const fn new(gpa: Gpa, dir: DmaDirection) -> Self {
        Self((gpa.into_u64() & !TceFlags::all().bits()) | dir.flags().bits())
    }

    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Get the permission bits of this entry.
    #[inline]
    pub const fn flags(self) -> TceFlags {
        TceFlags::from_bits_truncate(self.0)
    }

    /// Get the DMA direction of this entry.
    #[inline]
    pub fn direction(self) -> DmaDirection {
        self.flags().into()
    }

    /// Target guest physical address with the permission bits stripped.
    #[inline]
    pub const fn gpa(self) -> Gpa {
        Gpa::new(self.0 & !TceFlags::all().bits())
    }
}

impl core::fmt::Debug for Tce {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Tce(0x{:x}, {:?})", self.gpa().into_u64(), self.direction())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_bits() {
        assert_eq!(Tce::from_raw(0x1000).direction(), DmaDirection::None);
        assert_eq!(Tce::from_raw(0x1001).direction(), DmaDirection::ToDevice);
        assert_eq!(Tce::from_raw(0x1002).direction(), DmaDirection::FromDevice);
        assert_eq!(Tce::from_raw(0x1003).direction(), DmaDirection::Bidirectional);
        assert_eq!(Tce::from_raw(0x1003).gpa(), Gpa::new(0x1000));
    }

    #[test]
    fn build() {
        let tce = Tce::new(Gpa::new(0x4000), DmaDirection::FromDevice);
        assert_eq!(tce.raw(), 0x4002);
        assert!(Tce::CLEAR.direction().is_none());
    }
}
