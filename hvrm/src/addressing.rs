//! Address spaces seen by the real-mode handlers.
//!
//! Three kinds of addresses flow through a TCE hypercall:
//! the guest physical address encoded in a TCE ([`Gpa`]), the host userspace
//! address that backs that guest page in the VMM process ([`Ua`]), and the
//! host physical address that the IOMMU finally points at ([`Hpa`]).
//!
//! In real mode the MMU is off, so a host physical address is directly
//! dereferenceable. [`Hpa::as_ref`] is the only place this crate relies on it.

/// Page size.
pub const PAGE_SIZE: u64 = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: u32 = 12;
/// Mask for page offset.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new guest physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Guest frame number of this address.
    #[inline]
    pub const fn gfn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }
}

/// Host userspace address.
///
/// The address at which the VMM process mapped a piece of guest memory.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Ua(u64);

impl Ua {
    /// Create a new userspace address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

/// Host physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Hpa(u64);

impl Hpa {
    /// HPA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new host physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Get reference of T underlying the Hpa.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the address is a resident, properly
    /// aligned host location holding an initialized `T` which stays alive and
    /// unmodified for `'a`. Resolvers in this crate only hand out addresses of
    /// pinned or rmap-locked pages, which satisfy this for the duration of a
    /// hypercall.
    #[inline]
    pub unsafe fn as_ref<'a, T>(&self) -> Option<&'a T> {
        (self.0 as usize as *const T).as_ref()
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 += other
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = u64;

            fn sub(self, other: $t) -> u64 {
                self.0 - other.0
            }
        }
        impl core::ops::BitOr<u64> for $t {
            type Output = Self;

            fn bitor(self, other: u64) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<u64> for $t {
            type Output = Self;

            fn bitand(self, other: u64) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Gpa);
impl_arith!(Ua);
impl_arith!(Hpa);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arith() {
        let ua = Ua::new(0x7000_0000) + 0x1234;
        assert_eq!(ua.into_u64(), 0x7000_1234);
        assert_eq!(ua - Ua::new(0x7000_0000), 0x1234);
        assert_eq!((ua & !PAGE_MASK).into_u64(), 0x7000_1000);
        assert_eq!(Gpa::new(0x5123).gfn(), 5);
        assert_eq!(format!("{:?}", Hpa::new(0xff)), "Hpa(0xff)");
    }
}
