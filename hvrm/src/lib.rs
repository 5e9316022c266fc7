//! Real-mode hypervisor services.
//!
//! This crate implements the part of a hypervisor that runs on a hardware
//! thread right after a guest traps, before the host's full execution
//! environment is available. Code on this path must not allocate, fault or
//! sleep. Whatever cannot be done under that restriction is reported as
//! [`HvError::TooHard`], and the caller retries from a context that can.
//!
//! ## TCE virtualization
//! A guest programs DMA through per-bus translation tables ([`TceTable`]).
//! The guest updates them through four hypercalls:
//!
//! - `H_PUT_TCE` ([`tce_hcalls::h_put_tce`]) writes one entry.
//! - `H_PUT_TCE_INDIRECT` ([`tce_hcalls::h_put_tce_indirect`]) writes up to
//!   512 entries read from a guest page.
//! - `H_STUFF_TCE` ([`tce_hcalls::h_stuff_tce`]) clears a range.
//! - `H_GET_TCE` ([`tce_hcalls::h_get_tce`]) reads one entry.
//!
//! When passthrough devices are attached to a bus, every update is mirrored
//! into the hardware [`IommuTable`] of each device group, and each live
//! mapping holds a reference on the [`PinnedRegion`] its memory comes from.
//!
//! ## Vcore exit coordination
//! Hardware threads that run one virtual core together leave the guest
//! together. [`vcore::commence_exit`] lets any thread start
//! the exit and notify its siblings exactly once, and [`intr::read_intr`]
//! decides whether a pending external interrupt belongs to the host, wakes
//! the guest, or goes straight to a passthrough device.
//!
//! ## Hypercall ABI
//! [`hcall::dispatch`] decodes a [`hcall::Hypercall`] from the guest's
//! registers, runs it, and writes back the [`HcallStatus`].

pub mod addressing;
pub mod config;
pub mod hcall;
pub mod host;
pub mod icp;
pub mod intr;
pub mod iommu;
pub mod ipi;
pub mod mapper;
pub mod memslot;
pub mod page_table;
pub mod pinned;
pub mod rcu;
pub mod registry;
pub mod table;
pub mod tce;
pub mod tce_hcalls;
pub mod tce_list;
pub mod validate;
pub mod vcore;

pub use config::PlatformConfig;
pub use iommu::{IommuTable, SoftIommuTable};
pub use pinned::{PinnedMemory, PinnedRegion};
pub use registry::TableRegistry;
pub use table::TceTable;
pub use tce::{DmaDirection, Tce, TceFlags};

/// Failures of a real-mode operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HvError {
    /// The guest supplied a malformed request.
    #[error("invalid parameter")]
    Parameter,
    /// The request is valid but cannot be completed in real mode.
    #[error("cannot be completed in real mode")]
    TooHard,
    /// An underlying translation or pinning operation failed.
    #[error("hardware failure")]
    Hardware,
}

/// Guest-visible hypercall return code.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[repr(i64)]
pub enum HcallStatus {
    /// H_SUCCESS.
    Success = 0,
    /// H_HARDWARE.
    Hardware = -1,
    /// H_PARAMETER.
    Parameter = -4,
    /// H_TOO_HARD.
    TooHard = 9999,
}

impl From<HvError> for HcallStatus {
    fn from(e: HvError) -> Self {
        match e {
            HvError::Parameter => HcallStatus::Parameter,
            HvError::TooHard => HcallStatus::TooHard,
            HvError::Hardware => HcallStatus::Hardware,
        }
    }
}

impl HcallStatus {
    /// Convert the outcome of an operation into a return code.
    pub fn from_result<T>(r: &Result<T, HvError>) -> Self {
        match r {
            Ok(_) => HcallStatus::Success,
            Err(e) => (*e).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(i64::from(HcallStatus::Success), 0);
        assert_eq!(i64::from(HcallStatus::Hardware), -1);
        assert_eq!(i64::from(HcallStatus::Parameter), -4);
        assert_eq!(i64::from(HcallStatus::TooHard), 9999);
        assert_eq!(HcallStatus::try_from(9999i64).ok(), Some(HcallStatus::TooHard));
        assert!(HcallStatus::try_from(1i64).is_err());
        assert_eq!(
            HcallStatus::from_result::<()>(&Err(HvError::Parameter)),
            HcallStatus::Parameter
        );
    }
}
