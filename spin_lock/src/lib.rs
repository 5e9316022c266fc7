//! Busy-waiting mutual exclusion for contexts that must never sleep.
#![cfg_attr(not(test), no_std)]

mod smplock;
pub use smplock::*;
