//! Coordinated exit of the threads of a virtual core.
//!
//! All threads of a vcore enter and leave the guest together. The state of
//! the vcore lives in one word:
//!
//! ```text
//!  31           17  16   15        8  7         0
//! +---------------+----+------------+------------+
//! |      0        | RQ |  exit map  | entry map  |
//! +---------------+----+------------+------------+
//! ```
//!
//! A thread sets its entry bit when it enters the guest and its exit bit
//! when it starts leaving. The thread whose exit bit lands first notifies
//! every other thread still in the guest. `RQ` is set by a thread of
//! another sub-core to ask this vcore to exit.
//!
//! The word is only ever changed by compare-and-swap; nothing here waits
//! for another thread.

use crate::{config::PlatformConfig, host::HostThreadState, ipi::IpiSender, HvError};
use core::sync::atomic::{fence, AtomicU32, Ordering};
use crossbeam_utils::{Backoff, CachePadded};
use std::sync::Arc;

/// Exit request from another sub-core.
pub const VCORE_EXIT_REQ: u32 = 0x10000;

/// Exit state of one virtual core.
pub struct VcoreExitState {
    entry_exit_map: CachePadded<AtomicU32>,
    pcpu: usize,
    napping_threads: AtomicU32,
    conferring_threads: AtomicU32,
}

impl VcoreExitState {
    /// Create the state of a vcore whose thread 0 runs on `pcpu`.
    pub fn new(pcpu: usize) -> Self {
        Self {
            entry_exit_map: CachePadded::new(AtomicU32::new(0)),
            pcpu,
            napping_threads: AtomicU32::new(0),
            conferring_threads: AtomicU32::new(0),
        }
    }

    /// Physical CPU of thread 0.
    pub fn pcpu(&self) -> usize {
        self.pcpu
    }

    /// Raw entry/exit word.
    pub fn entry_exit_map(&self) -> u32 {
        self.entry_exit_map.load(Ordering::SeqCst)
    }

    /// Threads that are in the guest.
    pub fn entry_map(&self) -> u32 {
        self.entry_exit_map() & 0xff
    }

    /// Threads that are leaving the guest.
    pub fn exit_map(&self) -> u32 {
        (self.entry_exit_map() >> 8) & 0xff
    }

    /// Returns whether this vcore is exiting, or was asked to.
    pub fn is_exiting(&self) -> bool {
        self.entry_exit_map() >> 8 != 0
    }

    /// Mark `ptid` as entering the guest.
    ///
    /// Fails once the vcore started exiting; the thread must not enter.
    pub fn enter(&self, ptid: u32) -> bool {
        let backoff = Backoff::new();
        let mut cur = self.entry_exit_map.load(Ordering::Relaxed);
        loop {
            if cur >> 8 != 0 {
                return false;
            }
            match self.entry_exit_map.compare_exchange_weak(
                cur,
                cur | (1 << ptid),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(v) => {
                    cur = v;
                    backoff.spin();
                }
            }
        }
    }

    /// Clear the word once every thread is out of the guest.
    pub fn reset(&self) {
        self.entry_exit_map.store(0, Ordering::SeqCst);
    }

    /// Set or clear the napping (ceded) state of `ptid`.
    pub fn set_napping(&self, ptid: u32, napping: bool) {
        if napping {
            self.napping_threads.fetch_or(1 << ptid, Ordering::SeqCst);
        } else {
            self.napping_threads.fetch_and(!(1 << ptid), Ordering::SeqCst);
        }
    }

    /// Set `bits` in the word and return the previous value.
    fn set_bits(&self, bits: u32) -> u32 {
        let backoff = Backoff::new();
        let mut cur = self.entry_exit_map.load(Ordering::Relaxed);
        loop {
            match self.entry_exit_map.compare_exchange_weak(
                cur,
                cur | bits,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return prev,
                Err(v) => {
                    cur = v;
                    backoff.spin();
                }
            }
        }
    }

    /// Set [`VCORE_EXIT_REQ`] unless the vcore is exiting already.
    ///
    /// Returns the entry map to interrupt if the request was placed.
    fn request_exit(&self) -> Option<u32> {
        let backoff = Backoff::new();
        let mut cur = self.entry_exit_map.load(Ordering::Relaxed);
        loop {
            if cur >> 8 != 0 {
                return None;
            }
            match self.entry_exit_map.compare_exchange_weak(
                cur,
                cur | VCORE_EXIT_REQ,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Some(prev & 0xff),
                Err(v) => {
                    cur = v;
                    backoff.spin();
                }
            }
        }
    }

    /// Send an IPI to every thread set in `active`.
    fn interrupt(&self, active: u32, ipi: &dyn IpiSender) {
        // Order the exit map update before the notification.
        fence(Ordering::SeqCst);
        let mut active = active;
        let mut cpu = self.pcpu;
        while active != 0 {
            if active & 1 != 0 {
                ipi.send_ipi(cpu);
            }
            active >>= 1;
            cpu += 1;
        }
    }
}

impl core::fmt::Debug for VcoreExitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VcoreExitState")
            .field("pcpu", &self.pcpu)
            .field("entry_exit_map", &format_args!("{:#x}", self.entry_exit_map()))
            .finish()
    }
}

/// Layout of a physical core split into sub-cores.
#[derive(Default)]
pub struct SplitMode {
    master_vcs: [Option<Arc<VcoreExitState>>; crate::config::MAX_SUBCORES],
}

impl SplitMode {
    /// Create a layout from the vcore of each sub-core.
    pub fn new(vcores: impl IntoIterator<Item = Arc<VcoreExitState>>) -> Self {
        let mut split = Self::default();
        for (slot, vc) in split.master_vcs.iter_mut().zip(vcores) {
            *slot = Some(vc);
        }
        split
    }

    fn vcores(&self) -> impl Iterator<Item = &VcoreExitState> {
        self.master_vcs.iter().map_while(|vc| vc.as_deref())
    }
}

/// Start pulling the vcore of `thread` out of the guest.
///
/// Sets the thread's exit bit. Returns `true` if it was the first thread of
/// the vcore to do so; that thread notifies the siblings still in the guest
/// unless `trap` already takes them all out, and in split mode asks every
/// other sub-core to exit too.
pub fn commence_exit(
    thread: &HostThreadState,
    trap: u32,
    config: &PlatformConfig,
    ipi: &dyn IpiSender,
) -> bool {
    let vc = thread.vcore();
    let ptid = thread.ptid();
    let ee = vc.set_bits(0x100 << ptid);

    if ee >> 8 != 0 {
        return false;
    }
    if trap != config.hv_decrementer() {
        vc.interrupt(ee & !(1 << ptid) & 0xff, ipi);
    }

    if let Some(split) = thread.split() {
        for vc in split.vcores().take(config.subcores()) {
            if let Some(active) = vc.request_exit() {
                vc.interrupt(active, ipi);
            }
        }
    }
    true
}

/// Monotonic timebase of the processor.
pub trait Timebase {
    /// Current timebase value.
    fn get_tb(&self) -> u64;
    /// Timebase ticks per microsecond.
    fn ticks_per_usec(&self) -> u64;
}

/// How long H_CONFER waits for sibling threads, in microseconds.
const CONFER_SPIN_USEC: u64 = 10;

/// H_CONFER: give up the processor to another thread of the vcore.
///
/// Returns [`HvError::TooHard`] if every thread in the guest is ceded or
/// conferring, so the caller yields in virtual mode.
pub fn h_confer(thread: &HostThreadState, tb: &dyn Timebase) -> Result<(), HvError> {
    let vc = thread.vcore();
    let me = 1 << thread.ptid();
    let stop = tb.get_tb() + CONFER_SPIN_USEC * tb.ticks_per_usec();
    let mut r = Ok(());

    vc.conferring_threads.fetch_or(me, Ordering::SeqCst);
    while tb.get_tb() < stop && !vc.is_exiting() {
        let running = vc.entry_map();
        let ceded = vc.napping_threads.load(Ordering::SeqCst);
        let conferring = vc.conferring_threads.load(Ordering::SeqCst);
        if ceded | conferring == running {
            r = Err(HvError::TooHard);
            break;
        }
        core::hint::spin_loop();
    }
    vc.conferring_threads.fetch_and(!me, Ordering::SeqCst);
    r
}
