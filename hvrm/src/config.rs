//! Platform description used by the real-mode paths.

use crate::addressing::Hpa;

/// Trap number of the hypervisor decrementer interrupt.
pub const HV_DECREMENTER_TRAP: u32 = 0x980;

/// Maximum number of sub-cores a physical core is split into.
pub const MAX_SUBCORES: usize = 4;

/// Description of the host platform.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    threads_per_core: usize,
    doorbells: bool,
    xics_phys: Vec<Option<Hpa>>,
    hv_decrementer_trap: u32,
    max_subcores: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            threads_per_core: 8,
            doorbells: true,
            xics_phys: Vec::new(),
            hv_decrementer_trap: HV_DECREMENTER_TRAP,
            max_subcores: MAX_SUBCORES,
        }
    }
}

impl PlatformConfig {
    /// Set the number of hardware threads per core.
    pub fn threads_per_core(mut self, n: usize) -> Self {
        self.threads_per_core = n.max(1);
        self
    }

    /// Set whether threads of one core can message each other with
    /// doorbells.
    pub fn doorbells(mut self, doorbells: bool) -> Self {
        self.doorbells = doorbells;
        self
    }

    /// Set the interrupt controller base address of each hardware thread.
    pub fn xics_phys(mut self, bases: Vec<Option<Hpa>>) -> Self {
        self.xics_phys = bases;
        self
    }

    /// Set the trap number after which sibling threads are known to be
    /// leaving the guest already.
    pub fn hv_decrementer_trap(mut self, trap: u32) -> Self {
        self.hv_decrementer_trap = trap;
        self
    }

    /// Set the number of sub-cores considered in split mode.
    pub fn max_subcores(mut self, n: usize) -> Self {
        self.max_subcores = n.min(MAX_SUBCORES);
        self
    }

    /// Returns whether doorbells are available.
    pub fn has_doorbells(&self) -> bool {
        self.doorbells
    }

    /// Interrupt controller base address of `cpu`.
    pub fn xics_base(&self, cpu: usize) -> Option<Hpa> {
        self.xics_phys.get(cpu).copied().flatten()
    }

    /// First thread of the core `cpu` belongs to.
    pub fn first_thread_sibling(&self, cpu: usize) -> usize {
        cpu - cpu % self.threads_per_core
    }

    /// Index of `cpu` within its core.
    pub fn thread_in_core(&self, cpu: usize) -> usize {
        cpu % self.threads_per_core
    }

    /// Trap number of the hypervisor decrementer.
    pub fn hv_decrementer(&self) -> u32 {
        self.hv_decrementer_trap
    }

    /// Number of sub-cores considered in split mode.
    pub fn subcores(&self) -> usize {
        self.max_subcores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology() {
        let cfg = PlatformConfig::default()
            .threads_per_core(4)
            .xics_phys(vec![None, Some(Hpa::new(0x3000_0000))]);
        assert_eq!(cfg.first_thread_sibling(6), 4);
        assert_eq!(cfg.thread_in_core(6), 2);
        assert_eq!(cfg.xics_base(1), Some(Hpa::new(0x3000_0000)));
        assert_eq!(cfg.xics_base(0), None);
        assert_eq!(cfg.xics_base(9), None);
        assert_eq!(cfg.hv_decrementer(), 0x980);
        assert_eq!(PlatformConfig::default().max_subcores(9).subcores(), 4);
    }
}
