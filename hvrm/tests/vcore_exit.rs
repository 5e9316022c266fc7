mod common;

use hvrm::{
    addressing::Hpa,
    config::PlatformConfig,
    host::HostThreadState,
    icp::{IcpWrite, SoftIcp, IPI_PRIORITY, XICS_MFRR},
    ipi::{dbell_server_msg, Doorbell, IpiSender, PlatformIpi},
    vcore::{commence_exit, VcoreExitState},
};
use spin_lock::SpinLock;
use std::sync::{Arc, Barrier};

/// Counts IPIs per target cpu.
#[derive(Default)]
struct Recorder(SpinLock<Vec<usize>>);

impl Recorder {
    fn count(&self, cpu: usize) -> usize {
        self.0.lock().iter().filter(|c| **c == cpu).count()
    }
}

impl IpiSender for Recorder {
    fn send_ipi(&self, cpu: usize) {
        self.0.lock().push(cpu);
    }
}

#[derive(Default)]
struct Msgs(SpinLock<Vec<u64>>);

impl Doorbell for Msgs {
    fn msgsnd(&self, msg: u64) {
        self.0.lock().push(msg);
    }
}

fn vcore(pcpu: usize, threads: u32) -> (Arc<VcoreExitState>, Vec<HostThreadState>) {
    let vc = Arc::new(VcoreExitState::new(pcpu));
    let ts = (0..threads)
        .map(|p| HostThreadState::new(pcpu + p as usize, p, vc.clone()))
        .collect();
    (vc, ts)
}

#[test]
fn one_ipi_per_active_sibling() {
    common::init_log();
    let (vc, ts) = vcore(16, 4);
    // A, B and C are in the guest; D already left.
    for ptid in 0..3 {
        assert!(vc.enter(ptid));
    }
    let ipis = Recorder::default();
    let cfg = PlatformConfig::default();

    assert!(commence_exit(&ts[0], 0x500, &cfg, &ipis));
    assert!(!commence_exit(&ts[1], 0x500, &cfg, &ipis));
    assert!(!commence_exit(&ts[2], 0x500, &cfg, &ipis));

    assert_eq!(ipis.count(16), 0);
    assert_eq!(ipis.count(17), 1);
    assert_eq!(ipis.count(18), 1);
    assert_eq!(ipis.count(19), 0);
    assert_eq!(vc.exit_map(), 0b111);
}

#[test]
fn exactly_one_first_under_contention() {
    common::init_log();
    let cfg = PlatformConfig::default();
    for _ in 0..200 {
        let (vc, ts) = vcore(0, 4);
        for ptid in 0..4 {
            assert!(vc.enter(ptid));
        }
        let ipis = Recorder::default();
        let barrier = Barrier::new(4);
        let firsts: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = ts
                .iter()
                .map(|t| {
                    let (ipis, barrier, cfg) = (&ipis, &barrier, &cfg);
                    s.spawn(move || {
                        barrier.wait();
                        commence_exit(t, 0x500, cfg, ipis)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(firsts.iter().filter(|f| **f).count(), 1);
        let first = firsts.iter().position(|f| *f).unwrap();
        for cpu in 0..4 {
            let expected = usize::from(cpu != first);
            assert_eq!(ipis.count(cpu), expected);
        }
        assert_eq!(vc.exit_map(), 0b1111);
    }
}

#[test]
fn platform_ipis() {
    common::init_log();
    let cfg = PlatformConfig::default()
        .threads_per_core(4)
        .xics_phys((0..8).map(|c| Some(Hpa::new(0x3_0000_0000 + c * 0x1000))).collect());
    let icp = SoftIcp::new();
    let msgs = Msgs::default();

    // The vcore spans the second core: doorbells reach every sibling.
    let (vc, ts) = vcore(4, 4);
    for ptid in 0..4 {
        vc.enter(ptid);
    }
    let ipi = PlatformIpi::new(&cfg, &icp, &msgs, ts[1].cpu());
    assert!(commence_exit(&ts[1], 0x500, &cfg, &ipi));
    assert_eq!(
        *msgs.0.lock(),
        [dbell_server_msg(0), dbell_server_msg(2), dbell_server_msg(3)]
    );
    assert!(icp.writes().is_empty());

    // Without doorbells the ICPs are poked.
    let cfg = cfg.doorbells(false);
    let (vc, ts) = vcore(4, 2);
    vc.enter(0);
    vc.enter(1);
    let ipi = PlatformIpi::new(&cfg, &icp, &msgs, ts[0].cpu());
    assert!(commence_exit(&ts[0], 0x500, &cfg, &ipi));
    assert_eq!(
        icp.writes(),
        [IcpWrite::U8(Hpa::new(0x3_0000_5000) + XICS_MFRR, IPI_PRIORITY)]
    );
}
