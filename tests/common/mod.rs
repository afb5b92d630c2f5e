#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hcacore::qp::Mtu;
use hcacore::sim::SimHca;
use hcacore::{
    AccessFlags, AhAttr, CompletionQueue, Hca, HcaConfig, QpAttr, QpCapability, QpInitAttr,
    QpState, QpType, QueuePair, WorkCompletion,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small tables and short timeouts.
pub fn config() -> HcaConfig {
    HcaConfig {
        num_qps: 64,
        num_cqs: 16,
        num_mpts: 256,
        num_mtt_segs: 256,
        num_mgms: 8,
        num_amgms: 8,
        max_cmds: 8,
        class_a_ms: 2_000,
        class_b_ms: 2_000,
        class_c_ms: 2_000,
        go_bit_timeout_ms: 100,
        ..HcaConfig::default()
    }
}

pub struct Rig {
    pub sim: Arc<SimHca>,
    pub hca: Hca,
}

pub fn attach_with(config: HcaConfig) -> Rig {
    init_logger();
    let sim = Arc::new(SimHca::new(&config));
    let hca = Hca::attach(sim.clone(), sim.dma(), config).unwrap();
    Rig { sim, hca }
}

pub fn attach() -> Rig {
    attach_with(config())
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + timeout;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Polls until `n` completions have been collected or a second passed.
pub fn poll_n(cq: &CompletionQueue, n: usize) -> Vec<WorkCompletion> {
    let mut out = Vec::new();
    let mut wc = [WorkCompletion::default(); 8];
    wait_for(Duration::from_secs(1), || {
        out.extend_from_slice(cq.poll(&mut wc));
        out.len() >= n
    });
    out
}

pub fn qp_attr(qp_type: QpType, cq: &CompletionQueue) -> QpInitAttr {
    QpInitAttr {
        send_cq: cq.clone(),
        recv_cq: cq.clone(),
        cap: QpCapability {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 1,
            max_recv_sge: 1,
        },
        qp_type,
        sq_sig_all: false,
    }
}

pub fn to_init(qp: &QueuePair) {
    let attr = QpAttr::new()
        .pkey_index(0)
        .port_num(1)
        .access_flags(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ);
    qp.modify(QpState::Init, &attr).unwrap();
}

/// INIT -> RTR -> RTS towards `dest`.
pub fn connect(qp: &QueuePair, dest: u32) {
    let ah = AhAttr {
        dlid: 1,
        ..Default::default()
    };
    let rtr = match qp.qp_type() {
        QpType::RC => QpAttr::new()
            .ah_attr(ah)
            .path_mtu(Mtu::Mtu1024)
            .dest_qp_num(dest)
            .rq_psn(0)
            .max_dest_rd_atomic(1)
            .min_rnr_timer(12),
        _ => QpAttr::new()
            .ah_attr(ah)
            .path_mtu(Mtu::Mtu1024)
            .dest_qp_num(dest)
            .rq_psn(0),
    };
    qp.modify(QpState::Rtr, &rtr).unwrap();

    let rts = match qp.qp_type() {
        QpType::RC => QpAttr::new()
            .timeout(14)
            .retry_cnt(7)
            .rnr_retry(7)
            .sq_psn(0)
            .max_rd_atomic(1),
        _ => QpAttr::new().sq_psn(0).max_rd_atomic(0),
    };
    qp.modify(QpState::Rts, &rts).unwrap();
}

/// Two QPs of `qp_type` on one CQ, connected to each other and in RTS.
pub fn connected_pair(hca: &Hca, cq: &CompletionQueue, qp_type: QpType) -> (QueuePair, QueuePair) {
    let a = hca.create_qp(qp_attr(qp_type, cq)).unwrap();
    let b = hca.create_qp(qp_attr(qp_type, cq)).unwrap();
    to_init(&a);
    to_init(&b);
    connect(&a, b.qpn());
    connect(&b, a.qpn());
    (a, b)
}
