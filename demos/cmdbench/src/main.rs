use minstant::Instant;

use cmdbench::cli::get_args;
use cmdbench::{attach_sim, load_config, Stats};
use hcacore::qp::Mtu;
use hcacore::{
    AccessFlags, AhAttr, CompletionQueue, Hca, HcaConfig, QpAttr, QpCapability, QpInitAttr,
    QpState, QpType, QueuePair, RemoteAddr, SendOpcode, SendWr, Sge, WorkCompletion,
};

fn run_nop(config: HcaConfig, enable_events: bool) -> anyhow::Result<()> {
    let args = get_args();
    let (_sim, hca) = attach_sim(HcaConfig {
        enable_events,
        ..config
    })?;
    let mode = if hca.is_event_driven() { "event driven" } else { "polled" };

    let mut samples = Vec::with_capacity(args.num_iters);
    for i in 0..args.warmup + args.num_iters {
        let start = Instant::now();
        hca.cmd().nop()?;
        if i >= args.warmup {
            samples.push(start.elapsed());
        }
    }
    if let Some(stats) = Stats::from_samples(&mut samples) {
        println!("NOP ({mode}): {stats}");
    }
    Ok(())
}

/// An RC pair on one CQ, connected to each other and in RTS.
fn connect(
    hca: &Hca,
    config: &HcaConfig,
) -> anyhow::Result<(CompletionQueue, QueuePair, QueuePair)> {
    let args = get_args();
    let cq = hca.create_cq(args.tx_depth * 2, 0)?;
    let init_attr = || QpInitAttr {
        send_cq: cq.clone(),
        recv_cq: cq.clone(),
        cap: QpCapability {
            max_send_wr: args.tx_depth,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
        },
        qp_type: QpType::RC,
        sq_sig_all: false,
    };
    let a = hca.create_qp(init_attr())?;
    let b = hca.create_qp(init_attr())?;

    let init = QpAttr::new()
        .pkey_index(0)
        .port_num(1)
        .access_flags(AccessFlags::REMOTE_WRITE);
    let rts = QpAttr::new()
        .timeout(14)
        .retry_cnt(7)
        .rnr_retry(7)
        .sq_psn(0)
        .max_rd_atomic(config.max_qp_rd_atomic.min(1));
    for (qp, dest) in [(&a, b.qpn()), (&b, a.qpn())] {
        qp.modify(QpState::Init, &init)?;
        let rtr = QpAttr::new()
            .ah_attr(AhAttr {
                dlid: 1,
                ..Default::default()
            })
            .path_mtu(Mtu::Mtu1024)
            .dest_qp_num(dest)
            .rq_psn(0)
            .max_dest_rd_atomic(config.max_dest_rd_atomic.min(1))
            .min_rnr_timer(12);
        qp.modify(QpState::Rtr, &rtr)?;
        qp.modify(QpState::Rts, &rts)?;
    }
    Ok((cq, a, b))
}

fn run_write_bw(config: HcaConfig) -> anyhow::Result<()> {
    let args = get_args();
    let (_sim, hca) = attach_sim(config.clone())?;
    let (cq, qp, _peer) = connect(&hca, &config)?;

    let sge = [Sge {
        addr: 0x10_0000,
        length: args.size,
        lkey: 0,
    }];
    let remote = RemoteAddr {
        addr: 0x20_0000,
        rkey: 0,
    };
    let tx_depth = args.tx_depth as usize;
    let total_iters = args.num_iters + args.warmup;
    let mut completions = [WorkCompletion::default(); 32];

    let mut scnt = 0;
    let mut rcnt = 0;
    let mut start = Instant::now();
    while rcnt < total_iters {
        while scnt < rcnt + tx_depth && scnt < total_iters {
            let wr = SendWr {
                opcode: SendOpcode::RdmaWrite,
                remote: Some(remote),
                ..SendWr::send(scnt as u64, &sge)
            };
            qp.post_send(&[wr])?;
            scnt += 1;
        }
        for wc in cq.poll(&mut completions).iter() {
            anyhow::ensure!(wc.is_ok(), "wc failed: {:?}", wc);
            rcnt += 1;
            if rcnt == args.warmup {
                start = Instant::now();
            }
        }
    }

    let dura = start.elapsed().as_secs_f64();
    let rps = args.num_iters as f64 / dura;
    let bw_gbps = 8e-9 * (args.num_iters as u64 * u64::from(args.size)) as f64 / dura;
    println!("RDMA write (RC loopback): {:.2} rps, {:.2} Gb/s", rps, bw_gbps);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = get_args();
    let config = load_config()?;

    if !args.no_polling {
        run_nop(config.clone(), false)?;
    }
    if !args.no_events {
        run_nop(config.clone(), true)?;
    }
    run_write_bw(config)?;
    Ok(())
}
