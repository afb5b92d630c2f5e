mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use hcacore::cq::syndrome;
use hcacore::sim::SimHca;
use hcacore::{
    AccessFlags, CommandInterface, DeviceEvent, Error, Hca, PortLifecycle, QpAttr, QpAttrMask,
    QpCapability, QpEvent, QpState, QpType, RecvWr, RemoteAddr, SendOpcode, SendWr, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};

use common::*;

const WAIT: Duration = Duration::from_secs(1);

fn sge(length: u32) -> [Sge; 1] {
    [Sge {
        addr: 0x10_0000,
        length,
        lkey: 0x100,
    }]
}

fn recv(wr_id: u64, sg_list: &[Sge]) -> RecvWr<'_> {
    RecvWr { wr_id, sg_list }
}

#[test]
fn rc_send_lands_in_the_posted_receive() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    assert_eq!(rig.sim.qp_state(a.qpn()), Some(QpState::Rts));

    let buf = sge(256);
    b.post_recv(&[recv(7, &buf)]).unwrap();
    let data = sge(100);
    a.post_send(&[SendWr::send(1, &data)]).unwrap();

    let wcs = poll_n(&cq, 2);
    assert_eq!(wcs.len(), 2);
    let (r, s) = (&wcs[0], &wcs[1]);
    assert!(r.is_ok() && s.is_ok());
    assert_eq!((r.wr_id, r.qp_num, r.src_qp), (7, b.qpn(), a.qpn()));
    assert_eq!(r.opcode, WcOpcode::Recv);
    assert_eq!(r.byte_len, 100);
    assert_eq!(r.imm_data, None);
    assert_eq!((s.wr_id, s.qp_num, s.opcode), (1, a.qpn(), WcOpcode::Send));
}

#[test]
fn immediate_data_reaches_both_sides() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let buf = sge(64);
    b.post_recv(&[recv(1, &buf), recv(2, &buf)]).unwrap();

    let data = sge(32);
    let send = SendWr {
        opcode: SendOpcode::SendWithImm,
        imm: Some(0xdead_beef),
        ..SendWr::send(10, &data)
    };
    let write = SendWr {
        opcode: SendOpcode::RdmaWriteWithImm,
        imm: Some(5),
        remote: Some(RemoteAddr {
            addr: 0x9000,
            rkey: 0x11,
        }),
        ..SendWr::send(11, &data)
    };
    a.post_send(&[send, write]).unwrap();

    let wcs = poll_n(&cq, 4);
    let recvs: Vec<_> = wcs.iter().filter(|wc| wc.qp_num == b.qpn()).collect();
    let sends: Vec<_> = wcs.iter().filter(|wc| wc.qp_num == a.qpn()).collect();
    assert_eq!(recvs.len(), 2);
    assert_eq!((recvs[0].opcode, recvs[0].imm_data), (WcOpcode::Recv, Some(0xdead_beef)));
    assert_eq!(
        (recvs[1].opcode, recvs[1].imm_data),
        (WcOpcode::RecvRdmaWithImm, Some(5))
    );
    assert_eq!((sends[0].wr_id, sends[0].opcode), (10, WcOpcode::Send));
    assert_eq!((sends[1].wr_id, sends[1].opcode), (11, WcOpcode::RdmaWrite));
    assert_eq!(sends[1].imm_data, Some(5));
}

#[test]
fn rdma_needs_a_remote_address() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, _b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let data = sge(8);
    let wr = SendWr {
        opcode: SendOpcode::RdmaWrite,
        ..SendWr::send(1, &data)
    };
    assert!(matches!(a.post_send(&[wr]), Err(Error::InvalidAttribute(_))));

    // a plain RDMA write consumes no receive
    let wr = SendWr {
        opcode: SendOpcode::RdmaWrite,
        remote: Some(RemoteAddr { addr: 0, rkey: 1 }),
        ..SendWr::send(2, &data)
    };
    a.post_send(&[wr]).unwrap();
    let wcs = poll_n(&cq, 1);
    assert_eq!((wcs[0].wr_id, wcs[0].opcode), (2, WcOpcode::RdmaWrite));
}

#[test]
fn unsignaled_sends_are_retired_by_a_later_completion() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, _b) = connected_pair(&rig.hca, &cq, QpType::UC);
    let data = sge(8);
    let quiet: Vec<SendWr> = (0..7)
        .map(|i| SendWr {
            signaled: false,
            ..SendWr::send(i, &data)
        })
        .collect();
    a.post_send(&quiet).unwrap();
    a.post_send(&[SendWr::send(99, &data)]).unwrap();
    assert!(matches!(
        a.post_send(&[SendWr::send(100, &data)]),
        Err(Error::QueueFull)
    ));

    let wcs = poll_n(&cq, 1);
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].wr_id, 99);
    assert!(wcs[0].is_ok());

    // the whole queue is free again
    let batch: Vec<SendWr> = (200..208).map(|i| SendWr::send(i, &data)).collect();
    a.post_send(&batch).unwrap();
    assert_eq!(poll_n(&cq, 8).len(), 8);
}

#[test]
fn sq_sig_all_signals_every_send() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let mut attr = qp_attr(QpType::UC, &cq);
    attr.sq_sig_all = true;
    let a = rig.hca.create_qp(attr).unwrap();
    let b = rig.hca.create_qp(qp_attr(QpType::UC, &cq)).unwrap();
    to_init(&a);
    to_init(&b);
    connect(&a, b.qpn());
    connect(&b, a.qpn());

    let data = sge(8);
    let wrs: Vec<SendWr> = (0..3)
        .map(|i| SendWr {
            signaled: false,
            ..SendWr::send(i, &data)
        })
        .collect();
    a.post_send(&wrs).unwrap();
    let ids: Vec<u64> = poll_n(&cq, 3).iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [0, 1, 2]);
}

#[test]
fn uc_send_without_receive_is_dropped() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::UC);
    let data = sge(8);
    a.post_send(&[SendWr::send(3, &data)]).unwrap();

    let wcs = poll_n(&cq, 1);
    assert_eq!((wcs[0].wr_id, wcs[0].status), (3, WcStatus::Success));
    assert_eq!(rig.sim.qp_state(b.qpn()), Some(QpState::Rts));
    let mut wc = [WorkCompletion::default(); 4];
    assert!(cq.poll(&mut wc).is_empty());
}

#[test]
fn rc_send_without_receive_fails_and_flushes_the_rest() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, _b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let data = sge(8);

    a.post_send(&[SendWr::send(1, &data)]).unwrap();
    let wcs = poll_n(&cq, 1);
    assert_eq!((wcs[0].wr_id, wcs[0].status), (1, WcStatus::RnrRetryExcErr));
    assert_eq!(rig.sim.qp_state(a.qpn()), Some(QpState::Error));

    a.post_send(&[SendWr::send(2, &data), SendWr::send(3, &data)])
        .unwrap();
    let wcs = poll_n(&cq, 2);
    let ids: Vec<u64> = wcs.iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [2, 3]);
    assert!(wcs.iter().all(|wc| wc.status == WcStatus::WrFlushErr));
}

#[test]
fn short_receive_buffer_is_a_length_error() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let small = sge(16);
    b.post_recv(&[recv(5, &small)]).unwrap();
    let data = sge(64);
    a.post_send(&[SendWr::send(6, &data)]).unwrap();

    let wcs = poll_n(&cq, 2);
    let r = wcs.iter().find(|wc| wc.qp_num == b.qpn()).unwrap();
    let s = wcs.iter().find(|wc| wc.qp_num == a.qpn()).unwrap();
    assert_eq!((r.wr_id, r.status), (5, WcStatus::LocLenErr));
    assert_eq!((s.wr_id, s.status), (6, WcStatus::RemInvReqErr));
}

#[test]
fn injected_send_fault_is_reported() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let buf = sge(64);
    b.post_recv(&[recv(1, &buf)]).unwrap();

    rig.sim.fail_next_send(a.qpn(), syndrome::LOCAL_PROT);
    a.post_send(&[SendWr::send(9, &buf)]).unwrap();
    let wcs = poll_n(&cq, 1);
    assert_eq!((wcs[0].wr_id, wcs[0].status), (9, WcStatus::LocProtErr));
    assert_eq!(wcs[0].qp_num, a.qpn());
}

#[test]
fn error_state_flushes_posted_receives_in_order() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);
    let buf = sge(64);
    qp.post_recv(&[recv(10, &buf), recv(11, &buf), recv(12, &buf)])
        .unwrap();

    qp.modify(QpState::Error, &QpAttr::new()).unwrap();
    assert_eq!(qp.state(), QpState::Error);

    let wcs = poll_n(&cq, 3);
    let ids: Vec<u64> = wcs.iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [10, 11, 12]);
    assert!(wcs
        .iter()
        .all(|wc| wc.status == WcStatus::WrFlushErr && wc.qp_num == qp.qpn()));
    let mut wc = [WorkCompletion::default(); 4];
    assert!(cq.poll(&mut wc).is_empty());

    assert!(matches!(
        qp.post_recv(&[recv(13, &buf)]),
        Err(Error::InvalidState)
    ));
}

#[test]
fn reset_discards_completions_and_rewinds_the_queues() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let buf = sge(64);
    b.post_recv(&[recv(1, &buf)]).unwrap();
    a.post_send(&[SendWr::send(2, &buf)]).unwrap();

    a.modify(QpState::Reset, &QpAttr::new()).unwrap();
    assert_eq!(rig.sim.qp_state(a.qpn()), Some(QpState::Reset));
    let wcs = poll_n(&cq, 1);
    assert_eq!(wcs.len(), 1);
    assert_eq!((wcs[0].qp_num, wcs[0].wr_id), (b.qpn(), 1));

    to_init(&a);
    connect(&a, b.qpn());
    b.post_recv(&[recv(3, &buf)]).unwrap();
    a.post_send(&[SendWr::send(4, &buf)]).unwrap();
    let ids: Vec<u64> = poll_n(&cq, 2).iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [3, 4]);
}

#[test]
fn sqd_holds_sends_until_back_in_rts() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let (tx, rx) = mpsc::channel();
    a.set_event_handler(move |ev| {
        let _ = tx.send(ev);
    });

    a.modify(QpState::Sqd, &QpAttr::new().en_sqd_async_notify(true))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), QpEvent::SqDrained);
    assert!(!a.sq_draining());
    assert_eq!(a.state(), QpState::Sqd);

    let buf = sge(64);
    b.post_recv(&[recv(1, &buf)]).unwrap();
    a.post_send(&[SendWr::send(2, &buf)]).unwrap();
    let mut wc = [WorkCompletion::default(); 4];
    assert!(cq.poll(&mut wc).is_empty());

    a.modify(QpState::Rts, &QpAttr::new()).unwrap();
    let ids: Vec<u64> = poll_n(&cq, 2).iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [1, 2]);
}

#[test]
fn receive_queue_holds_exactly_its_size() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    let buf = sge(64);
    assert!(matches!(
        qp.post_recv(&[recv(0, &buf)]),
        Err(Error::InvalidState)
    ));
    to_init(&qp);

    let nine: Vec<RecvWr> = (0..9).map(|i| recv(i, &buf)).collect();
    assert!(matches!(qp.post_recv(&nine), Err(Error::QueueFull)));
    for wr in &nine[..8] {
        qp.post_recv(std::slice::from_ref(wr)).unwrap();
    }
    assert!(matches!(
        qp.post_recv(&nine[8..]),
        Err(Error::QueueFull)
    ));

    // sends need RTS or SQD
    assert!(matches!(
        qp.post_send(&[SendWr::send(1, &buf)]),
        Err(Error::InvalidState)
    ));
}

#[test]
fn capabilities_are_checked_and_rounded() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let mut attr = qp_attr(QpType::RC, &cq);
    attr.cap = QpCapability {
        max_send_wr: 5,
        max_recv_wr: 0,
        max_send_sge: 2,
        max_recv_sge: 1,
    };
    let qp = rig.hca.create_qp(attr.clone()).unwrap();
    assert_eq!(qp.cap().max_send_wr, 8);
    assert_eq!(qp.cap().max_recv_wr, 1);

    attr.cap.max_send_sge = 4;
    assert!(matches!(
        rig.hca.create_qp(attr.clone()),
        Err(Error::InvalidAttribute(_))
    ));
    attr.cap.max_send_sge = 1;
    attr.cap.max_recv_wr = 1 << 20;
    assert!(matches!(
        rig.hca.create_qp(attr),
        Err(Error::InvalidAttribute(_))
    ));
    assert!(matches!(
        rig.hca.create_qp(qp_attr(QpType::SMI, &cq)),
        Err(Error::InvalidAttribute(_))
    ));
}

#[test]
fn transitions_are_checked_before_any_command() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    rig.sim.clear_commands();

    assert!(matches!(
        qp.modify(QpState::Rts, &QpAttr::new()),
        Err(Error::InvalidTransition {
            from: QpState::Reset,
            to: QpState::Rts
        })
    ));
    let init = QpAttr::new()
        .pkey_index(0)
        .port_num(1)
        .access_flags(AccessFlags::REMOTE_WRITE);
    match qp.modify(QpState::Init, &init.clone().qkey(7)) {
        Err(Error::ExtraneousAttribute(extra)) => assert_eq!(extra, QpAttrMask::QKEY),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        qp.modify(QpState::Init, &init.clone().port_num(3)),
        Err(Error::InvalidAttribute(_))
    ));
    assert!(matches!(
        qp.modify(QpState::Init, &init.clone().pkey_index(64)),
        Err(Error::InvalidAttribute(_))
    ));
    assert!(rig.sim.commands().is_empty());
    assert_eq!(qp.state(), QpState::Reset);

    qp.modify(QpState::Init, &init).unwrap();
    assert_eq!(qp.port(), 1);
}

#[test]
fn firmware_rejection_leaves_the_state_alone() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    rig.sim
        .fail_next_command(hcacore::Opcode::Rst2InitQp, hcacore::CommandStatus::BadParam);
    let init = QpAttr::new()
        .pkey_index(0)
        .port_num(1)
        .access_flags(AccessFlags::REMOTE_WRITE);
    assert!(matches!(
        qp.modify(QpState::Init, &init),
        Err(Error::Firmware { .. })
    ));
    assert_eq!(qp.state(), QpState::Reset);
    qp.modify(QpState::Init, &init).unwrap();
}

fn smi_init() -> QpAttr {
    QpAttr::new().pkey_index(0).qkey(0)
}

#[test]
fn qp0_drives_the_port() {
    let rig = attach();
    let (tx, rx) = mpsc::channel();
    rig.hca.set_event_handler(move |ev| {
        let _ = tx.send(ev);
    });
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp0 = rig
        .hca
        .create_special_qp(qp_attr(QpType::SMI, &cq), 1)
        .unwrap();
    assert_eq!(qp0.qpn(), 8);
    assert_eq!(qp0.port(), 1);
    assert_eq!(rig.sim.special_qp_base(0), Some(8));
    assert_eq!(rig.sim.special_qp_base(1), Some(10));

    qp0.modify(QpState::Init, &smi_init()).unwrap();
    assert!(!rig.sim.port_active(1));
    qp0.modify(QpState::Rtr, &QpAttr::new()).unwrap();
    assert!(rig.sim.port_active(1));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), DeviceEvent::PortActive(1));

    qp0.modify(QpState::Rts, &QpAttr::new().sq_psn(0)).unwrap();
    qp0.modify(QpState::Error, &QpAttr::new()).unwrap();
    assert!(!rig.sim.port_active(1));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), DeviceEvent::PortError(1));
}

#[test]
fn special_qps_are_unique_per_port() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp0 = rig
        .hca
        .create_special_qp(qp_attr(QpType::SMI, &cq), 1)
        .unwrap();
    assert!(matches!(
        rig.hca.create_special_qp(qp_attr(QpType::SMI, &cq), 1),
        Err(Error::InUse)
    ));
    let qp1 = rig
        .hca
        .create_special_qp(qp_attr(QpType::GSI, &cq), 2)
        .unwrap();
    assert_eq!(qp1.qpn(), 11);
    assert!(matches!(
        rig.hca.create_special_qp(qp_attr(QpType::GSI, &cq), 3),
        Err(Error::InvalidAttribute(_))
    ));
    assert!(matches!(
        rig.hca.create_special_qp(qp_attr(QpType::RC, &cq), 1),
        Err(Error::InvalidAttribute(_))
    ));

    // the port of a special QP cannot be changed
    assert!(matches!(
        qp0.modify(QpState::Init, &smi_init().port_num(2)),
        Err(Error::InvalidAttribute(_))
    ));

    // the number is free again once the QP is gone
    drop(qp0);
    rig.hca
        .create_special_qp(qp_attr(QpType::SMI, &cq), 1)
        .unwrap();
}

#[derive(Default)]
struct RecordingPorts {
    calls: Mutex<Vec<(bool, u8)>>,
}

impl PortLifecycle for RecordingPorts {
    fn bring_up(&self, _cmd: &CommandInterface, port: u8) -> hcacore::Result<()> {
        self.calls.lock().push((true, port));
        Ok(())
    }

    fn bring_down(&self, _cmd: &CommandInterface, port: u8) -> hcacore::Result<()> {
        self.calls.lock().push((false, port));
        Ok(())
    }
}

#[test]
fn port_lifecycle_can_be_replaced() {
    init_logger();
    let config = config();
    let sim = Arc::new(SimHca::new(&config));
    let ports = Arc::new(RecordingPorts::default());
    let hca = Hca::attach_with_ports(sim.clone(), sim.dma(), config, ports.clone()).unwrap();

    let cq = hca.create_cq(16, 0).unwrap();
    let qp0 = hca.create_special_qp(qp_attr(QpType::SMI, &cq), 2).unwrap();
    qp0.modify(QpState::Init, &smi_init()).unwrap();
    qp0.modify(QpState::Rtr, &QpAttr::new()).unwrap();
    qp0.modify(QpState::Reset, &QpAttr::new()).unwrap();

    assert_eq!(*ports.calls.lock(), [(true, 2), (false, 2)]);
    assert!(!sim.port_active(2));
}

#[test]
fn async_qp_events_reach_the_handler() {
    use hcacore::eq::{EventType, QpEventData};

    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    let (tx, rx) = mpsc::channel();
    qp.set_event_handler(move |ev| {
        let _ = tx.send(ev);
    });

    // events for QPs that do not exist are dropped
    rig.sim
        .post_event(EventType::WqCatastrophic, 0, &QpEventData::new(0x3e));
    rig.sim
        .post_event(EventType::WqCatastrophic, 0, &QpEventData::new(qp.qpn()));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), QpEvent::Fatal);
    rig.sim
        .post_event(EventType::CommEstablished, 0, &QpEventData::new(qp.qpn()));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), QpEvent::CommEstablished);
}

#[test]
fn event_handler_may_modify_and_destroy_its_qp() {
    use hcacore::eq::{EventType, QpEventData};
    use hcacore::Opcode;

    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);
    let qpn = qp.qpn();

    // the handler owns the last handle and lets go of it when done
    let slot = Arc::new(Mutex::new(Some(qp.clone())));
    let (tx, rx) = mpsc::channel();
    {
        let slot = Arc::clone(&slot);
        qp.set_event_handler(move |ev| {
            let Some(qp) = slot.lock().take() else {
                return;
            };
            let res = qp.modify(QpState::Error, &QpAttr::new());
            let _ = tx.send((ev, res, qp.state()));
        });
    }
    drop(qp);

    rig.sim
        .post_event(EventType::CommEstablished, 0, &QpEventData::new(qpn));
    let (ev, res, state) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ev, QpEvent::CommEstablished);
    assert!(res.is_ok(), "{:?}", res);
    assert_eq!(state, QpState::Error);

    assert!(wait_for(WAIT, || rig
        .sim
        .commands()
        .iter()
        .any(|c| c.opcode == Opcode::Any2RstQp && c.in_modifier == qpn)));
    assert!(slot.lock().is_none());
    rig.hca.cmd().nop().unwrap();
}
