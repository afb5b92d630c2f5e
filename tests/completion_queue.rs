mod common;

use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use hcacore::cq::Cqe;
use hcacore::hw::Doorbell;
use hcacore::qp::{RecvWr, SendWr, Sge};
use hcacore::{CqEvent, Error, Opcode, QpType, WcOpcode, WorkCompletion};

use common::*;

const WAIT: Duration = Duration::from_secs(1);
const QUIET: Duration = Duration::from_millis(50);

#[test]
fn polling_an_empty_cq_changes_nothing() {
    let rig = attach();
    let cq = rig.hca.create_cq(4, 0).unwrap();
    rig.sim.take_doorbells();

    let mut wc = [WorkCompletion::default(); 4];
    assert!(cq.poll(&mut wc).is_empty());
    assert!(cq.poll(&mut wc).is_empty());
    assert!(rig.sim.take_doorbells().is_empty());
}

#[test]
fn sizes_round_up_and_bad_arguments_are_rejected() {
    let rig = attach();
    assert_eq!(rig.hca.create_cq(5, 0).unwrap().entries(), 8);
    assert_eq!(rig.hca.create_cq(1, 0).unwrap().entries(), 2);
    assert!(matches!(
        rig.hca.create_cq(0, 0),
        Err(Error::InvalidAttribute(_))
    ));
    assert!(matches!(
        rig.hca.create_cq(4, 1),
        Err(Error::InvalidAttribute(_))
    ));
}

#[test]
fn cq_numbers_run_out_and_come_back() {
    let rig = attach();
    // one CQ number is reserved
    let mut cqs: Vec<_> = (0..15).map(|_| rig.hca.create_cq(2, 0).unwrap()).collect();
    assert!(matches!(
        rig.hca.create_cq(2, 0),
        Err(Error::ResourceExhausted(_))
    ));

    let freed = cqs.pop().unwrap().cqn();
    let (_, _, hw_cqs) = rig.sim.hw_objects();
    assert_eq!(hw_cqs, 14);
    let again = rig.hca.create_cq(2, 0).unwrap();
    assert_ne!(again.cqn(), 0);
    assert_eq!(again.cqn() & 15, freed & 15);
}

#[test]
fn armed_cq_calls_the_completion_handler_once() {
    let rig = attach();
    let cq = rig.hca.create_cq(8, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);

    let (tx, rx) = mpsc::channel();
    let sim = rig.sim.clone();
    cq.set_comp_handler(move |cqn| {
        let _ = tx.send((cqn, sim.take_doorbells()));
    });

    cq.arm(false);
    assert!(rig.sim.cq_armed(cq.cqn()));
    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), 0, 16, 0, None));

    let (cqn, doorbells) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(cqn, cq.cqn());
    assert!(doorbells.contains(&Doorbell::CqArm {
        cqn,
        ci: 0,
        sn: 1,
        solicited: false
    }));
    assert!(doorbells
        .iter()
        .any(|db| matches!(db, Doorbell::CqDisarm { cqn: c, .. } if *c == cqn)));
    assert!(!rig.sim.cq_armed(cq.cqn()));

    // not re-armed: no further call
    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), 64, 16, 0, None));
    assert!(rx.recv_timeout(QUIET).is_err());

    // the sequence number moved on with the event
    assert_eq!(poll_n(&cq, 2).len(), 2);
    rig.sim.take_doorbells();
    cq.arm(false);
    let arms: Vec<_> = rig
        .sim
        .take_doorbells()
        .into_iter()
        .filter_map(|db| match db {
            Doorbell::CqArm { ci, sn, .. } => Some((ci, sn)),
            _ => None,
        })
        .collect();
    assert_eq!(arms, [(2, 2)]);
}

#[test]
fn arming_with_queued_entries_fires_at_once() {
    let rig = attach();
    let cq = rig.hca.create_cq(8, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);
    let (tx, rx) = mpsc::channel();
    cq.set_comp_handler(move |cqn| {
        let _ = tx.send(cqn);
    });

    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), 0, 16, 0, None));
    assert!(rx.recv_timeout(QUIET).is_err());
    cq.arm(false);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), cq.cqn());
}

#[test]
fn solicited_arm_waits_for_a_solicited_receive() {
    let rig = attach();
    let cq = rig.hca.create_cq(16, 0).unwrap();
    let (a, b) = connected_pair(&rig.hca, &cq, QpType::RC);
    let (tx, rx) = mpsc::channel();
    cq.set_comp_handler(move |cqn| {
        let _ = tx.send(cqn);
    });

    let sge = [Sge {
        addr: 0x1000,
        length: 64,
        lkey: 0,
    }];
    b.post_recv(&[
        RecvWr {
            wr_id: 1,
            sg_list: &sge,
        },
        RecvWr {
            wr_id: 2,
            sg_list: &sge,
        },
    ])
    .unwrap();

    cq.arm(true);
    let plain = SendWr {
        signaled: false,
        ..SendWr::send(10, &sge)
    };
    a.post_send(&[plain]).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
    assert!(rig.sim.cq_armed(cq.cqn()));

    let solicited = SendWr {
        signaled: false,
        solicited: true,
        ..SendWr::send(11, &sge)
    };
    a.post_send(&[solicited]).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), cq.cqn());

    let wcs = poll_n(&cq, 2);
    let ids: Vec<u64> = wcs.iter().map(|wc| wc.wr_id).collect();
    assert_eq!(ids, [1, 2]);
    assert!(wcs.iter().all(|wc| wc.opcode == WcOpcode::Recv && wc.is_ok()));
}

#[test]
fn overrun_reports_an_error_event() {
    let rig = attach();
    let cq = rig.hca.create_cq(2, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);
    let (tx, rx) = mpsc::channel();
    cq.set_event_handler(move |ev| {
        let _ = tx.send(ev);
    });

    for i in 0..3 {
        rig.sim
            .push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), i << 6, 8, 0, None));
    }
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        CqEvent::Error { syndrome: 1 }
    );
    assert!(rig.sim.cq_overflowed(cq.cqn()));
    // what made it into the ring is still there
    assert_eq!(poll_n(&cq, 2).len(), 2);
}

#[test]
fn entries_of_unknown_qps_are_skipped() {
    let rig = attach();
    let cq = rig.hca.create_cq(8, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);

    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(0x3f, 0, 10, 0, None));
    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), 0, 77, 0, None));
    rig.sim.take_doorbells();

    let mut wc = [WorkCompletion::default(); 4];
    let polled = cq.poll(&mut wc);
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].qp_num, qp.qpn());
    assert_eq!(polled[0].byte_len, 77);
    // both slots were handed back
    assert_eq!(
        rig.sim.take_doorbells(),
        [Doorbell::CqSetCi {
            cqn: cq.cqn(),
            ci: 2
        }]
    );
    assert!(cq.poll(&mut wc).is_empty());
}

#[test]
fn poll_stops_at_the_buffer_length() {
    let rig = attach();
    let cq = rig.hca.create_cq(8, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);
    for i in 0..5 {
        rig.sim
            .push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), i << 6, i, 0, None));
    }

    let mut wc = [WorkCompletion::default(); 3];
    let lens: Vec<u32> = cq.poll(&mut wc).iter().map(|wc| wc.byte_len).collect();
    assert_eq!(lens, [0, 1, 2]);
    let lens: Vec<u32> = cq.poll(&mut wc).iter().map(|wc| wc.byte_len).collect();
    assert_eq!(lens, [3, 4]);
}

#[test]
fn completion_handler_may_destroy_another_cq() {
    let rig = attach();
    let cq = rig.hca.create_cq(8, 0).unwrap();
    let qp = rig.hca.create_qp(qp_attr(QpType::RC, &cq)).unwrap();
    to_init(&qp);
    let other = rig.hca.create_cq(8, 0).unwrap();
    let other_cqn = other.cqn();

    let doomed = Mutex::new(Some(other));
    let (tx, rx) = mpsc::channel();
    cq.set_comp_handler(move |cqn| {
        let other = doomed.lock().take();
        // HW2SW_CQ completes through the command EQ meanwhile
        drop(other);
        let _ = tx.send(cqn);
    });

    cq.arm(false);
    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), 0, 16, 0, None));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), cq.cqn());
    assert!(rig
        .sim
        .commands()
        .iter()
        .any(|c| c.opcode == Opcode::Hw2SwCq && c.in_modifier == other_cqn && c.event));
    assert_eq!(rig.sim.hw_objects().2, 1);

    // events and commands keep flowing afterwards
    rig.hca.cmd().nop().unwrap();
    assert_eq!(poll_n(&cq, 1).len(), 1);
    cq.arm(false);
    rig.sim.push_cqe(cq.cqn(), &Cqe::recv(qp.qpn(), 64, 16, 0, None));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), cq.cqn());
}
