//! Completion queues.
//!
//! A CQ is a ring of 32-byte entries written by the device. The owner bit
//! of every entry starts out set (device owned, empty); the device clears
//! it when it writes a completion and software sets it again once the
//! completion is consumed.
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::alloc::Allocator;
use crate::array::{Held, RefCount, Refcounted, SparseArray, HANDLER_DRAIN_TIMEOUT};
use crate::config::HcaConfig;
use crate::device::HcaDev;
use crate::eq;
use crate::error::{Error, Result};
use crate::fw::{CqContext, Mailbox};
use crate::hw::{DmaBuffer, Doorbell, OwnedDma};
use crate::mr::MemoryRegion;
use crate::qp::WQE_SHIFT;

pub const CQE_SIZE: usize = 32;
/// Set in the owner byte while the slot belongs to the device.
pub const CQE_OWNER_HW: u8 = 0x80;
/// Error CQEs carry `0xfe | is_send` in the opcode byte.
pub const ERROR_CQE_OPCODE: u8 = 0xfe;
/// Bytes after the ring holding the arm doorbell record.
const CQ_DB_REC_SIZE: usize = 64;

const CQ_DB_REQ_NOT_SOL: u32 = 1;
const CQ_DB_REQ_NOT: u32 = 2;

/// Send opcodes as reported in a successful send CQE.
pub mod opcode {
    pub const RDMA_WRITE: u8 = 0x08;
    pub const RDMA_WRITE_IMM: u8 = 0x09;
    pub const SEND: u8 = 0x0a;
    pub const SEND_IMM: u8 = 0x0b;
    pub const RDMA_READ: u8 = 0x10;
    pub const ATOMIC_CS: u8 = 0x11;
    pub const ATOMIC_FA: u8 = 0x12;
    pub const BIND_MW: u8 = 0x18;

    // IB transport opcodes seen on the receive side (low five bits)
    pub const IB_SEND_LAST_WITH_IMM: u8 = 0x03;
    pub const IB_SEND_ONLY_WITH_IMM: u8 = 0x05;
    pub const IB_RDMA_WRITE_LAST_WITH_IMM: u8 = 0x09;
    pub const IB_RDMA_WRITE_ONLY_WITH_IMM: u8 = 0x0b;
}

/// Error syndromes of an error CQE.
pub mod syndrome {
    pub const LOCAL_LENGTH: u8 = 0x01;
    pub const LOCAL_QP_OP: u8 = 0x02;
    pub const LOCAL_EEC_OP: u8 = 0x03;
    pub const LOCAL_PROT: u8 = 0x04;
    pub const WR_FLUSH: u8 = 0x05;
    pub const MW_BIND: u8 = 0x06;
    pub const BAD_RESP: u8 = 0x10;
    pub const LOCAL_ACCESS: u8 = 0x11;
    pub const REMOTE_INVAL_REQ: u8 = 0x12;
    pub const REMOTE_ACCESS: u8 = 0x13;
    pub const REMOTE_OP: u8 = 0x14;
    pub const RETRY_EXCEEDED: u8 = 0x15;
    pub const RNR_RETRY_EXCEEDED: u8 = 0x16;
    pub const LOCAL_RDD_VIOL: u8 = 0x20;
    pub const REMOTE_INVAL_RD_REQ: u8 = 0x21;
    pub const REMOTE_ABORTED: u8 = 0x22;
    pub const INVAL_EECN: u8 = 0x23;
    pub const INVAL_EEC_STATE: u8 = 0x24;
}

/// A successful completion entry.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Cqe {
    pub my_qpn: U32,
    pub my_ee: U32,
    pub rqpn: U32,
    pub sl_ipok: u8,
    pub g_mlpath: u8,
    pub rlid: U16,
    pub imm_etype_pkey_eec: U32,
    pub byte_cnt: U32,
    /// Byte offset of the WQE in the QP's buffer.
    pub wqe: U32,
    pub opcode: u8,
    pub is_send: u8,
    _reserved: u8,
    pub owner: u8,
}

static_assertions::const_assert_eq!(std::mem::size_of::<Cqe>(), CQE_SIZE);

impl Cqe {
    /// A software-owned send completion.
    pub fn send(qpn: u32, wqe: u32, opcode: u8, byte_cnt: u32) -> Self {
        let mut cqe = Cqe::new_zeroed();
        cqe.my_qpn = qpn.into();
        cqe.wqe = wqe.into();
        cqe.opcode = opcode;
        cqe.is_send = 0x80;
        cqe.byte_cnt = byte_cnt.into();
        cqe
    }

    /// A software-owned receive completion. `imm` is carried in the
    /// immediate field and selects the "with immediate" IB opcode.
    pub fn recv(qpn: u32, wqe: u32, byte_cnt: u32, src_qpn: u32, imm: Option<u32>) -> Self {
        let mut cqe = Cqe::new_zeroed();
        cqe.my_qpn = qpn.into();
        cqe.wqe = wqe.into();
        cqe.byte_cnt = byte_cnt.into();
        cqe.rqpn = src_qpn.into();
        match imm {
            Some(imm) => {
                cqe.opcode = opcode::IB_SEND_ONLY_WITH_IMM;
                cqe.imm_etype_pkey_eec = imm.into();
            }
            None => cqe.opcode = 0x04,
        }
        cqe
    }

    fn is_error(&self) -> bool {
        self.opcode & ERROR_CQE_OPCODE == ERROR_CQE_OPCODE
    }

    fn is_send_cqe(&self) -> bool {
        if self.is_error() {
            self.opcode & 1 != 0
        } else {
            self.is_send & 0x80 != 0
        }
    }
}

/// The error view of a completion entry.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ErrCqe {
    pub my_qpn: U32,
    _reserved1: [U32; 3],
    pub syndrome: u8,
    pub vendor_err: u8,
    /// Further WQEs this entry stands for; each is reported as a flush.
    pub db_cnt: U16,
    _reserved2: U32,
    pub wqe: U32,
    pub opcode: u8,
    _reserved3: [u8; 2],
    pub owner: u8,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ErrCqe>(), CQE_SIZE);

impl ErrCqe {
    pub fn new(qpn: u32, wqe: u32, is_send: bool, syndrome: u8, db_cnt: u16) -> Self {
        let mut cqe = ErrCqe::new_zeroed();
        cqe.my_qpn = qpn.into();
        cqe.wqe = wqe.into();
        cqe.opcode = ERROR_CQE_OPCODE | u8::from(is_send);
        cqe.syndrome = syndrome;
        cqe.db_cnt = db_cnt.into();
        cqe
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WcStatus {
    #[default]
    Success,
    LocLenErr,
    LocQpOpErr,
    LocEecOpErr,
    LocProtErr,
    WrFlushErr,
    MwBindErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    LocRddViolErr,
    RemInvRdReqErr,
    RemAbortErr,
    InvEecnErr,
    InvEecStateErr,
    GeneralErr,
}

impl WcStatus {
    pub fn from_syndrome(syndrome: u8) -> Self {
        use self::syndrome::*;
        match syndrome {
            LOCAL_LENGTH => WcStatus::LocLenErr,
            LOCAL_QP_OP => WcStatus::LocQpOpErr,
            LOCAL_EEC_OP => WcStatus::LocEecOpErr,
            LOCAL_PROT => WcStatus::LocProtErr,
            WR_FLUSH => WcStatus::WrFlushErr,
            MW_BIND => WcStatus::MwBindErr,
            BAD_RESP => WcStatus::BadRespErr,
            LOCAL_ACCESS => WcStatus::LocAccessErr,
            REMOTE_INVAL_REQ => WcStatus::RemInvReqErr,
            REMOTE_ACCESS => WcStatus::RemAccessErr,
            REMOTE_OP => WcStatus::RemOpErr,
            RETRY_EXCEEDED => WcStatus::RetryExcErr,
            RNR_RETRY_EXCEEDED => WcStatus::RnrRetryExcErr,
            LOCAL_RDD_VIOL => WcStatus::LocRddViolErr,
            REMOTE_INVAL_RD_REQ => WcStatus::RemInvRdReqErr,
            REMOTE_ABORTED => WcStatus::RemAbortErr,
            INVAL_EECN => WcStatus::InvEecnErr,
            INVAL_EEC_STATE => WcStatus::InvEecStateErr,
            _ => WcStatus::GeneralErr,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WcOpcode {
    #[default]
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    BindMw,
    Recv,
    RecvRdmaWithImm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u8,
    pub byte_len: u32,
    pub imm_data: Option<u32>,
    pub qp_num: u32,
    pub src_qp: u32,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
    pub pkey_index: u16,
    pub grh: bool,
}

impl WorkCompletion {
    pub fn is_ok(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Asynchronous CQ events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqEvent {
    /// The CQ overran or hit an access error; it is no longer usable.
    Error { syndrome: u8 },
}

pub type CompHandler = Arc<dyn Fn(u32) + Send + Sync>;
pub type CqEventHandler = Arc<dyn Fn(CqEvent) + Send + Sync>;

pub(crate) struct CqState {
    cons_index: u32,
}

pub(crate) struct CqInner {
    cqn: u32,
    nent: u32,
    buf: OwnedDma,
    mr: Mutex<Option<MemoryRegion>>,
    /// Serializes poll, clean and QP teardown against each other.
    state: Mutex<CqState>,
    arm_sn: AtomicU32,
    refs: RefCount,
    comp_handler: RwLock<Option<CompHandler>>,
    event_handler: RwLock<Option<CqEventHandler>>,
}

impl Refcounted for CqInner {
    fn refs(&self) -> &RefCount {
        &self.refs
    }
}

impl CqInner {
    pub(crate) fn cqn(&self) -> u32 {
        self.cqn
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CqState> {
        self.state.lock()
    }

    fn arm_db_offset(&self) -> usize {
        self.nent as usize * CQE_SIZE
    }

    fn update_cons_index(&self, dev: &HcaDev, st: &CqState) {
        // freed entries must be visible before the new index
        fence(Ordering::SeqCst);
        dev.hw.ring(Doorbell::CqSetCi {
            cqn: self.cqn,
            ci: st.cons_index & 0xff_ffff,
        });
    }

    /// Drops every entry of `qpn` between the consumer index and the first
    /// device-owned entry.
    pub(crate) fn clean_locked(&self, dev: &HcaDev, st: &mut CqState, qpn: u32) {
        let nfreed = clean_ring(&self.buf, self.nent, &mut st.cons_index, qpn);
        if nfreed > 0 {
            debug!("cleaned {} entries of QP {:#x} from CQ {:#x}", nfreed, qpn, self.cqn);
            self.update_cons_index(dev, st);
        }
    }

    pub(crate) fn clean(&self, dev: &HcaDev, qpn: u32) {
        let mut st = self.state.lock();
        self.clean_locked(dev, &mut st, qpn);
    }
}

fn cqe_offset(nent: u32, index: u32) -> usize {
    (index & (nent - 1)) as usize * CQE_SIZE
}

fn cqe_sw(buf: &DmaBuffer, nent: u32, index: u32) -> bool {
    let mut owner = [0u8];
    buf.read_at(cqe_offset(nent, index) + CQE_SIZE - 1, &mut owner);
    owner[0] & CQE_OWNER_HW == 0
}

fn set_cqe_hw(buf: &DmaBuffer, nent: u32, index: u32) {
    buf.write_at(cqe_offset(nent, index) + CQE_SIZE - 1, &[CQE_OWNER_HW]);
}

/// Removes the entries of `qpn` that lie between `*ci` and the producer,
/// keeping the survivors in order, and advances `*ci` past the freed
/// slots. Returns how many entries were removed.
pub(crate) fn clean_ring(buf: &DmaBuffer, nent: u32, ci: &mut u32, qpn: u32) -> u32 {
    let cons = *ci;
    let mut prod = cons;
    while prod.wrapping_sub(cons) < nent - 1 && cqe_sw(buf, nent, prod) {
        prod = prod.wrapping_add(1);
    }

    let mut nfreed = 0u32;
    let mut entry = [0u8; CQE_SIZE];
    while prod != cons {
        prod = prod.wrapping_sub(1);
        buf.read_at(cqe_offset(nent, prod), &mut entry);
        let cqe_qpn = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        if cqe_qpn == qpn {
            nfreed += 1;
        } else if nfreed > 0 {
            buf.write_at(cqe_offset(nent, prod.wrapping_add(nfreed)), &entry);
        }
    }

    if nfreed > 0 {
        for i in 0..nfreed {
            set_cqe_hw(buf, nent, cons.wrapping_add(i));
        }
        fence(Ordering::SeqCst);
        *ci = cons.wrapping_add(nfreed);
    }
    nfreed
}

/// Both CQs of a QP locked in cqn order.
pub(crate) struct LockedCqs<'a> {
    send: (&'a CqInner, MutexGuard<'a, CqState>),
    recv: Option<(&'a CqInner, MutexGuard<'a, CqState>)>,
}

impl LockedCqs<'_> {
    pub(crate) fn clean(&mut self, dev: &HcaDev, qpn: u32) {
        let (cq, st) = &mut self.send;
        cq.clean_locked(dev, st, qpn);
        if let Some((cq, st)) = &mut self.recv {
            cq.clean_locked(dev, st, qpn);
        }
    }
}

pub(crate) fn lock_cqs<'a>(send: &'a CqInner, recv: &'a CqInner) -> LockedCqs<'a> {
    if send.cqn == recv.cqn {
        return LockedCqs {
            send: (send, send.lock()),
            recv: None,
        };
    }
    if send.cqn < recv.cqn {
        let s = send.lock();
        let r = recv.lock();
        LockedCqs {
            send: (send, s),
            recv: Some((recv, r)),
        }
    } else {
        let r = recv.lock();
        let s = send.lock();
        LockedCqs {
            send: (send, s),
            recv: Some((recv, r)),
        }
    }
}

pub(crate) struct CqTable {
    alloc: Allocator,
    num_cqs: u32,
    table: Mutex<SparseArray<Arc<CqInner>>>,
}

impl CqTable {
    pub(crate) fn new(config: &HcaConfig) -> Result<Self> {
        Ok(CqTable {
            alloc: Allocator::new(config.num_cqs, (1 << 24) - 1, config.reserved_cqs)?,
            num_cqs: config.num_cqs,
            table: Mutex::new(SparseArray::new(config.num_cqs as usize)),
        })
    }

    fn index(&self, cqn: u32) -> usize {
        (cqn & (self.num_cqs - 1)) as usize
    }

    fn hold(&self, cqn: u32) -> Option<Held<CqInner>> {
        let table = self.table.lock();
        table
            .get(self.index(cqn))
            .filter(|cq| cq.cqn == cqn)
            .map(|cq| Held::new(Arc::clone(cq)))
    }
}

/// Completion event for `cqn`, called from EQ dispatch.
pub(crate) fn completion(dev: &HcaDev, cqn: u32) {
    let Some(cq) = dev.cq_table.hold(cqn) else {
        warn!("completion event for bogus CQ {:#x}", cqn);
        return;
    };
    cq.arm_sn.fetch_add(1, Ordering::Relaxed);
    let handler = cq.comp_handler.read().clone();
    if let Some(handler) = handler {
        handler(cqn);
    }
}

pub(crate) fn async_event(dev: &HcaDev, cqn: u32, event: CqEvent) {
    let Some(cq) = dev.cq_table.hold(cqn) else {
        warn!("async event for bogus CQ {:#x}", cqn);
        return;
    };
    let handler = cq.event_handler.read().clone();
    match handler {
        Some(handler) => handler(event),
        None => debug!("unhandled {:?} on CQ {:#x}", event, cqn),
    }
}

pub(crate) fn create(dev: &Arc<HcaDev>, entries: u32, comp_vector: u32) -> Result<CompletionQueue> {
    if entries == 0 || entries > dev.config.max_cqes {
        return Err(Error::InvalidAttribute("CQ size out of range"));
    }
    let nent = entries.max(2).next_power_of_two();
    let comp_eqn = dev.eq_table.comp_eqn(comp_vector)?;
    let async_eqn = dev.eq_table.async_eqn()?;

    let cqn = dev.cq_table.alloc.alloc()?;
    let inner = match create_inner(dev, cqn, nent, async_eqn, comp_eqn) {
        Ok(inner) => Arc::new(inner),
        Err(e) => {
            dev.cq_table.alloc.free(cqn);
            return Err(e);
        }
    };

    let res = dev
        .cq_table
        .table
        .lock()
        .set(dev.cq_table.index(cqn), Arc::clone(&inner));
    if let Err(e) = res {
        free_hw(dev, &inner);
        return Err(e);
    }

    debug!("created CQ {:#x} with {} entries on EQ {}", cqn, nent, comp_eqn);
    Ok(CompletionQueue {
        cq: Arc::new(OwnedCq {
            dev: Arc::clone(dev),
            inner,
        }),
    })
}

fn create_inner(dev: &HcaDev, cqn: u32, nent: u32, async_eqn: u32, comp_eqn: u32) -> Result<CqInner> {
    let buf = OwnedDma::alloc(&dev.dma, nent as usize * CQE_SIZE + CQ_DB_REC_SIZE)?;
    buf.zero();
    for i in 0..nent {
        set_cqe_hw(&buf, nent, i);
    }
    let mr = MemoryRegion::register(dev, &buf)?;

    let res = Mailbox::new(&dev.dma).and_then(|mailbox| {
        let mut ctx = CqContext::new(nent.trailing_zeros(), cqn, async_eqn, comp_eqn, mr.lkey());
        ctx.state_db = ((nent as usize * CQE_SIZE) as u32).into();
        mailbox.write(0, &ctx);
        dev.cmd.sw2hw_cq(&mailbox, cqn)
    });
    if let Err(e) = res {
        mr.free(dev);
        return Err(e);
    }

    Ok(CqInner {
        cqn,
        nent,
        buf,
        mr: Mutex::new(Some(mr)),
        state: Mutex::new(CqState { cons_index: 0 }),
        arm_sn: AtomicU32::new(1),
        refs: RefCount::new(),
        comp_handler: RwLock::new(None),
        event_handler: RwLock::new(None),
    })
}

/// HW2SW_CQ and release of everything but the table slot.
fn free_hw(dev: &HcaDev, cq: &CqInner) {
    let res = Mailbox::new(&dev.dma).and_then(|mailbox| dev.cmd.hw2sw_cq(&mailbox, cq.cqn));
    if let Err(e) = res {
        warn!("HW2SW_CQ for CQ {:#x} failed: {}", cq.cqn, e);
    }
    if let Some(mr) = cq.mr.lock().take() {
        mr.free(dev);
    }
    dev.cq_table.alloc.free(cq.cqn);
}

fn destroy(dev: &HcaDev, cq: &Arc<CqInner>) {
    let res = Mailbox::new(&dev.dma).and_then(|mailbox| dev.cmd.hw2sw_cq(&mailbox, cq.cqn));
    if let Err(e) = res {
        warn!("HW2SW_CQ for CQ {:#x} failed: {}", cq.cqn, e);
    }

    dev.cq_table.table.lock().clear(dev.cq_table.index(cq.cqn));
    eq::synchronize(dev);
    if !cq.refs.wait_idle(HANDLER_DRAIN_TIMEOUT) {
        error!(
            "CQ {:#x} destroyed while a handler on another thread still uses it",
            cq.cqn
        );
    }

    if let Some(mr) = cq.mr.lock().take() {
        mr.free(dev);
    }
    dev.cq_table.alloc.free(cq.cqn);
    debug!("destroyed CQ {:#x}", cq.cqn);
}

struct OwnedCq {
    dev: Arc<HcaDev>,
    inner: Arc<CqInner>,
}

impl Drop for OwnedCq {
    fn drop(&mut self) {
        destroy(&self.dev, &self.inner);
    }
}

enum Polled {
    Empty,
    Skipped,
    Entry(WorkCompletion),
}

/// A completion queue. Clones share the queue; it is destroyed when the
/// last clone, and the last QP using it, is dropped.
#[derive(Clone)]
pub struct CompletionQueue {
    cq: Arc<OwnedCq>,
}

impl CompletionQueue {
    pub(crate) fn inner(&self) -> &Arc<CqInner> {
        &self.cq.inner
    }

    pub fn cqn(&self) -> u32 {
        self.cq.inner.cqn
    }

    /// Ring size; always a power of two.
    pub fn entries(&self) -> u32 {
        self.cq.inner.nent
    }

    /// Fills `completions` with ready work completions, in the order the
    /// device produced them, and returns the filled prefix.
    pub fn poll<'c>(&self, completions: &'c mut [WorkCompletion]) -> &'c mut [WorkCompletion] {
        let dev = &*self.cq.dev;
        let cq = &*self.cq.inner;
        let mut st = cq.state.lock();
        let mut freed = 0u32;
        let mut n = 0;

        while n < completions.len() {
            match poll_one(dev, cq, &mut st, &mut freed) {
                Polled::Empty => break,
                Polled::Skipped => continue,
                Polled::Entry(wc) => {
                    completions[n] = wc;
                    n += 1;
                }
            }
        }

        if freed > 0 {
            cq.update_cons_index(dev, &st);
        }
        &mut completions[..n]
    }

    /// Requests an event for the next completion, or the next solicited
    /// one.
    pub fn arm(&self, solicited: bool) {
        let dev = &self.cq.dev;
        let cq = &self.cq.inner;
        let ci = cq.state.lock().cons_index & 0xff_ffff;
        let sn = (cq.arm_sn.load(Ordering::Relaxed) & 3) as u8;
        let cmd = if solicited {
            CQ_DB_REQ_NOT_SOL
        } else {
            CQ_DB_REQ_NOT
        };

        let record = [
            U32::new((u32::from(sn) << 28) | (cmd << 24) | ci),
            U32::new(cq.cqn),
        ];
        cq.buf.write_obj(cq.arm_db_offset(), &record);
        // the device reads the record when the doorbell lands
        fence(Ordering::SeqCst);
        dev.hw.ring(Doorbell::CqArm {
            cqn: cq.cqn,
            ci,
            sn,
            solicited,
        });
    }

    /// Called with the cqn on every completion event.
    pub fn set_comp_handler<F>(&self, handler: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        *self.cq.inner.comp_handler.write() = Some(Arc::new(handler));
    }

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(CqEvent) + Send + Sync + 'static,
    {
        *self.cq.inner.event_handler.write() = Some(Arc::new(handler));
    }
}

fn consume(cq: &CqInner, st: &mut CqState, freed: &mut u32) {
    set_cqe_hw(&cq.buf, cq.nent, st.cons_index);
    st.cons_index = st.cons_index.wrapping_add(1);
    *freed += 1;
}

fn poll_one(dev: &HcaDev, cq: &CqInner, st: &mut CqState, freed: &mut u32) -> Polled {
    if !cqe_sw(&cq.buf, cq.nent, st.cons_index) {
        return Polled::Empty;
    }
    // read the entry only after checking ownership
    fence(Ordering::Acquire);
    let offset = cqe_offset(cq.nent, st.cons_index);
    let cqe: Cqe = cq.buf.read_obj(offset);
    trace!("CQ {:#x} index {:#x}: {:?}", cq.cqn, st.cons_index, cqe);

    let qpn = cqe.my_qpn.get() & 0xff_ffff;
    let Some(qp) = dev.qp_table.lookup(qpn) else {
        warn!("CQ {:#x} entry for unknown QP {:#x}", cq.cqn, qpn);
        consume(cq, st, freed);
        return Polled::Skipped;
    };

    let is_send = cqe.is_send_cqe();
    let (wq, base) = if is_send {
        (qp.sq(), qp.send_wqe_offset())
    } else {
        (qp.rq(), 0)
    };
    let wqe_index = (cqe.wqe.get().wrapping_sub(base) >> WQE_SHIFT) & (wq.max() - 1);
    wq.complete(wqe_index);

    let mut wc = WorkCompletion {
        wr_id: wq.wr_id(wqe_index),
        qp_num: qpn,
        ..Default::default()
    };

    if cqe.is_error() {
        let mut err: ErrCqe = cq.buf.read_obj(offset);
        wc.status = WcStatus::from_syndrome(err.syndrome);
        wc.vendor_err = err.vendor_err;
        if err.syndrome != syndrome::WR_FLUSH {
            error!(
                "error CQE on CQ {:#x} QP {:#x}: syndrome {:#04x} vendor {:#04x}",
                cq.cqn, qpn, err.syndrome, err.vendor_err
            );
        }

        let db_cnt = err.db_cnt.get();
        if db_cnt > 0 {
            // report the next WQE as flushed from this same entry
            let next = (wqe_index + 1) & (wq.max() - 1);
            err.db_cnt = (db_cnt - 1).into();
            err.wqe = (base + (next << WQE_SHIFT)).into();
            err.syndrome = syndrome::WR_FLUSH;
            cq.buf.write_obj(offset, &err);
        } else {
            consume(cq, st, freed);
        }
        return Polled::Entry(wc);
    }

    if is_send {
        match cqe.opcode {
            opcode::RDMA_WRITE => wc.opcode = WcOpcode::RdmaWrite,
            opcode::RDMA_WRITE_IMM => {
                wc.opcode = WcOpcode::RdmaWrite;
                wc.imm_data = Some(cqe.imm_etype_pkey_eec.get());
            }
            opcode::SEND => wc.opcode = WcOpcode::Send,
            opcode::SEND_IMM => {
                wc.opcode = WcOpcode::Send;
                wc.imm_data = Some(cqe.imm_etype_pkey_eec.get());
            }
            opcode::RDMA_READ => {
                wc.opcode = WcOpcode::RdmaRead;
                wc.byte_len = cqe.byte_cnt.get();
            }
            opcode::ATOMIC_CS => {
                wc.opcode = WcOpcode::CompSwap;
                wc.byte_len = 8;
            }
            opcode::ATOMIC_FA => {
                wc.opcode = WcOpcode::FetchAdd;
                wc.byte_len = 8;
            }
            opcode::BIND_MW => wc.opcode = WcOpcode::BindMw,
            _ => wc.opcode = WcOpcode::Send,
        }
    } else {
        wc.byte_len = cqe.byte_cnt.get();
        match cqe.opcode & 0x1f {
            opcode::IB_SEND_LAST_WITH_IMM | opcode::IB_SEND_ONLY_WITH_IMM => {
                wc.opcode = WcOpcode::Recv;
                wc.imm_data = Some(cqe.imm_etype_pkey_eec.get());
            }
            opcode::IB_RDMA_WRITE_LAST_WITH_IMM | opcode::IB_RDMA_WRITE_ONLY_WITH_IMM => {
                wc.opcode = WcOpcode::RecvRdmaWithImm;
                wc.imm_data = Some(cqe.imm_etype_pkey_eec.get());
            }
            _ => wc.opcode = WcOpcode::Recv,
        }
        wc.slid = cqe.rlid.get();
        wc.sl = cqe.sl_ipok >> 4;
        wc.src_qp = cqe.rqpn.get() & 0xff_ffff;
        wc.dlid_path_bits = cqe.g_mlpath & 0x7f;
        wc.pkey_index = (cqe.imm_etype_pkey_eec.get() >> 16) as u16;
        wc.grh = cqe.g_mlpath & 0x80 != 0;
    }

    consume(cq, st, freed);
    Polled::Entry(wc)
}
