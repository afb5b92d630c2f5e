//! Queue pairs: the QP table, the state machine driven through MODIFY_QP,
//! and work request posting.
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::alloc::Allocator;
use crate::array::{Held, RefCount, Refcounted, SparseArray, HANDLER_DRAIN_TIMEOUT};
use crate::cmd::Opcode;
use crate::config::HcaConfig;
use crate::cq::{self, opcode, CompletionQueue, CqInner};
use crate::device::HcaDev;
use crate::error::{Error, Result};
use crate::fw::{
    Mailbox, OptParam, QpContext, QpParam, QpPath, SpecialQpType, DRIVER_PD, QP_BIT_RAE,
    QP_BIT_RRE, QP_BIT_RSC, QP_BIT_RWE, QP_BIT_SAE, QP_BIT_SRE, QP_BIT_SSC, QP_BIT_SWE,
    QP_RDMA_DEPTH_SHIFT,
};
use crate::hw::{Doorbell, OwnedDma};
use crate::mr::MemoryRegion;

/// log2 of the WQE stride, for both work queues.
pub(crate) const WQE_SHIFT: u32 = 6;
const WQE_SIZE: usize = 1 << WQE_SHIFT;
const WQE_SEG_SIZE: usize = 16;
/// Scatter/gather entries that fit a WQE next to the control segment.
pub const MAX_SGE: u32 = ((WQE_SIZE - WQE_SEG_SIZE) / WQE_SEG_SIZE) as u32;

const QP_PM_MIGRATED: u32 = 0x3;
const QP_PM_ARMED: u32 = 0x0;
const QP_PM_REARM: u32 = 0x1;
const QP_PM_SHIFT: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Sqd,
    Sqe,
    Error,
}

impl QpState {
    pub const ALL: [QpState; 7] = [
        QpState::Reset,
        QpState::Init,
        QpState::Rtr,
        QpState::Rts,
        QpState::Sqd,
        QpState::Sqe,
        QpState::Error,
    ];

    /// Encoding in the QP context and in the device's own state field.
    pub fn to_hw(self) -> u8 {
        match self {
            QpState::Reset => 0,
            QpState::Init => 1,
            QpState::Rtr => 2,
            QpState::Rts => 3,
            QpState::Sqe => 4,
            QpState::Sqd => 5,
            QpState::Error => 6,
        }
    }

    pub fn from_hw(v: u8) -> Option<Self> {
        Some(match v {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqe,
            5 => QpState::Sqd,
            6 => QpState::Error,
            _ => return None,
        })
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpType {
    RC,
    UC,
    UD,
    /// QP0, subnet management.
    SMI,
    /// QP1, general services.
    GSI,
}

impl QpType {
    pub fn transport(self) -> Transport {
        match self {
            QpType::RC => Transport::RC,
            QpType::UC => Transport::UC,
            QpType::UD => Transport::UD,
            QpType::SMI | QpType::GSI => Transport::MLX,
        }
    }

    pub fn is_special(self) -> bool {
        matches!(self, QpType::SMI | QpType::GSI)
    }
}

/// Transport service as the device sees it. Special QPs use MLX, which
/// carries raw MADs.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    RC,
    UC,
    UD,
    MLX,
}

impl Transport {
    pub const ALL: [Transport; 4] = [Transport::RC, Transport::UC, Transport::UD, Transport::MLX];

    pub fn service_type(self) -> u8 {
        match self {
            Transport::RC => 0,
            Transport::UC => 1,
            Transport::UD => 3,
            Transport::MLX => 7,
        }
    }
}

bitflags! {
    /// Which attributes a modify call carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QpAttrMask: u32 {
        const CUR_STATE = 1 << 1;
        const EN_SQD_ASYNC_NOTIFY = 1 << 2;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const QKEY = 1 << 6;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const ALT_PATH = 1 << 14;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const PATH_MIG_STATE = 1 << 18;
        const DEST_QPN = 1 << 20;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigState {
    Migrated,
    Rearm,
    Armed,
}

impl MigState {
    fn to_hw(self) -> u32 {
        match self {
            MigState::Migrated => QP_PM_MIGRATED,
            MigState::Rearm => QP_PM_REARM,
            MigState::Armed => QP_PM_ARMED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRoute {
    pub dgid: [u8; 16],
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address vector of the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub static_rate: u8,
    pub grh: Option<GlobalRoute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AltPath {
    pub ah_attr: AhAttr,
    pub pkey_index: u16,
    pub port_num: u8,
    pub timeout: u8,
}

/// Attributes of one modify call. Only the attributes that are set are
/// sent; `mask()` reports which.
#[derive(Debug, Clone, Default)]
pub struct QpAttr {
    pub cur_state: Option<QpState>,
    pub en_sqd_async_notify: Option<bool>,
    pub access_flags: Option<AccessFlags>,
    pub pkey_index: Option<u16>,
    pub port_num: Option<u8>,
    pub qkey: Option<u32>,
    pub ah_attr: Option<AhAttr>,
    pub path_mtu: Option<Mtu>,
    pub timeout: Option<u8>,
    pub retry_cnt: Option<u8>,
    pub rnr_retry: Option<u8>,
    pub rq_psn: Option<u32>,
    pub max_rd_atomic: Option<u8>,
    pub alt_path: Option<AltPath>,
    pub min_rnr_timer: Option<u8>,
    pub sq_psn: Option<u32>,
    pub max_dest_rd_atomic: Option<u8>,
    pub path_mig_state: Option<MigState>,
    pub dest_qp_num: Option<u32>,
}

macro_rules! attr_setters {
    ($($field:ident: $ty:ty => $mask:ident,)*) => {
        impl QpAttr {
            $(
            pub fn $field(mut self, $field: $ty) -> Self {
                self.$field = Some($field);
                self
            }
            )*

            pub fn mask(&self) -> QpAttrMask {
                let mut mask = QpAttrMask::empty();
                $(mask.set(QpAttrMask::$mask, self.$field.is_some());)*
                mask
            }
        }
    };
}

attr_setters! {
    cur_state: QpState => CUR_STATE,
    en_sqd_async_notify: bool => EN_SQD_ASYNC_NOTIFY,
    access_flags: AccessFlags => ACCESS_FLAGS,
    pkey_index: u16 => PKEY_INDEX,
    port_num: u8 => PORT,
    qkey: u32 => QKEY,
    ah_attr: AhAttr => AV,
    path_mtu: Mtu => PATH_MTU,
    timeout: u8 => TIMEOUT,
    retry_cnt: u8 => RETRY_CNT,
    rnr_retry: u8 => RNR_RETRY,
    rq_psn: u32 => RQ_PSN,
    max_rd_atomic: u8 => MAX_QP_RD_ATOMIC,
    alt_path: AltPath => ALT_PATH,
    min_rnr_timer: u8 => MIN_RNR_TIMER,
    sq_psn: u32 => SQ_PSN,
    max_dest_rd_atomic: u8 => MAX_DEST_RD_ATOMIC,
    path_mig_state: MigState => PATH_MIG_STATE,
    dest_qp_num: u32 => DEST_QPN,
}

impl QpAttr {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    opcode: Opcode,
    required: QpAttrMask,
    optional: QpAttrMask,
}

macro_rules! transitions {
    ($(
        $from:ident => $to:ident: $op:ident,
            $(only: ($($only:ident),+),)?
            required: { $(($($qpt:ident),+) [$($req:ident)|+],)* }
            optional: { $(($($qpt_opt:ident),+) [$($opt:ident)|+],)* }
    )*) => {
        /// The firmware command and attribute sets of a transition between
        /// two non-terminal states, `None` if the transition is illegal.
        fn table_transition(from: QpState, to: QpState, transport: Transport) -> Option<Transition> {
            match (from, to) {
                $(
                (QpState::$from, QpState::$to) => {
                    $(if !matches!(transport, $(Transport::$only)|+) {
                        return None;
                    })?
                    #[allow(unused_mut)]
                    let mut required = QpAttrMask::empty();
                    #[allow(unused_mut)]
                    let mut optional = QpAttrMask::empty();
                    $({
                        let mask = $(QpAttrMask::$req)|+;
                        $(if transport == Transport::$qpt {
                            required |= mask;
                        })+
                    })*
                    $({
                        let mask = $(QpAttrMask::$opt)|+;
                        $(if transport == Transport::$qpt_opt {
                            optional |= mask;
                        })+
                    })*
                    Some(Transition {
                        opcode: Opcode::$op,
                        required,
                        optional,
                    })
                }
                )*
                _ => None,
            }
        }
    };
}

transitions! {
    Reset => Init: Rst2InitQp,
        required: {
            (UD) [PKEY_INDEX | PORT | QKEY],
            (UC, RC) [PKEY_INDEX | PORT | ACCESS_FLAGS],
            (MLX) [PKEY_INDEX | QKEY],
        }
        optional: {
            (MLX) [PORT],
        }
    Init => Init: Init2InitQp,
        required: {}
        optional: {
            (UD) [PKEY_INDEX | PORT | QKEY],
            (UC, RC) [PKEY_INDEX | PORT | ACCESS_FLAGS],
            (MLX) [PKEY_INDEX | QKEY],
        }
    Init => Rtr: Init2RtrQp,
        required: {
            (UC) [AV | PATH_MTU | DEST_QPN | RQ_PSN],
            (RC) [AV | PATH_MTU | DEST_QPN | RQ_PSN | MAX_DEST_RD_ATOMIC | MIN_RNR_TIMER],
        }
        optional: {
            (UD, MLX) [PKEY_INDEX | QKEY],
            (UC, RC) [ALT_PATH | ACCESS_FLAGS | PKEY_INDEX],
        }
    Rtr => Rts: Rtr2RtsQp,
        required: {
            (UD, MLX) [SQ_PSN],
            (UC) [SQ_PSN | MAX_QP_RD_ATOMIC],
            (RC) [TIMEOUT | RETRY_CNT | RNR_RETRY | SQ_PSN | MAX_QP_RD_ATOMIC],
        }
        optional: {
            (UD, MLX) [CUR_STATE | QKEY],
            (UC) [CUR_STATE | ALT_PATH | ACCESS_FLAGS | PATH_MIG_STATE],
            (RC) [CUR_STATE | ALT_PATH | ACCESS_FLAGS | MIN_RNR_TIMER | PATH_MIG_STATE],
        }
    Rts => Rts: Rts2RtsQp,
        required: {}
        optional: {
            (UD, MLX) [CUR_STATE | QKEY],
            (UC) [CUR_STATE | ACCESS_FLAGS | ALT_PATH | PATH_MIG_STATE],
            (RC) [CUR_STATE | ACCESS_FLAGS | ALT_PATH | PATH_MIG_STATE | MIN_RNR_TIMER],
        }
    Rts => Sqd: Rts2SqdQp,
        required: {}
        optional: {
            (UD, UC, RC, MLX) [EN_SQD_ASYNC_NOTIFY],
        }
    Sqd => Rts: Sqd2RtsQp,
        required: {}
        optional: {
            (UD, MLX) [CUR_STATE | QKEY],
            (UC) [CUR_STATE | ALT_PATH | ACCESS_FLAGS | PATH_MIG_STATE],
            (RC) [CUR_STATE | ALT_PATH | ACCESS_FLAGS | MIN_RNR_TIMER | PATH_MIG_STATE],
        }
    Sqd => Sqd: Sqd2SqdQp,
        required: {}
        optional: {
            (UD, MLX) [PKEY_INDEX | QKEY],
            (UC) [AV | ALT_PATH | ACCESS_FLAGS | PKEY_INDEX | PATH_MIG_STATE],
            (RC) [PORT | AV | TIMEOUT | RETRY_CNT | RNR_RETRY | MAX_QP_RD_ATOMIC
                | MAX_DEST_RD_ATOMIC | ALT_PATH | ACCESS_FLAGS | PKEY_INDEX
                | MIN_RNR_TIMER | PATH_MIG_STATE],
        }
    Sqe => Rts: Sqerr2RtsQp,
        // a reliable QP goes to the error state instead
        only: (UD, UC, MLX),
        required: {}
        optional: {
            (UD, MLX) [CUR_STATE | QKEY],
            (UC) [CUR_STATE | ACCESS_FLAGS],
        }
}

fn transition(from: QpState, to: QpState, transport: Transport) -> Option<Transition> {
    let any = |opcode| {
        Some(Transition {
            opcode,
            required: QpAttrMask::empty(),
            optional: QpAttrMask::empty(),
        })
    };
    match to {
        QpState::Reset => any(Opcode::Any2RstQp),
        QpState::Error => any(Opcode::Any2ErrQp),
        _ => table_transition(from, to, transport),
    }
}

/// Checks the attribute mask against the transition table.
fn check_transition(
    from: QpState,
    to: QpState,
    transport: Transport,
    mask: QpAttrMask,
) -> Result<Transition> {
    let trans =
        transition(from, to, transport).ok_or(Error::InvalidTransition { from, to })?;
    let missing = trans.required - mask;
    if !missing.is_empty() {
        return Err(Error::MissingAttribute(missing));
    }
    let extra = mask - (trans.required | trans.optional);
    if !extra.is_empty() {
        return Err(Error::ExtraneousAttribute(extra));
    }
    Ok(trans)
}

/// Send work request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    Send,
    SendWithImm,
    RdmaWrite,
    RdmaWriteWithImm,
    RdmaRead,
}

impl SendOpcode {
    fn to_hw(self) -> u8 {
        match self {
            SendOpcode::Send => opcode::SEND,
            SendOpcode::SendWithImm => opcode::SEND_IMM,
            SendOpcode::RdmaWrite => opcode::RDMA_WRITE,
            SendOpcode::RdmaWriteWithImm => opcode::RDMA_WRITE_IMM,
            SendOpcode::RdmaRead => opcode::RDMA_READ,
        }
    }

    fn is_rdma(self) -> bool {
        matches!(
            self,
            SendOpcode::RdmaWrite | SendOpcode::RdmaWriteWithImm | SendOpcode::RdmaRead
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone)]
pub struct SendWr<'a> {
    pub wr_id: u64,
    pub opcode: SendOpcode,
    pub sg_list: &'a [Sge],
    pub imm: Option<u32>,
    /// Required for RDMA opcodes.
    pub remote: Option<RemoteAddr>,
    pub signaled: bool,
    pub solicited: bool,
}

impl<'a> SendWr<'a> {
    pub fn send(wr_id: u64, sg_list: &'a [Sge]) -> Self {
        SendWr {
            wr_id,
            opcode: SendOpcode::Send,
            sg_list,
            imm: None,
            remote: None,
            signaled: true,
            solicited: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecvWr<'a> {
    pub wr_id: u64,
    pub sg_list: &'a [Sge],
}

/// First segment of every WQE.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WqeCtrl {
    /// Opcode in the low five bits.
    pub nda_op: U32,
    /// WQE size in 16-byte units in the low six bits.
    pub ee_nds: U32,
    pub flags: U32,
    pub imm: U32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<WqeCtrl>(), WQE_SEG_SIZE);

pub const WQE_FLAG_CQ_UPDATE: u32 = 1 << 3;
pub const WQE_FLAG_SOLICIT: u32 = 1 << 1;

impl WqeCtrl {
    pub fn opcode(&self) -> u8 {
        (self.nda_op.get() & 0x1f) as u8
    }

    pub fn size(&self) -> usize {
        (self.ee_nds.get() & 0x3f) as usize * WQE_SEG_SIZE
    }
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WqeRaddr {
    pub raddr: U64,
    pub rkey: U32,
    _reserved: U32,
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WqeData {
    pub byte_count: U32,
    pub lkey: U32,
    pub addr: U64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<WqeRaddr>(), WQE_SEG_SIZE);
static_assertions::const_assert_eq!(std::mem::size_of::<WqeData>(), WQE_SEG_SIZE);

/// Ring bookkeeping of one work queue. `head` counts posted requests and
/// doubles as the post lock; `tail` is advanced by the poller.
pub(crate) struct WorkQueue {
    max: u32,
    head: Mutex<u32>,
    tail: AtomicU32,
    last_comp: AtomicU32,
    wrid: Box<[AtomicU64]>,
}

impl WorkQueue {
    fn new(max: u32) -> Self {
        WorkQueue {
            max,
            head: Mutex::new(0),
            tail: AtomicU32::new(0),
            last_comp: AtomicU32::new(max - 1),
            wrid: (0..max).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn max(&self) -> u32 {
        self.max
    }

    /// Retires every WQE up to and including `index`.
    pub(crate) fn complete(&self, index: u32) {
        let last = self.last_comp.load(Ordering::Relaxed);
        let advance = if last < index {
            index - last
        } else {
            index + self.max - last
        };
        self.tail.fetch_add(advance, Ordering::Release);
        self.last_comp.store(index, Ordering::Relaxed);
    }

    pub(crate) fn wr_id(&self, index: u32) -> u64 {
        self.wrid[(index & (self.max - 1)) as usize].load(Ordering::Relaxed)
    }

    fn set_wr_id(&self, index: u32, wr_id: u64) {
        self.wrid[(index & (self.max - 1)) as usize].store(wr_id, Ordering::Relaxed);
    }

    fn fits(&self, head: u32, nreq: u32) -> bool {
        let outstanding = head.wrapping_sub(self.tail.load(Ordering::Acquire));
        outstanding + nreq <= self.max
    }

    /// The fast check reads `tail` without the CQ lock; only a failure is
    /// confirmed under it.
    fn overflow(&self, head: u32, nreq: u32, cq: &CqInner) -> bool {
        if self.fits(head, nreq) {
            return false;
        }
        let _cq = cq.lock();
        !self.fits(head, nreq)
    }

    fn reset(&self) {
        let mut head = self.head.lock();
        *head = 0;
        self.tail.store(0, Ordering::Release);
        self.last_comp.store(self.max - 1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

#[derive(Clone)]
pub struct QpInitAttr {
    pub send_cq: CompletionQueue,
    pub recv_cq: CompletionQueue,
    pub cap: QpCapability,
    pub qp_type: QpType,
    /// Generate a completion for every send, not just signaled ones.
    pub sq_sig_all: bool,
}

/// Asynchronous events affiliated with one QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpEvent {
    PathMigrated,
    CommEstablished,
    SqDrained,
    Fatal,
    PathMigrationFailed,
    InvalidRequest,
    AccessError,
}

pub type QpEventHandler = Arc<dyn Fn(QpEvent) + Send + Sync>;

/// Attributes remembered across modify calls.
struct QpAttrs {
    atomic_rd_en: AccessFlags,
    resp_depth: u8,
}

pub(crate) struct QpInner {
    qpn: u32,
    qp_type: QpType,
    sq_sig_all: bool,
    send_cq: Arc<CqInner>,
    recv_cq: Arc<CqInner>,
    sq: WorkQueue,
    rq: WorkQueue,
    send_wqe_offset: u32,
    buf: OwnedDma,
    mr: Mutex<Option<MemoryRegion>>,
    lkey: u32,
    state: AtomicU8,
    sq_draining: AtomicBool,
    port: AtomicU8,
    alt_port: AtomicU8,
    /// Held across a whole modify call.
    attrs: Mutex<QpAttrs>,
    refs: RefCount,
    event_handler: RwLock<Option<QpEventHandler>>,
}

impl Refcounted for QpInner {
    fn refs(&self) -> &RefCount {
        &self.refs
    }
}

impl QpInner {
    pub(crate) fn sq(&self) -> &WorkQueue {
        &self.sq
    }

    pub(crate) fn rq(&self) -> &WorkQueue {
        &self.rq
    }

    /// Byte offset of the send queue in the WQE buffer; the receive queue
    /// starts at 0.
    pub(crate) fn send_wqe_offset(&self) -> u32 {
        self.send_wqe_offset
    }

    fn state(&self) -> QpState {
        QpState::from_hw(self.state.load(Ordering::Acquire)).unwrap_or(QpState::Error)
    }

    fn transport(&self) -> Transport {
        self.qp_type.transport()
    }
}

pub(crate) struct QpTable {
    alloc: Allocator,
    num_qps: u32,
    sqp_start: u32,
    table: Mutex<SparseArray<Arc<QpInner>>>,
}

impl QpTable {
    pub(crate) fn new(config: &HcaConfig) -> Result<Self> {
        Ok(QpTable {
            alloc: Allocator::new(config.num_qps, (1 << 24) - 1, config.qp_reserved_count())?,
            num_qps: config.num_qps,
            sqp_start: config.sqp_start(),
            table: Mutex::new(SparseArray::new(config.num_qps as usize)),
        })
    }

    fn index(&self, qpn: u32) -> usize {
        (qpn & (self.num_qps - 1)) as usize
    }

    pub(crate) fn lookup(&self, qpn: u32) -> Option<Arc<QpInner>> {
        let table = self.table.lock();
        table
            .get(self.index(qpn))
            .filter(|qp| qp.qpn == qpn)
            .cloned()
    }

    fn hold(&self, qpn: u32) -> Option<Held<QpInner>> {
        let table = self.table.lock();
        table
            .get(self.index(qpn))
            .filter(|qp| qp.qpn == qpn)
            .map(|qp| Held::new(Arc::clone(qp)))
    }

    fn insert(&self, qp: Arc<QpInner>) -> Result<()> {
        let index = self.index(qp.qpn);
        let mut table = self.table.lock();
        if table.get(index).is_some() {
            return Err(Error::InUse);
        }
        table.set(index, qp)
    }
}

/// Points the device at the special QP ranges.
pub(crate) fn init_special_qps(dev: &Arc<HcaDev>) -> Result<()> {
    let base = dev.qp_table.sqp_start;
    dev.cmd.conf_special_qp(SpecialQpType::Smi, base)?;
    dev.cmd.conf_special_qp(SpecialQpType::Gsi, base + 2)?;
    debug!("special QPs start at {:#x}", base);
    Ok(())
}

pub(crate) fn cleanup_special_qps(dev: &HcaDev) {
    for kind in [SpecialQpType::Smi, SpecialQpType::Gsi] {
        if let Err(e) = dev.cmd.conf_special_qp(kind, 0) {
            warn!("CONF_SPECIAL_QP {:?} cleanup failed: {}", kind, e);
        }
    }
}

/// Async event for `qpn`, called from EQ dispatch.
pub(crate) fn event(dev: &HcaDev, qpn: u32, event: QpEvent) {
    let Some(qp) = dev.qp_table.hold(qpn) else {
        warn!("async event {:?} for bogus QP {:#08x}", event, qpn);
        return;
    };

    match event {
        QpEvent::PathMigrated => qp
            .port
            .store(qp.alt_port.load(Ordering::Relaxed), Ordering::Relaxed),
        QpEvent::SqDrained => qp.sq_draining.store(false, Ordering::Release),
        _ => {}
    }

    let handler = qp.event_handler.read().clone();
    match handler {
        Some(handler) => handler(event),
        None => debug!("unhandled event {:?} on QP {:#x}", event, qpn),
    }
}

fn queue_size(wr: u32, max_wqes: u32) -> Result<u32> {
    if wr > max_wqes {
        return Err(Error::InvalidAttribute("too many work requests"));
    }
    Ok(wr.max(1).next_power_of_two())
}

fn build(dev: &HcaDev, qpn: u32, attr: &QpInitAttr, port: u8) -> Result<QpInner> {
    let cap = &attr.cap;
    if cap.max_send_sge > MAX_SGE || cap.max_recv_sge > MAX_SGE {
        return Err(Error::InvalidAttribute("too many scatter/gather entries"));
    }
    let sq_max = queue_size(cap.max_send_wr, dev.config.max_wqes)?;
    let rq_max = queue_size(cap.max_recv_wr, dev.config.max_wqes)?;

    let send_wqe_offset = rq_max << WQE_SHIFT;
    let size = ((rq_max + sq_max) as usize) << WQE_SHIFT;
    let buf = OwnedDma::alloc(&dev.dma, size)?;
    buf.zero();
    let mr = MemoryRegion::register(dev, &buf)?;

    Ok(QpInner {
        qpn,
        qp_type: attr.qp_type,
        sq_sig_all: attr.sq_sig_all,
        send_cq: Arc::clone(attr.send_cq.inner()),
        recv_cq: Arc::clone(attr.recv_cq.inner()),
        sq: WorkQueue::new(sq_max),
        rq: WorkQueue::new(rq_max),
        send_wqe_offset,
        buf,
        lkey: mr.lkey(),
        mr: Mutex::new(Some(mr)),
        state: AtomicU8::new(QpState::Reset.to_hw()),
        sq_draining: AtomicBool::new(false),
        port: AtomicU8::new(port),
        alt_port: AtomicU8::new(0),
        attrs: Mutex::new(QpAttrs {
            atomic_rd_en: AccessFlags::empty(),
            resp_depth: 0,
        }),
        refs: RefCount::new(),
        event_handler: RwLock::new(None),
    })
}

fn release(dev: &HcaDev, qp: &QpInner) {
    if let Some(mr) = qp.mr.lock().take() {
        mr.free(dev);
    }
}

fn install(dev: &Arc<HcaDev>, qp: QpInner, attr: QpInitAttr) -> Result<QueuePair> {
    let qp = Arc::new(qp);
    if let Err(e) = dev.qp_table.insert(Arc::clone(&qp)) {
        release(dev, &qp);
        return Err(e);
    }
    debug!(
        "created {:?} QP {:#x}: sq {} rq {} cqs {:#x}/{:#x}",
        qp.qp_type,
        qp.qpn,
        qp.sq.max,
        qp.rq.max,
        qp.send_cq.cqn(),
        qp.recv_cq.cqn()
    );
    Ok(QueuePair {
        qp: Arc::new(OwnedQp {
            dev: Arc::clone(dev),
            inner: qp,
            _send_cq: attr.send_cq,
            _recv_cq: attr.recv_cq,
        }),
    })
}

pub(crate) fn create(dev: &Arc<HcaDev>, attr: QpInitAttr) -> Result<QueuePair> {
    if attr.qp_type.is_special() {
        return Err(Error::InvalidAttribute("special QPs are created per port"));
    }
    let qpn = dev.qp_table.alloc.alloc()?;
    let res = build(dev, qpn, &attr, 0).and_then(|qp| install(dev, qp, attr));
    if res.is_err() {
        dev.qp_table.alloc.free(qpn);
    }
    res
}

pub(crate) fn create_special(dev: &Arc<HcaDev>, attr: QpInitAttr, port: u8) -> Result<QueuePair> {
    let kind = match attr.qp_type {
        QpType::SMI => SpecialQpType::Smi,
        QpType::GSI => SpecialQpType::Gsi,
        _ => return Err(Error::InvalidAttribute("not a special QP type")),
    };
    if port == 0 || port > dev.config.num_ports {
        return Err(Error::InvalidAttribute("port number"));
    }
    let qpn = dev.qp_table.sqp_start + kind as u32 * 2 + u32::from(port) - 1;
    if dev.qp_table.lookup(qpn).is_some() {
        return Err(Error::InUse);
    }
    let qp = build(dev, qpn, &attr, port)?;
    install(dev, qp, attr)
}

fn destroy(dev: &HcaDev, qp: &Arc<QpInner>) {
    {
        // pollers look QPs up under their CQ lock
        let _cqs = cq::lock_cqs(&qp.send_cq, &qp.recv_cq);
        dev.qp_table.table.lock().clear(dev.qp_table.index(qp.qpn));
    }
    if !qp.refs.wait_idle(HANDLER_DRAIN_TIMEOUT) {
        error!(
            "QP {:#x} destroyed while a handler on another thread still uses it",
            qp.qpn
        );
    }

    if qp.state() != QpState::Reset {
        if let Err(e) = dev.cmd.modify_qp(Opcode::Any2RstQp, qp.qpn, None, false) {
            warn!("ANY2RST for QP {:#x} failed: {}", qp.qpn, e);
        }
    }
    cq::lock_cqs(&qp.send_cq, &qp.recv_cq).clean(dev, qp.qpn);

    release(dev, qp);
    if !qp.qp_type.is_special() {
        dev.qp_table.alloc.free(qp.qpn);
    }
    debug!("destroyed QP {:#x}", qp.qpn);
}

fn set_path(ah: &AhAttr, path: &mut QpPath) {
    path.g_mylmc = ah.src_path_bits & 0x7f;
    path.rlid = ah.dlid.into();
    path.static_rate = ah.static_rate;
    match &ah.grh {
        Some(grh) => {
            path.g_mylmc |= 1 << 7;
            path.mgid_index = grh.sgid_index;
            path.hop_limit = grh.hop_limit;
            path.sl_tclass_flowlabel = ((u32::from(ah.sl) << 28)
                | (u32::from(grh.traffic_class) << 20)
                | (grh.flow_label & 0xf_ffff))
                .into();
            path.rgid = grh.dgid;
        }
        None => path.sl_tclass_flowlabel = (u32::from(ah.sl) << 28).into(),
    }
}

/// log2 of the depth, rounded up, as the context encodes it.
fn rdma_depth(depth: u8) -> u32 {
    u32::from(depth).next_power_of_two().trailing_zeros()
}

/// Responder access bits. A QP without RDMA read/atomic resources may only
/// accept RDMA writes.
fn hw_access_flags(access: AccessFlags, dest_rd_atomic: u8) -> u32 {
    let access = if dest_rd_atomic == 0 {
        access & AccessFlags::REMOTE_WRITE
    } else {
        access
    };
    let mut hw = 0;
    if access.contains(AccessFlags::REMOTE_READ) {
        hw |= QP_BIT_RRE;
    }
    if access.contains(AccessFlags::REMOTE_ATOMIC) {
        hw |= QP_BIT_RAE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        hw |= QP_BIT_RWE;
    }
    hw
}

fn check_values(config: &HcaConfig, attr: &QpAttr) -> Result<()> {
    let port_ok = |port: u8| port >= 1 && port <= config.num_ports;
    if attr.pkey_index.is_some_and(|p| p >= config.pkey_table_len) {
        return Err(Error::InvalidAttribute("P_Key index"));
    }
    if attr.port_num.is_some_and(|p| !port_ok(p)) {
        return Err(Error::InvalidAttribute("port number"));
    }
    if attr.max_rd_atomic.is_some_and(|n| n > config.max_qp_rd_atomic) {
        return Err(Error::InvalidAttribute("max_rd_atomic"));
    }
    if attr.max_dest_rd_atomic.is_some_and(|n| n > config.max_dest_rd_atomic) {
        return Err(Error::InvalidAttribute("max_dest_rd_atomic"));
    }
    if attr.path_mtu.is_some_and(|mtu| mtu > Mtu::Mtu2048) {
        return Err(Error::InvalidAttribute("path MTU"));
    }
    if let Some(alt) = &attr.alt_path {
        if alt.pkey_index >= config.pkey_table_len {
            return Err(Error::InvalidAttribute("alternate P_Key index"));
        }
        if !port_ok(alt.port_num) {
            return Err(Error::InvalidAttribute("alternate port number"));
        }
    }
    Ok(())
}

fn build_context(
    qp: &QpInner,
    attrs: &QpAttrs,
    target: QpState,
    attr: &QpAttr,
) -> (OptParam, QpContext) {
    let transport = qp.transport();
    let mut opt = OptParam::empty();
    let mut ctx = QpContext::new_zeroed();

    let mut flags = (u32::from(target.to_hw()) << 28) | (u32::from(transport.service_type()) << 16);
    match attr.path_mig_state {
        Some(pm) => {
            flags |= pm.to_hw() << QP_PM_SHIFT;
            opt |= OptParam::PM_STATE;
        }
        None => flags |= QP_PM_MIGRATED << QP_PM_SHIFT,
    }
    ctx.flags = flags.into();

    if matches!(transport, Transport::UD | Transport::MLX) {
        ctx.mtu_msgmax = ((Mtu::Mtu2048 as u8) << 5) | 11;
    } else if let Some(mtu) = attr.path_mtu {
        ctx.mtu_msgmax = ((mtu as u8) << 5) | 31;
    }
    ctx.rq_size_stride = ((qp.rq.max.trailing_zeros() << 3) | (WQE_SHIFT - 4)) as u8;
    ctx.sq_size_stride = ((qp.sq.max.trailing_zeros() << 3) | (WQE_SHIFT - 4)) as u8;
    ctx.local_qpn = qp.qpn.into();
    if let Some(dest) = attr.dest_qp_num {
        ctx.remote_qpn = dest.into();
    }

    let mut port_pkey = 0u32;
    if transport == Transport::MLX {
        port_pkey |= u32::from(qp.port.load(Ordering::Relaxed)) << 24;
    } else if let Some(port) = attr.port_num {
        port_pkey |= u32::from(port) << 24;
        opt |= OptParam::PORT_NUM;
    }
    if let Some(pkey_index) = attr.pkey_index {
        port_pkey |= u32::from(pkey_index);
        opt |= OptParam::PKEY_INDEX;
    }
    ctx.pri_path.port_pkey = port_pkey.into();

    if let Some(rnr_retry) = attr.rnr_retry {
        ctx.pri_path.rnr_retry = rnr_retry << 5;
        ctx.alt_path.rnr_retry = rnr_retry << 5;
        opt |= OptParam::RNR_RETRY | OptParam::ALT_RNR_RETRY;
    }
    if let Some(ah) = &attr.ah_attr {
        set_path(ah, &mut ctx.pri_path);
        opt |= OptParam::PRIMARY_ADDR_PATH;
    }
    if let Some(timeout) = attr.timeout {
        ctx.pri_path.ackto = timeout << 3;
        opt |= OptParam::ACK_TIMEOUT;
    }
    if let Some(alt) = &attr.alt_path {
        set_path(&alt.ah_attr, &mut ctx.alt_path);
        ctx.alt_path.port_pkey =
            (u32::from(alt.pkey_index) | (u32::from(alt.port_num) << 24)).into();
        ctx.alt_path.ackto = alt.timeout << 3;
        opt |= OptParam::ALT_ADDR_PATH;
    }

    ctx.pd = DRIVER_PD.into();
    ctx.wqe_lkey = qp.lkey.into();

    let mut params1 = QP_BIT_SWE;
    if qp.sq_sig_all {
        params1 |= QP_BIT_SSC;
    }
    if let Some(retry_cnt) = attr.retry_cnt {
        params1 |= u32::from(retry_cnt) << 16;
        opt |= OptParam::RETRY_COUNT;
    }
    if let Some(max_rd_atomic) = attr.max_rd_atomic {
        if max_rd_atomic > 0 {
            params1 |= QP_BIT_SRE | QP_BIT_SAE;
            params1 |= rdma_depth(max_rd_atomic) << QP_RDMA_DEPTH_SHIFT;
        }
        opt |= OptParam::SRA_MAX;
    }
    ctx.params1 = params1.into();
    if let Some(sq_psn) = attr.sq_psn {
        ctx.next_send_psn = sq_psn.into();
    }
    ctx.cqn_snd = qp.send_cq.cqn().into();
    ctx.snd_wqe_base_l = qp.send_wqe_offset.into();

    let mut params2 = QP_BIT_RSC;
    if let Some(depth) = attr.max_dest_rd_atomic {
        if depth > 0 {
            params2 |= rdma_depth(depth) << QP_RDMA_DEPTH_SHIFT;
        }
        opt |= OptParam::RRA_MAX;
    }
    if attr.access_flags.is_some() || attr.max_dest_rd_atomic.is_some() {
        params2 |= hw_access_flags(
            attr.access_flags.unwrap_or(attrs.atomic_rd_en),
            attr.max_dest_rd_atomic.unwrap_or(attrs.resp_depth),
        );
        opt |= OptParam::RWE | OptParam::RRE | OptParam::RAE;
    }
    ctx.params2 = params2.into();

    let mut rnr_nextrecvpsn = 0u32;
    if let Some(timer) = attr.min_rnr_timer {
        rnr_nextrecvpsn |= u32::from(timer) << 24;
        opt |= OptParam::RNR_TIMEOUT;
    }
    if let Some(rq_psn) = attr.rq_psn {
        rnr_nextrecvpsn |= rq_psn & 0xff_ffff;
    }
    ctx.rnr_nextrecvpsn = rnr_nextrecvpsn.into();
    ctx.cqn_rcv = qp.recv_cq.cqn().into();
    if let Some(qkey) = attr.qkey {
        ctx.qkey = qkey.into();
        opt |= OptParam::Q_KEY;
    }

    (opt, ctx)
}

fn modify(dev: &HcaDev, qp: &QpInner, target: QpState, attr: &QpAttr) -> Result<()> {
    let mut attrs = qp.attrs.lock();

    let cur = match attr.cur_state {
        Some(s @ (QpState::Rtr | QpState::Rts | QpState::Sqd | QpState::Sqe)) => s,
        Some(_) => return Err(Error::InvalidAttribute("current state")),
        None => qp.state(),
    };
    let trans = check_transition(cur, target, qp.transport(), attr.mask())?;
    check_values(&dev.config, attr)?;
    if qp.transport() == Transport::MLX
        && attr
            .port_num
            .is_some_and(|p| p != qp.port.load(Ordering::Relaxed))
    {
        return Err(Error::InvalidAttribute("special QP port is fixed"));
    }

    if cur == QpState::Reset && target == QpState::Reset {
        return Ok(());
    }

    // the drained event may arrive before the command returns
    let draining = cur == QpState::Rts && target == QpState::Sqd;
    qp.sq_draining.store(draining, Ordering::Release);
    let res = if trans.opcode == Opcode::Any2RstQp {
        dev.cmd.modify_qp(Opcode::Any2RstQp, qp.qpn, None, false)
    } else {
        let sqd_event = attr.en_sqd_async_notify == Some(true) && draining;
        let (opt, ctx) = build_context(qp, &attrs, target, attr);
        Mailbox::new(&dev.dma).and_then(|mailbox| {
            mailbox.write(0, &QpParam::new(opt, ctx));
            dev.cmd.modify_qp(trans.opcode, qp.qpn, Some(&mailbox), sqd_event)
        })
    };
    if let Err(e) = res {
        qp.sq_draining.store(false, Ordering::Release);
        return Err(e);
    }

    qp.state.store(target.to_hw(), Ordering::Release);
    if let Some(access) = attr.access_flags {
        attrs.atomic_rd_en = access;
    }
    if let Some(depth) = attr.max_dest_rd_atomic {
        attrs.resp_depth = depth;
    }
    if let Some(port) = attr.port_num {
        qp.port.store(port, Ordering::Relaxed);
    }
    if let Some(alt) = &attr.alt_path {
        qp.alt_port.store(alt.port_num, Ordering::Relaxed);
    }
    debug!("QP {:#x}: {:?} -> {:?}", qp.qpn, cur, target);

    if qp.qp_type == QpType::SMI {
        let port = qp.port.load(Ordering::Relaxed);
        if cur != QpState::Rtr && target == QpState::Rtr {
            info!("QP0 reached RTR, bringing up port {}", port);
            if let Err(e) = dev.ports.bring_up(&dev.cmd, port) {
                warn!("bringing up port {} failed: {}", port, e);
            }
        }
        if !matches!(cur, QpState::Reset | QpState::Error)
            && matches!(target, QpState::Reset | QpState::Error)
        {
            info!("QP0 left service, bringing down port {}", port);
            if let Err(e) = dev.ports.bring_down(&dev.cmd, port) {
                warn!("bringing down port {} failed: {}", port, e);
            }
        }
    }

    if target == QpState::Reset {
        cq::lock_cqs(&qp.send_cq, &qp.recv_cq).clean(dev, qp.qpn);
        qp.sq.reset();
        qp.rq.reset();
    }
    Ok(())
}

fn write_data(qp: &QpInner, offset: usize, sg_list: &[Sge]) {
    for (i, sge) in sg_list.iter().enumerate() {
        let seg = WqeData {
            byte_count: sge.length.into(),
            lkey: sge.lkey.into(),
            addr: sge.addr.into(),
        };
        qp.buf.write_obj(offset + i * WQE_SEG_SIZE, &seg);
    }
}

fn post_send(dev: &HcaDev, qp: &QpInner, wrs: &[SendWr<'_>]) -> Result<()> {
    if !matches!(qp.state(), QpState::Rts | QpState::Sqd) {
        return Err(Error::InvalidState);
    }
    for wr in wrs {
        let nseg = 1 + usize::from(wr.opcode.is_rdma()) + wr.sg_list.len();
        if nseg * WQE_SEG_SIZE > WQE_SIZE {
            return Err(Error::InvalidAttribute("too many scatter/gather entries"));
        }
        if wr.opcode.is_rdma() && wr.remote.is_none() {
            return Err(Error::InvalidAttribute("RDMA without a remote address"));
        }
    }
    if wrs.is_empty() {
        return Ok(());
    }

    let nreq = wrs.len() as u32;
    let mut head = qp.sq.head.lock();
    if qp.sq.overflow(*head, nreq, &qp.send_cq) {
        return Err(Error::QueueFull);
    }

    for (n, wr) in wrs.iter().enumerate() {
        let ind = head.wrapping_add(n as u32) & (qp.sq.max - 1);
        let wqe = qp.send_wqe_offset as usize + ((ind as usize) << WQE_SHIFT);

        let mut flags = 0;
        if wr.signaled || qp.sq_sig_all {
            flags |= WQE_FLAG_CQ_UPDATE;
        }
        if wr.solicited {
            flags |= WQE_FLAG_SOLICIT;
        }
        let mut seg = wqe + WQE_SEG_SIZE;
        if let Some(remote) = wr.remote.filter(|_| wr.opcode.is_rdma()) {
            let raddr = WqeRaddr {
                raddr: remote.addr.into(),
                rkey: remote.rkey.into(),
                _reserved: U32::new(0),
            };
            qp.buf.write_obj(seg, &raddr);
            seg += WQE_SEG_SIZE;
        }
        write_data(qp, seg, wr.sg_list);
        let size = (seg - wqe) / WQE_SEG_SIZE + wr.sg_list.len();

        let ctrl = WqeCtrl {
            nda_op: u32::from(wr.opcode.to_hw()).into(),
            ee_nds: (size as u32).into(),
            flags: flags.into(),
            imm: wr.imm.unwrap_or(0).into(),
        };
        qp.buf.write_obj(wqe, &ctrl);
        qp.sq.set_wr_id(ind, wr.wr_id);
        trace!("QP {:#x} send WQE {} wr_id {:#x}", qp.qpn, ind, wr.wr_id);
    }

    *head = head.wrapping_add(nreq);
    // WQEs must be visible before the doorbell
    fence(Ordering::SeqCst);
    dev.hw.ring(Doorbell::SendQueue {
        qpn: qp.qpn,
        head: *head & 0xffff,
    });
    Ok(())
}

fn post_recv(dev: &HcaDev, qp: &QpInner, wrs: &[RecvWr<'_>]) -> Result<()> {
    if matches!(qp.state(), QpState::Reset | QpState::Error) {
        return Err(Error::InvalidState);
    }
    if wrs.iter().any(|wr| wr.sg_list.len() > MAX_SGE as usize) {
        return Err(Error::InvalidAttribute("too many scatter/gather entries"));
    }
    if wrs.is_empty() {
        return Ok(());
    }

    let nreq = wrs.len() as u32;
    let mut head = qp.rq.head.lock();
    if qp.rq.overflow(*head, nreq, &qp.recv_cq) {
        return Err(Error::QueueFull);
    }

    for (n, wr) in wrs.iter().enumerate() {
        let ind = head.wrapping_add(n as u32) & (qp.rq.max - 1);
        let wqe = (ind as usize) << WQE_SHIFT;
        write_data(qp, wqe + WQE_SEG_SIZE, wr.sg_list);
        let ctrl = WqeCtrl {
            nda_op: U32::new(0),
            ee_nds: (1 + wr.sg_list.len() as u32).into(),
            flags: U32::new(0),
            imm: U32::new(0),
        };
        qp.buf.write_obj(wqe, &ctrl);
        qp.rq.set_wr_id(ind, wr.wr_id);
    }

    *head = head.wrapping_add(nreq);
    fence(Ordering::SeqCst);
    dev.hw.ring(Doorbell::RecvQueue {
        qpn: qp.qpn,
        head: *head & 0xffff,
    });
    Ok(())
}

struct OwnedQp {
    dev: Arc<HcaDev>,
    inner: Arc<QpInner>,
    // keep the CQs alive until the QP is gone
    _send_cq: CompletionQueue,
    _recv_cq: CompletionQueue,
}

impl Drop for OwnedQp {
    fn drop(&mut self) {
        destroy(&self.dev, &self.inner);
    }
}

/// A queue pair. Clones share the QP; it is destroyed with the last clone.
#[derive(Clone)]
pub struct QueuePair {
    qp: Arc<OwnedQp>,
}

impl QueuePair {
    pub fn qpn(&self) -> u32 {
        self.qp.inner.qpn
    }

    pub fn qp_type(&self) -> QpType {
        self.qp.inner.qp_type
    }

    pub fn state(&self) -> QpState {
        self.qp.inner.state()
    }

    /// Set while an RTS -> SQD transition waits for outstanding sends.
    pub fn sq_draining(&self) -> bool {
        self.qp.inner.sq_draining.load(Ordering::Acquire)
    }

    /// Primary port; 0 until one is assigned.
    pub fn port(&self) -> u8 {
        self.qp.inner.port.load(Ordering::Relaxed)
    }

    /// Actual queue sizes after rounding.
    pub fn cap(&self) -> QpCapability {
        QpCapability {
            max_send_wr: self.qp.inner.sq.max,
            max_recv_wr: self.qp.inner.rq.max,
            max_send_sge: MAX_SGE,
            max_recv_sge: MAX_SGE,
        }
    }

    /// Moves the QP to `state`. The attributes must be exactly those the
    /// transition allows for this QP's transport.
    pub fn modify(&self, state: QpState, attr: &QpAttr) -> Result<()> {
        modify(&self.qp.dev, &self.qp.inner, state, attr)
    }

    pub fn post_send(&self, wrs: &[SendWr<'_>]) -> Result<()> {
        post_send(&self.qp.dev, &self.qp.inner, wrs)
    }

    pub fn post_recv(&self, wrs: &[RecvWr<'_>]) -> Result<()> {
        post_recv(&self.qp.dev, &self.qp.inner, wrs)
    }

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(QpEvent) + Send + Sync + 'static,
    {
        *self.qp.inner.event_handler.write() = Some(Arc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legal(from: QpState, to: QpState, t: Transport) -> Option<Transition> {
        transition(from, to, t)
    }

    #[test]
    fn rc_bring_up_attributes() {
        let init = QpAttr::new()
            .pkey_index(0)
            .port_num(1)
            .access_flags(AccessFlags::REMOTE_READ);
        let trans = check_transition(QpState::Reset, QpState::Init, Transport::RC, init.mask())
            .unwrap();
        assert_eq!(trans.opcode, Opcode::Rst2InitQp);

        match check_transition(QpState::Init, QpState::Rtr, Transport::RC, QpAttrMask::empty()) {
            Err(Error::MissingAttribute(missing)) => assert_eq!(
                missing,
                QpAttrMask::AV
                    | QpAttrMask::PATH_MTU
                    | QpAttrMask::DEST_QPN
                    | QpAttrMask::RQ_PSN
                    | QpAttrMask::MAX_DEST_RD_ATOMIC
                    | QpAttrMask::MIN_RNR_TIMER
            ),
            other => panic!("unexpected {:?}", other.map(|t| t.opcode)),
        }
    }

    #[test]
    fn extra_attribute_is_rejected() {
        let mask = QpAttrMask::PKEY_INDEX | QpAttrMask::PORT | QpAttrMask::QKEY;
        assert!(matches!(
            check_transition(QpState::Reset, QpState::Init, Transport::RC, mask | QpAttrMask::ACCESS_FLAGS),
            Err(Error::ExtraneousAttribute(extra)) if extra == QpAttrMask::QKEY
        ));
        assert!(check_transition(QpState::Reset, QpState::Init, Transport::UD, mask).is_ok());
    }

    #[test]
    fn skipping_states_is_illegal() {
        for t in Transport::ALL {
            assert!(legal(QpState::Reset, QpState::Rtr, t).is_none());
            assert!(legal(QpState::Reset, QpState::Rts, t).is_none());
            assert!(legal(QpState::Init, QpState::Rts, t).is_none());
            assert!(legal(QpState::Error, QpState::Init, t).is_none());
            assert!(legal(QpState::Rtr, QpState::Init, t).is_none());
        }
    }

    #[test]
    fn send_queue_error_recovery_is_unreliable_only() {
        for t in [Transport::UD, Transport::UC, Transport::MLX] {
            assert_eq!(legal(QpState::Sqe, QpState::Rts, t).unwrap().opcode, Opcode::Sqerr2RtsQp);
        }
        assert!(legal(QpState::Sqe, QpState::Rts, Transport::RC).is_none());
        assert!(matches!(
            check_transition(QpState::Sqe, QpState::Rts, Transport::RC, QpAttrMask::empty()),
            Err(Error::InvalidTransition {
                from: QpState::Sqe,
                to: QpState::Rts
            })
        ));
    }

    #[test]
    fn reset_and_error_reachable_from_anywhere() {
        for t in Transport::ALL {
            for from in QpState::ALL {
                let rst = legal(from, QpState::Reset, t).unwrap();
                assert_eq!(rst.opcode, Opcode::Any2RstQp);
                assert!(rst.required.is_empty() && rst.optional.is_empty());
                assert_eq!(legal(from, QpState::Error, t).unwrap().opcode, Opcode::Any2ErrQp);
            }
        }
    }

    #[test]
    fn table_sweep_masks_are_exact() {
        for t in Transport::ALL {
            for from in QpState::ALL {
                for to in QpState::ALL {
                    let Some(trans) = legal(from, to, t) else {
                        assert!(matches!(
                            check_transition(from, to, t, QpAttrMask::empty()),
                            Err(Error::InvalidTransition { .. })
                        ));
                        continue;
                    };
                    assert!(
                        (trans.required & trans.optional).is_empty(),
                        "{from:?}->{to:?} {t:?} overlaps"
                    );
                    let allowed = trans.required | trans.optional;
                    assert!(check_transition(from, to, t, trans.required).is_ok());
                    assert!(check_transition(from, to, t, allowed).is_ok());

                    for bit in trans.required.iter() {
                        assert!(matches!(
                            check_transition(from, to, t, trans.required - bit),
                            Err(Error::MissingAttribute(m)) if m == bit
                        ));
                    }
                    for bit in QpAttrMask::all().iter() {
                        if allowed.contains(bit) {
                            continue;
                        }
                        assert!(matches!(
                            check_transition(from, to, t, trans.required | bit),
                            Err(Error::ExtraneousAttribute(e)) if e == bit
                        ));
                    }
                }
            }
        }
    }

    #[test]
    fn builder_mask_tracks_set_fields() {
        let attr = QpAttr::new()
            .ah_attr(AhAttr {
                dlid: 7,
                ..Default::default()
            })
            .path_mtu(Mtu::Mtu1024)
            .dest_qp_num(0x41)
            .rq_psn(0);
        assert_eq!(
            attr.mask(),
            QpAttrMask::AV | QpAttrMask::PATH_MTU | QpAttrMask::DEST_QPN | QpAttrMask::RQ_PSN
        );
        assert_eq!(QpAttr::new().mask(), QpAttrMask::empty());
    }

    #[test]
    fn state_encoding_round_trips() {
        for s in QpState::ALL {
            assert_eq!(QpState::from_hw(s.to_hw()), Some(s));
        }
        assert_eq!(QpState::Sqe.to_hw(), 4);
        assert_eq!(QpState::Sqd.to_hw(), 5);
        assert_eq!(QpState::from_hw(7), None);
    }

    #[test]
    fn responder_without_resources_keeps_only_write() {
        let all = AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC;
        assert_eq!(hw_access_flags(all, 0), QP_BIT_RWE);
        assert_eq!(hw_access_flags(all, 4), QP_BIT_RWE | QP_BIT_RRE | QP_BIT_RAE);
        assert_eq!(hw_access_flags(AccessFlags::REMOTE_READ, 0), 0);
    }

    #[test]
    fn work_queue_tail_follows_completions() {
        let wq = WorkQueue::new(8);
        *wq.head.lock() = 6;
        assert!(wq.fits(6, 2));
        assert!(!wq.fits(6, 3));

        wq.complete(0);
        assert_eq!(wq.tail.load(Ordering::Relaxed), 1);
        wq.complete(4);
        assert_eq!(wq.tail.load(Ordering::Relaxed), 5);
        assert!(wq.fits(6, 7));

        // wraps past the end of the ring
        *wq.head.lock() = 10;
        wq.complete(1);
        assert_eq!(wq.tail.load(Ordering::Relaxed), 10);

        wq.reset();
        assert_eq!(*wq.head.lock(), 0);
        assert_eq!(wq.tail.load(Ordering::Relaxed), 0);
        assert_eq!(wq.last_comp.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn rdma_depth_rounds_up() {
        assert_eq!(rdma_depth(1), 0);
        assert_eq!(rdma_depth(2), 1);
        assert_eq!(rdma_depth(3), 2);
        assert_eq!(rdma_depth(16), 4);
    }

    #[test]
    fn wqe_ctrl_decodes_size() {
        let ctrl = WqeCtrl {
            nda_op: u32::from(opcode::SEND).into(),
            ee_nds: U32::new(3),
            flags: WQE_FLAG_CQ_UPDATE.into(),
            imm: U32::new(0),
        };
        assert_eq!(ctrl.opcode(), opcode::SEND);
        assert_eq!(ctrl.size(), 48);
        assert_eq!(MAX_SGE, 3);
    }
}
