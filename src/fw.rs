//! Mailbox layouts and typed wrappers for the firmware commands the core
//! issues. All multi-byte fields are big-endian, as the device reads them.
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::cmd::{CommandInterface, CommandStatus, Opcode};
use crate::error::{Error, Result};
use crate::hw::{DmaAllocator, OwnedDma, PAGE_SIZE};

/// A one-page DMA buffer whose address is passed as a command parameter.
pub(crate) struct Mailbox {
    buf: OwnedDma,
}

impl Mailbox {
    pub(crate) fn new(dma: &Arc<dyn DmaAllocator>) -> Result<Self> {
        let buf = OwnedDma::alloc(dma, PAGE_SIZE)?;
        buf.zero();
        Ok(Mailbox { buf })
    }

    pub(crate) fn addr(&self) -> u64 {
        self.buf.phys_addr(0)
    }

    pub(crate) fn write<T: IntoBytes + Immutable>(&self, offset: usize, obj: &T) {
        self.buf.write_obj(offset, obj)
    }

    pub(crate) fn read<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        self.buf.read_obj(offset)
    }

    pub(crate) fn clear(&self) {
        self.buf.zero()
    }
}

/// MTT entries that fit in one WRITE_MTT mailbox after its header.
pub(crate) const MTT_PER_MAILBOX: usize = PAGE_SIZE / 8 - 2;
pub(crate) const MTT_FLAG_PRESENT: u64 = 1;

pub(crate) const MPT_FLAG_SW_OWNS: u32 = 0xf << 28;
pub(crate) const MPT_FLAG_MIO: u32 = 1 << 17;
pub(crate) const MPT_FLAG_REGION: u32 = 1 << 8;
pub(crate) const MPT_FLAG_LOCAL_READ: u32 = 1 << 10;
pub(crate) const MPT_FLAG_LOCAL_WRITE: u32 = 1 << 11;

/// Protection domain the core registers its own buffers under.
pub(crate) const DRIVER_PD: u32 = 0;

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MptEntry {
    pub flags: U32,
    pub page_size: U32,
    pub key: U32,
    pub pd: U32,
    pub start: U64,
    pub length: U64,
    pub lkey: U32,
    pub window_count: U32,
    pub window_count_limit: U32,
    /// Byte address of the first MTT entry.
    pub mtt_seg: U64,
    pub mtt_sz: U32,
    _reserved: [U32; 2],
}

static_assertions::const_assert_eq!(std::mem::size_of::<MptEntry>(), 64);

impl MptEntry {
    pub(crate) fn new(key: u32, length: u64, mtt_addr: u64, mtt_sz: u32) -> Self {
        let mut mpt = MptEntry::new_zeroed();
        mpt.flags = (MPT_FLAG_SW_OWNS
            | MPT_FLAG_MIO
            | MPT_FLAG_REGION
            | MPT_FLAG_LOCAL_READ
            | MPT_FLAG_LOCAL_WRITE)
            .into();
        mpt.key = key.into();
        mpt.pd = DRIVER_PD.into();
        mpt.length = length.into();
        mpt.lkey = key.into();
        mpt.mtt_seg = mtt_addr.into();
        mpt.mtt_sz = mtt_sz.into();
        mpt
    }
}

/// Header of a WRITE_MTT mailbox; the entries follow it.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MttHeader {
    /// Byte address of the first entry written.
    pub mtt_base_addr: U64,
    _reserved: U64,
}

impl MttHeader {
    pub(crate) fn new(mtt_base_addr: u64) -> Self {
        let mut hdr = MttHeader::new_zeroed();
        hdr.mtt_base_addr = mtt_base_addr.into();
        hdr
    }
}

pub(crate) const EQ_STATUS_OK: u32 = 0 << 28;
pub(crate) const EQ_STATE_ARMED: u32 = 1 << 8;
pub(crate) const EQ_FLAG_OI: u32 = 1 << 17;

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EqContext {
    pub flags: U32,
    pub start: U64,
    /// log2 of the entry count in the top byte.
    pub logsize_usrpage: U32,
    pub tavor_pd: U32,
    _reserved1: [u8; 3],
    pub intr: u8,
    pub arbel_pd: U32,
    pub lkey: U32,
    _reserved2: [U32; 2],
    pub consumer_index: U32,
    pub producer_index: U32,
    _reserved3: [U32; 4],
}

static_assertions::const_assert_eq!(std::mem::size_of::<EqContext>(), 64);

impl EqContext {
    pub(crate) fn new(log_nent: u32, intr: u8, lkey: u32) -> Self {
        let mut ctx = EqContext::new_zeroed();
        ctx.flags = (EQ_STATUS_OK | EQ_STATE_ARMED | EQ_FLAG_OI).into();
        ctx.logsize_usrpage = (log_nent << 24).into();
        ctx.tavor_pd = DRIVER_PD.into();
        ctx.intr = intr;
        ctx.arbel_pd = DRIVER_PD.into();
        ctx.lkey = lkey.into();
        ctx
    }

    pub fn log_size(&self) -> u32 {
        self.logsize_usrpage.get() >> 24
    }
}

pub(crate) const CQ_STATUS_OK: u32 = 0 << 28;
pub(crate) const CQ_STATE_DISARMED: u32 = 0x0 << 8;

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CqContext {
    pub flags: U32,
    pub start: U64,
    pub logsize_usrpage: U32,
    pub error_eqn: U32,
    pub comp_eqn: U32,
    pub pd: U32,
    pub lkey: U32,
    pub last_notified_index: U32,
    pub solicit_producer_index: U32,
    pub consumer_index: U32,
    pub producer_index: U32,
    pub cqn: U32,
    pub ci_db: U32,
    pub state_db: U32,
    _reserved: U32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<CqContext>(), 64);

impl CqContext {
    pub(crate) fn new(log_nent: u32, cqn: u32, error_eqn: u32, comp_eqn: u32, lkey: u32) -> Self {
        let mut ctx = CqContext::new_zeroed();
        ctx.flags = (CQ_STATUS_OK | CQ_STATE_DISARMED).into();
        ctx.logsize_usrpage = (log_nent << 24).into();
        ctx.error_eqn = error_eqn.into();
        ctx.comp_eqn = comp_eqn.into();
        ctx.pd = DRIVER_PD.into();
        ctx.lkey = lkey.into();
        ctx.cqn = cqn.into();
        ctx
    }

    pub fn log_size(&self) -> u32 {
        self.logsize_usrpage.get() >> 24
    }
}

bitflags! {
    /// Which context fields a MODIFY_QP command updates beyond the ones the
    /// transition always carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptParam: u32 {
        const ALT_ADDR_PATH = 1 << 0;
        const RRE = 1 << 1;
        const RAE = 1 << 2;
        const RWE = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const Q_KEY = 1 << 5;
        const RNR_TIMEOUT = 1 << 6;
        const PRIMARY_ADDR_PATH = 1 << 7;
        const SRA_MAX = 1 << 8;
        const RRA_MAX = 1 << 9;
        const PM_STATE = 1 << 10;
        const PORT_NUM = 1 << 11;
        const RETRY_COUNT = 1 << 12;
        const ALT_RNR_RETRY = 1 << 13;
        const ACK_TIMEOUT = 1 << 14;
        const RNR_RETRY = 1 << 15;
        const SCHED_QUEUE = 1 << 16;
    }
}

// params1: requester side
pub(crate) const QP_BIT_SRE: u32 = 1 << 15;
pub(crate) const QP_BIT_SWE: u32 = 1 << 14;
pub(crate) const QP_BIT_SAE: u32 = 1 << 13;
pub(crate) const QP_BIT_SSC: u32 = 1 << 3;
// params2: responder side
pub(crate) const QP_BIT_RRE: u32 = 1 << 15;
pub(crate) const QP_BIT_RWE: u32 = 1 << 14;
pub(crate) const QP_BIT_RAE: u32 = 1 << 13;
pub(crate) const QP_BIT_RSC: u32 = 1 << 3;
/// log2 of the outstanding RDMA read/atomic depth, in params1 and params2.
pub(crate) const QP_RDMA_DEPTH_SHIFT: u32 = 21;

/// One address path of a QP context.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QpPath {
    /// Port in the top byte, pkey index in the low bits.
    pub port_pkey: U32,
    pub rnr_retry: u8,
    pub g_mylmc: u8,
    pub rlid: U16,
    pub ackto: u8,
    pub mgid_index: u8,
    pub static_rate: u8,
    pub hop_limit: u8,
    pub sl_tclass_flowlabel: U32,
    pub rgid: [u8; 16],
}

static_assertions::const_assert_eq!(std::mem::size_of::<QpPath>(), 32);

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QpContext {
    /// Target state in bits 28-31, transport service type in bits 16-23,
    /// migration state in bits 11-12.
    pub flags: U32,
    pub tavor_sched_queue: U32,
    pub mtu_msgmax: u8,
    /// log2(entries) << 3 | (wqe_shift - 4)
    pub rq_size_stride: u8,
    pub sq_size_stride: u8,
    pub rlkey_arbel_sched_queue: u8,
    pub usr_page: U32,
    pub local_qpn: U32,
    pub remote_qpn: U32,
    _reserved1: [U32; 2],
    pub pri_path: QpPath,
    pub alt_path: QpPath,
    pub rdd: U32,
    pub pd: U32,
    pub wqe_base: U32,
    pub wqe_lkey: U32,
    pub params1: U32,
    _reserved2: U32,
    pub next_send_psn: U32,
    pub cqn_snd: U32,
    /// Byte offset of the send queue in the WQE buffer.
    pub snd_wqe_base_l: U32,
    pub snd_db_index: U32,
    pub last_acked_psn: U32,
    pub ssn: U32,
    pub params2: U32,
    pub rnr_nextrecvpsn: U32,
    pub ra_buff_indx: U32,
    pub cqn_rcv: U32,
    pub rcv_wqe_base_l: U32,
    pub rcv_db_index: U32,
    pub qkey: U32,
    pub srqn: U32,
    pub rmsn: U32,
    pub rq_wqe_counter: U16,
    pub sq_wqe_counter: U16,
    _reserved3: [U32; 18],
}

static_assertions::const_assert_eq!(std::mem::size_of::<QpContext>(), 256);

impl QpContext {
    pub fn state(&self) -> u8 {
        (self.flags.get() >> 28) as u8
    }

    pub fn service_type(&self) -> u8 {
        ((self.flags.get() >> 16) & 0xff) as u8
    }
}

/// MODIFY_QP mailbox.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QpParam {
    pub opt_param_mask: U32,
    _reserved1: U32,
    pub context: QpContext,
    _reserved2: [U32; 62],
}

static_assertions::const_assert_eq!(std::mem::size_of::<QpParam>(), 512);

impl QpParam {
    pub(crate) fn new(opt: OptParam, context: QpContext) -> Self {
        let mut param = QpParam::new_zeroed();
        param.opt_param_mask = opt.bits().into();
        param.context = context;
        param
    }
}

pub const QP_PER_MGM: usize = 8;
pub(crate) const MGM_QP_VALID: u32 = 1 << 31;

/// A multicast group entry: chain link, group GID and member QPNs.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MgmEntry {
    /// Index of the next entry in the hash chain, shifted left by 6.
    pub next_gid_index: U32,
    _reserved: [U32; 3],
    pub gid: [u8; 16],
    pub qp: [U32; QP_PER_MGM],
}

static_assertions::const_assert_eq!(std::mem::size_of::<MgmEntry>(), 64);

impl MgmEntry {
    pub fn next_index(&self) -> u32 {
        self.next_gid_index.get() >> 6
    }

    pub fn set_next_index(&mut self, index: u32) {
        self.next_gid_index = (index << 6).into();
    }
}

/// CONF_SPECIAL_QP selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpecialQpType {
    Smi = 0,
    Gsi = 1,
}

/// op_mod for ANY2RST: 0 dumps the old context to the out mailbox.
const QP_RST_NO_DUMP: u8 = 1;

const NOP_TIMEOUT: Duration = Duration::from_millis(100);

impl CommandInterface {
    pub(crate) fn write_mtt(&self, mailbox: &Mailbox, num_mtt: u32) -> Result<()> {
        self.cmd(Opcode::WriteMtt, mailbox.addr(), 0, num_mtt, 0)
            .map(drop)
    }

    pub(crate) fn sw2hw_mpt(&self, mailbox: &Mailbox, index: u32) -> Result<()> {
        self.cmd(Opcode::Sw2HwMpt, mailbox.addr(), 0, index, 0)
            .map(drop)
    }

    pub(crate) fn hw2sw_mpt(&self, index: u32) -> Result<()> {
        // op_mod 1: no output mailbox
        self.cmd(Opcode::Hw2SwMpt, 0, 0, index, 1).map(drop)
    }

    pub(crate) fn map_eq(&self, event_mask: u64, unmap: bool, eqn: u32) -> Result<()> {
        self.cmd(
            Opcode::MapEq,
            event_mask,
            0,
            (u32::from(unmap) << 31) | eqn,
            0,
        )
        .map(drop)
    }

    pub(crate) fn sw2hw_eq(&self, mailbox: &Mailbox, eqn: u32) -> Result<()> {
        self.cmd(Opcode::Sw2HwEq, mailbox.addr(), 0, eqn, 0).map(drop)
    }

    pub(crate) fn hw2sw_eq(&self, mailbox: &Mailbox, eqn: u32) -> Result<()> {
        self.cmd(Opcode::Hw2SwEq, 0, mailbox.addr(), eqn, 0).map(drop)
    }

    pub(crate) fn sw2hw_cq(&self, mailbox: &Mailbox, cqn: u32) -> Result<()> {
        self.cmd(Opcode::Sw2HwCq, mailbox.addr(), 0, cqn, 0).map(drop)
    }

    pub(crate) fn hw2sw_cq(&self, mailbox: &Mailbox, cqn: u32) -> Result<()> {
        self.cmd(Opcode::Hw2SwCq, 0, mailbox.addr(), cqn, 0).map(drop)
    }

    /// Issues one QP transition. ANY2RST takes no input; with a mailbox it
    /// receives the dumped context.
    pub(crate) fn modify_qp(
        &self,
        trans: Opcode,
        qpn: u32,
        mailbox: Option<&Mailbox>,
        sqd_event: bool,
    ) -> Result<()> {
        let in_mod = (u32::from(sqd_event) << 31) | qpn;
        if trans == Opcode::Any2RstQp {
            let (out, op_mod) = match mailbox {
                Some(mailbox) => (mailbox.addr(), 0),
                None => (0, QP_RST_NO_DUMP),
            };
            return self.cmd(trans, 0, out, in_mod, op_mod).map(drop);
        }
        let in_param = mailbox.map_or(0, Mailbox::addr);
        self.cmd(trans, in_param, 0, in_mod, 0).map(drop)
    }

    pub(crate) fn conf_special_qp(&self, kind: SpecialQpType, base_qpn: u32) -> Result<()> {
        self.cmd(Opcode::ConfSpecialQp, 0, 0, base_qpn, kind as u8)
            .map(drop)
    }

    pub(crate) fn read_mgm(&self, mailbox: &Mailbox, index: u32) -> Result<()> {
        self.cmd(Opcode::ReadMgm, 0, mailbox.addr(), index, 0).map(drop)
    }

    pub(crate) fn write_mgm(&self, mailbox: &Mailbox, index: u32) -> Result<()> {
        self.cmd(Opcode::WriteMgm, mailbox.addr(), 0, index, 0).map(drop)
    }

    /// The GID to hash must already be at the start of the mailbox.
    pub(crate) fn mgid_hash(&self, mailbox: &Mailbox) -> Result<u16> {
        self.cmd(Opcode::MgidHash, mailbox.addr(), 0, 0, 0)
            .map(|out| out as u16)
    }

    pub fn init_ib(&self, port: u8) -> Result<()> {
        self.cmd(Opcode::InitIb, 0, 0, u32::from(port), 0).map(drop)
    }

    pub fn close_ib(&self, port: u8) -> Result<()> {
        self.cmd(Opcode::CloseIb, 0, 0, u32::from(port), 0).map(drop)
    }

    /// A NOP with a short timeout; used to prove event delivery works.
    pub fn nop(&self) -> Result<()> {
        let (_, status) = self.execute(0, 0, 0, 0, Opcode::Nop, NOP_TIMEOUT)?;
        match CommandStatus::from_u8(status) {
            CommandStatus::Ok => Ok(()),
            status => Err(Error::Firmware {
                opcode: Opcode::Nop,
                status,
            }),
        }
    }
}
