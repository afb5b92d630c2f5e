//! A software model of the adapter.
//!
//! `SimDma` hands out DMA buffers backed by host memory and resolves the
//! fake physical addresses it issued. `SimHca` implements `Hardware` on top
//! of it: commands written to the HCR are executed synchronously against an
//! in-memory firmware state (MPT/MTT tables, EQ/CQ/QP contexts, the
//! multicast table), rings are read and written through the registered
//! lkeys just as the device would, and every EQ's interrupts are delivered
//! from a thread of its own.
//!
//! Send doorbells are executed immediately. RC and UC sends are looped back
//! to the destination QP named in the context, consuming one of its posted
//! receives. Nothing is copied between buffers: a scatter/gather entry only
//! contributes its length.
//!
//! The model also carries fault injection hooks (stalled or failing
//! commands, lost command events, held interrupts, raw CQEs and EQEs) for
//! exercising the error paths of the core.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use slab::Slab;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::cmd::{CommandStatus, Opcode};
use crate::config::{HcaConfig, MAX_PORTS};
use crate::cq::{opcode, syndrome, Cqe, ErrCqe, CQE_SIZE};
use crate::eq::{
    CmdEvent, CompEvent, CqErrEvent, EventType, Eqe, PortChangeEvent, QpEventData, EQE_OWNER_HW,
    EQE_SIZE, PORT_CHANGE_ACTIVE,
};
use crate::fw::{
    CqContext, EqContext, MgmEntry, MptEntry, MttHeader, QpContext, QpParam, EQ_STATE_ARMED,
    MTT_FLAG_PRESENT, MTT_PER_MAILBOX, QP_BIT_SSC,
};
use crate::hw::{
    DmaAllocator, DmaBuffer, DmaRegion, Doorbell, Hardware, HcrBlock, HcrStatus, IrqHandler,
    PAGE_SHIFT, PAGE_SIZE,
};
use crate::mr::key_to_hw_index;
use crate::qp::{QpState, WqeCtrl, WqeData, WQE_FLAG_CQ_UPDATE, WQE_FLAG_SOLICIT, WQE_SHIFT};

/// Subtype of a port change event reporting the link down.
const PORT_CHANGE_DOWN: u8 = 0x01;
/// CQ error syndrome for an overrun.
const CQ_ERROR_OVERRUN: u8 = 0x01;
/// Records kept by the command and doorbell logs.
const LOG_DEPTH: usize = 4096;

const SERVICE_RC: u8 = 0x0;
const SERVICE_UC: u8 = 0x1;

/// Host memory posing as DMA memory. Allocation `k` lives at physical
/// addresses `(k + 1) << 32` onwards.
#[derive(Default)]
pub struct SimDma {
    regions: Mutex<Slab<Arc<DmaRegion>>>,
    fail_allocs: AtomicUsize,
}

impl SimDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations not yet freed.
    pub fn live(&self) -> usize {
        self.regions.lock().len()
    }

    /// Makes the next `n` allocations fail.
    pub fn fail_next_allocs(&self, n: usize) {
        self.fail_allocs.store(n, Ordering::Relaxed);
    }

    fn locate(&self, addr: u64, len: usize) -> Option<(Arc<DmaRegion>, usize)> {
        let key = (addr >> 32).checked_sub(1)? as usize;
        let offset = (addr & 0xffff_ffff) as usize;
        let region = Arc::clone(self.regions.lock().get(key)?);
        if offset + len > region.len() {
            return None;
        }
        Some((region, offset))
    }

    /// Device read at a physical address. False if nothing is mapped there.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        match self.locate(addr, buf.len()) {
            Some((region, offset)) => {
                region.read(offset, buf);
                true
            }
            None => false,
        }
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        match self.locate(addr, data.len()) {
            Some((region, offset)) => {
                region.write(offset, data);
                true
            }
            None => false,
        }
    }
}

impl DmaAllocator for SimDma {
    fn alloc_coherent(&self, size: usize) -> io::Result<DmaBuffer> {
        let failing = self
            .fail_allocs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "injected DMA failure"));
        }

        let npages = size.div_ceil(PAGE_SIZE).max(1);
        let region = Arc::new(DmaRegion::new(npages * PAGE_SIZE));
        let key = self.regions.lock().insert(Arc::clone(&region));
        let base = (key as u64 + 1) << 32;
        let pages = (0..npages as u64).map(|p| base + (p << PAGE_SHIFT)).collect();
        trace!("DMA alloc {} bytes as region {}", size, key);
        Ok(DmaBuffer::new(key, size, pages, region))
    }

    fn free_coherent(&self, buf: &DmaBuffer) {
        if self.regions.lock().try_remove(buf.handle()).is_none() {
            warn!("freeing unknown DMA region {}", buf.handle());
        }
    }
}

/// One command as the device received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    pub opcode: Opcode,
    pub in_modifier: u32,
    pub op_modifier: u8,
    pub event: bool,
}

type FwResult<T = u64> = std::result::Result<T, CommandStatus>;

struct SimMpt {
    key: u32,
    length: u64,
    /// Index of the first MTT entry.
    mtt_base: u64,
}

struct SimEq {
    lkey: u32,
    nent: u32,
    prod: u32,
    /// Last index published with `EqSetCi`.
    ci: u32,
    armed: bool,
}

struct SimCq {
    lkey: u32,
    nent: u32,
    comp_eqn: u32,
    error_eqn: u32,
    state_db: u32,
    prod: u32,
    ci: u32,
    /// Pending request for one completion event; `true` for solicited only.
    arm: Option<bool>,
    overflowed: bool,
}

impl SimCq {
    fn outstanding(&self) -> u32 {
        self.prod.wrapping_sub(self.ci) & 0xff_ffff
    }
}

#[derive(Debug, Clone, Copy)]
struct SimQp {
    qpn: u32,
    state: QpState,
    service: u8,
    remote_qpn: u32,
    cqn_snd: u32,
    cqn_rcv: u32,
    wqe_lkey: u32,
    snd_base: u32,
    sq_max: u32,
    rq_max: u32,
    sig_all: bool,
    /// Send WQEs executed, and announced by doorbell.
    sq_done: u32,
    sq_posted: u32,
    rq_done: u32,
    rq_posted: u32,
}

impl SimQp {
    fn new(qpn: u32) -> Self {
        SimQp {
            qpn,
            state: QpState::Reset,
            service: 0,
            remote_qpn: 0,
            cqn_snd: 0,
            cqn_rcv: 0,
            wqe_lkey: 0,
            snd_base: 0,
            sq_max: 1,
            rq_max: 1,
            sig_all: false,
            sq_done: 0,
            sq_posted: 0,
            rq_done: 0,
            rq_posted: 0,
        }
    }

    fn load(&mut self, ctx: &QpContext) {
        self.service = ctx.service_type();
        self.cqn_snd = ctx.cqn_snd.get();
        self.cqn_rcv = ctx.cqn_rcv.get();
        self.wqe_lkey = ctx.wqe_lkey.get();
        self.snd_base = ctx.snd_wqe_base_l.get();
        self.sq_max = 1 << (ctx.sq_size_stride >> 3);
        self.rq_max = 1 << (ctx.rq_size_stride >> 3);
        self.sig_all = ctx.params1.get() & QP_BIT_SSC != 0;
        if ctx.remote_qpn.get() != 0 {
            self.remote_qpn = ctx.remote_qpn.get() & 0xff_ffff;
        }
    }

    fn reset(&mut self) {
        self.state = QpState::Reset;
        self.sq_done = 0;
        self.sq_posted = 0;
        self.rq_done = 0;
        self.rq_posted = 0;
    }

    fn receiving(&self) -> bool {
        matches!(self.state, QpState::Rtr | QpState::Rts | QpState::Sqd)
    }
}

/// Source and target state of each context-carrying transition; `None`
/// accepts any source.
fn transition_states(op: Opcode) -> Option<(Option<QpState>, QpState)> {
    use QpState::*;
    Some(match op {
        Opcode::Rst2InitQp => (Some(Reset), Init),
        Opcode::Init2InitQp => (Some(Init), Init),
        Opcode::Init2RtrQp => (Some(Init), Rtr),
        Opcode::Rtr2RtsQp => (Some(Rtr), Rts),
        Opcode::Rts2RtsQp => (Some(Rts), Rts),
        Opcode::Sqerr2RtsQp => (Some(Sqe), Rts),
        Opcode::Rts2SqdQp => (Some(Rts), Sqd),
        Opcode::Sqd2RtsQp => (Some(Sqd), Rts),
        Opcode::Sqd2SqdQp => (Some(Sqd), Sqd),
        Opcode::Any2ErrQp => (None, Error),
        _ => return None,
    })
}

enum Delivery {
    Accepted,
    NoReceiver,
    /// The receive buffer was too small.
    Rejected,
}

struct Firmware {
    dma: Arc<SimDma>,
    num_mpts: u32,
    num_mgms: u32,
    num_ports: u8,
    mtt_entries: u64,

    mtt: HashMap<u64, u64>,
    mpts: HashMap<u32, SimMpt>,
    eqs: HashMap<u32, SimEq>,
    /// EQ each event type is mapped to.
    event_map: [Option<u32>; 64],
    cqs: HashMap<u32, SimCq>,
    qps: HashMap<u32, SimQp>,
    mgm: Vec<MgmEntry>,
    special_qp: [u32; 2],
    ports_up: [bool; MAX_PORTS as usize],

    irq: Option<IrqLines>,
    hold_irqs: bool,
    held_irqs: Vec<u32>,
    eq_overflows: u32,
    forced_hash: Option<u16>,
    send_faults: HashMap<u32, u8>,
}

impl Firmware {
    fn new(config: &HcaConfig, dma: Arc<SimDma>) -> Self {
        let mgm_size = (config.num_mgms + config.num_amgms) as usize;
        Firmware {
            dma,
            num_mpts: config.num_mpts,
            num_mgms: config.num_mgms,
            num_ports: config.num_ports,
            mtt_entries: u64::from(config.num_mtt_segs) * u64::from(config.mtt_seg_size),
            mtt: HashMap::new(),
            mpts: HashMap::new(),
            eqs: HashMap::new(),
            event_map: [None; 64],
            cqs: HashMap::new(),
            qps: HashMap::new(),
            mgm: (0..mgm_size).map(|_| MgmEntry::new_zeroed()).collect(),
            special_qp: [0; 2],
            ports_up: [false; MAX_PORTS as usize],
            irq: None,
            hold_irqs: false,
            held_irqs: Vec::new(),
            eq_overflows: 0,
            forced_hash: None,
            send_faults: HashMap::new(),
        }
    }

    fn read_phys<T: FromBytes + IntoBytes>(&self, addr: u64) -> FwResult<T> {
        let mut obj = T::new_zeroed();
        if !self.dma.read(addr, obj.as_mut_bytes()) {
            warn!("device read from unmapped address {:#x}", addr);
            return Err(CommandStatus::BadParam);
        }
        Ok(obj)
    }

    fn write_phys(&self, addr: u64, data: &[u8]) -> FwResult<()> {
        if !self.dma.write(addr, data) {
            warn!("device write to unmapped address {:#x}", addr);
            return Err(CommandStatus::BadParam);
        }
        Ok(())
    }

    /// Resolves `offset` within the region of `lkey` to a physical address.
    fn translate(&self, lkey: u32, offset: usize) -> Option<u64> {
        let mpt = self
            .mpts
            .get(&(key_to_hw_index(lkey) & (self.num_mpts - 1)))?;
        if mpt.key != lkey || offset as u64 >= mpt.length {
            return None;
        }
        let entry = self.mtt.get(&(mpt.mtt_base + (offset / PAGE_SIZE) as u64))?;
        if entry & MTT_FLAG_PRESENT == 0 {
            return None;
        }
        Some((entry & !MTT_FLAG_PRESENT) + (offset % PAGE_SIZE) as u64)
    }

    fn ring_read<T: FromBytes + IntoBytes>(&self, lkey: u32, offset: usize) -> Option<T> {
        let addr = self.translate(lkey, offset)?;
        let mut obj = T::new_zeroed();
        self.dma.read(addr, obj.as_mut_bytes()).then_some(obj)
    }

    fn ring_write(&self, lkey: u32, offset: usize, data: &[u8]) -> bool {
        match self.translate(lkey, offset) {
            Some(addr) => self.dma.write(addr, data),
            None => false,
        }
    }

    fn fire(&mut self, eqn: u32) {
        if self.hold_irqs {
            if !self.held_irqs.contains(&eqn) {
                self.held_irqs.push(eqn);
            }
            return;
        }
        if let Some(irq) = &mut self.irq {
            irq.raise(eqn);
        }
    }

    fn post_eqe(&mut self, eqn: u32, eqe: &Eqe) {
        let Some(eq) = self.eqs.get(&eqn) else {
            warn!("event {:#04x} for EQ {} which is not in hardware", eqe.event_type, eqn);
            return;
        };
        let (lkey, offset) = (eq.lkey, (eq.prod & (eq.nent - 1)) as usize * EQE_SIZE);

        let owner = self.ring_read::<[u8; 1]>(lkey, offset + EQE_SIZE - 1);
        if owner.map_or(true, |o| o[0] & EQE_OWNER_HW == 0) {
            self.eq_overflows += 1;
            warn!("EQ {} overrun, dropping event {:#04x}", eqn, eqe.event_type);
            if let Some(async_eqn) = self.event_map[EventType::EqOverflow as usize] {
                if async_eqn != eqn {
                    self.post_eqe(async_eqn, &Eqe::new(EventType::EqOverflow, 0, &U32::new(eqn)));
                }
            }
            return;
        }

        let mut bytes = [0u8; EQE_SIZE];
        bytes.copy_from_slice(eqe.as_bytes());
        bytes[EQE_SIZE - 1] = 0;
        self.ring_write(lkey, offset, &bytes);

        let Some(eq) = self.eqs.get_mut(&eqn) else {
            return;
        };
        eq.prod = eq.prod.wrapping_add(1);
        trace!("EQ {} event {:#04x} at {}", eqn, eqe.event_type, eq.prod - 1);
        if eq.armed {
            eq.armed = false;
            self.fire(eqn);
        }
    }

    fn post_event<T: IntoBytes + Immutable>(&mut self, event_type: EventType, subtype: u8, payload: &T) {
        match self.event_map[event_type as usize] {
            Some(eqn) => self.post_eqe(eqn, &Eqe::new(event_type, subtype, payload)),
            None => debug!("{:?} event not mapped to any EQ", event_type),
        }
    }

    fn eq_req_not(&mut self, eqn: u32) {
        let Some(eq) = self.eqs.get_mut(&eqn) else {
            warn!("ReqNot for EQ {} which is not in hardware", eqn);
            return;
        };
        eq.armed = true;
        if eq.prod & (eq.nent - 1) != eq.ci & (eq.nent - 1) {
            eq.armed = false;
            self.fire(eqn);
        }
    }

    /// Writes one completion to `cqn`. The owner byte is forced to software.
    fn write_cqe(&mut self, cqn: u32, entry: &[u8], solicited: bool) {
        let Some(cq) = self.cqs.get(&cqn) else {
            warn!("completion for CQ {:#x} which is not in hardware", cqn);
            return;
        };
        if cq.overflowed {
            return;
        }
        if cq.outstanding() >= cq.nent {
            let error_eqn = cq.error_eqn;
            if let Some(cq) = self.cqs.get_mut(&cqn) {
                cq.overflowed = true;
            }
            warn!("CQ {:#x} overrun", cqn);
            self.post_eqe(
                error_eqn,
                &Eqe::new(EventType::CqError, 0, &CqErrEvent::new(cqn, CQ_ERROR_OVERRUN)),
            );
            return;
        }

        let offset = (cq.prod & (cq.nent - 1)) as usize * CQE_SIZE;
        let mut bytes = [0u8; CQE_SIZE];
        bytes.copy_from_slice(&entry[..CQE_SIZE]);
        bytes[CQE_SIZE - 1] = 0;
        if !self.ring_write(cq.lkey, offset, &bytes) {
            warn!("CQ {:#x} buffer not reachable through lkey {:#x}", cqn, cq.lkey);
            return;
        }

        let Some(cq) = self.cqs.get_mut(&cqn) else {
            return;
        };
        cq.prod = cq.prod.wrapping_add(1);
        let fire = match cq.arm {
            Some(solicited_only) => !solicited_only || solicited,
            None => false,
        };
        if fire {
            cq.arm = None;
            let eqn = cq.comp_eqn;
            self.post_eqe(eqn, &Eqe::new(EventType::Completion, 0, &CompEvent::new(cqn)));
        }
    }

    fn cq_arm(&mut self, cqn: u32, ci: u32, solicited: bool) {
        let Some(cq) = self.cqs.get(&cqn) else {
            warn!("arm for CQ {:#x} which is not in hardware", cqn);
            return;
        };
        match self.ring_read::<[U32; 2]>(cq.lkey, cq.state_db as usize) {
            Some([word, rec_cqn]) => {
                if rec_cqn.get() != cqn || word.get() & 0xff_ffff != ci {
                    warn!("CQ {:#x} arm record does not match the doorbell", cqn);
                }
            }
            None => warn!("CQ {:#x} arm record unreadable", cqn),
        }

        let Some(cq) = self.cqs.get_mut(&cqn) else {
            return;
        };
        cq.ci = ci;
        cq.arm = Some(solicited);
        // an unsolicited request is satisfied by entries already queued
        if !solicited && cq.outstanding() > 0 {
            cq.arm = None;
            let eqn = cq.comp_eqn;
            self.post_eqe(eqn, &Eqe::new(EventType::Completion, 0, &CompEvent::new(cqn)));
        }
    }

    fn execute(&mut self, opcode: Opcode, hcr: &HcrBlock) -> FwResult {
        let in_param = hcr.in_param.get();
        let out_param = hcr.out_param.get();
        let in_mod = hcr.in_modifier.get();
        let op_mod = hcr.op_modifier();

        match opcode {
            Opcode::Nop => Ok(0),
            Opcode::InitIb => self.set_port(in_mod, true),
            Opcode::CloseIb => self.set_port(in_mod, false),
            Opcode::WriteMtt => self.write_mtt(in_param, in_mod),
            Opcode::Sw2HwMpt => self.sw2hw_mpt(in_param, in_mod),
            Opcode::Hw2SwMpt => self
                .mpts
                .remove(&in_mod)
                .map(|_| 0)
                .ok_or(CommandStatus::BadResourceState),
            Opcode::MapEq => self.map_eq(in_param, in_mod),
            Opcode::Sw2HwEq => self.sw2hw_eq(in_param, in_mod),
            Opcode::Hw2SwEq => self
                .eqs
                .remove(&in_mod)
                .map(|_| 0)
                .ok_or(CommandStatus::BadResourceState),
            Opcode::Sw2HwCq => self.sw2hw_cq(in_param, in_mod),
            Opcode::Hw2SwCq => self
                .cqs
                .remove(&in_mod)
                .map(|_| 0)
                .ok_or(CommandStatus::BadResourceState),
            Opcode::Any2RstQp => {
                if let Some(qp) = self.qps.get_mut(&(in_mod & 0xff_ffff)) {
                    qp.reset();
                }
                Ok(0)
            }
            Opcode::Rst2InitQp
            | Opcode::Init2InitQp
            | Opcode::Init2RtrQp
            | Opcode::Rtr2RtsQp
            | Opcode::Rts2RtsQp
            | Opcode::Sqerr2RtsQp
            | Opcode::Any2ErrQp
            | Opcode::Rts2SqdQp
            | Opcode::Sqd2RtsQp
            | Opcode::Sqd2SqdQp => self.modify_qp(opcode, in_param, in_mod),
            Opcode::ConfSpecialQp => {
                let slot = self
                    .special_qp
                    .get_mut(usize::from(op_mod))
                    .ok_or(CommandStatus::BadParam)?;
                *slot = in_mod;
                Ok(0)
            }
            Opcode::ReadMgm => {
                let mgm = self
                    .mgm
                    .get(in_mod as usize)
                    .ok_or(CommandStatus::BadIndex)?;
                self.write_phys(out_param, mgm.as_bytes())?;
                Ok(0)
            }
            Opcode::WriteMgm => {
                let mgm: MgmEntry = self.read_phys(in_param)?;
                let slot = self
                    .mgm
                    .get_mut(in_mod as usize)
                    .ok_or(CommandStatus::BadIndex)?;
                *slot = mgm;
                Ok(0)
            }
            Opcode::MgidHash => {
                let gid: [u8; 16] = self.read_phys(in_param)?;
                Ok(u64::from(self.mgid_hash(&gid)))
            }
            Opcode::QueryMpt | Opcode::ReadMtt | Opcode::QueryEq | Opcode::QueryCq | Opcode::QueryQp => {
                Err(CommandStatus::BadOpcode)
            }
        }
    }

    fn mgid_hash(&self, gid: &[u8; 16]) -> u32 {
        let hash = match self.forced_hash {
            Some(hash) => u32::from(hash),
            None => gid
                .iter()
                .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(*b))),
        };
        hash % self.num_mgms
    }

    fn set_port(&mut self, port: u32, up: bool) -> FwResult {
        if port == 0 || port > u32::from(self.num_ports) {
            return Err(CommandStatus::BadParam);
        }
        self.ports_up[port as usize - 1] = up;
        let subtype = if up { PORT_CHANGE_ACTIVE } else { PORT_CHANGE_DOWN };
        self.post_event(EventType::PortChange, subtype, &PortChangeEvent::new(port as u8));
        Ok(0)
    }

    fn write_mtt(&mut self, mailbox: u64, count: u32) -> FwResult {
        if count as usize > MTT_PER_MAILBOX {
            return Err(CommandStatus::BadParam);
        }
        let hdr: MttHeader = self.read_phys(mailbox)?;
        let base = hdr.mtt_base_addr.get() / 8;
        if base + u64::from(count) > self.mtt_entries {
            return Err(CommandStatus::BadIndex);
        }
        for i in 0..u64::from(count) {
            let entry: U64 = self.read_phys(mailbox + 16 + i * 8)?;
            self.mtt.insert(base + i, entry.get());
        }
        Ok(0)
    }

    fn sw2hw_mpt(&mut self, mailbox: u64, index: u32) -> FwResult {
        if index >= self.num_mpts {
            return Err(CommandStatus::BadIndex);
        }
        if self.mpts.contains_key(&index) {
            return Err(CommandStatus::BadResourceState);
        }
        let mpt: MptEntry = self.read_phys(mailbox)?;
        self.mpts.insert(
            index,
            SimMpt {
                key: mpt.key.get(),
                length: mpt.length.get(),
                mtt_base: mpt.mtt_seg.get() / 8,
            },
        );
        Ok(0)
    }

    fn map_eq(&mut self, mask: u64, in_mod: u32) -> FwResult {
        let unmap = in_mod >> 31 != 0;
        let eqn = in_mod & 0xff;
        if !unmap && !self.eqs.contains_key(&eqn) {
            return Err(CommandStatus::BadResourceState);
        }
        for (bit, slot) in self.event_map.iter_mut().enumerate() {
            if mask & (1 << bit) == 0 {
                continue;
            }
            if !unmap {
                *slot = Some(eqn);
            } else if *slot == Some(eqn) {
                *slot = None;
            }
        }
        Ok(0)
    }

    fn sw2hw_eq(&mut self, mailbox: u64, eqn: u32) -> FwResult {
        if self.eqs.contains_key(&eqn) {
            return Err(CommandStatus::BadResourceState);
        }
        let ctx: EqContext = self.read_phys(mailbox)?;
        self.eqs.insert(
            eqn,
            SimEq {
                lkey: ctx.lkey.get(),
                nent: 1 << ctx.log_size(),
                prod: 0,
                ci: 0,
                armed: ctx.flags.get() & EQ_STATE_ARMED != 0,
            },
        );
        Ok(0)
    }

    fn sw2hw_cq(&mut self, mailbox: u64, cqn: u32) -> FwResult {
        if self.cqs.contains_key(&cqn) {
            return Err(CommandStatus::BadResourceState);
        }
        let ctx: CqContext = self.read_phys(mailbox)?;
        if ctx.cqn.get() != cqn || !self.eqs.contains_key(&ctx.comp_eqn.get()) {
            return Err(CommandStatus::BadParam);
        }
        self.cqs.insert(
            cqn,
            SimCq {
                lkey: ctx.lkey.get(),
                nent: 1 << ctx.log_size(),
                comp_eqn: ctx.comp_eqn.get(),
                error_eqn: ctx.error_eqn.get(),
                state_db: ctx.state_db.get(),
                prod: 0,
                ci: 0,
                arm: None,
                overflowed: false,
            },
        );
        Ok(0)
    }

    fn modify_qp(&mut self, op: Opcode, mailbox: u64, in_mod: u32) -> FwResult {
        let qpn = in_mod & 0xff_ffff;
        let sqd_event = in_mod >> 31 != 0;
        let Some((from, to)) = transition_states(op) else {
            return Err(CommandStatus::BadOpcode);
        };
        let param: QpParam = self.read_phys(mailbox)?;
        let ctx = &param.context;
        if QpState::from_hw(ctx.state()) != Some(to) {
            return Err(CommandStatus::BadParam);
        }
        let cur = self.qps.get(&qpn).map_or(QpState::Reset, |qp| qp.state);
        if from.is_some_and(|from| from != cur) {
            debug!("{:?} on QP {:#x} in state {:?}", op, qpn, cur);
            return Err(CommandStatus::BadQpState);
        }

        let qp = self.qps.entry(qpn).or_insert_with(|| SimQp::new(qpn));
        qp.load(ctx);
        qp.state = to;
        trace!("QP {:#x} now {:?}", qpn, to);

        match op {
            Opcode::Rts2SqdQp if sqd_event => {
                // nothing is ever in flight, so the drain is immediate
                self.post_event(EventType::SqDrained, 0, &QpEventData::new(qpn));
            }
            Opcode::Sqd2RtsQp => self.process_sends(qpn),
            Opcode::Any2ErrQp => {
                self.flush_sends(qpn);
                self.flush_recvs(qpn);
            }
            _ => {}
        }
        Ok(0)
    }

    fn send_doorbell(&mut self, qpn: u32, head: u32) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            warn!("send doorbell for QP {:#x} which is not in hardware", qpn);
            return;
        };
        let n = head.wrapping_sub(qp.sq_posted) & 0xffff;
        qp.sq_posted = qp.sq_posted.wrapping_add(n);
        self.process_sends(qpn);
    }

    fn recv_doorbell(&mut self, qpn: u32, head: u32) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            warn!("receive doorbell for QP {:#x} which is not in hardware", qpn);
            return;
        };
        let n = head.wrapping_sub(qp.rq_posted) & 0xffff;
        qp.rq_posted = qp.rq_posted.wrapping_add(n);
        if qp.state == QpState::Error {
            self.flush_recvs(qpn);
        }
    }

    fn process_sends(&mut self, qpn: u32) {
        loop {
            let Some(qp) = self.qps.get_mut(&qpn) else {
                return;
            };
            if qp.sq_done == qp.sq_posted {
                return;
            }
            match qp.state {
                QpState::Rts => {}
                QpState::Error => return self.flush_sends(qpn),
                // held until the QP is back in RTS
                QpState::Sqd => return,
                state => {
                    warn!("send doorbell for QP {:#x} in {:?}", qpn, state);
                    return;
                }
            }
            let idx = qp.sq_done & (qp.sq_max - 1);
            qp.sq_done = qp.sq_done.wrapping_add(1);
            let qp = *qp;
            self.execute_send(&qp, qp.snd_base + (idx << WQE_SHIFT));
        }
    }

    fn fail_qp(&mut self, qpn: u32) {
        if let Some(qp) = self.qps.get_mut(&qpn) {
            qp.state = QpState::Error;
        }
        self.flush_recvs(qpn);
    }

    fn execute_send(&mut self, qp: &SimQp, wqe: u32) {
        let Some(ctrl) = self.ring_read::<WqeCtrl>(qp.wqe_lkey, wqe as usize) else {
            warn!("QP {:#x} send WQE at {:#x} unreadable", qp.qpn, wqe);
            return;
        };
        let op = ctrl.opcode();
        let flags = ctrl.flags.get();
        let first_data = if matches!(op, opcode::RDMA_WRITE | opcode::RDMA_WRITE_IMM | opcode::RDMA_READ) {
            2
        } else {
            1
        };
        let nseg = ctrl.size() / size_of::<WqeData>();
        let len: u32 = (first_data..nseg)
            .filter_map(|s| self.ring_read::<WqeData>(qp.wqe_lkey, wqe as usize + s * size_of::<WqeData>()))
            .map(|seg| seg.byte_count.get())
            .sum();

        if let Some(syndrome) = self.send_faults.remove(&qp.qpn) {
            self.complete_send_error(qp, wqe, syndrome);
            return;
        }

        let loopback = matches!(qp.service, SERVICE_RC | SERVICE_UC);
        let imm = matches!(op, opcode::SEND_IMM | opcode::RDMA_WRITE_IMM).then(|| ctrl.imm.get());
        let delivery = match op {
            opcode::SEND | opcode::SEND_IMM | opcode::RDMA_WRITE_IMM if loopback => {
                self.deliver(qp, len, imm, flags & WQE_FLAG_SOLICIT != 0, op == opcode::RDMA_WRITE_IMM)
            }
            _ => Delivery::Accepted,
        };
        match delivery {
            Delivery::NoReceiver if qp.service == SERVICE_RC => {
                return self.complete_send_error(qp, wqe, syndrome::RNR_RETRY_EXCEEDED);
            }
            Delivery::Rejected if qp.service == SERVICE_RC => {
                return self.complete_send_error(qp, wqe, syndrome::REMOTE_INVAL_REQ);
            }
            // UC drops silently
            _ => {}
        }

        if qp.sig_all || flags & WQE_FLAG_CQ_UPDATE != 0 {
            let mut cqe = Cqe::send(qp.qpn, wqe, op, len);
            if let Some(imm) = imm {
                cqe.imm_etype_pkey_eec = imm.into();
            }
            self.write_cqe(qp.cqn_snd, cqe.as_bytes(), false);
        }
    }

    fn complete_send_error(&mut self, qp: &SimQp, wqe: u32, syndrome: u8) {
        debug!("QP {:#x} send WQE {:#x} failed, syndrome {:#04x}", qp.qpn, wqe, syndrome);
        self.write_cqe(qp.cqn_snd, ErrCqe::new(qp.qpn, wqe, true, syndrome, 0).as_bytes(), false);
        self.fail_qp(qp.qpn);
    }

    /// Consumes one receive of the destination QP.
    fn deliver(&mut self, src: &SimQp, len: u32, imm: Option<u32>, solicited: bool, rdma: bool) -> Delivery {
        let Some(dst) = self.qps.get_mut(&src.remote_qpn) else {
            return Delivery::NoReceiver;
        };
        if !dst.receiving() || dst.rq_done == dst.rq_posted {
            return Delivery::NoReceiver;
        }
        let idx = dst.rq_done & (dst.rq_max - 1);
        dst.rq_done = dst.rq_done.wrapping_add(1);
        let dst = *dst;
        let wqe = idx << WQE_SHIFT;

        let capacity: u32 = match self.ring_read::<WqeCtrl>(dst.wqe_lkey, wqe as usize) {
            Some(ctrl) => (1..ctrl.size() / size_of::<WqeData>())
                .filter_map(|s| {
                    self.ring_read::<WqeData>(dst.wqe_lkey, wqe as usize + s * size_of::<WqeData>())
                })
                .map(|seg| seg.byte_count.get())
                .sum(),
            None => 0,
        };
        // an RDMA write only consumes the receive for its immediate
        if !rdma && len > capacity {
            let err = ErrCqe::new(dst.qpn, wqe, false, syndrome::LOCAL_LENGTH, 0);
            self.write_cqe(dst.cqn_rcv, err.as_bytes(), false);
            self.fail_qp(dst.qpn);
            return Delivery::Rejected;
        }

        let mut cqe = Cqe::recv(dst.qpn, wqe, len, src.qpn, imm);
        if rdma {
            cqe.opcode = opcode::IB_RDMA_WRITE_ONLY_WITH_IMM;
        }
        self.write_cqe(dst.cqn_rcv, cqe.as_bytes(), solicited);
        Delivery::Accepted
    }

    /// Reports every outstanding send WQE with one flush entry.
    fn flush_sends(&mut self, qpn: u32) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            return;
        };
        let n = qp.sq_posted.wrapping_sub(qp.sq_done);
        if n == 0 {
            return;
        }
        let wqe = qp.snd_base + ((qp.sq_done & (qp.sq_max - 1)) << WQE_SHIFT);
        qp.sq_done = qp.sq_posted;
        let cqn = qp.cqn_snd;
        let err = ErrCqe::new(qpn, wqe, true, syndrome::WR_FLUSH, (n - 1) as u16);
        self.write_cqe(cqn, err.as_bytes(), false);
    }

    fn flush_recvs(&mut self, qpn: u32) {
        let Some(qp) = self.qps.get_mut(&qpn) else {
            return;
        };
        let n = qp.rq_posted.wrapping_sub(qp.rq_done);
        if n == 0 {
            return;
        }
        let wqe = (qp.rq_done & (qp.rq_max - 1)) << WQE_SHIFT;
        qp.rq_done = qp.rq_posted;
        let cqn = qp.cqn_rcv;
        let err = ErrCqe::new(qpn, wqe, false, syndrome::WR_FLUSH, (n - 1) as u16);
        self.write_cqe(cqn, err.as_bytes(), false);
    }
}

/// One interrupt vector per EQ, each delivered by its own thread, so a
/// handler blocked on one EQ never holds up another.
struct IrqLines {
    handler: IrqHandler,
    lines: HashMap<u32, Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl IrqLines {
    fn new(handler: IrqHandler) -> Self {
        IrqLines {
            handler,
            lines: HashMap::new(),
            threads: Vec::new(),
        }
    }

    fn raise(&mut self, eqn: u32) {
        if !self.lines.contains_key(&eqn) {
            let (tx, rx) = mpsc::channel::<()>();
            let handler = Arc::clone(&self.handler);
            let spawned = thread::Builder::new()
                .name(format!("sim-irq-{}", eqn))
                .spawn(move || {
                    while rx.recv().is_ok() {
                        handler(eqn);
                    }
                });
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    warn!("no interrupt thread for EQ {}: {}", eqn, e);
                    return;
                }
            }
            self.lines.insert(eqn, tx);
        }
        if let Some(line) = self.lines.get(&eqn) {
            let _ = line.send(());
        }
    }
}

#[derive(Default)]
struct Faults {
    stall: bool,
    stalled: Option<HcrBlock>,
    /// Opcode, how many of its executions still succeed, status.
    fail: Vec<(Opcode, u32, CommandStatus)>,
    drop_command_events: bool,
    refuse_irq: bool,
}

struct HcrRegs {
    status: u32,
    out_param: u64,
}

/// The simulated adapter.
pub struct SimHca {
    dma: Arc<SimDma>,
    fw: Mutex<Firmware>,
    hcr: Mutex<HcrRegs>,
    faults: Mutex<Faults>,
    commands: Mutex<VecDeque<CommandRecord>>,
    doorbells: Mutex<VecDeque<Doorbell>>,
}

impl SimHca {
    /// A device with the limits of `config` and its own DMA memory.
    pub fn new(config: &HcaConfig) -> Self {
        let dma = Arc::new(SimDma::new());
        SimHca {
            fw: Mutex::new(Firmware::new(config, Arc::clone(&dma))),
            dma,
            hcr: Mutex::new(HcrRegs {
                status: 0,
                out_param: 0,
            }),
            faults: Mutex::new(Faults::default()),
            commands: Mutex::new(VecDeque::new()),
            doorbells: Mutex::new(VecDeque::new()),
        }
    }

    pub fn dma(&self) -> Arc<SimDma> {
        Arc::clone(&self.dma)
    }

    fn run(&self, block: &HcrBlock) {
        let Some(opcode) = Opcode::from_u16(block.opcode()) else {
            warn!("unknown opcode {:#x}", block.opcode());
            self.finish(block, CommandStatus::BadOpcode, 0);
            return;
        };

        let injected = {
            let mut faults = self.faults.lock();
            match faults.fail.iter().position(|(op, _, _)| *op == opcode) {
                Some(i) if faults.fail[i].1 == 0 => Some(faults.fail.remove(i).2),
                Some(i) => {
                    faults.fail[i].1 -= 1;
                    None
                }
                None => None,
            }
        };
        let res = match injected {
            Some(status) => Err(status),
            None => self.fw.lock().execute(opcode, block),
        };
        let (status, out) = match res {
            Ok(out) => (CommandStatus::Ok, out),
            Err(status) => (status, 0),
        };
        trace!("{:?} completed with {:?}", opcode, status);
        self.finish(block, status, out);
    }

    fn finish(&self, block: &HcrBlock, status: CommandStatus, out: u64) {
        {
            let mut hcr = self.hcr.lock();
            hcr.out_param = out;
            hcr.status = HcrStatus {
                go: false,
                toggle: block.toggle(),
                status: status.to_u8(),
            }
            .to_word();
        }
        if block.event() && !self.faults.lock().drop_command_events {
            let ev = CmdEvent::new(block.token(), status.to_u8(), out);
            self.fw.lock().post_event(EventType::Command, 0, &ev);
        }
    }

    /// Leaves every following command pending with the go bit set.
    pub fn stall_commands(&self) {
        self.faults.lock().stall = true;
    }

    /// Completes the command held by `stall_commands`, if any, and resumes
    /// normal execution.
    pub fn release_commands(&self) {
        let stalled = {
            let mut faults = self.faults.lock();
            faults.stall = false;
            faults.stalled.take()
        };
        if let Some(block) = stalled {
            self.run(&block);
        }
    }

    /// The next `opcode` fails with `status` and has no effect.
    pub fn fail_next_command(&self, opcode: Opcode, status: CommandStatus) {
        self.fail_command_after(opcode, 0, status);
    }

    /// Lets `skip` more executions of `opcode` through, then fails the one
    /// after with `status`.
    pub fn fail_command_after(&self, opcode: Opcode, skip: u32, status: CommandStatus) {
        self.faults.lock().fail.push((opcode, skip, status));
    }

    /// Commands still complete, but no completion event is generated.
    pub fn drop_command_events(&self, drop: bool) {
        self.faults.lock().drop_command_events = drop;
    }

    /// Makes `request_irq` fail.
    pub fn refuse_irq(&self) {
        self.faults.lock().refuse_irq = true;
    }

    /// Interrupts are recorded but not delivered until `release_interrupts`.
    pub fn hold_interrupts(&self) {
        self.fw.lock().hold_irqs = true;
    }

    pub fn release_interrupts(&self) {
        let mut fw = self.fw.lock();
        fw.hold_irqs = false;
        for eqn in std::mem::take(&mut fw.held_irqs) {
            fw.fire(eqn);
        }
    }

    /// The next send WQE executed on `qpn` completes with `syndrome` and
    /// moves the QP to the error state.
    pub fn fail_next_send(&self, qpn: u32, syndrome: u8) {
        self.fw.lock().send_faults.insert(qpn, syndrome);
    }

    /// Overrides the multicast hash so tests can force collisions.
    pub fn force_mgid_hash(&self, hash: Option<u16>) {
        self.fw.lock().forced_hash = hash;
    }

    /// Writes a raw 32-byte completion entry to `cqn` as the device would.
    pub fn push_cqe<T: IntoBytes + Immutable>(&self, cqn: u32, cqe: &T) {
        let bytes = cqe.as_bytes();
        if bytes.len() != CQE_SIZE {
            warn!("ignoring {}-byte completion entry", bytes.len());
            return;
        }
        self.fw.lock().write_cqe(cqn, bytes, false);
    }

    /// Posts an event to whichever EQ its type is mapped to.
    pub fn post_event<T: IntoBytes + Immutable>(&self, event_type: EventType, subtype: u8, payload: &T) {
        self.fw.lock().post_event(event_type, subtype, payload);
    }

    /// Raises the interrupt of `eqn` without writing anything to its ring.
    pub fn spurious_interrupt(&self, eqn: u32) {
        self.fw.lock().fire(eqn);
    }

    /// Posts a raw entry to `eqn`.
    pub fn post_eqe(&self, eqn: u32, eqe: &Eqe) {
        self.fw.lock().post_eqe(eqn, eqe);
    }

    /// The EQ `event_type` is currently mapped to.
    pub fn event_eqn(&self, event_type: EventType) -> Option<u32> {
        self.fw.lock().event_map[event_type as usize]
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.commands.lock().iter().copied().collect()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().clear();
    }

    pub fn take_doorbells(&self) -> Vec<Doorbell> {
        self.doorbells.lock().drain(..).collect()
    }

    pub fn qp_state(&self, qpn: u32) -> Option<QpState> {
        self.fw.lock().qps.get(&qpn).map(|qp| qp.state)
    }

    pub fn port_active(&self, port: u8) -> bool {
        let fw = self.fw.lock();
        port >= 1 && fw.ports_up.get(usize::from(port) - 1).copied().unwrap_or(false)
    }

    /// Base QPN configured for SMI (0) or GSI (1).
    pub fn special_qp_base(&self, kind: usize) -> Option<u32> {
        self.fw.lock().special_qp.get(kind).copied()
    }

    pub fn mgm(&self, index: u32) -> Option<MgmEntry> {
        self.fw.lock().mgm.get(index as usize).cloned()
    }

    pub fn cq_armed(&self, cqn: u32) -> bool {
        self.fw
            .lock()
            .cqs
            .get(&cqn)
            .is_some_and(|cq| cq.arm.is_some())
    }

    pub fn cq_overflowed(&self, cqn: u32) -> bool {
        self.fw.lock().cqs.get(&cqn).is_some_and(|cq| cq.overflowed)
    }

    pub fn eq_overflows(&self) -> u32 {
        self.fw.lock().eq_overflows
    }

    /// MPTs, EQs and CQs currently owned by the device.
    pub fn hw_objects(&self) -> (usize, usize, usize) {
        let fw = self.fw.lock();
        (fw.mpts.len(), fw.eqs.len(), fw.cqs.len())
    }

    fn log<T>(log: &Mutex<VecDeque<T>>, record: T) {
        let mut log = log.lock();
        if log.len() == LOG_DEPTH {
            log.pop_front();
        }
        log.push_back(record);
    }
}

impl Hardware for SimHca {
    fn write_hcr(&self, hcr: &HcrBlock) {
        if let Some(opcode) = Opcode::from_u16(hcr.opcode()) {
            Self::log(
                &self.commands,
                CommandRecord {
                    opcode,
                    in_modifier: hcr.in_modifier.get(),
                    op_modifier: hcr.op_modifier(),
                    event: hcr.event(),
                },
            );
        }
        if !hcr.go() {
            return;
        }
        {
            let mut faults = self.faults.lock();
            if faults.stall {
                if faults.stalled.is_none() {
                    faults.stalled = Some(*hcr);
                    let mut regs = self.hcr.lock();
                    regs.status |= 1 << crate::hw::HCR_GO_BIT;
                }
                return;
            }
        }
        self.run(hcr);
    }

    fn read_hcr_status(&self) -> u32 {
        self.hcr.lock().status
    }

    fn read_hcr_out_param(&self) -> u64 {
        self.hcr.lock().out_param
    }

    fn ring(&self, doorbell: Doorbell) {
        Self::log(&self.doorbells, doorbell);
        let mut fw = self.fw.lock();
        match doorbell {
            Doorbell::CqSetCi { cqn, ci } => match fw.cqs.get_mut(&cqn) {
                Some(cq) => cq.ci = ci,
                None => warn!("consumer index for CQ {:#x} which is not in hardware", cqn),
            },
            Doorbell::CqArm {
                cqn, ci, solicited, ..
            } => fw.cq_arm(cqn, ci, solicited),
            Doorbell::CqDisarm { .. } => {}
            Doorbell::EqSetCi { eqn, ci } => {
                if let Some(eq) = fw.eqs.get_mut(&eqn) {
                    eq.ci = ci;
                }
            }
            Doorbell::EqReqNot { eqn } => fw.eq_req_not(eqn),
            Doorbell::SendQueue { qpn, head } => fw.send_doorbell(qpn, head),
            Doorbell::RecvQueue { qpn, head } => fw.recv_doorbell(qpn, head),
        }
    }

    fn request_irq(&self, handler: IrqHandler) -> io::Result<()> {
        if self.faults.lock().refuse_irq {
            return Err(io::Error::new(io::ErrorKind::Other, "no interrupt vector available"));
        }
        let mut fw = self.fw.lock();
        if fw.irq.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "interrupt already requested"));
        }
        fw.irq = Some(IrqLines::new(handler));
        Ok(())
    }

    fn free_irq(&self) {
        let Some(irq) = self.fw.lock().irq.take() else {
            return;
        };
        // each thread exits once its line is gone and its queue drained
        drop(irq.lines);
        let me = thread::current().id();
        for handle in irq.threads {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("interrupt thread panicked");
            }
        }
    }
}
