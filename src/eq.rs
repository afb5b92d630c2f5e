//! Event queues.
//!
//! Three kinds are created at attach: one for asynchronous events, one for
//! command completions and `num_comp_eqs` for CQ completion notifications.
//! The device raises an interrupt per EQ; `interrupt` drains the ring and
//! dispatches every entry to the CQ, QP, command or device handlers.
use std::cell::Cell;
use std::mem::size_of;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::alloc::Allocator;
use crate::config::HcaConfig;
use crate::cq::{self, CqEvent};
use crate::device::{DeviceEvent, HcaDev};
use crate::error::{Error, Result};
use crate::fw::{EqContext, Mailbox};
use crate::hw::{Doorbell, OwnedDma};
use crate::mr::MemoryRegion;
use crate::qp::{self, QpEvent};

pub const EQE_SIZE: usize = 32;
/// Set in `Eqe::owner` while the slot belongs to the device.
pub const EQE_OWNER_HW: u8 = 0x80;

const NUM_ASYNC_EQE: u32 = 0x80;
/// Slack kept in every ring; also how often a long burst publishes the
/// consumer index.
const NUM_SPARE_EQE: u32 = 0x80;

/// Subtype of a port change event that reports the port as active.
pub const PORT_CHANGE_ACTIVE: u8 = 0x04;

thread_local! {
    /// Set while the current thread is inside `service`.
    static IN_SERVICE: Cell<bool> = const { Cell::new(false) };
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Completion = 0x00,

    // QP affiliated events
    PathMigrated = 0x01,
    CommEstablished = 0x02,
    SqDrained = 0x03,
    SrqLastWqe = 0x13,
    SrqLimit = 0x14,

    // QP affiliated errors
    CqError = 0x04,
    WqCatastrophic = 0x05,
    EecCatastrophic = 0x06,
    PathMigrationFailed = 0x07,
    WqInvalidRequest = 0x10,
    WqAccessViolation = 0x11,
    SrqCatastrophic = 0x12,

    // unaffiliated
    LocalCatastrophic = 0x08,
    PortChange = 0x09,
    EccDetect = 0x0e,
    EqOverflow = 0x0f,

    Command = 0x0a,
}

impl EventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use EventType::*;
        Some(match v {
            0x00 => Completion,
            0x01 => PathMigrated,
            0x02 => CommEstablished,
            0x03 => SqDrained,
            0x04 => CqError,
            0x05 => WqCatastrophic,
            0x06 => EecCatastrophic,
            0x07 => PathMigrationFailed,
            0x08 => LocalCatastrophic,
            0x09 => PortChange,
            0x0a => Command,
            0x0e => EccDetect,
            0x0f => EqOverflow,
            0x10 => WqInvalidRequest,
            0x11 => WqAccessViolation,
            0x12 => SrqCatastrophic,
            0x13 => SrqLastWqe,
            0x14 => SrqLimit,
            _ => return None,
        })
    }
}

bitflags! {
    /// Event types routed to an EQ by MAP_EQ.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AsyncEventMask: u64 {
        const PATH_MIGRATED = 1 << EventType::PathMigrated as u64;
        const COMM_ESTABLISHED = 1 << EventType::CommEstablished as u64;
        const SQ_DRAINED = 1 << EventType::SqDrained as u64;
        const SRQ_LAST_WQE = 1 << EventType::SrqLastWqe as u64;
        const SRQ_LIMIT = 1 << EventType::SrqLimit as u64;

        const CQ_ERROR = 1 << EventType::CqError as u64;
        const WQ_CATASTROPHIC = 1 << EventType::WqCatastrophic as u64;
        const EEC_CATASTROPHIC = 1 << EventType::EecCatastrophic as u64;
        const PATH_MIGRATION_FAILED = 1 << EventType::PathMigrationFailed as u64;
        const WQ_INVALID_REQUEST = 1 << EventType::WqInvalidRequest as u64;
        const WQ_ACCESS_VIOLATION = 1 << EventType::WqAccessViolation as u64;
        const SRQ_CATASTROPHIC = 1 << EventType::SrqCatastrophic as u64;

        const LOCAL_CATASTROPHIC = 1 << EventType::LocalCatastrophic as u64;
        const PORT_CHANGE = 1 << EventType::PortChange as u64;
        const ECC_DETECT = 1 << EventType::EccDetect as u64;
        const EQ_OVERFLOW = 1 << EventType::EqOverflow as u64;

        const COMMAND = 1 << EventType::Command as u64;
    }
}

impl AsyncEventMask {
    /// Everything except completions and command completions.
    pub fn async_events() -> Self {
        Self::all() - Self::COMMAND
    }
}

/// One event queue entry.
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Eqe {
    _reserved1: u8,
    pub event_type: u8,
    _reserved2: u8,
    pub subtype: u8,
    pub event: [u8; 24],
    _reserved3: [u8; 3],
    pub owner: u8,
}

static_assertions::const_assert_eq!(size_of::<Eqe>(), EQE_SIZE);

impl Eqe {
    /// A software-owned entry carrying `payload`.
    pub fn new<T: IntoBytes + Immutable>(event_type: EventType, subtype: u8, payload: &T) -> Self {
        let mut eqe = Eqe::new_zeroed();
        eqe.event_type = event_type as u8;
        eqe.subtype = subtype;
        let bytes = payload.as_bytes();
        let n = bytes.len().min(eqe.event.len());
        eqe.event[..n].copy_from_slice(&bytes[..n]);
        eqe
    }

    pub fn payload<T: FromBytes + IntoBytes>(&self) -> T {
        let mut obj = T::new_zeroed();
        let n = size_of::<T>().min(self.event.len());
        obj.as_mut_bytes()[..n].copy_from_slice(&self.event[..n]);
        obj
    }
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CompEvent {
    pub cqn: U32,
}

impl CompEvent {
    pub fn new(cqn: u32) -> Self {
        CompEvent { cqn: cqn.into() }
    }
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CmdEvent {
    pub token: U16,
    _reserved1: U16,
    _reserved2: [u8; 3],
    pub status: u8,
    pub out_param: U64,
}

impl CmdEvent {
    pub fn new(token: u16, status: u8, out_param: u64) -> Self {
        let mut ev = CmdEvent::new_zeroed();
        ev.token = token.into();
        ev.status = status;
        ev.out_param = out_param.into();
        ev
    }
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct QpEventData {
    pub qpn: U32,
}

impl QpEventData {
    pub fn new(qpn: u32) -> Self {
        QpEventData { qpn: qpn.into() }
    }
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CqErrEvent {
    pub cqn: U32,
    _reserved1: U32,
    _reserved2: [u8; 3],
    pub syndrome: u8,
}

impl CqErrEvent {
    pub fn new(cqn: u32, syndrome: u8) -> Self {
        let mut ev = CqErrEvent::new_zeroed();
        ev.cqn = cqn.into();
        ev.syndrome = syndrome;
        ev
    }
}

#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortChangeEvent {
    _reserved: [U32; 3],
    /// Port number in the top four bits.
    pub port: U32,
}

impl PortChangeEvent {
    pub fn new(port: u8) -> Self {
        let mut ev = PortChangeEvent::new_zeroed();
        ev.port = (u32::from(port) << 28).into();
        ev
    }
}

pub(crate) struct EventQueue {
    eqn: u32,
    nent: u32,
    buf: OwnedDma,
    mr: Mutex<Option<MemoryRegion>>,
    /// Event types currently mapped here.
    mapped: Mutex<AsyncEventMask>,
    cons_index: Mutex<u32>,
    servicing: Mutex<bool>,
    idle: Condvar,
}

impl EventQueue {
    fn create(dev: &HcaDev, eqn: u32, nent: u32, intr: u8) -> Result<Self> {
        let buf = OwnedDma::alloc(&dev.dma, nent as usize * EQE_SIZE)?;
        for i in 0..nent as usize {
            buf.write_at(i * EQE_SIZE + EQE_SIZE - 1, &[EQE_OWNER_HW]);
        }
        let mr = MemoryRegion::register(dev, &buf)?;

        let res = Mailbox::new(&dev.dma).and_then(|mailbox| {
            mailbox.write(0, &EqContext::new(nent.trailing_zeros(), intr, mr.lkey()));
            dev.cmd.sw2hw_eq(&mailbox, eqn)
        });
        if let Err(e) = res {
            mr.free(dev);
            return Err(e);
        }

        debug!("created EQ {} with {} entries", eqn, nent);
        Ok(EventQueue {
            eqn,
            nent,
            buf,
            mr: Mutex::new(Some(mr)),
            mapped: Mutex::new(AsyncEventMask::empty()),
            cons_index: Mutex::new(0),
            servicing: Mutex::new(false),
            idle: Condvar::new(),
        })
    }

    pub(crate) fn eqn(&self) -> u32 {
        self.eqn
    }

    fn offset(&self, ci: u32) -> usize {
        (ci & (self.nent - 1)) as usize * EQE_SIZE
    }

    fn next_eqe_sw(&self, ci: u32) -> Option<Eqe> {
        let eqe: Eqe = self.buf.read_obj(self.offset(ci));
        if eqe.owner & EQE_OWNER_HW != 0 {
            None
        } else {
            Some(eqe)
        }
    }

    fn set_eqe_hw(&self, ci: u32) {
        self.buf.write_at(self.offset(ci) + EQE_SIZE - 1, &[EQE_OWNER_HW]);
    }

    fn set_ci(&self, dev: &HcaDev, ci: u32) {
        // entries must be handed back before the device sees the new index
        fence(Ordering::SeqCst);
        dev.hw.ring(Doorbell::EqSetCi {
            eqn: self.eqn,
            ci: ci & (self.nent - 1),
        });
    }

    fn enter(&self) -> Servicing<'_> {
        let mut servicing = self.servicing.lock();
        while *servicing {
            self.idle.wait(&mut servicing);
        }
        *servicing = true;
        IN_SERVICE.with(|flag| flag.set(true));
        Servicing { eq: self }
    }

    fn map(&self, dev: &HcaDev, mask: AsyncEventMask) -> Result<()> {
        dev.cmd.map_eq(mask.bits(), false, self.eqn)?;
        *self.mapped.lock() = mask;
        Ok(())
    }
}

/// Marks one `service` call in progress.
struct Servicing<'a> {
    eq: &'a EventQueue,
}

impl Drop for Servicing<'_> {
    fn drop(&mut self) {
        IN_SERVICE.with(|flag| flag.set(false));
        *self.eq.servicing.lock() = false;
        self.eq.idle.notify_all();
    }
}

pub(crate) struct EqTable {
    alloc: Allocator,
    num_comp_eqs: u32,
    /// async, command, then the completion EQs in vector order
    eqs: RwLock<Vec<Arc<EventQueue>>>,
}

const ASYNC_SLOT: usize = 0;
const CMD_SLOT: usize = 1;
const COMP_SLOT: usize = 2;

impl EqTable {
    pub(crate) fn new(config: &HcaConfig) -> Result<Self> {
        Ok(EqTable {
            alloc: Allocator::new(config.num_eqs, config.num_eqs - 1, config.reserved_eqs)?,
            num_comp_eqs: config.num_comp_eqs,
            eqs: RwLock::new(Vec::new()),
        })
    }

    fn slot(&self, slot: usize) -> Result<u32> {
        self.eqs
            .read()
            .get(slot)
            .map(|eq| eq.eqn)
            .ok_or(Error::InvalidState)
    }

    pub(crate) fn async_eqn(&self) -> Result<u32> {
        self.slot(ASYNC_SLOT)
    }

    pub(crate) fn cmd_eqn(&self) -> Result<u32> {
        self.slot(CMD_SLOT)
    }

    pub(crate) fn comp_eqn(&self, vector: u32) -> Result<u32> {
        if vector >= self.num_comp_eqs {
            return Err(Error::InvalidAttribute("completion vector out of range"));
        }
        self.slot(COMP_SLOT + vector as usize)
    }

    fn get(&self, eqn: u32) -> Option<Arc<EventQueue>> {
        self.eqs.read().iter().find(|eq| eq.eqn == eqn).cloned()
    }
}

fn create_eq(dev: &HcaDev, nent: u32, intr: u8) -> Result<Arc<EventQueue>> {
    let nent = nent.next_power_of_two();
    let eqn = dev.eq_table.alloc.alloc()?;
    match EventQueue::create(dev, eqn, nent, intr) {
        Ok(eq) => Ok(Arc::new(eq)),
        Err(e) => {
            dev.eq_table.alloc.free(eqn);
            Err(e)
        }
    }
}

/// Creates every EQ, hooks up the interrupt and maps async and command
/// events. Whatever was set up before a failure is torn down with the
/// device.
pub(crate) fn init_eq_table(dev: &Arc<HcaDev>) -> Result<()> {
    let config = &dev.config;
    let mut sizes = vec![NUM_ASYNC_EQE + NUM_SPARE_EQE, config.max_cmds + NUM_SPARE_EQE];
    sizes.extend((0..config.num_comp_eqs).map(|_| config.num_cqs + NUM_SPARE_EQE));

    for (intr, nent) in sizes.into_iter().enumerate() {
        let eq = create_eq(dev, nent, intr as u8)?;
        dev.eq_table.eqs.write().push(eq);
    }

    let weak: Weak<HcaDev> = Arc::downgrade(dev);
    dev.hw.request_irq(Arc::new(move |eqn| {
        if let Some(dev) = weak.upgrade() {
            interrupt(&dev, eqn);
        }
    }))?;

    let eqs = dev.eq_table.eqs.read().clone();
    eqs[ASYNC_SLOT].map(dev, AsyncEventMask::async_events())?;
    eqs[CMD_SLOT].map(dev, AsyncEventMask::COMMAND)?;

    for eq in &eqs {
        dev.hw.ring(Doorbell::EqReqNot { eqn: eq.eqn });
    }
    Ok(())
}

/// Releases the interrupt, unmaps and destroys every EQ. Commands must
/// already be polled.
pub(crate) fn cleanup_eq_table(dev: &HcaDev) {
    dev.hw.free_irq();
    let eqs = std::mem::take(&mut *dev.eq_table.eqs.write());

    for eq in &eqs {
        let mask = *eq.mapped.lock();
        if !mask.is_empty() {
            if let Err(e) = dev.cmd.map_eq(mask.bits(), true, eq.eqn) {
                warn!("failed to unmap events from EQ {}: {}", eq.eqn, e);
            }
            *eq.mapped.lock() = AsyncEventMask::empty();
        }
    }

    for eq in eqs {
        let res = Mailbox::new(&dev.dma).and_then(|mailbox| dev.cmd.hw2sw_eq(&mailbox, eq.eqn));
        if let Err(e) = res {
            warn!("HW2SW_EQ for EQ {} failed: {}", eq.eqn, e);
        }
        if let Some(mr) = eq.mr.lock().take() {
            mr.free(dev);
        }
        dev.eq_table.alloc.free(eq.eqn);
    }
}

/// Interrupt entry point for `eqn`.
pub(crate) fn interrupt(dev: &HcaDev, eqn: u32) {
    match dev.eq_table.get(eqn) {
        Some(eq) => {
            service(dev, &eq);
        }
        None => debug!("interrupt for unknown EQ {}", eqn),
    }
}

/// Drains `eq` and re-arms it. Returns the number of entries consumed.
///
/// No lock is held while an entry is dispatched, so handlers may post
/// commands and destroy objects.
pub(crate) fn service(dev: &HcaDev, eq: &EventQueue) -> u32 {
    let _servicing = eq.enter();
    let mut set_ci = 0;
    let mut found = 0;

    loop {
        let eqe = {
            let mut ci = eq.cons_index.lock();
            let Some(eqe) = eq.next_eqe_sw(*ci) else {
                break;
            };
            // read the entry only after checking ownership
            fence(Ordering::Acquire);
            eq.set_eqe_hw(*ci);
            *ci = ci.wrapping_add(1);
            set_ci += 1;

            // a completed command may immediately post another one, so the
            // device has to see this slot freed first
            if eqe.event_type == EventType::Command as u8 || set_ci >= NUM_SPARE_EQE {
                eq.set_ci(dev, *ci);
                set_ci = 0;
            }
            eqe
        };
        found += 1;
        dispatch(dev, eq.eqn, &eqe);
    }

    let ci = *eq.cons_index.lock();
    eq.set_ci(dev, ci);
    dev.hw.ring(Doorbell::EqReqNot { eqn: eq.eqn });
    trace!("EQ {} serviced {} entries", eq.eqn, found);
    found
}

fn qp_event(dev: &HcaDev, eqe: &Eqe, event: QpEvent) {
    let qpn = eqe.payload::<QpEventData>().qpn.get() & 0xff_ffff;
    qp::event(dev, qpn, event);
}

fn dispatch(dev: &HcaDev, eqn: u32, eqe: &Eqe) {
    let Some(event_type) = EventType::from_u8(eqe.event_type) else {
        warn!(
            "unhandled event {:#04x}/{:#04x} on EQ {}",
            eqe.event_type, eqe.subtype, eqn
        );
        return;
    };

    match event_type {
        EventType::Completion => {
            let cqn = eqe.payload::<CompEvent>().cqn.get() & 0xff_ffff;
            dev.hw.ring(Doorbell::CqDisarm { eqn, cqn });
            cq::completion(dev, cqn);
        }
        EventType::Command => {
            let ev: CmdEvent = eqe.payload();
            dev.cmd
                .deliver_event(ev.token.get(), ev.status, ev.out_param.get());
        }
        EventType::PathMigrated => qp_event(dev, eqe, QpEvent::PathMigrated),
        EventType::CommEstablished => qp_event(dev, eqe, QpEvent::CommEstablished),
        EventType::SqDrained => qp_event(dev, eqe, QpEvent::SqDrained),
        EventType::WqCatastrophic => qp_event(dev, eqe, QpEvent::Fatal),
        EventType::PathMigrationFailed => qp_event(dev, eqe, QpEvent::PathMigrationFailed),
        EventType::WqInvalidRequest => qp_event(dev, eqe, QpEvent::InvalidRequest),
        EventType::WqAccessViolation => qp_event(dev, eqe, QpEvent::AccessError),
        EventType::CqError => {
            let ev: CqErrEvent = eqe.payload();
            let cqn = ev.cqn.get() & 0xff_ffff;
            warn!("CQ {} error, syndrome {:#04x}", cqn, ev.syndrome);
            cq::async_event(dev, cqn, CqEvent::Error { syndrome: ev.syndrome });
        }
        EventType::PortChange => {
            let port = (eqe.payload::<PortChangeEvent>().port.get() >> 28) as u8;
            let event = if eqe.subtype == PORT_CHANGE_ACTIVE {
                DeviceEvent::PortActive(port)
            } else {
                DeviceEvent::PortError(port)
            };
            debug!("port {} changed: {:?}", port, event);
            dev.device_event(event);
        }
        EventType::LocalCatastrophic => {
            error!("local catastrophic error reported on EQ {}", eqn);
            dev.cmd.abort();
            dev.device_event(DeviceEvent::CatastrophicError);
        }
        EventType::EqOverflow => warn!("EQ overrun on EQ {}", eqn),
        EventType::EccDetect => warn!("ECC error detected, subtype {:#04x}", eqe.subtype),
        EventType::EecCatastrophic
        | EventType::SrqCatastrophic
        | EventType::SrqLastWqe
        | EventType::SrqLimit => {
            warn!("ignoring {:?} event on EQ {}", event_type, eqn);
        }
    }
}

/// Waits for every in-progress `service` call to return. After a handler
/// has been unhooked from its table, no invocation of it is running once
/// this returns.
///
/// Called from inside a handler this returns at once: waiting there could
/// close a cycle with another EQ, and the object counts taken by dispatch
/// already cover handlers still running.
pub(crate) fn synchronize(dev: &HcaDev) {
    if IN_SERVICE.with(Cell::get) {
        return;
    }
    let eqs = dev.eq_table.eqs.read().clone();
    for eq in eqs {
        let mut servicing = eq.servicing.lock();
        while *servicing {
            eq.idle.wait(&mut servicing);
        }
    }
}
