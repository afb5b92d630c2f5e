//! Firmware command interface.
//!
//! Every command goes through the single HCR register block. Completion is
//! either polled from the go bit, or delivered as a command-completion event
//! on the command EQ and matched back to the issuer by token.
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::HcaConfig;
use crate::error::{Error, Result};
use crate::hw::{Hardware, HcrBlock, HcrStatus};

/// Token used by polled commands; never matched against a context.
const POLL_TOKEN: u16 = 0xffff;
/// How often a blocked poster re-checks for an abort.
const ABORT_CHECK: Duration = Duration::from_millis(10);

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // port commands
    InitIb = 0x09,
    CloseIb = 0x0a,

    // TPT commands
    Sw2HwMpt = 0x0d,
    QueryMpt = 0x0e,
    Hw2SwMpt = 0x0f,
    ReadMtt = 0x10,
    WriteMtt = 0x11,

    // EQ commands
    MapEq = 0x12,
    Sw2HwEq = 0x13,
    Hw2SwEq = 0x14,
    QueryEq = 0x15,

    // CQ commands
    Sw2HwCq = 0x16,
    Hw2SwCq = 0x17,
    QueryCq = 0x18,

    // QP commands
    Rst2InitQp = 0x19,
    Init2RtrQp = 0x1a,
    Rtr2RtsQp = 0x1b,
    Rts2RtsQp = 0x1c,
    Sqerr2RtsQp = 0x1d,
    Any2ErrQp = 0x1e,
    Rts2SqdQp = 0x1f,
    Sqd2RtsQp = 0x20,
    Any2RstQp = 0x21,
    QueryQp = 0x22,
    ConfSpecialQp = 0x23,
    Init2InitQp = 0x2d,
    Sqd2SqdQp = 0x38,

    // multicast commands
    ReadMgm = 0x25,
    WriteMgm = 0x26,
    MgidHash = 0x27,

    // miscellaneous
    Nop = 0x31,
}

/// Timeout budget a command is allowed. The actual durations are device
/// tuning and come from `HcaConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeClass {
    A,
    B,
    C,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            0x09 => InitIb,
            0x0a => CloseIb,
            0x0d => Sw2HwMpt,
            0x0e => QueryMpt,
            0x0f => Hw2SwMpt,
            0x10 => ReadMtt,
            0x11 => WriteMtt,
            0x12 => MapEq,
            0x13 => Sw2HwEq,
            0x14 => Hw2SwEq,
            0x15 => QueryEq,
            0x16 => Sw2HwCq,
            0x17 => Hw2SwCq,
            0x18 => QueryCq,
            0x19 => Rst2InitQp,
            0x1a => Init2RtrQp,
            0x1b => Rtr2RtsQp,
            0x1c => Rts2RtsQp,
            0x1d => Sqerr2RtsQp,
            0x1e => Any2ErrQp,
            0x1f => Rts2SqdQp,
            0x20 => Sqd2RtsQp,
            0x21 => Any2RstQp,
            0x22 => QueryQp,
            0x23 => ConfSpecialQp,
            0x2d => Init2InitQp,
            0x38 => Sqd2SqdQp,
            0x25 => ReadMgm,
            0x26 => WriteMgm,
            0x27 => MgidHash,
            0x31 => Nop,
            _ => return None,
        })
    }

    pub fn time_class(self) -> TimeClass {
        use Opcode::*;
        match self {
            Sw2HwMpt | Hw2SwMpt | WriteMtt | ReadMtt | MapEq | ConfSpecialQp => TimeClass::B,
            Rst2InitQp | Init2RtrQp | Rtr2RtsQp | Rts2RtsQp | Sqerr2RtsQp | Any2ErrQp
            | Rts2SqdQp | Sqd2RtsQp | Any2RstQp | Init2InitQp | Sqd2SqdQp => TimeClass::C,
            _ => TimeClass::A,
        }
    }
}

/// Completion status reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    InternalError,
    BadOpcode,
    BadParam,
    BadSystemState,
    BadResource,
    ResourceBusy,
    DdrMemoryError,
    ExceedLimit,
    BadResourceState,
    BadIndex,
    BadNvmem,
    BadQpState,
    BadSegmentParam,
    RegionBound,
    LamNotPresent,
    BadPacket,
    BadSize,
    Unknown(u8),
}

impl CommandStatus {
    pub fn from_u8(v: u8) -> Self {
        use CommandStatus::*;
        match v {
            0x00 => Ok,
            0x01 => InternalError,
            0x02 => BadOpcode,
            0x03 => BadParam,
            0x04 => BadSystemState,
            0x05 => BadResource,
            0x06 => ResourceBusy,
            0x07 => DdrMemoryError,
            0x08 => ExceedLimit,
            0x09 => BadResourceState,
            0x0a => BadIndex,
            0x0b => BadNvmem,
            0x10 => BadQpState,
            0x20 => BadSegmentParam,
            0x21 => RegionBound,
            0x22 => LamNotPresent,
            0x30 => BadPacket,
            0x40 => BadSize,
            other => Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        use CommandStatus::*;
        match self {
            Ok => 0x00,
            InternalError => 0x01,
            BadOpcode => 0x02,
            BadParam => 0x03,
            BadSystemState => 0x04,
            BadResource => 0x05,
            ResourceBusy => 0x06,
            DdrMemoryError => 0x07,
            ExceedLimit => 0x08,
            BadResourceState => 0x09,
            BadIndex => 0x0a,
            BadNvmem => 0x0b,
            BadQpState => 0x10,
            BadSegmentParam => 0x20,
            RegionBound => 0x21,
            LamNotPresent => 0x22,
            BadPacket => 0x30,
            BadSize => 0x40,
            Unknown(v) => v,
        }
    }
}

/// Counting semaphore; `max_cmds` slots for event-driven commands.
struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
        Permit { sem: self }
    }
}

struct Permit<'a> {
    sem: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.sem.count.lock() += 1;
        self.sem.cv.notify_one();
    }
}

struct CmdContext {
    token: u16,
    next: Option<usize>,
    in_flight: bool,
    result: Option<(u8, u64)>,
}

struct PoolState {
    contexts: Vec<CmdContext>,
    free_head: Option<usize>,
}

/// The context pool that exists while the interface is event-driven.
struct EventPool {
    sem: Semaphore,
    token_mask: u16,
    state: Mutex<PoolState>,
    // one per context, all paired with `state`
    done: Box<[Condvar]>,
}

impl EventPool {
    fn new(max_cmds: usize) -> Self {
        let mut token_mask: u16 = 1;
        while usize::from(token_mask) < max_cmds {
            token_mask <<= 1;
        }
        token_mask -= 1;
        let contexts = (0..max_cmds)
            .map(|i| CmdContext {
                token: i as u16,
                next: if i + 1 < max_cmds { Some(i + 1) } else { None },
                in_flight: false,
                result: None,
            })
            .collect();
        EventPool {
            sem: Semaphore::new(max_cmds),
            token_mask,
            state: Mutex::new(PoolState {
                contexts,
                free_head: Some(0),
            }),
            done: (0..max_cmds).map(|_| Condvar::new()).collect(),
        }
    }

    fn take(&self) -> Result<(usize, u16)> {
        let mut st = self.state.lock();
        // the semaphore guarantees a free context
        let idx = st
            .free_head
            .ok_or(Error::ResourceExhausted("command contexts"))?;
        let ctx = &mut st.contexts[idx];
        ctx.token = ctx.token.wrapping_add(self.token_mask.wrapping_add(1));
        ctx.in_flight = true;
        ctx.result = None;
        let token = ctx.token;
        st.free_head = st.contexts[idx].next;
        Ok((idx, token))
    }

    fn put(st: &mut PoolState, idx: usize) {
        st.contexts[idx].in_flight = false;
        st.contexts[idx].next = st.free_head;
        st.free_head = Some(idx);
    }
}

struct HcrState {
    /// Toggle value the next posted command carries.
    toggle: bool,
}

pub struct CommandInterface {
    hw: Arc<dyn Hardware>,
    class_a: Duration,
    class_b: Duration,
    class_c: Duration,
    go_bit_timeout: Duration,
    max_cmds: usize,
    /// Post lock; the only path that writes the HCR.
    hcr: Mutex<HcrState>,
    /// One polled command in flight device-wide.
    poll_sem: Mutex<()>,
    use_events: AtomicBool,
    events: RwLock<Option<Arc<EventPool>>>,
    aborted: AtomicBool,
}

impl CommandInterface {
    pub fn new(hw: Arc<dyn Hardware>, config: &HcaConfig) -> Self {
        CommandInterface {
            hw,
            class_a: config.class_a(),
            class_b: config.class_b(),
            class_c: config.class_c(),
            go_bit_timeout: config.go_bit_timeout(),
            max_cmds: config.max_cmds as usize,
            hcr: Mutex::new(HcrState { toggle: true }),
            poll_sem: Mutex::new(()),
            use_events: AtomicBool::new(false),
            events: RwLock::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self, class: TimeClass) -> Duration {
        match class {
            TimeClass::A => self.class_a,
            TimeClass::B => self.class_b,
            TimeClass::C => self.class_c,
        }
    }

    fn status(&self) -> HcrStatus {
        HcrStatus::from_word(self.hw.read_hcr_status())
    }

    fn go_bit(&self) -> bool {
        self.status().go
    }

    fn pending(&self, toggle: bool) -> bool {
        let st = self.status();
        st.go || st.toggle != toggle
    }

    /// Writes one command to the HCR. Returns the toggle it carried.
    #[allow(clippy::too_many_arguments)]
    pub fn post(
        &self,
        in_param: u64,
        out_param: u64,
        in_modifier: u32,
        op_modifier: u8,
        opcode: Opcode,
        token: u16,
        event: bool,
    ) -> Result<bool> {
        let mut hcr = loop {
            if self.aborted.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            if let Some(guard) = self.hcr.try_lock_for(ABORT_CHECK) {
                break guard;
            }
        };

        if event {
            let end = Instant::now() + self.go_bit_timeout;
            while self.go_bit() && Instant::now() < end {
                thread::yield_now();
            }
        }
        if self.go_bit() {
            return Err(Error::Busy { opcode });
        }

        let toggle = hcr.toggle;
        let block = HcrBlock::new(
            in_param,
            out_param,
            in_modifier,
            op_modifier,
            opcode as u16,
            token,
            event,
            toggle,
        );
        trace!(
            "posting {:?} in_mod {:#x} op_mod {} token {:#x} event {}",
            opcode,
            in_modifier,
            op_modifier,
            token,
            event
        );
        // mailbox contents must be visible before the go bit
        fence(Ordering::SeqCst);
        self.hw.write_hcr(&block);
        hcr.toggle = !toggle;
        Ok(toggle)
    }

    /// Posts and spins on the go bit. Returns `(out_param, status)`.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_polling(
        &self,
        in_param: u64,
        out_param: u64,
        in_modifier: u32,
        op_modifier: u8,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<(u64, u8)> {
        let _poll = self.poll_sem.lock();
        let toggle = self.post(
            in_param,
            out_param,
            in_modifier,
            op_modifier,
            opcode,
            POLL_TOKEN,
            false,
        )?;
        let end = Instant::now() + timeout;
        while self.pending(toggle) {
            if Instant::now() >= end {
                warn!("{:?} timed out after {:?} (polling)", opcode, timeout);
                return Err(Error::Timeout { opcode });
            }
            thread::yield_now();
        }
        let status = self.status().status;
        Ok((self.hw.read_hcr_out_param(), status))
    }

    /// Posts with a context token and sleeps until the completion event or
    /// the timeout. Blocks while every context is in use.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_event_driven(
        &self,
        in_param: u64,
        out_param: u64,
        in_modifier: u32,
        op_modifier: u8,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<(u64, u8)> {
        let pool = self.events.read().clone().ok_or(Error::InvalidState)?;
        let _permit = pool.sem.acquire();
        let (idx, token) = pool.take()?;

        if let Err(e) = self.post(
            in_param,
            out_param,
            in_modifier,
            op_modifier,
            opcode,
            token,
            true,
        ) {
            EventPool::put(&mut pool.state.lock(), idx);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut st = pool.state.lock();
        let outcome = loop {
            if let Some(res) = st.contexts[idx].result.take() {
                break Ok(res);
            }
            if pool.done[idx].wait_until(&mut st, deadline).timed_out() {
                break st.contexts[idx]
                    .result
                    .take()
                    .ok_or(Error::Timeout { opcode });
            }
        };
        EventPool::put(&mut st, idx);
        drop(st);
        if outcome.is_err() {
            warn!("{:?} token {:#x} timed out after {:?}", opcode, token, timeout);
        }
        outcome.map(|(status, out)| (out, status))
    }

    /// Runs a command in the current mode.
    pub fn execute(
        &self,
        in_param: u64,
        out_param: u64,
        in_modifier: u32,
        op_modifier: u8,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<(u64, u8)> {
        if self.use_events.load(Ordering::Acquire) {
            self.execute_event_driven(in_param, out_param, in_modifier, op_modifier, opcode, timeout)
        } else {
            self.execute_polling(in_param, out_param, in_modifier, op_modifier, opcode, timeout)
        }
    }

    /// Runs a command with its class timeout and turns a non-zero status
    /// into `Error::Firmware`. Returns the immediate output parameter.
    pub fn cmd(
        &self,
        opcode: Opcode,
        in_param: u64,
        out_param: u64,
        in_modifier: u32,
        op_modifier: u8,
    ) -> Result<u64> {
        let timeout = self.timeout(opcode.time_class());
        let (out, status) =
            self.execute(in_param, out_param, in_modifier, op_modifier, opcode, timeout)?;
        match CommandStatus::from_u8(status) {
            CommandStatus::Ok => Ok(out),
            status => {
                debug!("{:?} failed with {:?}", opcode, status);
                Err(Error::Firmware { opcode, status })
            }
        }
    }

    /// Called from the command EQ for every command-completion record.
    pub fn deliver_event(&self, token: u16, status: u8, out_param: u64) {
        let guard = self.events.read();
        let Some(pool) = guard.as_ref() else {
            warn!("command completion token {:#x} while polling", token);
            return;
        };
        let idx = usize::from(token & pool.token_mask);
        let mut st = pool.state.lock();
        let Some(ctx) = st.contexts.get_mut(idx) else {
            warn!("command completion with bad token {:#x}", token);
            return;
        };
        if !ctx.in_flight || ctx.token != token {
            // the waiter gave up and the context moved on
            debug!("discarding stale command completion token {:#x}", token);
            return;
        }
        ctx.result = Some((status, out_param));
        pool.done[idx].notify_one();
    }

    /// Allocates the context pool and starts waiting for completion events.
    /// The command EQ must already be delivering interrupts.
    pub fn use_events(&self) {
        let mut events = self.events.write();
        if events.is_none() {
            *events = Some(Arc::new(EventPool::new(self.max_cmds)));
        }
        self.use_events.store(true, Ordering::Release);
        debug!("command interface is event driven ({} contexts)", self.max_cmds);
    }

    /// Waits for every in-flight event-driven command, then frees the pool.
    pub fn use_polling(&self) {
        self.use_events.store(false, Ordering::Release);
        let Some(pool) = self.events.read().clone() else {
            return;
        };
        let permits: Vec<_> = (0..self.max_cmds).map(|_| pool.sem.acquire()).collect();
        *self.events.write() = None;
        drop(permits);
        debug!("command interface is polling");
    }

    pub fn is_event_driven(&self) -> bool {
        self.use_events.load(Ordering::Acquire)
    }

    /// Fails every later post with `Interrupted`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{Doorbell, IrqHandler};
    use std::io;

    /// Completes every command instantly with a fixed status and output.
    struct InstantHcr {
        status: u8,
        out: u64,
        word: Mutex<u32>,
        cmd: Mutex<Option<Arc<CommandInterface>>>,
    }

    impl Hardware for InstantHcr {
        fn write_hcr(&self, hcr: &HcrBlock) {
            *self.word.lock() = HcrStatus {
                go: false,
                toggle: hcr.toggle(),
                status: self.status,
            }
            .to_word();
            if hcr.event() {
                let cmd = self.cmd.lock().clone().unwrap();
                let (token, status, out) = (hcr.token(), self.status, self.out);
                thread::spawn(move || cmd.deliver_event(token, status, out));
            }
        }
        fn read_hcr_status(&self) -> u32 {
            *self.word.lock()
        }
        fn read_hcr_out_param(&self) -> u64 {
            self.out
        }
        fn ring(&self, _doorbell: Doorbell) {}
        fn request_irq(&self, _handler: IrqHandler) -> io::Result<()> {
            Ok(())
        }
        fn free_irq(&self) {}
    }

    /// Never completes anything.
    struct DeadHcr;

    impl Hardware for DeadHcr {
        fn write_hcr(&self, _hcr: &HcrBlock) {}
        fn read_hcr_status(&self) -> u32 {
            HcrStatus {
                go: false,
                toggle: false,
                status: 0,
            }
            .to_word()
        }
        fn read_hcr_out_param(&self) -> u64 {
            0
        }
        fn ring(&self, _doorbell: Doorbell) {}
        fn request_irq(&self, _handler: IrqHandler) -> io::Result<()> {
            Ok(())
        }
        fn free_irq(&self) {}
    }

    fn instant(status: u8, out: u64) -> Arc<CommandInterface> {
        let hw = Arc::new(InstantHcr {
            status,
            out,
            word: Mutex::new(0),
            cmd: Mutex::new(None),
        });
        let cmd = Arc::new(CommandInterface::new(
            hw.clone(),
            &HcaConfig::default().with_fast_timeouts(200),
        ));
        *hw.cmd.lock() = Some(Arc::clone(&cmd));
        cmd
    }

    #[test]
    fn polling_returns_hardware_result() {
        let cmd = instant(0x10, 0xdead_beef);
        let res = cmd
            .execute_polling(0, 0, 0, 0, Opcode::Nop, Duration::from_millis(100))
            .unwrap();
        assert_eq!(res, (0xdead_beef, 0x10));
    }

    #[test]
    fn events_return_hardware_result() {
        let cmd = instant(0x03, 42);
        cmd.use_events();
        let res = cmd
            .execute_event_driven(0, 0, 0, 0, Opcode::Nop, Duration::from_secs(2))
            .unwrap();
        assert_eq!(res, (42, 0x03));
        let err = cmd.cmd(Opcode::Nop, 0, 0, 0, 0).unwrap_err();
        assert_eq!(err.firmware_status(), Some(CommandStatus::BadParam));
        cmd.use_polling();
        assert!(!cmd.is_event_driven());
    }

    #[test]
    fn many_concurrent_event_commands() {
        let cmd = instant(0, 7);
        cmd.use_events();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cmd = Arc::clone(&cmd);
                thread::spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(cmd.cmd(Opcode::Nop, 0, 0, 0, 0).unwrap(), 7);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        cmd.use_polling();
    }

    #[test]
    fn polling_timeout_is_bounded() {
        let cmd = CommandInterface::new(Arc::new(DeadHcr), &HcaConfig::default());
        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        let err = cmd
            .execute_polling(0, 0, 0, 0, Opcode::Nop, timeout)
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::Timeout { opcode: Opcode::Nop }));
        assert!(err.is_indeterminate());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
    }

    #[test]
    fn event_timeout_is_bounded() {
        let cmd = CommandInterface::new(Arc::new(DeadHcr), &HcaConfig::default());
        cmd.use_events();
        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        let err = cmd
            .execute_event_driven(0, 0, 0, 0, Opcode::Nop, timeout)
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
    }

    #[test]
    fn stale_token_is_discarded() {
        let config = HcaConfig {
            max_cmds: 1,
            ..Default::default()
        };
        let cmd = Arc::new(CommandInterface::new(Arc::new(DeadHcr), &config));
        cmd.use_events();
        // first command times out; its token is now stale
        assert!(cmd
            .execute_event_driven(0, 0, 0, 0, Opcode::Nop, Duration::from_millis(20))
            .is_err());
        let stale = 1u16; // context 0 after one reuse: 0 + (mask + 1)
        let waiter = {
            let cmd = Arc::clone(&cmd);
            thread::spawn(move || {
                cmd.execute_event_driven(0, 0, 0, 0, Opcode::Nop, Duration::from_secs(5))
            })
        };
        thread::sleep(Duration::from_millis(50));
        cmd.deliver_event(stale, 0x05, 0xbad);
        // current occupant carries token 2
        cmd.deliver_event(2, 0, 0x600d);
        assert_eq!(waiter.join().unwrap().unwrap(), (0x600d, 0));
    }

    #[test]
    fn abort_interrupts_posting() {
        let cmd = instant(0, 0);
        cmd.abort();
        assert!(matches!(
            cmd.cmd(Opcode::Nop, 0, 0, 0, 0),
            Err(Error::Interrupted)
        ));
    }

    #[test]
    fn status_codes_round_trip() {
        for v in 0..=u8::MAX {
            assert_eq!(CommandStatus::from_u8(v).to_u8(), v);
        }
        assert_eq!(Opcode::from_u16(0x21), Some(Opcode::Any2RstQp));
        assert_eq!(Opcode::Any2RstQp.time_class(), TimeClass::C);
    }
}
