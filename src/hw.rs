//! The collaborators the core drives: the HCA register file, doorbells,
//! interrupt delivery, and DMA-capable memory.
use std::io;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub(crate) const HCR_GO_BIT: u32 = 23;
pub(crate) const HCR_E_BIT: u32 = 22;
pub(crate) const HCR_T_BIT: u32 = 21;
pub(crate) const HCR_OPMOD_SHIFT: u32 = 12;
pub(crate) const HCR_STATUS_SHIFT: u32 = 24;
pub(crate) const HCR_TOKEN_SHIFT: u32 = 16;

/// The command register block as the device sees it.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HcrBlock {
    pub in_param: U64,
    pub in_modifier: U32,
    pub out_param: U64,
    /// Only the upper 16 bits are used.
    pub token: U32,
    /// go, event and toggle bits, op modifier and opcode.
    pub status_opcode: U32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<HcrBlock>(), 28);

impl HcrBlock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        in_param: u64,
        out_param: u64,
        in_modifier: u32,
        op_modifier: u8,
        opcode: u16,
        token: u16,
        event: bool,
        toggle: bool,
    ) -> Self {
        HcrBlock {
            in_param: in_param.into(),
            in_modifier: in_modifier.into(),
            out_param: out_param.into(),
            token: (u32::from(token) << HCR_TOKEN_SHIFT).into(),
            status_opcode: ((1 << HCR_GO_BIT)
                | (u32::from(event) << HCR_E_BIT)
                | (u32::from(toggle) << HCR_T_BIT)
                | (u32::from(op_modifier & 0xf) << HCR_OPMOD_SHIFT)
                | u32::from(opcode & 0xfff))
            .into(),
        }
    }

    pub fn opcode(&self) -> u16 {
        (self.status_opcode.get() & 0xfff) as u16
    }

    pub fn op_modifier(&self) -> u8 {
        ((self.status_opcode.get() >> HCR_OPMOD_SHIFT) & 0xf) as u8
    }

    pub fn token(&self) -> u16 {
        (self.token.get() >> HCR_TOKEN_SHIFT) as u16
    }

    pub fn event(&self) -> bool {
        self.status_opcode.get() & (1 << HCR_E_BIT) != 0
    }

    pub fn go(&self) -> bool {
        self.status_opcode.get() & (1 << HCR_GO_BIT) != 0
    }

    pub fn toggle(&self) -> bool {
        self.status_opcode.get() & (1 << HCR_T_BIT) != 0
    }
}

/// Decoded view of the status word read back from the HCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcrStatus {
    pub go: bool,
    /// Flipped by the device each time it accepts a command.
    pub toggle: bool,
    pub status: u8,
}

impl HcrStatus {
    pub fn from_word(word: u32) -> Self {
        HcrStatus {
            go: word & (1 << HCR_GO_BIT) != 0,
            toggle: word & (1 << HCR_T_BIT) != 0,
            status: (word >> HCR_STATUS_SHIFT) as u8,
        }
    }

    pub fn to_word(self) -> u32 {
        (u32::from(self.go) << HCR_GO_BIT)
            | (u32::from(self.toggle) << HCR_T_BIT)
            | (u32::from(self.status) << HCR_STATUS_SHIFT)
    }
}

/// A write to one of the device's doorbell registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Doorbell {
    /// Consumer index update, frees CQ slots for the device.
    CqSetCi { cqn: u32, ci: u32 },
    /// Request one completion event.
    CqArm {
        cqn: u32,
        ci: u32,
        sn: u8,
        solicited: bool,
    },
    /// Acknowledge a completion event so the CQ may be armed again.
    CqDisarm { eqn: u32, cqn: u32 },
    EqSetCi { eqn: u32, ci: u32 },
    /// Request an interrupt for the next event on this EQ.
    EqReqNot { eqn: u32 },
    SendQueue { qpn: u32, head: u32 },
    RecvQueue { qpn: u32, head: u32 },
}

/// Called with the EQ number whose interrupt fired.
pub type IrqHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// The register-level interface of the adapter.
pub trait Hardware: Send + Sync {
    /// Writes the whole HCR block; the device acts on the go bit.
    fn write_hcr(&self, hcr: &HcrBlock);
    /// The raw status word (go, toggle, status byte).
    fn read_hcr_status(&self) -> u32;
    fn read_hcr_out_param(&self) -> u64;
    fn ring(&self, doorbell: Doorbell);
    /// At most one invocation per EQ runs at a time.
    fn request_irq(&self, handler: IrqHandler) -> io::Result<()>;
    fn free_irq(&self);
}

/// Backing store of a DMA allocation, shared with the device.
pub struct DmaRegion {
    bytes: Mutex<Box<[u8]>>,
}

impl DmaRegion {
    pub fn new(size: usize) -> Self {
        DmaRegion {
            bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn fill(&self, value: u8) {
        self.bytes.lock().fill(value);
    }
}

/// A DMA allocation: CPU accessor plus the physical address of each page.
#[derive(Clone)]
pub struct DmaBuffer {
    handle: usize,
    size: usize,
    pages: Arc<[u64]>,
    region: Arc<DmaRegion>,
}

impl DmaBuffer {
    pub fn new(handle: usize, size: usize, pages: Vec<u64>, region: Arc<DmaRegion>) -> Self {
        DmaBuffer {
            handle,
            size,
            pages: pages.into(),
            region,
        }
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Physical address of the byte at `offset`.
    pub fn phys_addr(&self, offset: usize) -> u64 {
        self.pages[offset / PAGE_SIZE] + (offset % PAGE_SIZE) as u64
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        self.region.read(offset, buf)
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.region.write(offset, data)
    }

    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.region.read(offset, obj.as_mut_bytes());
        obj
    }

    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, obj: &T) {
        self.region.write(offset, obj.as_bytes())
    }

    pub fn zero(&self) {
        self.region.fill(0)
    }
}

/// Coherent DMA memory provider.
pub trait DmaAllocator: Send + Sync {
    /// At least `size` bytes, described as a list of page addresses.
    fn alloc_coherent(&self, size: usize) -> io::Result<DmaBuffer>;
    fn free_coherent(&self, buf: &DmaBuffer);
}

/// Frees its buffer when dropped.
pub(crate) struct OwnedDma {
    buf: DmaBuffer,
    dma: Arc<dyn DmaAllocator>,
}

impl OwnedDma {
    pub(crate) fn alloc(dma: &Arc<dyn DmaAllocator>, size: usize) -> io::Result<Self> {
        let buf = dma.alloc_coherent(size)?;
        Ok(OwnedDma {
            buf,
            dma: Arc::clone(dma),
        })
    }
}

impl Deref for OwnedDma {
    type Target = DmaBuffer;
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl Drop for OwnedDma {
    fn drop(&mut self) {
        self.dma.free_coherent(&self.buf);
    }
}
