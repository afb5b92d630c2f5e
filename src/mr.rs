//! Memory regions for the rings the core hands to the device.
//!
//! Each region takes one MPT entry and a power-of-two run of MTT segments
//! holding its page list. The device resolves ring addresses through the
//! lkey, so rings need not be physically contiguous.
use log::{debug, warn};
use zerocopy::byteorder::big_endian::U64;

use crate::alloc::{Allocator, Buddy};
use crate::config::HcaConfig;
use crate::device::HcaDev;
use crate::error::{Error, Result};
use crate::fw::{Mailbox, MptEntry, MttHeader, MTT_FLAG_PRESENT, MTT_PER_MAILBOX};
use crate::hw::DmaBuffer;

pub(crate) struct MrTable {
    mpt_alloc: Allocator,
    mtt_buddy: Buddy,
    num_mpts: u32,
    mtt_seg_size: u32,
}

impl MrTable {
    pub(crate) fn new(config: &HcaConfig) -> Result<Self> {
        Ok(MrTable {
            mpt_alloc: Allocator::new(config.num_mpts, u32::MAX, config.reserved_mrws)?,
            mtt_buddy: Buddy::new(config.num_mtt_segs.trailing_zeros()),
            num_mpts: config.num_mpts,
            mtt_seg_size: config.mtt_seg_size,
        })
    }
}

#[inline]
pub(crate) fn hw_index_to_key(index: u32) -> u32 {
    index.rotate_left(8)
}

#[inline]
pub(crate) fn key_to_hw_index(key: u32) -> u32 {
    key.rotate_right(8)
}

/// Not freed on drop: the owner calls `free` while it still has the device.
pub(crate) struct MemoryRegion {
    key: u32,
    first_seg: u32,
    order: u32,
}

impl MemoryRegion {
    pub(crate) fn register(dev: &HcaDev, buf: &DmaBuffer) -> Result<Self> {
        let table = &dev.mr_table;
        let npages = buf.pages().len() as u32;
        if npages == 0 {
            return Err(Error::InvalidAttribute("empty memory region"));
        }
        let nsegs = npages.div_ceil(table.mtt_seg_size);
        let order = nsegs.next_power_of_two().trailing_zeros();
        let first_seg = table.mtt_buddy.alloc(order)?;
        let index = match table.mpt_alloc.alloc() {
            Ok(index) => index,
            Err(e) => {
                table.mtt_buddy.free(first_seg, order);
                return Err(e);
            }
        };
        let mr = MemoryRegion {
            key: hw_index_to_key(index),
            first_seg,
            order,
        };
        if let Err(e) = mr.write(dev, buf) {
            mr.release(table);
            return Err(e);
        }
        debug!(
            "registered MR lkey {:#x}, {} pages at MTT segment {}",
            mr.key, npages, first_seg
        );
        Ok(mr)
    }

    fn write(&self, dev: &HcaDev, buf: &DmaBuffer) -> Result<()> {
        let table = &dev.mr_table;
        let mailbox = Mailbox::new(&dev.dma)?;
        let first_entry = u64::from(self.first_seg) * u64::from(table.mtt_seg_size);

        for (n, chunk) in buf.pages().chunks(MTT_PER_MAILBOX).enumerate() {
            let start = first_entry + (n * MTT_PER_MAILBOX) as u64;
            mailbox.write(0, &MttHeader::new(start * 8));
            for (i, page) in chunk.iter().enumerate() {
                mailbox.write(16 + i * 8, &U64::new(page | MTT_FLAG_PRESENT));
            }
            dev.cmd.write_mtt(&mailbox, chunk.len() as u32)?;
        }

        mailbox.clear();
        let mpt = MptEntry::new(
            self.key,
            buf.size() as u64,
            first_entry * 8,
            buf.pages().len() as u32,
        );
        mailbox.write(0, &mpt);
        dev.cmd.sw2hw_mpt(&mailbox, self.hw_index(table))
    }

    fn hw_index(&self, table: &MrTable) -> u32 {
        key_to_hw_index(self.key) & (table.num_mpts - 1)
    }

    pub(crate) fn lkey(&self) -> u32 {
        self.key
    }

    pub(crate) fn free(self, dev: &HcaDev) {
        if let Err(e) = dev.cmd.hw2sw_mpt(self.hw_index(&dev.mr_table)) {
            warn!("HW2SW_MPT for lkey {:#x} failed: {}", self.key, e);
        }
        self.release(&dev.mr_table);
    }

    fn release(&self, table: &MrTable) {
        table.mtt_buddy.free(self.first_seg, self.order);
        table.mpt_alloc.free(key_to_hw_index(self.key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_through_hw_index() {
        for index in [0u32, 1, 0x3ff, 0x12_3456, u32::MAX] {
            assert_eq!(key_to_hw_index(hw_index_to_key(index)), index);
        }
        assert_eq!(hw_index_to_key(1), 0x100);
    }
}
