//! Multicast group attach/detach.
//!
//! The device keeps multicast groups in a hash table of MGM entries. The
//! firmware hashes a GID to a head slot below `num_mgms`; collisions chain
//! into AMGM entries taken from the allocator above that. Each entry holds
//! up to `QP_PER_MGM` member QPNs, packed at the front.
use log::{debug, error, warn};
use parking_lot::Mutex;
use zerocopy::byteorder::big_endian::U32;
use zerocopy::FromZeros;

use crate::alloc::Allocator;
use crate::config::HcaConfig;
use crate::device::HcaDev;
use crate::error::{Error, Result};
use crate::fw::{Mailbox, MgmEntry, MGM_QP_VALID};

pub(crate) struct McgTable {
    alloc: Allocator,
    num_mgms: u32,
    /// Serializes every chain walk and update.
    lock: Mutex<()>,
}

impl McgTable {
    pub(crate) fn new(config: &HcaConfig) -> Result<Self> {
        let size = config.num_mgms + config.num_amgms;
        Ok(McgTable {
            alloc: Allocator::new(size, size - 1, config.num_mgms)?,
            num_mgms: config.num_mgms,
            lock: Mutex::new(()),
        })
    }

    fn free_amgm(&self, index: u32) {
        if index < self.num_mgms {
            error!("refusing to free MGM hash slot {:#x} as an AMGM", index);
            return;
        }
        self.alloc.free(index);
    }
}

fn fmt_gid(gid: &[u8; 16]) -> String {
    gid.chunks(2)
        .map(|c| format!("{:02x}{:02x}", c[0], c[1]))
        .collect::<Vec<_>>()
        .join(":")
}

struct Found {
    hash: u32,
    /// Entry before `index` in the chain, `None` at the head.
    prev: Option<u32>,
    /// The entry holding the GID, or the empty head slot. `None` if the
    /// chain was walked to its end without a match.
    index: Option<u32>,
    /// Contents of `index`, or of the chain tail when `index` is `None`.
    mgm: MgmEntry,
}

fn find_mgm(dev: &HcaDev, mailbox: &Mailbox, gid: &[u8; 16]) -> Result<Found> {
    mailbox.clear();
    mailbox.write(0, gid);
    let hash = u32::from(dev.cmd.mgid_hash(mailbox)?);
    let mut index = hash;
    let mut prev = None;

    for _ in 0..dev.mcg_table.alloc.capacity() {
        dev.cmd.read_mgm(mailbox, index)?;
        let mgm: MgmEntry = mailbox.read(0);

        if mgm.gid == [0; 16] {
            if index != hash {
                error!("found zero MGID in AMGM {:#x} (hash {:#x})", index, hash);
                return Err(Error::InvalidState);
            }
            return Ok(Found {
                hash,
                prev,
                index: Some(index),
                mgm,
            });
        }
        if &mgm.gid == gid {
            return Ok(Found {
                hash,
                prev,
                index: Some(index),
                mgm,
            });
        }

        prev = Some(index);
        index = mgm.next_index();
        if index == 0 {
            return Ok(Found {
                hash,
                prev,
                index: None,
                mgm,
            });
        }
    }
    error!("multicast chain for hash {:#x} does not terminate", hash);
    Err(Error::InvalidState)
}

/// `Ok(false)` if `qpn` is already a member.
fn insert_member(mgm: &mut MgmEntry, qpn: u32) -> Result<bool> {
    let member = qpn | MGM_QP_VALID;
    for slot in mgm.qp.iter_mut() {
        if slot.get() == member {
            return Ok(false);
        }
        if slot.get() & MGM_QP_VALID == 0 {
            *slot = member.into();
            return Ok(true);
        }
    }
    Err(Error::ResourceExhausted("multicast group members"))
}

/// Removes `qpn` by moving the last member into its slot. Returns how many
/// members the entry had before, `None` if `qpn` was not one.
fn remove_member(mgm: &mut MgmEntry, qpn: u32) -> Option<usize> {
    let member = qpn | MGM_QP_VALID;
    let count = mgm
        .qp
        .iter()
        .take_while(|slot| slot.get() & MGM_QP_VALID != 0)
        .count();
    let loc = mgm.qp[..count].iter().position(|slot| slot.get() == member)?;
    mgm.qp[loc] = mgm.qp[count - 1];
    mgm.qp[count - 1] = U32::new(0);
    Some(count)
}

pub(crate) fn attach(dev: &HcaDev, gid: &[u8; 16], qpn: u32) -> Result<()> {
    let table = &dev.mcg_table;
    let mailbox = Mailbox::new(&dev.dma)?;
    let _guard = table.lock.lock();

    let found = find_mgm(dev, &mailbox, gid)?;
    let (index, mut mgm, link) = match found.index {
        Some(index) => {
            let mut mgm = found.mgm;
            if mgm.gid == [0; 16] {
                mgm.gid = *gid;
            }
            (index, mgm, None)
        }
        None => {
            let index = table.alloc.alloc().map_err(|_| {
                warn!("no AMGM entries left for {}", fmt_gid(gid));
                Error::ResourceExhausted("multicast group entries")
            })?;
            let mut mgm = MgmEntry::new_zeroed();
            mgm.gid = *gid;
            (index, mgm, found.prev)
        }
    };

    let res = (|| -> Result<()> {
        if !insert_member(&mut mgm, qpn).inspect_err(|_| {
            warn!("MGM {:#x} for {} is full", index, fmt_gid(gid));
        })? {
            debug!("QP {:#x} already attached to {}", qpn, fmt_gid(gid));
            return Ok(());
        }
        mailbox.write(0, &mgm);
        dev.cmd.write_mgm(&mailbox, index)?;

        if let Some(prev) = link {
            dev.cmd.read_mgm(&mailbox, prev)?;
            let mut tail: MgmEntry = mailbox.read(0);
            tail.set_next_index(index);
            mailbox.write(0, &tail);
            dev.cmd.write_mgm(&mailbox, prev)?;
        }
        debug!(
            "attached QP {:#x} to {} at MGM {:#x} (hash {:#x})",
            qpn,
            fmt_gid(gid),
            index,
            found.hash
        );
        Ok(())
    })();

    if res.is_err() && link.is_some() {
        // the entry may already have been written
        mailbox.write(0, &MgmEntry::new_zeroed());
        if let Err(e) = dev.cmd.write_mgm(&mailbox, index) {
            warn!("failed to clear AMGM {:#x}: {}", index, e);
        }
        table.free_amgm(index);
    }
    res
}

pub(crate) fn detach(dev: &HcaDev, gid: &[u8; 16], qpn: u32) -> Result<()> {
    let table = &dev.mcg_table;
    let mailbox = Mailbox::new(&dev.dma)?;
    let _guard = table.lock.lock();

    let found = find_mgm(dev, &mailbox, gid)?;
    let Some(index) = found.index else {
        warn!("MGID {} not found", fmt_gid(gid));
        return Err(Error::NotFound);
    };
    let mut mgm = found.mgm;
    let Some(count) = remove_member(&mut mgm, qpn) else {
        warn!("QP {:#x} not attached to {}", qpn, fmt_gid(gid));
        return Err(Error::NotFound);
    };
    mailbox.write(0, &mgm);
    dev.cmd.write_mgm(&mailbox, index)?;
    debug!("detached QP {:#x} from {}", qpn, fmt_gid(gid));

    if count != 1 {
        return Ok(());
    }

    // last member gone: take the entry out of the chain
    let next = mgm.next_index();
    match found.prev {
        None => {
            if next != 0 {
                // pull the first AMGM up into the hash slot
                dev.cmd.read_mgm(&mailbox, next)?;
            } else {
                mgm.gid = [0; 16];
                mailbox.write(0, &mgm);
            }
            dev.cmd.write_mgm(&mailbox, index)?;
            if next != 0 {
                table.free_amgm(next);
            }
        }
        Some(prev) => {
            dev.cmd.read_mgm(&mailbox, prev)?;
            let mut prev_mgm: MgmEntry = mailbox.read(0);
            prev_mgm.set_next_index(next);
            mailbox.write(0, &prev_mgm);
            dev.cmd.write_mgm(&mailbox, prev)?;
            table.free_amgm(index);
        }
    }
    debug!("released MGM {:#x} of {}", index, fmt_gid(gid));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fw::QP_PER_MGM;

    fn members(mgm: &MgmEntry) -> Vec<u32> {
        mgm.qp
            .iter()
            .map(|slot| slot.get())
            .take_while(|v| v & MGM_QP_VALID != 0)
            .map(|v| v & !MGM_QP_VALID)
            .collect()
    }

    #[test]
    fn members_pack_at_the_front() {
        let mut mgm = MgmEntry::new_zeroed();
        for qpn in [0x40, 0x41, 0x42] {
            assert!(insert_member(&mut mgm, qpn).unwrap());
        }
        assert!(!insert_member(&mut mgm, 0x41).unwrap());
        assert_eq!(members(&mgm), [0x40, 0x41, 0x42]);

        assert_eq!(remove_member(&mut mgm, 0x40), Some(3));
        assert_eq!(members(&mgm), [0x42, 0x41]);
        assert_eq!(mgm.qp[2].get(), 0);
        assert_eq!(remove_member(&mut mgm, 0x40), None);
        assert_eq!(remove_member(&mut mgm, 0x41), Some(2));
        assert_eq!(remove_member(&mut mgm, 0x42), Some(1));
        assert!(members(&mgm).is_empty());
    }

    #[test]
    fn full_group_rejects_new_member() {
        let mut mgm = MgmEntry::new_zeroed();
        for qpn in 0..QP_PER_MGM as u32 {
            insert_member(&mut mgm, 0x100 + qpn).unwrap();
        }
        assert!(matches!(
            insert_member(&mut mgm, 0x200),
            Err(Error::ResourceExhausted(_))
        ));
        assert!(!insert_member(&mut mgm, 0x103).unwrap());
    }

    #[test]
    fn gid_formats_as_groups() {
        let mut gid = [0u8; 16];
        gid[0] = 0xff;
        gid[1] = 0x12;
        gid[15] = 0x01;
        assert_eq!(fmt_gid(&gid), "ff12:0000:0000:0000:0000:0000:0000:0001");
    }
}
