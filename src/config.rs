//! Device limits and command timing.
//!
//! On real hardware most of these come from QUERY_DEV_LIM / QUERY_ADAPTER;
//! here they are supplied by whoever attaches the device.
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_PORTS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HcaConfig {
    pub num_qps: u32,
    pub reserved_qps: u32,
    pub num_cqs: u32,
    pub reserved_cqs: u32,
    pub num_eqs: u32,
    pub reserved_eqs: u32,
    /// Completion EQs; CQs pick one by their completion vector.
    pub num_comp_eqs: u32,
    pub num_mpts: u32,
    pub reserved_mrws: u32,
    pub num_mtt_segs: u32,
    /// MTT entries per segment.
    pub mtt_seg_size: u32,
    /// Hash heads of the multicast table.
    pub num_mgms: u32,
    /// Overflow entries chained behind the hash heads.
    pub num_amgms: u32,
    /// Outstanding event-driven commands the firmware accepts.
    pub max_cmds: u32,
    pub num_ports: u8,
    pub pkey_table_len: u16,
    pub max_qp_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub max_wqes: u32,
    pub max_cqes: u32,
    /// Try to switch the command interface to event-driven mode at attach.
    pub enable_events: bool,

    pub class_a_ms: u64,
    pub class_b_ms: u64,
    pub class_c_ms: u64,
    pub go_bit_timeout_ms: u64,
}

impl Default for HcaConfig {
    fn default() -> Self {
        HcaConfig {
            num_qps: 1 << 10,
            reserved_qps: 8,
            num_cqs: 1 << 8,
            reserved_cqs: 1,
            num_eqs: 32,
            reserved_eqs: 0,
            num_comp_eqs: 1,
            num_mpts: 1 << 10,
            reserved_mrws: 1,
            num_mtt_segs: 1 << 12,
            mtt_seg_size: 8,
            num_mgms: 1 << 6,
            num_amgms: 1 << 6,
            max_cmds: 16,
            num_ports: 2,
            pkey_table_len: 64,
            max_qp_rd_atomic: 4,
            max_dest_rd_atomic: 4,
            max_wqes: 1 << 14,
            max_cqes: 1 << 16,
            enable_events: true,
            class_a_ms: 10_000,
            class_b_ms: 60_000,
            class_c_ms: 60_000,
            go_bit_timeout_ms: 10_000,
        }
    }
}

fn pow2(n: u32) -> bool {
    n != 0 && n.is_power_of_two()
}

impl HcaConfig {
    pub fn validate(&self) -> Result<()> {
        if !pow2(self.num_qps) || !pow2(self.num_cqs) || !pow2(self.num_eqs) {
            return Err(Error::InvalidConfig("QP, CQ and EQ tables must be powers of two"));
        }
        if !pow2(self.num_mpts) || !pow2(self.num_mtt_segs) || !pow2(self.mtt_seg_size) {
            return Err(Error::InvalidConfig("MPT and MTT tables must be powers of two"));
        }
        if !pow2(self.num_mgms + self.num_amgms) || self.num_mgms == 0 {
            return Err(Error::InvalidConfig("multicast table must be a power of two"));
        }
        if self.num_ports == 0 || self.num_ports > MAX_PORTS {
            return Err(Error::InvalidConfig("device must have one or two ports"));
        }
        if self.qp_reserved_count() >= self.num_qps
            || self.reserved_cqs >= self.num_cqs
            || self.reserved_mrws >= self.num_mpts
        {
            return Err(Error::InvalidConfig("reserved objects exceed the table"));
        }
        // async + cmd + completion vectors
        if self.reserved_eqs + self.num_comp_eqs + 2 > self.num_eqs || self.num_comp_eqs == 0 {
            return Err(Error::InvalidConfig("not enough event queues"));
        }
        if self.max_cmds == 0 || self.max_cmds > 1 << 15 {
            return Err(Error::InvalidConfig("max_cmds out of range"));
        }
        Ok(())
    }

    /// First special QP number; QP0/QP1 of every port live at
    /// `sqp_start + kind * 2 + port - 1`.
    pub fn sqp_start(&self) -> u32 {
        (self.reserved_qps + 1) & !1
    }

    /// QPNs below this are never handed out by the allocator.
    pub(crate) fn qp_reserved_count(&self) -> u32 {
        self.sqp_start() + u32::from(MAX_PORTS) * 2
    }

    pub fn class_a(&self) -> Duration {
        Duration::from_millis(self.class_a_ms)
    }

    pub fn class_b(&self) -> Duration {
        Duration::from_millis(self.class_b_ms)
    }

    pub fn class_c(&self) -> Duration {
        Duration::from_millis(self.class_c_ms)
    }

    pub fn go_bit_timeout(&self) -> Duration {
        Duration::from_millis(self.go_bit_timeout_ms)
    }

    /// Short command timeouts for tests and simulation.
    pub fn with_fast_timeouts(mut self, ms: u64) -> Self {
        self.class_a_ms = ms;
        self.class_b_ms = ms;
        self.class_c_ms = ms;
        self.go_bit_timeout_ms = ms;
        self
    }

    #[cfg(feature = "serde")]
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HcaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
