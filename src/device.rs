//! The device context. Every table, lock and the command interface of one
//! attached adapter hang off `HcaDev`; `Hca` is the cloneable handle to it.
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::cmd::CommandInterface;
use crate::config::HcaConfig;
use crate::cq::{self, CompletionQueue, CqTable};
use crate::eq::{self, EqTable};
use crate::error::Result;
use crate::hw::{DmaAllocator, Hardware};
use crate::mcg::{self, McgTable};
use crate::mr::MrTable;
use crate::qp::{self, QpInitAttr, QpTable, QueuePair};

/// Brings the IB link of a port up or down when QP0 moves through RTR,
/// RESET and ERROR.
pub trait PortLifecycle: Send + Sync {
    fn bring_up(&self, cmd: &CommandInterface, port: u8) -> Result<()> {
        cmd.init_ib(port)
    }

    fn bring_down(&self, cmd: &CommandInterface, port: u8) -> Result<()> {
        cmd.close_ib(port)
    }
}

/// Issues INIT_IB / CLOSE_IB.
pub struct FirmwarePorts;

impl PortLifecycle for FirmwarePorts {}

/// Events not affiliated with a CQ or QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    PortActive(u8),
    PortError(u8),
    /// The device reported a fatal error; commands now fail `Interrupted`.
    CatastrophicError,
}

pub type DeviceEventHandler = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

pub(crate) struct HcaDev {
    pub(crate) config: HcaConfig,
    pub(crate) hw: Arc<dyn Hardware>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) cmd: CommandInterface,
    pub(crate) mr_table: MrTable,
    pub(crate) eq_table: EqTable,
    pub(crate) cq_table: CqTable,
    pub(crate) qp_table: QpTable,
    pub(crate) mcg_table: McgTable,
    pub(crate) ports: Arc<dyn PortLifecycle>,
    event_handler: RwLock<Option<DeviceEventHandler>>,
}

impl HcaDev {
    pub(crate) fn device_event(&self, event: DeviceEvent) {
        let handler = self.event_handler.read().clone();
        match handler {
            Some(handler) => handler(event),
            None => debug!("unhandled device event {:?}", event),
        }
    }
}

impl Drop for HcaDev {
    fn drop(&mut self) {
        debug!("detaching HCA");
        qp::cleanup_special_qps(self);
        self.cmd.use_polling();
        eq::cleanup_eq_table(self);
    }
}

#[derive(Clone)]
pub struct Hca {
    dev: Arc<HcaDev>,
}

impl Hca {
    pub fn attach(
        hw: Arc<dyn Hardware>,
        dma: Arc<dyn DmaAllocator>,
        config: HcaConfig,
    ) -> Result<Hca> {
        Self::attach_with_ports(hw, dma, config, Arc::new(FirmwarePorts))
    }

    pub fn attach_with_ports(
        hw: Arc<dyn Hardware>,
        dma: Arc<dyn DmaAllocator>,
        config: HcaConfig,
        ports: Arc<dyn PortLifecycle>,
    ) -> Result<Hca> {
        config.validate()?;
        let dev = Arc::new(HcaDev {
            cmd: CommandInterface::new(Arc::clone(&hw), &config),
            mr_table: MrTable::new(&config)?,
            eq_table: EqTable::new(&config)?,
            cq_table: CqTable::new(&config)?,
            qp_table: QpTable::new(&config)?,
            mcg_table: McgTable::new(&config)?,
            config,
            hw,
            dma,
            ports,
            event_handler: RwLock::new(None),
        });

        eq::init_eq_table(&dev)?;

        if dev.config.enable_events {
            dev.cmd.use_events();
            if let Err(e) = dev.cmd.nop() {
                warn!("NOP command failed to generate an event ({}), using polling", e);
                dev.cmd.use_polling();
            }
        }

        qp::init_special_qps(&dev)?;

        info!(
            "HCA attached: {} ports, {} QPs, {} CQs, commands {}",
            dev.config.num_ports,
            dev.config.num_qps,
            dev.config.num_cqs,
            if dev.cmd.is_event_driven() { "event driven" } else { "polled" }
        );
        Ok(Hca { dev })
    }

    pub fn config(&self) -> &HcaConfig {
        &self.dev.config
    }

    pub fn cmd(&self) -> &CommandInterface {
        &self.dev.cmd
    }

    pub fn is_event_driven(&self) -> bool {
        self.dev.cmd.is_event_driven()
    }

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        *self.dev.event_handler.write() = Some(Arc::new(handler));
    }

    /// `entries` is rounded up to a power of two. Completion events go to
    /// completion EQ `comp_vector`.
    pub fn create_cq(&self, entries: u32, comp_vector: u32) -> Result<CompletionQueue> {
        cq::create(&self.dev, entries, comp_vector)
    }

    pub fn create_qp(&self, attr: QpInitAttr) -> Result<QueuePair> {
        qp::create(&self.dev, attr)
    }

    /// QP0 (`QpType::SMI`) or QP1 (`QpType::GSI`) of `port`.
    pub fn create_special_qp(&self, attr: QpInitAttr, port: u8) -> Result<QueuePair> {
        qp::create_special(&self.dev, attr, port)
    }

    pub fn attach_mcast(&self, gid: &[u8; 16], qpn: u32) -> Result<()> {
        mcg::attach(&self.dev, gid, qpn)
    }

    pub fn detach_mcast(&self, gid: &[u8; 16], qpn: u32) -> Result<()> {
        mcg::detach(&self.dev, gid, qpn)
    }
}
