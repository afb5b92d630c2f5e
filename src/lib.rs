//! Resource management core of an InfiniBand host channel adapter driver.
//!
//! `Hca::attach` takes the register-level `Hardware` and a `DmaAllocator`
//! and brings up the event queues, the firmware command interface and the
//! special QPs. Completion queues, queue pairs and multicast attachments are
//! created from the resulting handle. `sim` provides a software device for
//! running all of this without an adapter.
pub mod alloc;
pub mod array;
pub mod cmd;
pub mod config;
pub mod cq;
pub mod device;
pub mod eq;
pub mod error;
pub mod fw;
pub mod hw;
mod mcg;
mod mr;
pub mod qp;
pub mod sim;

pub use cmd::{CommandInterface, CommandStatus, Opcode};
pub use config::HcaConfig;
pub use cq::{CompletionQueue, CqEvent, WcOpcode, WcStatus, WorkCompletion};
pub use device::{DeviceEvent, FirmwarePorts, Hca, PortLifecycle};
pub use error::{Error, Result};
pub use hw::{DmaAllocator, DmaBuffer, Doorbell, Hardware};
pub use qp::{
    AccessFlags, AhAttr, QpAttr, QpAttrMask, QpCapability, QpEvent, QpInitAttr, QpState, QpType,
    QueuePair, RecvWr, RemoteAddr, SendOpcode, SendWr, Sge,
};
