use thiserror::Error;

use crate::cmd::{CommandStatus, Opcode};
use crate::qp::{QpAttrMask, QpState};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid QP transition {from:?} -> {to:?}")]
    InvalidTransition { from: QpState, to: QpState },
    #[error("missing required QP attributes: {0:?}")]
    MissingAttribute(QpAttrMask),
    #[error("QP attributes not allowed for this transition: {0:?}")]
    ExtraneousAttribute(QpAttrMask),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(&'static str),
    #[error("capacity {0} is not a power of two")]
    InvalidCapacity(u32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("operation not valid in the current QP state")]
    InvalidState,
    #[error("object not found")]
    NotFound,
    #[error("object still in use")]
    InUse,

    #[error("no free {0} left")]
    ResourceExhausted(&'static str),
    #[error("out of memory")]
    OutOfMemory,
    #[error("work queue full")]
    QueueFull,

    #[error("firmware rejected {opcode:?}: {status:?}")]
    Firmware { opcode: Opcode, status: CommandStatus },
    #[error("command register still busy, cannot post {opcode:?}")]
    Busy { opcode: Opcode },
    #[error("{opcode:?} did not complete in time")]
    Timeout { opcode: Opcode },
    #[error("command interface aborted")]
    Interrupted,

    #[error("DMA: {0}")]
    Dma(#[from] std::io::Error),
    #[cfg(feature = "serde")]
    #[error("config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// The command may or may not have taken effect on the device.
    ///
    /// Non-idempotent operations that fail this way leave the object in an
    /// unknown state: the firmware may still complete the command later.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Error::Busy { .. } | Error::Timeout { .. })
    }

    /// The status byte the firmware returned, if it got that far.
    pub fn firmware_status(&self) -> Option<CommandStatus> {
        match self {
            Error::Firmware { status, .. } => Some(*status),
            _ => None,
        }
    }
}
