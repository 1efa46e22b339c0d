pub mod driver;
pub mod frame;
pub mod handler;

pub use driver::{CanDriver, MailboxFilter, ReceivedFrame, VirtualCanDriver};
pub use frame::CanFrame;
pub use handler::{CanHandler, CanStats, Reception, Subscription};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two physical buses of the extension board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanBus {
    /// CAN0: EV bus (GEVCU, charger, ...)
    Ev,
    /// CAN1: the car's high speed bus (the one with the ECU)
    Car,
}

impl CanBus {
    pub fn name(self) -> &'static str {
        match self {
            CanBus::Ev => "EV",
            CanBus::Car => "car",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CanError {
    #[error("observer table full")]
    ObserverTableFull,
    #[error("no free receive mailbox")]
    NoFreeMailbox,
    #[error("identifier {0:#x} exceeds 29 bits")]
    InvalidIdentifier(u32),
    #[error("transmit queue full")]
    TxQueueFull,
    #[error("bus not initialized")]
    NotInitialized,
    #[error("invalid baud rate {0}")]
    InvalidBaudRate(u32),
}
