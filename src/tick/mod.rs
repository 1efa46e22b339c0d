pub mod handler;
pub mod queue;
pub mod timer;

pub use handler::{Attachment, TickHandler, TickPort, TickStats, TimerSlot};
pub use queue::{PendingTick, PendingTickQueue};
pub use timer::{SimulatedTimers, TimerDriver};

use crate::device::DeviceId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TickError {
    #[error("tick buffer full, dropped tick for {0}")]
    QueueOverflow(DeviceId),
    #[error("no free timer for interval {interval_us}us")]
    NoFreeTimer { interval_us: u32 },
    #[error("timer for interval {interval_us}us has no free observer slot")]
    SlotFull { interval_us: u32 },
    #[error("tick interval must be non-zero")]
    InvalidInterval,
}
