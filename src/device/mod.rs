//! Device abstraction shared by everything registered with the board.
//!
//! A device is identified by a [`DeviceId`] and reacts to lifecycle messages.
//! What else it can do is discovered through the capability accessors of
//! [`Device`]: periodic ticks ([`Tickable`]), CAN frames ([`CanObserver`]) and
//! persisted parameters ([`Configurable`]).

pub mod context;
pub mod manager;
pub mod message;

pub use context::{DeviceContext, Outbox, Request};
pub use manager::{Capabilities, DeviceError, DeviceInfo, DeviceManager};
pub use message::{Message, MessageTarget, ParamText};

use crate::can::{CanBus, CanFrame};
use crate::prefs::{ConfigError, ConfigStore};
use core::any::Any;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Unique 15-bit identity of a piece of hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl DeviceId {
    pub const SYSTEM: DeviceId = DeviceId(0x5000);
    pub const HEARTBEAT: DeviceId = DeviceId(0x5001);
    pub const TEMPERATURE: DeviceId = DeviceId(0x5002);
    pub const CAN_IO: DeviceId = DeviceId(0x5003);
    pub const FLOW_METER_COOLING: DeviceId = DeviceId(0x5004);
    pub const FLOW_METER_HEATER: DeviceId = DeviceId(0x5005);

    /// Ids must leave bit 15 free for the enabled flag of the device table.
    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 & 0x8000 == 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    None,
    Sensor,
    Io,
    FlowMeter,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::None => "none",
            DeviceType::Sensor => "sensor",
            DeviceType::Io => "io",
            DeviceType::FlowMeter => "flow meter",
        };
        f.write_str(name)
    }
}

/// State every device carries.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCore {
    pub id: DeviceId,
    pub name: &'static str,
    pub enabled: bool,
    pub ready: bool,
}

impl DeviceCore {
    pub fn new(id: DeviceId, name: &'static str) -> Self {
        Self { id, name, enabled: true, ready: false }
    }
}

pub trait Device {
    fn core(&self) -> &DeviceCore;
    fn core_mut(&mut self) -> &mut DeviceCore;

    fn device_type(&self) -> DeviceType {
        DeviceType::None
    }

    fn id(&self) -> DeviceId {
        self.core().id
    }

    fn name(&self) -> &'static str {
        self.core().name
    }

    fn is_enabled(&self) -> bool {
        self.core().enabled
    }

    fn is_ready(&self) -> bool {
        self.core().ready
    }

    /// Claim pins, subscriptions and timers. Runs on `Startup` and `Enable`.
    fn setup(&mut self, _ctx: &mut DeviceContext<'_>) {
        self.core_mut().ready = true;
    }

    /// Give back everything claimed in [`Device::setup`].
    fn tear_down(&mut self, ctx: &mut DeviceContext<'_>) {
        let id = self.id();
        ctx.release(id);
        self.core_mut().ready = false;
    }

    /// Messages other than the lifecycle ones handled by the manager.
    fn handle_message(&mut self, _message: &Message, _ctx: &mut DeviceContext<'_>) {}

    fn as_tickable(&mut self) -> Option<&mut dyn Tickable> {
        None
    }

    fn as_can_observer(&mut self) -> Option<&mut dyn CanObserver> {
        None
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait Tickable {
    fn handle_tick(&mut self, ctx: &mut DeviceContext<'_>);
}

pub trait CanObserver {
    fn handle_can_frame(&mut self, bus: CanBus, frame: &CanFrame, ctx: &mut DeviceContext<'_>);
}

pub trait Configurable {
    /// Load from `store`, falling back to defaults on a missing or corrupt block.
    fn load_config(&mut self, store: &mut dyn ConfigStore);
    fn save_config(&self, store: &mut dyn ConfigStore) -> Result<(), ConfigError>;

    /// Apply `key = value`. `Ok(false)` means the key is not one of ours.
    fn set_parameter(&mut self, key: &str, value: &str) -> Result<bool, ConfigError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Owned services for driving a device outside the board.

    use super::*;
    use crate::can::{CanHandler, VirtualCanDriver};
    use crate::config::BoardConfig;
    use crate::io::SimulatedIo;
    use crate::prefs::MemoryStore;
    use crate::status::SystemState;
    use crate::tick::{SimulatedTimers, TickHandler};

    pub struct Harness {
        pub now_ms: u64,
        pub state: SystemState,
        pub config: BoardConfig,
        pub can_ev: CanHandler<VirtualCanDriver>,
        pub can_car: CanHandler<VirtualCanDriver>,
        pub ticks: TickHandler<SimulatedTimers>,
        pub io: SimulatedIo,
        pub store: MemoryStore,
        pub outbox: Outbox,
    }

    impl Harness {
        pub fn new() -> Self {
            let mut can_ev = CanHandler::new(CanBus::Ev, VirtualCanDriver::new());
            let mut can_car = CanHandler::new(CanBus::Car, VirtualCanDriver::new());
            let _ = can_ev.initialize(500_000);
            let _ = can_car.initialize(500_000);
            Self {
                now_ms: 0,
                state: SystemState::Init,
                config: BoardConfig::default(),
                can_ev,
                can_car,
                ticks: TickHandler::new(SimulatedTimers::new()),
                io: SimulatedIo::new(),
                store: MemoryStore::new(),
                outbox: Outbox::new(),
            }
        }

        pub fn ctx(&mut self) -> DeviceContext<'_> {
            DeviceContext {
                now_ms: self.now_ms,
                state: self.state,
                config: &self.config,
                can_ev: &mut self.can_ev,
                can_car: &mut self.can_car,
                ticks: &mut self.ticks,
                io: &mut self.io,
                store: &mut self.store,
                outbox: &mut self.outbox,
            }
        }

        pub fn sent(&mut self) -> Option<CanFrame> {
            self.can_ev.driver_mut().pop_transmitted()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::CAN_IO.to_string(), "0x5003");
    }

    #[test]
    fn test_device_id_validity() {
        assert!(DeviceId::HEARTBEAT.is_valid());
        assert!(!DeviceId(0).is_valid());
        assert!(!DeviceId(0x8001).is_valid());
    }
}
