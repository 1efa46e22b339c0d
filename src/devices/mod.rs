//! The peripherals of the extension board.

pub mod can_io;
pub mod flow_meter;
pub mod heartbeat;
pub mod temperature;

pub use can_io::{CanIo, CanIoConfig, FaultReason, Output};
pub use flow_meter::{FlowMeter, FlowMeterConfig, PulseCounter};
pub use heartbeat::Heartbeat;
pub use temperature::{SimulatedProbes, TemperatureMonitor, TemperatureSource};
