//! Board-wide constants and runtime configuration.
//!
//! Capacities are fixed at compile time so that no table grows after start-up.
//! The values that an installation may want to tune live in [`BoardConfig`].

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const VERSION: &str = "GEVCU extension 2015-03-16";

// Table capacities
pub const DEV_MGR_MAX_DEVICES: usize = 20;
pub const CAN_NUM_OBSERVERS: usize = 10;
pub const NUM_TIMERS: usize = 9;
pub const TIMER_NUM_OBSERVERS: usize = 9;
pub const TICK_BUFFER_SIZE: usize = 100;
pub const MAX_NUM_TEMPERATURE_SENSORS: usize = 32;
pub const MAX_PENDING_REQUESTS: usize = 16;

// CAN controller layout: 7 filterable receive mailboxes plus one transmit mailbox
pub const CAN_NUM_MAILBOXES: usize = 8;
pub const CAN_NUM_RX_MAILBOXES: usize = 7;
pub const CAN_TX_MAILBOX: u8 = (CAN_NUM_MAILBOXES - 1) as u8;
pub const CAN_DEFAULT_BAUD_RATE: u32 = 500_000;

// Tick intervals in microseconds. Devices sharing an interval share a timer.
pub const TICK_INTERVAL_HEARTBEAT: u32 = 2_000_000;
pub const TICK_INTERVAL_TEMPERATURE: u32 = 2_000_000;
pub const TICK_INTERVAL_CAN_IO: u32 = 200_000;
pub const TICK_INTERVAL_FLOW_METER: u32 = 1_000_000;

/// Milliseconds a GEVCU status frame may be missing before CAN I/O faults.
pub const CAN_IO_MSG_TIMEOUT_MS: u64 = 1000;

// CAN identifiers exchanged with the GEVCU on the EV bus
pub const CAN_ID_GEVCU_STATUS: u32 = 0x724;
pub const CAN_ID_GEVCU_ANALOG_IO: u32 = 0x725;
pub const CAN_MASK_GEVCU: u32 = 0x7fe;
pub const CAN_MASKED_ID_GEVCU: u32 = 0x724;
pub const CAN_ID_GEVCU_EXT_TEMPERATURE: u32 = 0x728;
pub const CAN_ID_GEVCU_FLOW_HEAT: u32 = 0x729;
pub const CAN_ID_GEVCU_FLOW_COOL: u32 = 0x72a;

// Pin assignment
pub const OUTPUT_NONE: u8 = 255;
pub const BLINK_LED: u8 = 73;
pub const IO_TEMPERATURE_SENSOR: u8 = 24;
pub const IO_FLOW_METER_HEATER: u8 = 26;
pub const IO_FLOW_METER_COOLING: u8 = 27;

// Default output pins of the CAN I/O device
pub const PRECHARGE_RELAY_OUTPUT: u8 = 0;
pub const MAIN_CONTACTOR_RELAY_OUTPUT: u8 = 1;
pub const SECONDARY_CONTACTOR_RELAY_OUTPUT: u8 = 2;
pub const ENABLE_RELAY_OUTPUT: u8 = 3;
pub const BRAKE_LIGHT_OUTPUT: u8 = 4;
pub const REVERSE_LIGHT_OUTPUT: u8 = 5;
pub const COOLING_FAN_RELAY_OUTPUT: u8 = 7;

/// Pulses per litre of the stock flow sensors (some models give 450).
pub const FLOW_METER_DEFAULT_CALIBRATION: u16 = 270;

const_assert!(CAN_NUM_RX_MAILBOXES < CAN_NUM_MAILBOXES);
const_assert!(CAN_NUM_RX_MAILBOXES <= 8);
const_assert!(CAN_NUM_OBSERVERS >= CAN_NUM_RX_MAILBOXES);
const_assert!(TICK_BUFFER_SIZE > 0);
const_assert!(DEV_MGR_MAX_DEVICES <= 63);

/// Runtime-tunable board settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub ev_bus_baud_rate: u32,
    pub car_bus_baud_rate: u32,
    pub can_io_timeout_ms: u64,
    pub tick_interval_heartbeat_us: u32,
    pub tick_interval_temperature_us: u32,
    pub tick_interval_can_io_us: u32,
    pub tick_interval_flow_meter_us: u32,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            ev_bus_baud_rate: CAN_DEFAULT_BAUD_RATE,
            car_bus_baud_rate: CAN_DEFAULT_BAUD_RATE,
            can_io_timeout_ms: CAN_IO_MSG_TIMEOUT_MS,
            tick_interval_heartbeat_us: TICK_INTERVAL_HEARTBEAT,
            tick_interval_temperature_us: TICK_INTERVAL_TEMPERATURE,
            tick_interval_can_io_us: TICK_INTERVAL_CAN_IO,
            tick_interval_flow_meter_us: TICK_INTERVAL_FLOW_METER,
        }
    }
}

impl BoardConfig {
    /// Parse a JSON document; missing fields fall back to the defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Number of distinct tick intervals this configuration needs.
    pub fn distinct_tick_intervals(&self) -> usize {
        let intervals = [
            self.tick_interval_heartbeat_us,
            self.tick_interval_temperature_us,
            self.tick_interval_can_io_us,
            self.tick_interval_flow_meter_us,
        ];
        intervals
            .iter()
            .enumerate()
            .filter(|(i, interval)| !intervals[..*i].contains(interval))
            .count()
    }
}
