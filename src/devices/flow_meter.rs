//! Coolant flow from hall-effect pulse sensors.
//!
//! The sensor pin interrupt only bumps a [`PulseCounter`]; the periodic tick
//! takes the accumulated pulses, converts them with the calibration factor and
//! reports flow rate and total volume to the GEVCU.

use crate::can::CanBus;
use crate::config::{
    CAN_ID_GEVCU_FLOW_COOL, CAN_ID_GEVCU_FLOW_HEAT, FLOW_METER_DEFAULT_CALIBRATION, IO_FLOW_METER_COOLING,
    IO_FLOW_METER_HEATER,
};
use crate::device::{Configurable, Device, DeviceContext, DeviceCore, DeviceId, DeviceType, ParamText, Tickable};
use crate::io::PinMode;
use crate::prefs::{self, ConfigError, ConfigStore, PersistentConfig, PrefHandler, CONFIG_FIELDS_OFFSET};
use core::any::Any;
use core::sync::atomic::{AtomicU16, Ordering};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const EE_CALIBRATION_FACTOR: usize = CONFIG_FIELDS_OFFSET;

/// Pulse count shared between the pin interrupt and the device.
#[derive(Debug, Clone, Default)]
pub struct PulseCounter(Arc<AtomicU16>);

impl PulseCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt side: one falling edge.
    pub fn pulse(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, pulses: u16) {
        self.0.fetch_add(pulses, Ordering::Relaxed);
    }

    /// Take the pulses counted so far and restart from zero.
    pub fn take(&self) -> u16 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMeterConfig {
    /// Sensor pulses per litre.
    pub calibration_factor: u16,
}

impl Default for FlowMeterConfig {
    fn default() -> Self {
        Self { calibration_factor: FLOW_METER_DEFAULT_CALIBRATION }
    }
}

impl PersistentConfig for FlowMeterConfig {
    fn read(prefs: &PrefHandler) -> Result<Self, ConfigError> {
        let calibration_factor = prefs.read_u16(EE_CALIBRATION_FACTOR)?;
        if calibration_factor == 0 {
            return Err(ConfigError::InvalidValue {
                key: ParamText::from("calibration").unwrap_or_default(),
                value: ParamText::from("0").unwrap_or_default(),
            });
        }
        Ok(Self { calibration_factor })
    }

    fn write(&self, prefs: &mut PrefHandler) -> Result<(), ConfigError> {
        prefs.write_u16(EE_CALIBRATION_FACTOR, self.calibration_factor)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlowStatus {
    pub flow_ml_per_sec: u32,
    pub total_ml: u32,
    pub calibration_factor: u16,
}

pub struct FlowMeter {
    core: DeviceCore,
    pin: u8,
    frame_id: u32,
    param_key: &'static str,
    counter: PulseCounter,
    config: FlowMeterConfig,
    last_tick_ms: u64,
    flow_ml_per_sec: u32,
    total_ml: u32,
}

impl FlowMeter {
    pub fn heater(counter: PulseCounter) -> Self {
        Self::new(
            DeviceCore::new(DeviceId::FLOW_METER_HEATER, "Flow Meter Heater"),
            IO_FLOW_METER_HEATER,
            CAN_ID_GEVCU_FLOW_HEAT,
            "FMHCALIB",
            counter,
        )
    }

    pub fn cooling(counter: PulseCounter) -> Self {
        Self::new(
            DeviceCore::new(DeviceId::FLOW_METER_COOLING, "Flow Meter Cooling"),
            IO_FLOW_METER_COOLING,
            CAN_ID_GEVCU_FLOW_COOL,
            "FMCCALIB",
            counter,
        )
    }

    fn new(core: DeviceCore, pin: u8, frame_id: u32, param_key: &'static str, counter: PulseCounter) -> Self {
        Self {
            core,
            pin,
            frame_id,
            param_key,
            counter,
            config: FlowMeterConfig::default(),
            last_tick_ms: 0,
            flow_ml_per_sec: 0,
            total_ml: 0,
        }
    }

    pub fn counter(&self) -> &PulseCounter {
        &self.counter
    }

    pub fn flow_ml_per_sec(&self) -> u32 {
        self.flow_ml_per_sec
    }

    pub fn flow_liter_per_min(&self) -> f32 {
        self.flow_ml_per_sec as f32 * 60.0 / 1000.0
    }

    pub fn total_ml(&self) -> u32 {
        self.total_ml
    }

    pub fn config(&self) -> &FlowMeterConfig {
        &self.config
    }

    pub fn status(&self) -> FlowStatus {
        FlowStatus {
            flow_ml_per_sec: self.flow_ml_per_sec,
            total_ml: self.total_ml,
            calibration_factor: self.config.calibration_factor,
        }
    }
}

impl Device for FlowMeter {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::FlowMeter
    }

    fn setup(&mut self, ctx: &mut DeviceContext<'_>) {
        ctx.io.set_mode(self.pin, PinMode::InputPullup);
        self.counter.take();
        self.last_tick_ms = ctx.now_ms;

        if let Err(err) = ctx.ticks.attach(self.core.id, ctx.config.tick_interval_flow_meter_us) {
            error!(device = %self.core.id, "{}", err);
            return;
        }
        info!(device = %self.core.id, "calibration factor: {} pulses per liter", self.config.calibration_factor);
        self.core.ready = true;
    }

    fn as_tickable(&mut self) -> Option<&mut dyn Tickable> {
        Some(self)
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Tickable for FlowMeter {
    fn handle_tick(&mut self, ctx: &mut DeviceContext<'_>) {
        let pulses = u64::from(self.counter.take());
        let elapsed_ms = match ctx.now_ms.saturating_sub(self.last_tick_ms) {
            0 => u64::from(ctx.config.tick_interval_flow_meter_us / 1000).max(1),
            elapsed => elapsed,
        };
        self.last_tick_ms = ctx.now_ms;

        let calibration = u64::from(self.config.calibration_factor.max(1));
        let milli_liters = pulses * 1000 / calibration;
        self.flow_ml_per_sec = u32::try_from(milli_liters * 1000 / elapsed_ms).unwrap_or(u32::MAX);
        self.total_ml = self.total_ml.wrapping_add(milli_liters as u32);

        debug!(device = %self.core.id, "flow: {}ml/sec, total: {}ml", self.flow_ml_per_sec, self.total_ml);

        let can = ctx.can(CanBus::Ev);
        let mut frame = can.prepare_output_frame(self.frame_id);
        frame.set_low(self.total_ml);
        frame.set_high(self.flow_ml_per_sec);
        if let Err(err) = can.send_frame(&frame) {
            warn!(device = %self.core.id, "unable to send flow: {}", err);
        }
    }
}

impl Configurable for FlowMeter {
    fn load_config(&mut self, store: &mut dyn ConfigStore) {
        self.config = prefs::load_or_default(store, self.core.id);
    }

    fn save_config(&self, store: &mut dyn ConfigStore) -> Result<(), ConfigError> {
        prefs::save_config(store, self.core.id, &self.config)
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        if !key.eq_ignore_ascii_case(self.param_key) {
            return Ok(false);
        }
        match value.trim().parse::<u16>() {
            Ok(factor) if factor > 0 => {
                self.config.calibration_factor = factor;
                Ok(true)
            }
            _ => Err(ConfigError::InvalidValue {
                key: ParamText::from(key).unwrap_or_default(),
                value: ParamText::from(value).unwrap_or_default(),
            }),
        }
    }
}
