//! Temperature probes reported to the GEVCU.

use crate::can::CanBus;
use crate::config::{CAN_ID_GEVCU_EXT_TEMPERATURE, MAX_NUM_TEMPERATURE_SENSORS};
use crate::device::{Device, DeviceContext, DeviceCore, DeviceId, DeviceType, Tickable};
use core::any::Any;
use heapless::Vec;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Probes reported per frame, one byte each.
pub const PROBES_PER_FRAME: usize = 8;

/// Offset added to degrees Celsius on the wire.
pub const TEMPERATURE_OFFSET: f32 = 50.0;

/// A bus of temperature probes.
pub trait TemperatureSource {
    fn sensor_count(&self) -> usize;

    /// Start a conversion whose results are read on the next tick.
    fn prepare(&mut self) {}

    fn read_celsius(&mut self, index: usize) -> Option<f32>;
}

/// Probes whose values are set from outside.
#[derive(Debug, Clone, Default)]
pub struct SimulatedProbes {
    readings: Vec<f32, MAX_NUM_TEMPERATURE_SENSORS>,
}

impl SimulatedProbes {
    pub fn new(readings: &[f32]) -> Self {
        Self { readings: readings.iter().copied().take(MAX_NUM_TEMPERATURE_SENSORS).collect() }
    }

    pub fn set(&mut self, index: usize, celsius: f32) {
        if let Some(reading) = self.readings.get_mut(index) {
            *reading = celsius;
        }
    }
}

impl TemperatureSource for SimulatedProbes {
    fn sensor_count(&self) -> usize {
        self.readings.len()
    }

    fn read_celsius(&mut self, index: usize) -> Option<f32> {
        self.readings.get(index).copied()
    }
}

/// Wire encoding of one reading: whole degrees offset by 50, saturated to a byte.
pub fn encode_temperature(celsius: f32) -> u8 {
    (celsius.round() + TEMPERATURE_OFFSET).clamp(0.0, 255.0) as u8
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureStatus {
    pub readings: Vec<f32, MAX_NUM_TEMPERATURE_SENSORS>,
    pub minimum: Option<f32>,
    pub maximum: Option<f32>,
}

pub struct TemperatureMonitor<S: TemperatureSource> {
    core: DeviceCore,
    source: S,
    readings: Vec<f32, MAX_NUM_TEMPERATURE_SENSORS>,
}

impl<S: TemperatureSource> TemperatureMonitor<S> {
    pub fn new(source: S) -> Self {
        Self { core: DeviceCore::new(DeviceId::TEMPERATURE, "Temperature Sensors"), source, readings: Vec::new() }
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn readings(&self) -> &[f32] {
        &self.readings
    }

    pub fn minimum(&self) -> Option<f32> {
        self.readings.iter().copied().reduce(f32::min)
    }

    pub fn maximum(&self) -> Option<f32> {
        self.readings.iter().copied().reduce(f32::max)
    }

    pub fn status(&self) -> TemperatureStatus {
        TemperatureStatus { readings: self.readings.clone(), minimum: self.minimum(), maximum: self.maximum() }
    }
}

impl<S: TemperatureSource + 'static> Device for TemperatureMonitor<S> {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Sensor
    }

    fn setup(&mut self, ctx: &mut DeviceContext<'_>) {
        let count = self.source.sensor_count().min(MAX_NUM_TEMPERATURE_SENSORS);
        info!(device = %self.core.id, "found {} temperature sensors", count);
        self.readings.clear();
        self.source.prepare();

        if let Err(err) = ctx.ticks.attach(self.core.id, ctx.config.tick_interval_temperature_us) {
            error!(device = %self.core.id, "{}", err);
            return;
        }
        self.core.ready = true;
    }

    fn as_tickable(&mut self) -> Option<&mut dyn Tickable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<S: TemperatureSource> Tickable for TemperatureMonitor<S> {
    fn handle_tick(&mut self, ctx: &mut DeviceContext<'_>) {
        let can = ctx.can(CanBus::Ev);
        let mut frame = can.prepare_output_frame(CAN_ID_GEVCU_EXT_TEMPERATURE);

        self.readings.clear();
        let count = self.source.sensor_count().min(MAX_NUM_TEMPERATURE_SENSORS);
        for index in 0..count {
            let Some(celsius) = self.source.read_celsius(index) else {
                break;
            };
            debug!(device = %self.core.id, "sensor #{}: {:.1} C", index, celsius);
            if index < PROBES_PER_FRAME {
                frame.data[index] = encode_temperature(celsius);
            }
            // count is capped at the capacity
            let _ = self.readings.push(celsius);
        }

        if let Err(err) = can.send_frame(&frame) {
            warn!(device = %self.core.id, "unable to send temperatures: {}", err);
        }

        self.source.prepare();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::Harness;

    #[test]
    fn test_encoding_saturates() {
        assert_eq!(encode_temperature(21.4), 71);
        assert_eq!(encode_temperature(21.5), 72);
        assert_eq!(encode_temperature(-60.0), 0);
        assert_eq!(encode_temperature(250.0), 255);
    }

    #[test]
    fn test_tick_sends_first_eight_probes() {
        let mut harness = Harness::new();
        let readings: std::vec::Vec<f32> = (0..10).map(|i| i as f32 * 10.0 - 20.0).collect();
        let mut monitor = TemperatureMonitor::new(SimulatedProbes::new(&readings));
        monitor.setup(&mut harness.ctx());
        monitor.handle_tick(&mut harness.ctx());

        let frame = harness.sent().unwrap();
        assert_eq!(frame.id, CAN_ID_GEVCU_EXT_TEMPERATURE);
        assert_eq!(frame.payload(), &[30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(monitor.readings().len(), 10);
        assert_eq!(monitor.minimum(), Some(-20.0));
        assert_eq!(monitor.maximum(), Some(70.0));
    }

    #[test]
    fn test_no_probes() {
        let mut harness = Harness::new();
        let mut monitor = TemperatureMonitor::new(SimulatedProbes::default());
        monitor.setup(&mut harness.ctx());
        monitor.handle_tick(&mut harness.ctx());
        assert_eq!(monitor.minimum(), None);
        assert_eq!(harness.sent().unwrap().payload(), &[0; 8]);
    }
}
