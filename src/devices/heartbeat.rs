use crate::config::BLINK_LED;
use crate::device::{Device, DeviceContext, DeviceCore, DeviceId, Tickable};
use crate::io::{DigitalIo, PinMode};
use core::any::Any;
use tracing::{error, trace};

/// Blinks the board LED so a running main loop is visible.
pub struct Heartbeat {
    core: DeviceCore,
    led: bool,
    beats: u32,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self { core: DeviceCore::new(DeviceId::HEARTBEAT, "Heartbeat"), led: false, beats: 0 }
    }

    pub fn beats(&self) -> u32 {
        self.beats
    }

    pub fn led(&self) -> bool {
        self.led
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Heartbeat {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn setup(&mut self, ctx: &mut DeviceContext<'_>) {
        ctx.io.set_mode(BLINK_LED, PinMode::Output);
        if let Err(err) = ctx.ticks.attach(self.core.id, ctx.config.tick_interval_heartbeat_us) {
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

impl Tickable for Heartbeat {
    fn handle_tick(&mut self, ctx: &mut DeviceContext<'_>) {
        ctx.io.write(BLINK_LED, self.led);
        self.led = !self.led;
        self.beats = self.beats.wrapping_add(1);
        trace!(device = %self.core.id, state = %ctx.state, "heartbeat");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::Harness;

    #[test]
    fn test_led_toggles_each_tick() {
        let mut harness = Harness::new();
        let mut heartbeat = Heartbeat::new();
        heartbeat.setup(&mut harness.ctx());
        assert!(harness.io.is_output(BLINK_LED));

        heartbeat.handle_tick(&mut harness.ctx());
        assert!(!harness.io.read(BLINK_LED));
        heartbeat.handle_tick(&mut harness.ctx());
        assert!(harness.io.read(BLINK_LED));
        assert_eq!(heartbeat.beats(), 2);
    }
}
