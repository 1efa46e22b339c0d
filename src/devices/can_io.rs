//! Digital outputs driven by the GEVCU status frame.
//!
//! The GEVCU broadcasts its logic I/O word and system state every few hundred
//! milliseconds. This device mirrors the word onto sixteen active-low outputs
//! and enforces the pre-charge interlock: contactors and the motor enable are
//! never energized unless this board saw the pre-charge phase itself, and the
//! device faults (all outputs off) when the GEVCU reports a later state first,
//! reports an error, or goes silent.

use crate::can::{CanBus, CanFrame};
use crate::config::{
    BRAKE_LIGHT_OUTPUT, CAN_ID_GEVCU_ANALOG_IO, CAN_ID_GEVCU_STATUS, CAN_MASKED_ID_GEVCU, CAN_MASK_GEVCU,
    COOLING_FAN_RELAY_OUTPUT, ENABLE_RELAY_OUTPUT, MAIN_CONTACTOR_RELAY_OUTPUT, OUTPUT_NONE,
    PRECHARGE_RELAY_OUTPUT, REVERSE_LIGHT_OUTPUT, SECONDARY_CONTACTOR_RELAY_OUTPUT,
};
use crate::device::{CanObserver, Configurable, Device, DeviceContext, DeviceCore, DeviceId, DeviceType, Message, ParamText, Tickable};
use crate::io::{DigitalIo, PinMode};
use crate::prefs::{self, ConfigError, ConfigStore, PersistentConfig, PrefHandler, CONFIG_FIELDS_OFFSET};
use crate::status::SystemState;
use core::any::Any;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const NUM_OUTPUTS: usize = 16;

/// Logical outputs in the order of the logic I/O word, most significant first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Output {
    PreChargeRelay = 0,
    MainContactor,
    SecondaryContactor,
    FastChargeContactor,
    EnableMotor,
    EnableCharger,
    EnableDcDc,
    EnableHeater,
    HeaterValve,
    HeaterPump,
    CoolingPump,
    CoolingFan,
    BrakeLight,
    ReverseLight,
    Warning,
    PowerLimitation,
}

impl Output {
    pub const ALL: [Output; NUM_OUTPUTS] = [
        Output::PreChargeRelay,
        Output::MainContactor,
        Output::SecondaryContactor,
        Output::FastChargeContactor,
        Output::EnableMotor,
        Output::EnableCharger,
        Output::EnableDcDc,
        Output::EnableHeater,
        Output::HeaterValve,
        Output::HeaterPump,
        Output::CoolingPump,
        Output::CoolingFan,
        Output::BrakeLight,
        Output::ReverseLight,
        Output::Warning,
        Output::PowerLimitation,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit of this output in the logic I/O word.
    pub fn bit(self) -> u16 {
        0x8000 >> self.index()
    }

    /// Name of the configuration parameter holding the output's pin.
    pub fn param_key(self) -> &'static str {
        match self {
            Output::PreChargeRelay => "PRELAY",
            Output::MainContactor => "MRELAY",
            Output::SecondaryContactor => "NRELAY",
            Output::FastChargeContactor => "FRELAY",
            Output::EnableMotor => "ENABLEM",
            Output::EnableCharger => "ENABLEC",
            Output::EnableDcDc => "ENABLED",
            Output::EnableHeater => "ENABLEH",
            Output::HeaterValve => "HEATVALV",
            Output::HeaterPump => "HEATPUMP",
            Output::CoolingPump => "COOLPUMP",
            Output::CoolingFan => "COOLFAN",
            Output::BrakeLight => "BRAKELT",
            Output::ReverseLight => "REVLT",
            Output::Warning => "WARNLT",
            Output::PowerLimitation => "PWRLIM",
        }
    }

    pub fn from_param_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|output| output.param_key().eq_ignore_ascii_case(key))
    }

    /// Outputs that close the high voltage circuit or let the motor draw from it.
    pub fn requires_pre_charge(self) -> bool {
        matches!(
            self,
            Output::MainContactor | Output::SecondaryContactor | Output::FastChargeContactor | Output::EnableMotor
        )
    }

    fn eeprom_offset(self) -> usize {
        CONFIG_FIELDS_OFFSET + self.index()
    }
}

/// Pin assignment of every output, [`OUTPUT_NONE`] for unused ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanIoConfig {
    pub pins: [u8; NUM_OUTPUTS],
}

impl CanIoConfig {
    pub fn pin(&self, output: Output) -> u8 {
        self.pins[output.index()]
    }

    pub fn set_pin(&mut self, output: Output, pin: u8) {
        self.pins[output.index()] = pin;
    }
}

impl Default for CanIoConfig {
    fn default() -> Self {
        let mut config = Self { pins: [OUTPUT_NONE; NUM_OUTPUTS] };
        config.set_pin(Output::PreChargeRelay, PRECHARGE_RELAY_OUTPUT);
        config.set_pin(Output::MainContactor, MAIN_CONTACTOR_RELAY_OUTPUT);
        config.set_pin(Output::SecondaryContactor, SECONDARY_CONTACTOR_RELAY_OUTPUT);
        config.set_pin(Output::EnableMotor, ENABLE_RELAY_OUTPUT);
        config.set_pin(Output::BrakeLight, BRAKE_LIGHT_OUTPUT);
        config.set_pin(Output::ReverseLight, REVERSE_LIGHT_OUTPUT);
        config.set_pin(Output::CoolingFan, COOLING_FAN_RELAY_OUTPUT);
        config
    }
}

impl PersistentConfig for CanIoConfig {
    fn read(prefs: &PrefHandler) -> Result<Self, ConfigError> {
        let mut config = Self { pins: [OUTPUT_NONE; NUM_OUTPUTS] };
        for output in Output::ALL {
            config.set_pin(output, prefs.read_u8(output.eeprom_offset())?);
        }
        Ok(config)
    }

    fn write(&self, prefs: &mut PrefHandler) -> Result<(), ConfigError> {
        for output in Output::ALL {
            prefs.write_u8(output.eeprom_offset(), self.pin(output))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultReason {
    RemoteError,
    PreChargeSkipped { remote_state: u8 },
    MessageTimeout { silent_ms: u64 },
    LocalError,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanIoStatus {
    pub faulted: bool,
    pub fault_reason: Option<FaultReason>,
    pub passed_pre_charge: bool,
    pub remote_state: Option<SystemState>,
    pub logic_io: u16,
    pub status_flags: u8,
    pub analog_in: [u16; 4],
    pub status_frames: u32,
}

pub struct CanIo {
    core: DeviceCore,
    config: CanIoConfig,
    /// Pins owned since the last setup. Pin changes wait for the next setup so
    /// a pin that is driven now is always released through this table.
    wired: CanIoConfig,
    faulted: bool,
    fault_reason: Option<FaultReason>,
    passed_pre_charge: bool,
    last_reception_ms: u64,
    remote_state: Option<SystemState>,
    logic_io: u16,
    status_flags: u8,
    analog_in: [u16; 4],
    status_frames: u32,
}

impl CanIo {
    pub fn new() -> Self {
        Self {
            core: DeviceCore::new(DeviceId::CAN_IO, "CanIO"),
            config: CanIoConfig::default(),
            wired: CanIoConfig::default(),
            faulted: false,
            fault_reason: None,
            passed_pre_charge: false,
            last_reception_ms: 0,
            remote_state: None,
            logic_io: 0,
            status_flags: 0,
            analog_in: [0; 4],
            status_frames: 0,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn fault_reason(&self) -> Option<FaultReason> {
        self.fault_reason
    }

    pub fn passed_pre_charge(&self) -> bool {
        self.passed_pre_charge
    }

    pub fn config(&self) -> &CanIoConfig {
        &self.config
    }

    pub fn analog_in(&self) -> [u16; 4] {
        self.analog_in
    }

    /// Whether `output` is currently energized.
    pub fn is_active(&self, output: Output) -> bool {
        !self.faulted
            && self.logic_io & output.bit() != 0
            && (self.passed_pre_charge || !output.requires_pre_charge())
    }

    pub fn status(&self) -> CanIoStatus {
        CanIoStatus {
            faulted: self.faulted,
            fault_reason: self.fault_reason,
            passed_pre_charge: self.passed_pre_charge,
            remote_state: self.remote_state,
            logic_io: self.logic_io,
            status_flags: self.status_flags,
            analog_in: self.analog_in,
            status_frames: self.status_frames,
        }
    }

    fn process_gevcu_status(&mut self, data: &[u8; 8], ctx: &mut DeviceContext<'_>) {
        let raw_state = data[4];
        self.remote_state = SystemState::from_u8(raw_state);

        match self.remote_state {
            Some(SystemState::Error) => {
                error!(device = %self.core.id, "state: error");
                self.fault(FaultReason::RemoteError, ctx);
                return;
            }
            Some(SystemState::PreCharge) => {
                if !self.passed_pre_charge {
                    info!(device = %self.core.id, "state: {}", SystemState::PreCharge);
                }
                self.passed_pre_charge = true;
            }
            Some(state) => debug!(device = %self.core.id, "state: {}", state),
            None => warn!(device = %self.core.id, "unknown state {}", raw_state),
        }

        // a reset of the extension alone must not skip the pre-charge cycle
        if !self.passed_pre_charge && raw_state > SystemState::PreCharge as u8 {
            error!(
                device = %self.core.id,
                "GEVCU reports its status is higher than 'pre-charge' but extension did not pass pre-charge cycle"
            );
            self.fault(FaultReason::PreChargeSkipped { remote_state: raw_state }, ctx);
            return;
        }

        self.logic_io = u16::from_be_bytes([data[2], data[3]]);
        self.status_flags = data[5];
        self.apply_outputs(ctx.io);

        debug!(
            device = %self.core.id,
            "pre-charge: {}, main cont: {}, sec cont: {}, fast charge: {}, enable motor: {}",
            self.is_active(Output::PreChargeRelay),
            self.is_active(Output::MainContactor),
            self.is_active(Output::SecondaryContactor),
            self.is_active(Output::FastChargeContactor),
            self.is_active(Output::EnableMotor)
        );
    }

    fn process_gevcu_analog_io(&mut self, data: &[u8; 8]) {
        for (value, bytes) in self.analog_in.iter_mut().zip(data.chunks_exact(2)) {
            *value = u16::from_be_bytes([bytes[0], bytes[1]]);
        }
    }

    /// Reset every output and stop listening. Only a new setup recovers.
    fn fault(&mut self, reason: FaultReason, ctx: &mut DeviceContext<'_>) {
        error!(device = %self.core.id, ?reason, "faulting and resetting all output, reset device to restart");

        self.faulted = true;
        self.fault_reason = Some(reason);
        self.reset_output(ctx.io);
        ctx.release(self.core.id);
        self.core.ready = false;

        if reason != FaultReason::LocalError {
            ctx.request_state(SystemState::Error);
        }
    }

    fn apply_outputs(&self, io: &mut dyn DigitalIo) {
        for output in Output::ALL {
            self.set_output(io, output, self.is_active(output));
        }
    }

    fn reset_output(&self, io: &mut dyn DigitalIo) {
        for output in Output::ALL {
            self.set_output(io, output, false);
        }
    }

    /// Active outputs are driven LOW.
    fn set_output(&self, io: &mut dyn DigitalIo, output: Output, active: bool) {
        let pin = self.wired.pin(output);
        if pin != OUTPUT_NONE {
            io.write(pin, !(active && !self.faulted));
        }
    }
}

impl Default for CanIo {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for CanIo {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Io
    }

    fn setup(&mut self, ctx: &mut DeviceContext<'_>) {
        let id = self.core.id;
        self.faulted = false;
        self.fault_reason = None;
        self.passed_pre_charge = false;
        self.remote_state = None;
        self.logic_io = 0;

        // release pins that a parameter change moved away from
        self.reset_output(ctx.io);
        self.wired = self.config;
        for output in Output::ALL {
            let pin = self.wired.pin(output);
            if pin != OUTPUT_NONE {
                ctx.io.set_mode(pin, PinMode::Output);
            }
        }
        self.reset_output(ctx.io);

        if let Err(err) = ctx.can_ev.attach(id, CAN_MASKED_ID_GEVCU, CAN_MASK_GEVCU, false) {
            error!(device = %id, "unable to listen for GEVCU status: {}", err);
            return;
        }
        if let Err(err) = ctx.ticks.attach(id, ctx.config.tick_interval_can_io_us) {
            error!(device = %id, "unable to supervise GEVCU status: {}", err);
            ctx.can_ev.detach(id, CAN_MASKED_ID_GEVCU, CAN_MASK_GEVCU);
            return;
        }

        self.last_reception_ms = ctx.now_ms;
        self.core.ready = true;
    }

    fn tear_down(&mut self, ctx: &mut DeviceContext<'_>) {
        self.reset_output(ctx.io);
        ctx.release(self.core.id);
        self.core.ready = false;
    }

    fn handle_message(&mut self, message: &Message, ctx: &mut DeviceContext<'_>) {
        if let Message::StateChange { new, .. } = message {
            match new {
                SystemState::PreCharge => self.passed_pre_charge = true,
                SystemState::Error if !self.faulted && self.core.ready => {
                    self.fault(FaultReason::LocalError, ctx);
                }
                _ => {}
            }
        }
    }

    fn as_tickable(&mut self) -> Option<&mut dyn Tickable> {
        Some(self)
    }

    fn as_can_observer(&mut self) -> Option<&mut dyn CanObserver> {
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

impl Tickable for CanIo {
    fn handle_tick(&mut self, ctx: &mut DeviceContext<'_>) {
        if self.faulted {
            return;
        }
        let silent_ms = ctx.now_ms.saturating_sub(self.last_reception_ms);
        if silent_ms > ctx.config.can_io_timeout_ms {
            error!(device = %self.core.id, silent_ms, "too many lost messages");
            self.fault(FaultReason::MessageTimeout { silent_ms }, ctx);
        }
    }
}

impl CanObserver for CanIo {
    fn handle_can_frame(&mut self, _bus: CanBus, frame: &CanFrame, ctx: &mut DeviceContext<'_>) {
        if self.faulted {
            return;
        }

        match frame.id {
            CAN_ID_GEVCU_STATUS => {
                self.status_frames = self.status_frames.wrapping_add(1);
                self.process_gevcu_status(&frame.data, ctx);
                self.last_reception_ms = ctx.now_ms;
            }
            CAN_ID_GEVCU_ANALOG_IO => self.process_gevcu_analog_io(&frame.data),
            _ => {}
        }
    }
}

impl Configurable for CanIo {
    fn load_config(&mut self, store: &mut dyn ConfigStore) {
        self.config = prefs::load_or_default(store, self.core.id);
    }

    fn save_config(&self, store: &mut dyn ConfigStore) -> Result<(), ConfigError> {
        prefs::save_config(store, self.core.id, &self.config)
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        let Some(output) = Output::from_param_key(key) else {
            return Ok(false);
        };
        let pin = value.trim().parse::<u8>().map_err(|_| ConfigError::InvalidValue {
            key: ParamText::from(key).unwrap_or_default(),
            value: ParamText::from(value).unwrap_or_default(),
        })?;
        self.config.set_pin(output, pin);
        if self.wired.pin(output) != pin {
            info!(device = %self.core.id, "{} moves to pin {} on next setup", key, pin);
        }
        Ok(true)
    }
}
