//! The main loop of the extension board.
//!
//! [`Board`] owns both CAN handlers, the tick scheduler, the digital pins, the
//! configuration store, the system status and the device registry. Interrupt
//! context only fills the pending tick queue and the CAN receive FIFOs; all
//! device code runs from [`Board::process`].

use crate::can::{CanBus, CanDriver, CanError, CanHandler, CanStats, VirtualCanDriver};
use crate::config::{BoardConfig, DEV_MGR_MAX_DEVICES, MAX_PENDING_REQUESTS, VERSION};
use crate::device::{
    Device, DeviceContext, DeviceError, DeviceId, DeviceInfo, DeviceManager, Message, MessageTarget, Outbox, Request,
};
use crate::device::manager::ManagerStats;
use crate::io::{DigitalIo, SimulatedIo};
use crate::prefs::{ConfigStore, DeviceTable, MemoryStore, StoreError};
use crate::status::{StateTransition, Status, StatusStats, SystemState};
use crate::tick::{SimulatedTimers, TickHandler, TickStats, TimerDriver};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Requests handled per [`Board::process`] call before the rest waits.
const MAX_REQUESTS_PER_PASS: usize = MAX_PENDING_REQUESTS * 4;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("CAN: {0}")]
    Can(#[from] CanError),
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Everything a device may touch, kept apart from the registry so both can be
/// borrowed at once.
struct Services<C: CanDriver, T: TimerDriver, I: DigitalIo, S: ConfigStore> {
    config: BoardConfig,
    can_ev: CanHandler<C>,
    can_car: CanHandler<C>,
    ticks: TickHandler<T>,
    io: I,
    store: S,
    status: Status,
    outbox: Outbox,
    now_us: u64,
}

impl<C: CanDriver, T: TimerDriver, I: DigitalIo, S: ConfigStore> Services<C, T, I, S> {
    fn context(&mut self) -> DeviceContext<'_> {
        DeviceContext {
            now_ms: self.now_us / 1000,
            state: self.status.system_state(),
            config: &self.config,
            can_ev: &mut self.can_ev,
            can_car: &mut self.can_car,
            ticks: &mut self.ticks,
            io: &mut self.io,
            store: &mut self.store,
            outbox: &mut self.outbox,
        }
    }

    fn can_mut(&mut self, bus: CanBus) -> &mut CanHandler<C> {
        match bus {
            CanBus::Ev => &mut self.can_ev,
            CanBus::Car => &mut self.can_car,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BoardStats {
    pub loops: u32,
    pub ticks_handled: u32,
    pub frames_handled: u32,
    pub requests_handled: u32,
}

/// Serializable snapshot of the board.
#[derive(Debug, Clone, Serialize)]
pub struct BoardTelemetry {
    pub version: &'static str,
    pub uptime_ms: u64,
    pub system_state: SystemState,
    pub status: StatusStats,
    pub can_ev: CanStats,
    pub can_car: CanStats,
    pub ticks: TickStats,
    pub pending_ticks: usize,
    pub devices: heapless::Vec<DeviceInfo, DEV_MGR_MAX_DEVICES>,
    pub messages: ManagerStats,
    pub board: BoardStats,
}

pub struct Board<C: CanDriver, T: TimerDriver, I: DigitalIo, S: ConfigStore> {
    services: Services<C, T, I, S>,
    manager: DeviceManager,
    device_table: DeviceTable,
    stats: BoardStats,
    started: bool,
}

/// A board running entirely in memory.
pub type SimBoard = Board<VirtualCanDriver, SimulatedTimers, SimulatedIo, MemoryStore>;

impl<C: CanDriver, T: TimerDriver, I: DigitalIo, S: ConfigStore> Board<C, T, I, S> {
    pub fn new(ev_driver: C, car_driver: C, timers: T, io: I, store: S, config: BoardConfig) -> Self {
        Self {
            services: Services {
                config,
                can_ev: CanHandler::new(CanBus::Ev, ev_driver),
                can_car: CanHandler::new(CanBus::Car, car_driver),
                ticks: TickHandler::new(timers),
                io,
                store,
                status: Status::new(),
                outbox: Outbox::new(),
                now_us: 0,
            },
            manager: DeviceManager::new(),
            device_table: DeviceTable::new(),
            stats: BoardStats::default(),
            started: false,
        }
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) -> Result<(), BoardError> {
        Ok(self.manager.add_device(device)?)
    }

    /// Bring up the buses, apply the persisted device table, start every
    /// enabled device and enter `Init`.
    pub fn start(&mut self) -> Result<(), BoardError> {
        info!("{}", VERSION);

        let config = &self.services.config;
        let (ev_baud, car_baud) = (config.ev_bus_baud_rate, config.car_bus_baud_rate);
        self.services.can_ev.initialize(ev_baud)?;
        self.services.can_car.initialize(car_baud)?;

        self.load_device_table()?;

        let mut ctx = self.services.context();
        self.manager.send_message(MessageTarget::broadcast(), &Message::Startup, &mut ctx);

        self.apply_state(SystemState::Init);
        self.handle_requests();
        self.started = true;
        info!(devices = self.manager.len(), "system initialized");
        Ok(())
    }

    /// Tear every device down and start over from `Startup`, as after a reset
    /// of the board alone.
    pub fn restart(&mut self) -> Result<(), BoardError> {
        info!("restarting board");
        let ids: heapless::Vec<DeviceId, DEV_MGR_MAX_DEVICES> = self.manager.ids().collect();
        for id in ids {
            let mut ctx = self.services.context();
            if let Some(device) = self.manager.get_device_by_id_mut(id) {
                if device.is_ready() {
                    device.tear_down(&mut ctx);
                }
            }
        }

        self.services.ticks.clean_buffer();
        self.services.outbox.clear();
        self.services.status = Status::new();
        self.started = false;
        self.start()
    }

    /// One pass of the main loop: pending ticks, then received frames, then
    /// whatever the devices asked for. Returns the number of events handled.
    pub fn process(&mut self) -> usize {
        let mut handled = 0;

        while let Some(id) = self.services.ticks.next_pending() {
            let mut ctx = self.services.context();
            self.manager.dispatch_tick(id, &mut ctx);
            self.stats.ticks_handled = self.stats.ticks_handled.wrapping_add(1);
            handled += 1;
        }

        for bus in [CanBus::Ev, CanBus::Car] {
            while let Some(reception) = self.services.can_mut(bus).receive() {
                for observer in &reception.observers {
                    let mut ctx = self.services.context();
                    self.manager.dispatch_can_frame(*observer, bus, &reception.frame, &mut ctx);
                }
                self.stats.frames_handled = self.stats.frames_handled.wrapping_add(1);
                handled += 1;
            }
        }

        handled += self.handle_requests();
        self.stats.loops = self.stats.loops.wrapping_add(1);
        handled
    }

    /// Request a system state change and let the devices react to it.
    pub fn set_system_state(&mut self, state: SystemState) -> SystemState {
        self.apply_state(state);
        self.handle_requests();
        self.services.status.system_state()
    }

    pub fn send_message(&mut self, target: MessageTarget, message: &Message) -> bool {
        let mut ctx = self.services.context();
        let matched = self.manager.send_message(target, message, &mut ctx);
        self.handle_requests();
        matched
    }

    pub fn set_parameter(&mut self, target: MessageTarget, key: &str, value: &str) -> bool {
        let mut ctx = self.services.context();
        let matched = self.manager.set_parameter(target, key, value, &mut ctx);
        self.handle_requests();
        matched
    }

    pub fn enable_device(&mut self, id: DeviceId) -> Result<(), BoardError> {
        self.set_device_enabled(id, true)
    }

    pub fn disable_device(&mut self, id: DeviceId) -> Result<(), BoardError> {
        self.set_device_enabled(id, false)
    }

    pub fn system_state(&self) -> SystemState {
        self.services.status.system_state()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn now_ms(&self) -> u64 {
        self.services.now_us / 1000
    }

    /// Set the board clock. Time only moves forward.
    pub fn set_time_us(&mut self, now_us: u64) {
        self.services.now_us = self.services.now_us.max(now_us);
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn device_as<D: 'static>(&self, id: DeviceId) -> Option<&D> {
        self.manager.device_as::<D>(id)
    }

    pub fn device_as_mut<D: 'static>(&mut self, id: DeviceId) -> Option<&mut D> {
        self.manager.device_as_mut::<D>(id)
    }

    pub fn device_table(&self) -> &DeviceTable {
        &self.device_table
    }

    pub fn can(&self, bus: CanBus) -> &CanHandler<C> {
        match bus {
            CanBus::Ev => &self.services.can_ev,
            CanBus::Car => &self.services.can_car,
        }
    }

    pub fn can_mut(&mut self, bus: CanBus) -> &mut CanHandler<C> {
        self.services.can_mut(bus)
    }

    pub fn ticks(&self) -> &TickHandler<T> {
        &self.services.ticks
    }

    pub fn ticks_mut(&mut self) -> &mut TickHandler<T> {
        &mut self.services.ticks
    }

    pub fn io(&self) -> &I {
        &self.services.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.services.io
    }

    pub fn store(&self) -> &S {
        &self.services.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.services.store
    }

    pub fn config(&self) -> &BoardConfig {
        &self.services.config
    }

    pub fn stats(&self) -> &BoardStats {
        &self.stats
    }

    pub fn telemetry(&self) -> BoardTelemetry {
        BoardTelemetry {
            version: VERSION,
            uptime_ms: self.now_ms(),
            system_state: self.system_state(),
            status: *self.services.status.stats(),
            can_ev: *self.services.can_ev.stats(),
            can_car: *self.services.can_car.stats(),
            ticks: *self.services.ticks.stats(),
            pending_ticks: self.services.ticks.pending(),
            devices: self.manager.device_list(),
            messages: *self.manager.stats(),
            board: self.stats,
        }
    }

    /// Move the status and broadcast a settled transition to all devices.
    fn apply_state(&mut self, requested: SystemState) -> Option<StateTransition> {
        let transition = self.services.status.set_system_state(requested)?;
        let message = Message::StateChange { old: transition.old, new: transition.new };
        let mut ctx = self.services.context();
        self.manager.send_message(MessageTarget::broadcast(), &message, &mut ctx);
        Some(transition)
    }

    fn handle_requests(&mut self) -> usize {
        let mut handled = 0;
        while handled < MAX_REQUESTS_PER_PASS {
            let Some(request) = self.services.outbox.pop_front() else {
                break;
            };
            match request {
                Request::SetSystemState(state) => {
                    self.apply_state(state);
                }
                Request::Message { target, message } => {
                    let mut ctx = self.services.context();
                    self.manager.send_message(target, &message, &mut ctx);
                }
            }
            handled += 1;
        }

        self.stats.requests_handled = self.stats.requests_handled.wrapping_add(handled as u32);
        if !self.services.outbox.is_empty() {
            warn!(pending = self.services.outbox.len(), "requests left for the next pass");
        }
        handled
    }

    fn load_device_table(&mut self) -> Result<(), BoardError> {
        let mut changed = false;
        self.device_table = match DeviceTable::load(&self.services.store) {
            Some(table) => table,
            None => {
                info!("initializing device table");
                changed = true;
                DeviceTable::new()
            }
        };

        let ids: heapless::Vec<DeviceId, DEV_MGR_MAX_DEVICES> = self.manager.ids().collect();
        for id in ids {
            let Some(device) = self.manager.get_device_by_id_mut(id) else {
                continue;
            };
            match self.device_table.is_enabled(id) {
                Some(enabled) => device.core_mut().enabled = enabled,
                None => {
                    self.device_table.set_enabled(id, device.is_enabled())?;
                    changed = true;
                }
            }
            debug!(device = %id, enabled = device.is_enabled(), "device table entry");
        }

        if changed {
            self.device_table.save(&mut self.services.store)?;
        }
        Ok(())
    }

    fn set_device_enabled(&mut self, id: DeviceId, enabled: bool) -> Result<(), BoardError> {
        if self.manager.get_device_by_id(id).is_none() {
            return Err(DeviceError::NotFound(id).into());
        }

        let message = if enabled { Message::Enable } else { Message::Disable };
        self.send_message(MessageTarget::by_id(id), &message);

        self.device_table.set_enabled(id, enabled)?;
        self.device_table.save(&mut self.services.store)?;
        info!(device = %id, enabled, "device state stored");
        Ok(())
    }
}

impl SimBoard {
    pub fn simulated(config: BoardConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    /// A simulated board whose configuration survives from an earlier run.
    pub fn with_store(config: BoardConfig, store: MemoryStore) -> Self {
        Board::new(
            VirtualCanDriver::new(),
            VirtualCanDriver::new(),
            SimulatedTimers::new(),
            SimulatedIo::new(),
            store,
            config,
        )
    }
}

impl<C: CanDriver, I: DigitalIo, S: ConfigStore> Board<C, SimulatedTimers, I, S> {
    /// Let `elapsed_us` of simulated time pass, firing the timer interrupts.
    /// Devices only run on the next [`Board::process`].
    pub fn advance(&mut self, elapsed_us: u64) -> u32 {
        self.services.now_us = self.services.now_us.saturating_add(elapsed_us);
        self.services.ticks.advance(elapsed_us)
    }

    /// Alternate `advance` and `process` in steps of `step_us`.
    pub fn run_for(&mut self, duration_us: u64, step_us: u64) -> usize {
        let step_us = step_us.max(1);
        let mut remaining = duration_us;
        let mut handled = 0;
        while remaining > 0 {
            let step = remaining.min(step_us);
            self.advance(step);
            handled += self.process();
            remaining -= step;
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{CanIo, Heartbeat};

    fn board() -> SimBoard {
        let mut board = SimBoard::simulated(BoardConfig::default());
        board.add_device(Box::new(Heartbeat::new())).unwrap();
        board.add_device(Box::new(CanIo::new())).unwrap();
        board
    }

    #[test]
    fn test_start_enters_init() {
        let mut board = board();
        board.start().unwrap();
        assert_eq!(board.system_state(), SystemState::Init);
        assert!(board.is_started());
        assert!(board.manager().get_device_by_id(DeviceId::CAN_IO).unwrap().is_ready());
    }

    #[test]
    fn test_start_persists_device_table() {
        let mut board = board();
        board.start().unwrap();
        let table = DeviceTable::load(board.store()).unwrap();
        assert_eq!(table.is_enabled(DeviceId::HEARTBEAT), Some(true));
        assert_eq!(table.is_enabled(DeviceId::CAN_IO), Some(true));
    }

    #[test]
    fn test_heartbeat_ticks_through_main_loop() {
        let mut board = board();
        board.start().unwrap();
        board.advance(2_000_000);
        board.process();
        assert_eq!(board.device_as::<Heartbeat>(DeviceId::HEARTBEAT).unwrap().beats(), 1);
    }

    #[test]
    fn test_disable_is_persisted_and_survives_restart() {
        let mut board = board();
        board.start().unwrap();
        board.disable_device(DeviceId::HEARTBEAT).unwrap();
        assert!(!board.ticks().is_attached(DeviceId::HEARTBEAT));

        board.restart().unwrap();
        let heartbeat = board.manager().get_device_by_id(DeviceId::HEARTBEAT).unwrap();
        assert!(!heartbeat.is_enabled());
        assert!(!heartbeat.is_ready());
    }

    #[test]
    fn test_unknown_device_cannot_be_enabled() {
        let mut board = board();
        assert!(matches!(
            board.enable_device(DeviceId(0x1234)),
            Err(BoardError::Device(DeviceError::NotFound(_)))
        ));
    }
}
