use super::{DeviceId, Message, MessageTarget};
use crate::can::handler::CanPort;
use crate::can::CanBus;
use crate::config::{BoardConfig, MAX_PENDING_REQUESTS};
use crate::io::DigitalIo;
use crate::prefs::ConfigStore;
use crate::status::SystemState;
use crate::tick::TickPort;
use heapless::Deque;
use tracing::warn;

/// Work a device asks the board to do once the current event is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    SetSystemState(SystemState),
    Message { target: MessageTarget, message: Message },
}

pub type Outbox = Deque<Request, MAX_PENDING_REQUESTS>;

/// Board services lent to a device for the duration of one event.
pub struct DeviceContext<'a> {
    pub now_ms: u64,
    pub state: SystemState,
    pub config: &'a BoardConfig,
    pub can_ev: &'a mut dyn CanPort,
    pub can_car: &'a mut dyn CanPort,
    pub ticks: &'a mut dyn TickPort,
    pub io: &'a mut dyn DigitalIo,
    pub store: &'a mut dyn ConfigStore,
    pub outbox: &'a mut Outbox,
}

impl<'a> DeviceContext<'a> {
    pub fn can(&mut self, bus: CanBus) -> &mut (dyn CanPort + 'a) {
        match bus {
            CanBus::Ev => &mut *self.can_ev,
            CanBus::Car => &mut *self.can_car,
        }
    }

    /// Ask for a system state change. Applied after the current event.
    pub fn request_state(&mut self, state: SystemState) {
        self.push(Request::SetSystemState(state));
    }

    /// Queue a message for other devices.
    pub fn post(&mut self, target: MessageTarget, message: Message) {
        self.push(Request::Message { target, message });
    }

    /// Drop every CAN subscription and tick registration of `id`.
    pub fn release(&mut self, id: DeviceId) {
        self.can_ev.detach_all(id);
        self.can_car.detach_all(id);
        self.ticks.detach(id);
    }

    fn push(&mut self, request: Request) {
        if let Err(request) = self.outbox.push_back(request) {
            warn!("request queue full, dropping {:?}", request);
        }
    }
}
