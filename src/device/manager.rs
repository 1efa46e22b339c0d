//! Registry of installed devices and the message bus between them.

use super::{Device, DeviceContext, DeviceId, DeviceType, Message, MessageTarget};
use crate::can::{CanBus, CanFrame};
use crate::config::DEV_MGR_MAX_DEVICES;
use core::fmt;
use heapless::Vec;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("unable to register device {0}, max number of devices reached")]
    RegistryFull(DeviceId),
    #[error("device {0} is already registered")]
    Duplicate(DeviceId),
    #[error("device id {0} is reserved")]
    InvalidId(DeviceId),
    #[error("no device with id {0}")]
    NotFound(DeviceId),
}

/// What a device can do beyond handling messages, probed once at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub tickable: bool,
    pub can_observer: bool,
    pub configurable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: &'static str,
    pub device_type: DeviceType,
    pub enabled: bool,
    pub ready: bool,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ManagerStats {
    pub messages_sent: u32,
    pub messages_unmatched: u32,
    pub ticks_delivered: u32,
    pub frames_delivered: u32,
}

struct Entry {
    device: Box<dyn Device>,
    capabilities: Capabilities,
}

pub struct DeviceManager {
    devices: Vec<Entry, DEV_MGR_MAX_DEVICES>,
    stats: ManagerStats,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self { devices: Vec::new(), stats: ManagerStats::default() }
    }

    pub fn add_device(&mut self, mut device: Box<dyn Device>) -> Result<(), DeviceError> {
        let id = device.id();
        info!(device = %id, "add device: {}", device.name());

        if !id.is_valid() {
            error!(device = %id, "device id is reserved");
            return Err(DeviceError::InvalidId(id));
        }
        if self.find(id).is_some() {
            return Err(DeviceError::Duplicate(id));
        }

        let capabilities = Capabilities {
            tickable: device.as_tickable().is_some(),
            can_observer: device.as_can_observer().is_some(),
            configurable: device.as_configurable().is_some(),
        };

        self.devices.push(Entry { device, capabilities }).map_err(|_| {
            error!(device = %id, "unable to register device, max number of devices reached");
            DeviceError::RegistryFull(id)
        })
    }

    /// Unregister a device. Its resources must have been released already.
    pub fn remove_device(&mut self, id: DeviceId) -> Option<Box<dyn Device>> {
        let index = self.find(id)?;
        debug!(device = %id, "remove device");
        Some(self.devices.remove(index).device)
    }

    /// Deliver `message` to every matching enabled device (disabled devices
    /// only receive `Enable`). Returns whether any device matched.
    pub fn send_message(&mut self, target: MessageTarget, message: &Message, ctx: &mut DeviceContext<'_>) -> bool {
        let mut matched = false;

        for entry in self.devices.iter_mut() {
            let device = entry.device.as_mut();
            if !target.matches(device.device_type(), device.id()) {
                continue;
            }
            if !device.is_enabled() && *message != Message::Enable {
                continue;
            }

            debug!(device = %device.id(), "sending msg {:#x}", message.kind());
            deliver(device, message, ctx);
            matched = true;
        }

        if matched {
            self.stats.messages_sent = self.stats.messages_sent.wrapping_add(1);
        } else {
            self.stats.messages_unmatched = self.stats.messages_unmatched.wrapping_add(1);
        }
        matched
    }

    /// Send a `SetParam` built from `key` and `value`.
    pub fn set_parameter(
        &mut self,
        target: MessageTarget,
        key: &str,
        value: &str,
        ctx: &mut DeviceContext<'_>,
    ) -> bool {
        match Message::set_param(key, value) {
            Some(message) => self.send_message(target, &message, ctx),
            None => {
                warn!("parameter {}={} is too long", key, value);
                false
            }
        }
    }

    /// Run the tick handler of `id`. Returns whether the device took the tick.
    pub fn dispatch_tick(&mut self, id: DeviceId, ctx: &mut DeviceContext<'_>) -> bool {
        let Some(index) = self.find(id) else {
            return false;
        };
        let device = self.devices[index].device.as_mut();
        if !device.is_enabled() {
            return false;
        }
        match device.as_tickable() {
            Some(tickable) => {
                tickable.handle_tick(ctx);
                self.stats.ticks_delivered = self.stats.ticks_delivered.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    /// Hand a received frame to `id`. Returns whether the device took it.
    pub fn dispatch_can_frame(
        &mut self,
        id: DeviceId,
        bus: CanBus,
        frame: &CanFrame,
        ctx: &mut DeviceContext<'_>,
    ) -> bool {
        let Some(index) = self.find(id) else {
            return false;
        };
        let device = self.devices[index].device.as_mut();
        if !device.is_enabled() {
            return false;
        }
        match device.as_can_observer() {
            Some(observer) => {
                observer.handle_can_frame(bus, frame, ctx);
                self.stats.frames_delivered = self.stats.frames_delivered.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    pub fn get_device_by_id(&self, id: DeviceId) -> Option<&dyn Device> {
        self.find(id).map(|index| self.devices[index].device.as_ref())
    }

    pub fn get_device_by_id_mut(&mut self, id: DeviceId) -> Option<&mut dyn Device> {
        let index = self.find(id)?;
        Some(self.devices[index].device.as_mut())
    }

    /// First enabled device of the given type.
    pub fn get_device_by_type(&self, device_type: DeviceType) -> Option<&dyn Device> {
        self.devices
            .iter()
            .map(|entry| entry.device.as_ref())
            .find(|device| device.is_enabled() && device.device_type() == device_type)
    }

    /// Typed access to a specific device.
    pub fn device_as<T: 'static>(&self, id: DeviceId) -> Option<&T> {
        self.get_device_by_id(id)?.as_any().downcast_ref::<T>()
    }

    pub fn device_as_mut<T: 'static>(&mut self, id: DeviceId) -> Option<&mut T> {
        self.get_device_by_id_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn count_device_type(&self, device_type: DeviceType) -> usize {
        self.devices.iter().filter(|entry| entry.device.device_type() == device_type).count()
    }

    pub fn device_list(&self) -> Vec<DeviceInfo, DEV_MGR_MAX_DEVICES> {
        self.devices
            .iter()
            .map(|entry| DeviceInfo {
                id: entry.device.id(),
                name: entry.device.name(),
                device_type: entry.device.device_type(),
                enabled: entry.device.is_enabled(),
                ready: entry.device.is_ready(),
                capabilities: entry.capabilities,
            })
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.iter().map(|entry| entry.device.id())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    fn find(&self, id: DeviceId) -> Option<usize> {
        self.devices.iter().position(|entry| entry.device.id() == id)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.ids().collect::<Vec<DeviceId, DEV_MGR_MAX_DEVICES>>())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Lifecycle handling common to all devices, then the device's own handler.
fn deliver(device: &mut dyn Device, message: &Message, ctx: &mut DeviceContext<'_>) {
    let id = device.id();

    match message {
        Message::Startup => {
            if let Some(configurable) = device.as_configurable() {
                configurable.load_config(ctx.store);
            }
            device.setup(ctx);
        }
        Message::Enable => {
            device.core_mut().enabled = true;
            if !device.is_ready() {
                if let Some(configurable) = device.as_configurable() {
                    configurable.load_config(ctx.store);
                }
                device.setup(ctx);
            }
        }
        Message::Disable => {
            if device.is_ready() {
                device.tear_down(ctx);
            }
            device.core_mut().enabled = false;
        }
        Message::SetParam { key, value } => {
            if let Some(configurable) = device.as_configurable() {
                match configurable.set_parameter(key, value) {
                    Ok(true) => {
                        info!(device = %id, "setting {} to {}", key, value);
                        if let Err(err) = configurable.save_config(ctx.store) {
                            warn!(device = %id, "unable to save configuration: {}", err);
                        }
                    }
                    Ok(false) => debug!(device = %id, "unknown parameter {}", key),
                    Err(err) => warn!(device = %id, "{}", err),
                }
            }
        }
        Message::ConfigChange => {
            if let Some(configurable) = device.as_configurable() {
                configurable.load_config(ctx.store);
            }
        }
        _ => {}
    }

    device.handle_message(message, ctx);
}
