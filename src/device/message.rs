use super::{DeviceId, DeviceType};
use crate::status::SystemState;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

/// Longest accepted parameter key or value.
pub const PARAM_TEXT_LEN: usize = 16;

pub type ParamText = ArrayString<PARAM_TEXT_LEN>;

pub const MSG_STARTUP: u32 = 0x3000;
pub const MSG_SOFT_FAULT: u32 = 0x3100;
pub const MSG_HARD_FAULT: u32 = 0x3150;
pub const MSG_DISABLE: u32 = 0x3200;
pub const MSG_ENABLE: u32 = 0x3300;
pub const MSG_SET_PARAM: u32 = 0x4000;
pub const MSG_CONFIG_CHANGE: u32 = 0x4001;
pub const MSG_COMMAND: u32 = 0x4002;
pub const MSG_STATE_CHANGE: u32 = 0x4003;

/// Inter-device message. Each variant carries its own payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Startup,
    SoftFault,
    HardFault,
    Disable,
    Enable,
    SetParam { key: ParamText, value: ParamText },
    ConfigChange,
    Command(u32),
    StateChange { old: SystemState, new: SystemState },
}

impl Message {
    /// Numeric message kind, as carried in logs and on the console.
    pub fn kind(&self) -> u32 {
        match self {
            Message::Startup => MSG_STARTUP,
            Message::SoftFault => MSG_SOFT_FAULT,
            Message::HardFault => MSG_HARD_FAULT,
            Message::Disable => MSG_DISABLE,
            Message::Enable => MSG_ENABLE,
            Message::SetParam { .. } => MSG_SET_PARAM,
            Message::ConfigChange => MSG_CONFIG_CHANGE,
            Message::Command(_) => MSG_COMMAND,
            Message::StateChange { .. } => MSG_STATE_CHANGE,
        }
    }

    /// Build a `SetParam`, rejecting text that does not fit.
    pub fn set_param(key: &str, value: &str) -> Option<Self> {
        Some(Message::SetParam {
            key: ParamText::from(key).ok()?,
            value: ParamText::from(value).ok()?,
        })
    }
}

/// Receiver filter of a message. `None` matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageTarget {
    pub device_type: Option<DeviceType>,
    pub device_id: Option<DeviceId>,
}

impl MessageTarget {
    pub const fn broadcast() -> Self {
        Self { device_type: None, device_id: None }
    }

    pub const fn by_id(id: DeviceId) -> Self {
        Self { device_type: None, device_id: Some(id) }
    }

    pub const fn by_type(device_type: DeviceType) -> Self {
        Self { device_type: Some(device_type), device_id: None }
    }

    pub fn matches(&self, device_type: DeviceType, id: DeviceId) -> bool {
        self.device_type.map_or(true, |t| t == device_type) && self.device_id.map_or(true, |i| i == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kinds() {
        assert_eq!(Message::Startup.kind(), 0x3000);
        assert_eq!(Message::HardFault.kind(), 0x3150);
        assert_eq!(Message::Command(7).kind(), 0x4002);
        let msg = Message::set_param("PRELAY", "4").unwrap();
        assert_eq!(msg.kind(), 0x4000);
    }

    #[test]
    fn test_set_param_rejects_long_text() {
        assert!(Message::set_param("THIS_KEY_IS_FAR_TOO_LONG", "1").is_none());
    }

    #[test]
    fn test_target_matching() {
        let id = DeviceId::CAN_IO;
        assert!(MessageTarget::broadcast().matches(DeviceType::Io, id));
        assert!(MessageTarget::by_id(id).matches(DeviceType::Io, id));
        assert!(!MessageTarget::by_id(DeviceId::HEARTBEAT).matches(DeviceType::Io, id));
        assert!(!MessageTarget::by_type(DeviceType::Sensor).matches(DeviceType::Io, id));
    }
}
