//! System state machine.
//!
//! The board follows the state of the GEVCU. Only the edges listed in
//! [`is_transition_allowed`] are legal; anything else (or an explicit request
//! for [`SystemState::Error`]) lands in `Error`, from where only `Init` leads
//! back.

use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemState {
    Startup = 0,
    Init = 1,
    PreCharge = 2,
    PreCharged = 3,
    BatteryHeating = 4,
    Charging = 5,
    Charged = 6,
    Ready = 7,
    Running = 8,
    Shutdown = 9,
    Error = 99,
}

impl SystemState {
    pub const ALL: [SystemState; 11] = [
        SystemState::Startup,
        SystemState::Init,
        SystemState::PreCharge,
        SystemState::PreCharged,
        SystemState::BatteryHeating,
        SystemState::Charging,
        SystemState::Charged,
        SystemState::Ready,
        SystemState::Running,
        SystemState::Shutdown,
        SystemState::Error,
    ];

    /// Decode the state byte of a GEVCU status frame.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| *state as u8 == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SystemState::Startup => "unknown",
            SystemState::Init => "init",
            SystemState::PreCharge => "pre-charge",
            SystemState::PreCharged => "pre-charged",
            SystemState::BatteryHeating => "battery heating",
            SystemState::Charging => "charging",
            SystemState::Charged => "charged",
            SystemState::Ready => "ready",
            SystemState::Running => "running",
            SystemState::Shutdown => "shutdown",
            SystemState::Error => "error",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal edges of the state machine. Requests for `Error` are handled apart.
pub fn is_transition_allowed(from: SystemState, to: SystemState) -> bool {
    use SystemState::*;

    matches!(
        (from, to),
        (Startup, Init)
            | (Init, PreCharge)
            | (PreCharge, PreCharged)
            | (PreCharged, Ready)
            | (BatteryHeating, Charging | Ready)
            | (Charging, Charged | Ready)
            | (Charged, Ready)
            | (Ready, Running | Charging | BatteryHeating)
            | (Running, Ready)
            | (Error, Init)
    )
}

/// Outcome of a state request that changed the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub old: SystemState,
    pub new: SystemState,
    pub requested: SystemState,
}

impl StateTransition {
    pub fn accepted(&self) -> bool {
        self.new == self.requested
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusStats {
    pub transitions: u32,
    pub rejected: u32,
}

#[derive(Debug, Clone)]
pub struct Status {
    state: SystemState,
    stats: StatusStats,
}

impl Status {
    pub fn new() -> Self {
        Self { state: SystemState::Startup, stats: StatusStats::default() }
    }

    pub fn system_state(&self) -> SystemState {
        self.state
    }

    /// Request a new state.
    ///
    /// Returns `None` when already in `requested`. Otherwise the state moves to
    /// `requested` if the edge is legal and to `Error` if not; the caller is
    /// responsible for broadcasting the returned transition.
    pub fn set_system_state(&mut self, requested: SystemState) -> Option<StateTransition> {
        let old = self.state;
        if old == requested {
            return None;
        }

        if requested == SystemState::Error {
            error!("switching from system state '{}' to 'error'", old);
            self.state = SystemState::Error;
        } else if is_transition_allowed(old, requested) {
            info!("switching to system state '{}'", requested);
            self.state = requested;
        } else {
            error!("switching from system state '{}' to '{}' is not allowed", old, requested);
            self.state = SystemState::Error;
            self.stats.rejected = self.stats.rejected.wrapping_add(1);
        }

        self.stats.transitions = self.stats.transitions.wrapping_add(1);
        Some(StateTransition { old, new: self.state, requested })
    }

    pub fn stats(&self) -> &StatusStats {
        &self.stats
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_in_startup() {
        assert_eq!(Status::new().system_state(), SystemState::Startup);
    }

    #[test]
    fn test_legal_path_to_running() {
        let mut status = Status::new();
        for state in [
            SystemState::Init,
            SystemState::PreCharge,
            SystemState::PreCharged,
            SystemState::Ready,
            SystemState::Running,
        ] {
            let transition = status.set_system_state(state).unwrap();
            assert!(transition.accepted());
            assert_eq!(status.system_state(), state);
        }
        assert_eq!(status.stats().rejected, 0);
    }

    #[test]
    fn test_illegal_request_forces_error() {
        let mut status = Status::new();
        status.set_system_state(SystemState::Init);
        let transition = status.set_system_state(SystemState::Running).unwrap();

        assert_eq!(transition.old, SystemState::Init);
        assert_eq!(transition.new, SystemState::Error);
        assert!(!transition.accepted());
        assert_eq!(status.system_state(), SystemState::Error);
    }

    #[test]
    fn test_same_state_request_is_noop() {
        let mut status = Status::new();
        assert!(status.set_system_state(SystemState::Startup).is_none());
        assert_eq!(status.stats().transitions, 0);
    }

    #[test]
    fn test_error_only_recovers_to_init() {
        let mut status = Status::new();
        status.set_system_state(SystemState::Error);
        status.set_system_state(SystemState::Ready);
        assert_eq!(status.system_state(), SystemState::Error);
        assert!(status.set_system_state(SystemState::Init).unwrap().accepted());
    }

    #[test]
    fn test_transition_table_is_exhaustive() {
        let legal = SystemState::ALL
            .iter()
            .flat_map(|from| SystemState::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| is_transition_allowed(*from, *to))
            .count();
        assert_eq!(legal, 14);
        assert!(!is_transition_allowed(SystemState::Shutdown, SystemState::Init));
    }

    #[test]
    fn test_state_wire_values() {
        assert_eq!(SystemState::from_u8(2), Some(SystemState::PreCharge));
        assert_eq!(SystemState::from_u8(99), Some(SystemState::Error));
        assert_eq!(SystemState::from_u8(42), None);
        assert_eq!(SystemState::Running as u8, 8);
    }
}
