//! # GEVCU CAN I/O Extension
//!
//! The core of the CAN I/O extension board of the GEVCU electric vehicle
//! controller: CAN frame dispatch, periodic tick scheduling, device lifecycle
//! and the system state machine with its pre-charge interlock.
//!
//! ## Features
//!
//! - **Frame dispatch**: mask/id subscriptions backed by a bounded pool of
//!   receive mailboxes, fan-out to every matching observer
//! - **Tick scheduling**: observers with the same interval share one timer,
//!   interrupt context only fills a bounded pending queue
//! - **Device registry**: targeted and broadcast messages, persisted
//!   enabled/disabled table
//! - **State machine**: strict transition table, every illegal request ends
//!   in `Error`
//! - **Embedded-friendly**: fixed capacities, no growth after start-up
//!
//! ## Quick Start
//!
//! ```rust
//! use gevcu_ext::board::SimBoard;
//! use gevcu_ext::config::BoardConfig;
//! use gevcu_ext::devices::{CanIo, Heartbeat};
//! use gevcu_ext::status::SystemState;
//!
//! let mut board = SimBoard::simulated(BoardConfig::default());
//! board.add_device(Box::new(Heartbeat::new())).unwrap();
//! board.add_device(Box::new(CanIo::new())).unwrap();
//! board.start().unwrap();
//! assert_eq!(board.system_state(), SystemState::Init);
//!
//! // 100 ms of simulated time in 10 ms steps
//! board.run_for(100_000, 10_000);
//! ```
//!
//! ## Architecture
//!
//! - [`board`] - Main loop and public API
//! - [`can`] - Frames, bus drivers and the observer registry
//! - [`tick`] - Timer slots and the pending tick queue
//! - [`device`] - Device traits, registry and messages
//! - [`devices`] - The peripherals of the board
//! - [`status`] - System state machine
//! - [`prefs`] - Persistent configuration blocks
//! - [`io`] - Digital pins

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod board;
pub mod can;
pub mod config;
pub mod device;
pub mod devices;
pub mod io;
pub mod prefs;
pub mod status;
pub mod tick;

// Re-export main public types for convenience
pub use board::{Board, BoardError, SimBoard};
pub use can::{CanBus, CanFrame, CanHandler};
pub use device::{Device, DeviceId, DeviceManager, Message, MessageTarget};
pub use status::{Status, SystemState};
pub use tick::TickHandler;
