//! Control of the MR-Box peripheral board: serial session management, board
//! reset, ADC gain and reservoir fill calibration, and per-step orchestration
//! of the magnet, pump and PMT subsystems.

pub mod board_state;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod connection;
pub mod devices;
pub mod error;
pub mod experiment;
pub mod prompt;

pub use error::{BoardError, Result};
