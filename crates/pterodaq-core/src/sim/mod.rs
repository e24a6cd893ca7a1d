//! Simulated Hardware
//!
//! An in-memory serial link and a board emulator on its far end, for tests
//! and the CLI demo mode.

mod device;
pub mod pipe;

pub use device::{SimConfig, SimTrigger, SimulatedBoard};
pub use pipe::{duplex, PipeEnd};

use thiserror::Error;

use crate::board::BoardError;

/// Why a simulated board could not start
#[derive(Error, Debug)]
pub enum SimError {
    /// Model response did not resolve
    #[error("Board error: {0}")]
    Board(#[from] BoardError),

    /// Emulator thread could not be spawned
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
