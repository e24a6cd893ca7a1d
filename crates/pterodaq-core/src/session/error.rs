//! Session errors

use thiserror::Error;

use crate::board::BoardError;
use crate::protocol::{Command, LinkError};

/// Why a connection attempt failed
#[derive(Error, Debug)]
pub enum ConnectError {
    /// connect called on a live session
    #[error("Session is already connected")]
    AlreadyConnected,

    /// No handshake reply after every attempt
    #[error("Handshake timed out. Check if PteroDAQ firmware is installed.")]
    HandshakeTimeout,

    /// The handshake reply was not the PteroDAQ greeting
    #[error("Handshake failed (got {got:?}). Check if PteroDAQ firmware is installed.")]
    HandshakeFailed {
        /// Reply as received
        got: String,
    },

    /// Firmware speaks another protocol version
    #[error("Incorrect version: {got} present, {want} needed.")]
    VersionMismatch {
        /// Version the board reported
        got: String,
        /// Version this host speaks
        want: String,
    },

    /// Model id not in the board catalog
    #[error("Unknown board model {0}")]
    UnknownModel(u16),

    /// Version or model request went unanswered
    #[error("No response to {command} command")]
    CommandTimeout {
        /// Unanswered request
        command: Command,
    },

    /// Model response could not be resolved
    #[error("Board error: {0}")]
    Board(BoardError),

    /// Serial link failure
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

impl From<BoardError> for ConnectError {
    fn from(e: BoardError) -> Self {
        match e {
            BoardError::UnknownModel(id) => ConnectError::UnknownModel(id),
            other => ConnectError::Board(other),
        }
    }
}

/// Errors from session operations after connecting
#[derive(Error, Debug)]
pub enum SessionError {
    /// No open link
    #[error("Not connected")]
    NotConnected,

    /// start or single read before configure
    #[error("No configuration has been sent")]
    NotConfigured,

    /// Operation not allowed in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// State name at the time
        state: &'static str,
    },

    /// Operation needs sampling stopped
    #[error("Not allowed while sampling is running")]
    Running,

    /// Configuration with no channels
    #[error("At least one channel is required")]
    EmptyChannelList,

    /// Configuration exceeds a board or frame limit
    #[error("Too many channels: {0}")]
    TooManyChannels(String),

    /// Command unanswered after every retry
    #[error("{command} command failed after {attempts} attempts")]
    CommandFailed {
        /// Command that failed
        command: Command,
        /// Attempts made
        attempts: u32,
    },

    /// The board rejected a trigger type; latched until reconnect
    #[error("Illegal trigger type requested: {0}")]
    IllegalTriggerType(u8),

    /// Plan did not fit the board
    #[error("Board error: {0}")]
    Board(#[from] BoardError),

    /// Serial link failure
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Saving a recording failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
