//! Protocol commands
//!
//! Defines the commands understood by the PteroDAQ firmware and the error
//! reports it can send without being asked.

use serde::{Deserialize, Serialize};

/// Reserved response code marking an asynchronous device error report
pub const ERROR_CODE: u8 = b'E';

/// Commands sent from host to board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Handshake ('H'); the board answers `DAQ`
    Handshake,

    /// Protocol version ('V')
    Version,

    /// Board model and calibration bytes ('M')
    Model,

    /// Stop continuous sampling ('S')
    Stop,

    /// Force a single telemetry frame ('I')
    SingleRead,

    /// Begin continuous sampling ('G')
    Go,

    /// Upload a configuration blob ('C')
    Configure,
}

impl Command {
    /// All commands, in no particular order
    pub const ALL: [Command; 7] = [
        Command::Handshake,
        Command::Version,
        Command::Model,
        Command::Stop,
        Command::SingleRead,
        Command::Go,
        Command::Configure,
    ];

    /// Command byte on the wire
    pub fn code(&self) -> u8 {
        match self {
            Command::Handshake => b'H',
            Command::Version => b'V',
            Command::Model => b'M',
            Command::Stop => b'S',
            Command::SingleRead => b'I',
            Command::Go => b'G',
            Command::Configure => b'C',
        }
    }

    /// Look up a command from its wire byte
    pub fn from_code(code: u8) -> Option<Command> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Human-readable name for log lines and errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::Handshake => "handshake",
            Command::Version => "version",
            Command::Model => "model",
            Command::Stop => "stop",
            Command::SingleRead => "single read",
            Command::Go => "go",
            Command::Configure => "configure",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ('{}')", self.name(), char::from(self.code()))
    }
}

/// Error reported by the board in an error frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Next trigger arrived before the previous sample finished
    TriggerOverrun,

    /// Configuration requested a trigger type the firmware does not know
    IllegalTriggerType(u8),

    /// An error code this host does not recognize
    Unknown(u8),
}

impl DeviceErrorKind {
    /// Kind byte for a trigger overrun
    pub const TRIGGER_OVERRUN: u8 = 1;

    /// Kind byte for an illegal trigger type
    pub const ILLEGAL_TRIGGER: u8 = 2;

    /// Parse an error payload; `None` if the payload is empty
    pub fn parse(payload: &[u8]) -> Option<DeviceErrorKind> {
        let kind = *payload.first()?;
        Some(match kind {
            Self::TRIGGER_OVERRUN => DeviceErrorKind::TriggerOverrun,
            Self::ILLEGAL_TRIGGER => {
                DeviceErrorKind::IllegalTriggerType(payload.get(1).copied().unwrap_or(0))
            }
            other => DeviceErrorKind::Unknown(other),
        })
    }

    /// Encode as an error payload (as the firmware sends it)
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            DeviceErrorKind::TriggerOverrun => vec![Self::TRIGGER_OVERRUN],
            DeviceErrorKind::IllegalTriggerType(value) => vec![Self::ILLEGAL_TRIGGER, *value],
            DeviceErrorKind::Unknown(kind) => vec![*kind],
        }
    }
}
