//! Link errors

use thiserror::Error;

/// Errors that can occur on the serial link
#[derive(Error, Debug)]
pub enum LinkError {
    /// Serial port open or configure failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No matching response within the command timeout
    #[error("No response to '{}' command", char::from(*code))]
    Timeout {
        /// Command code
        code: u8,
    },

    /// Link already closed
    #[error("Link closed")]
    Closed,

    /// Payload longer than a length byte can carry
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Frame bytes did not sum to zero
    #[error("Checksum error on {kind} frame: byte sum is {sum:#04x}")]
    ChecksumMismatch {
        /// "command" or "telemetry"
        kind: &'static str,
        /// Byte sum of the frame
        sum: u8,
    },

    /// Frame stalled before its last byte
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Frame length
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// Byte that starts no frame
    #[error("Frame marker missing: expected '!' or '*', got {0:#04x}")]
    Framing(u8),

    /// No such serial port
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Stream read or write failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl LinkError {
    /// Whether the reader loop can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::ChecksumMismatch { .. }
                | LinkError::Truncated { .. }
                | LinkError::Framing(_)
        )
    }
}

impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => LinkError::PortNotFound(e.description),
            _ => LinkError::SerialError(e.to_string()),
        }
    }
}
