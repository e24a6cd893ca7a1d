//! Serial Protocol Communication
//!
//! Implements the PteroDAQ framed command/response protocol.
//!
//! Every frame carries a trailing checksum byte chosen so that the unsigned
//! byte sum of the whole frame is zero modulo 256. Command and response frames
//! start with `!`, telemetry frames with `*`. Responses, device error reports
//! and telemetry all share the one stream and are separated by the background
//! reader in [`link`].

pub mod commands;
mod error;
pub mod link;
pub mod packet;
pub mod serial;
pub mod stream;

pub use commands::{Command, DeviceErrorKind, ERROR_CODE};
pub use error::LinkError;
pub use link::{LinkChannel, LinkCounters, LinkEvent, LinkOptions};
pub use packet::{CommandFrame, Frame, FrameReader, PayloadBuilder, TelemetryFrame};
pub use serial::{
    clear_buffers, configure_port, list_ports, open_port, port_names, reset_and_open, PortInfo,
    PortWatcher,
};
pub use stream::{ByteStream, SerialChannel};

/// Baud rate used by the firmware UART (ignored by true USB boards)
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Time to wait for a matching command response
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// Read timeout of the underlying stream; bounds how long link teardown waits
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Time allowed for the rest of a frame once its prefix has arrived
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1000;

/// Attempts made for one command before the caller gives up
pub const DEFAULT_COMMAND_ATTEMPTS: u32 = 3;

/// Maximum payload of a command or telemetry frame
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// Leading byte of command, response and error frames
pub const COMMAND_MARKER: u8 = b'!';

/// Leading byte of telemetry frames
pub const TELEMETRY_MARKER: u8 = b'*';

/// Protocol version this engine speaks; the board must report exactly this
pub const PROTOCOL_VERSION: &[u8] = b"v0.2";

/// Payload of a successful handshake response
pub const HANDSHAKE_REPLY: &[u8] = b"DAQ";
