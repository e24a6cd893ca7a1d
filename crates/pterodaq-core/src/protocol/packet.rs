//! Frame encoding/decoding
//!
//! Frame formats:
//! - command/response: `'!' code len payload[len] checksum`
//! - telemetry:        `'*' len payload[len] checksum`
//!
//! The checksum byte makes the unsigned sum of every byte in the frame,
//! markers and checksum included, congruent to zero modulo 256. A response
//! whose code is [`ERROR_CODE`] is a device error report, never a reply.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read};
use std::time::{Duration, Instant};

use super::{LinkError, COMMAND_MARKER, ERROR_CODE, MAX_PAYLOAD_SIZE, TELEMETRY_MARKER};

/// Byte that completes `bytes` to a zero sum
pub fn checksum(bytes: &[u8]) -> u8 {
    byte_sum(bytes).wrapping_neg()
}

/// Unsigned byte sum modulo 256
pub fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A command, response or error frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command byte
    pub code: u8,
    /// Frame payload
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame, rejecting payloads that do not fit the length byte
    pub fn new(code: u8, payload: impl Into<Vec<u8>>) -> Result<Self, LinkError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { code, payload })
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        bytes.push(COMMAND_MARKER);
        bytes.push(self.code);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&bytes));
        bytes
    }

    /// Decode a complete frame from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, LinkError> {
        if data.len() < 4 {
            return Err(LinkError::Truncated {
                expected: 4,
                actual: data.len(),
            });
        }
        if data[0] != COMMAND_MARKER {
            return Err(LinkError::Framing(data[0]));
        }
        let length = data[2] as usize;
        if data.len() < 4 + length {
            return Err(LinkError::Truncated {
                expected: 4 + length,
                actual: data.len(),
            });
        }
        let frame = &data[..4 + length];
        let sum = byte_sum(frame);
        if sum != 0 {
            return Err(LinkError::ChecksumMismatch {
                kind: "command",
                sum,
            });
        }
        Ok(Self {
            code: data[1],
            payload: data[3..3 + length].to_vec(),
        })
    }

    /// Whether this frame is a device error report
    pub fn is_error_report(&self) -> bool {
        self.code == ERROR_CODE
    }
}

/// A telemetry frame (timestamp plus packed samples)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Timestamp and sample bytes
    pub payload: Vec<u8>,
}

impl TelemetryFrame {
    /// Create a telemetry frame
    pub fn new(payload: impl Into<Vec<u8>>) -> Result<Self, LinkError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { payload })
    }

    /// Encode the frame to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.payload.len());
        bytes.push(TELEMETRY_MARKER);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(&bytes));
        bytes
    }

    /// Decode a complete frame from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, LinkError> {
        if data.len() < 3 {
            return Err(LinkError::Truncated {
                expected: 3,
                actual: data.len(),
            });
        }
        if data[0] != TELEMETRY_MARKER {
            return Err(LinkError::Framing(data[0]));
        }
        let length = data[1] as usize;
        if data.len() < 3 + length {
            return Err(LinkError::Truncated {
                expected: 3 + length,
                actual: data.len(),
            });
        }
        let sum = byte_sum(&data[..3 + length]);
        if sum != 0 {
            return Err(LinkError::ChecksumMismatch {
                kind: "telemetry",
                sum,
            });
        }
        Ok(Self {
            payload: data[2..2 + length].to_vec(),
        })
    }
}

/// A validated frame as seen by the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reply to a command
    Response(CommandFrame),
    /// Unsolicited device error report (payload only)
    DeviceError(Vec<u8>),
    /// Telemetry record
    Telemetry(TelemetryFrame),
}

/// Builder for little-endian frame payloads
#[derive(Debug, Default, Clone)]
pub struct PayloadBuilder {
    payload: Vec<u8>,
}

impl PayloadBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn u16_le(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value (little-endian)
    pub fn u32_le(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 64-bit value (little-endian)
    pub fn u64_le(mut self, value: u64) -> Self {
        let mut bytes = [0u8; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Current payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether nothing has been added yet
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Finish and return the payload bytes
    pub fn build(self) -> Vec<u8> {
        self.payload
    }
}

/// Incremental frame reader over a stream with a read timeout.
///
/// A read timeout while waiting for the two-byte prefix is "idle" and yields
/// `Ok(None)`; partial prefixes are kept for the next call. Once a prefix is
/// complete, the rest of the frame must arrive within `frame_timeout`.
pub struct FrameReader<R> {
    inner: R,
    prefix: Vec<u8>,
    frame_timeout: Duration,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a stream
    pub fn new(inner: R, frame_timeout: Duration) -> Self {
        Self {
            inner,
            prefix: Vec::with_capacity(2),
            frame_timeout,
        }
    }

    /// Access the wrapped stream
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Read the next frame.
    ///
    /// Recoverable errors (checksum, framing, truncation) consume the bad
    /// bytes so the next call starts fresh. An unrecognized leading byte is
    /// skipped on its own; the byte after it becomes the next prefix start.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, LinkError> {
        while self.prefix.len() < 2 {
            let mut buf = [0u8; 2];
            let want = 2 - self.prefix.len();
            match self.inner.read(&mut buf[..want]) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => self.prefix.extend_from_slice(&buf[..n]),
                Err(ref e) if is_idle(e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        let marker = self.prefix[0];
        let second = self.prefix[1];
        match marker {
            COMMAND_MARKER => {
                self.prefix.clear();
                let mut len = [0u8; 1];
                self.read_body(&mut len)?;
                let mut rest = vec![0u8; len[0] as usize + 1];
                self.read_body(&mut rest)?;

                let sum = marker
                    .wrapping_add(second)
                    .wrapping_add(len[0])
                    .wrapping_add(byte_sum(&rest));
                if sum != 0 {
                    return Err(LinkError::ChecksumMismatch {
                        kind: "command",
                        sum,
                    });
                }
                rest.pop();
                if second == ERROR_CODE {
                    Ok(Some(Frame::DeviceError(rest)))
                } else {
                    Ok(Some(Frame::Response(CommandFrame {
                        code: second,
                        payload: rest,
                    })))
                }
            }
            TELEMETRY_MARKER => {
                self.prefix.clear();
                let mut rest = vec![0u8; second as usize + 1];
                self.read_body(&mut rest)?;

                let sum = marker.wrapping_add(second).wrapping_add(byte_sum(&rest));
                if sum != 0 {
                    return Err(LinkError::ChecksumMismatch {
                        kind: "telemetry",
                        sum,
                    });
                }
                rest.pop();
                Ok(Some(Frame::Telemetry(TelemetryFrame { payload: rest })))
            }
            other => {
                self.prefix.remove(0);
                Err(LinkError::Framing(other))
            }
        }
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.frame_timeout;
        let mut offset = 0;
        while offset < buf.len() {
            match self.inner.read(&mut buf[offset..]) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => offset += n,
                Err(ref e) if is_idle(e) => {
                    if Instant::now() >= deadline {
                        return Err(LinkError::Truncated {
                            expected: buf.len(),
                            actual: offset,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
