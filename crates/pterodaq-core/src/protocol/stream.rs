//! Byte stream seam between the link and the transport
//!
//! The link only needs blocking reads that give up after a timeout and
//! blocking writes. A second handle on the same transport lets the reader
//! thread and the command writer work independently.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// A full-duplex byte transport with a read timeout
pub trait ByteStream: Read + Write + Send {
    /// Set the read timeout; a read that times out returns `TimedOut`
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard anything received but not yet read
    fn clear_input(&mut self) -> io::Result<()>;

    /// Open a second handle on the same transport
    fn try_clone(&self) -> io::Result<Box<dyn ByteStream>>;
}

impl ByteStream for Box<dyn ByteStream> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteStream>> {
        (**self).try_clone()
    }
}

/// Serial port wrapper implementing [`ByteStream`]
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Name of the underlying port, if the platform reports one
    pub fn name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl ByteStream for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteStream>> {
        let port = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}
