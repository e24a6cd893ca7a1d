//! In-memory duplex byte pipe
//!
//! Two connected ends, each readable and writable, behaving like a serial
//! port: reads block until data arrives or the read timeout passes. When
//! every handle of one end is dropped, the other end reads end-of-stream.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::ByteStream;

/// Read timeout a fresh pipe end starts with
pub const DEFAULT_PIPE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Buffer {
    data: VecDeque<u8>,
    closed: bool,
}

/// One direction of the pipe
#[derive(Default)]
struct Direction {
    buffer: Mutex<Buffer>,
    ready: Condvar,
}

impl Direction {
    fn close(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.closed = true;
        }
        self.ready.notify_all();
    }
}

/// Closes both directions once the last handle of an end is gone
struct EndGuard {
    incoming: Arc<Direction>,
    outgoing: Arc<Direction>,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.outgoing.close();
        self.incoming.close();
    }
}

/// One end of a duplex pipe
pub struct PipeEnd {
    incoming: Arc<Direction>,
    outgoing: Arc<Direction>,
    timeout: Duration,
    _guard: Arc<EndGuard>,
}

/// Create a connected pair of pipe ends
pub fn duplex() -> (PipeEnd, PipeEnd) {
    let a_to_b = Arc::new(Direction::default());
    let b_to_a = Arc::new(Direction::default());

    let a = PipeEnd {
        incoming: b_to_a.clone(),
        outgoing: a_to_b.clone(),
        timeout: DEFAULT_PIPE_TIMEOUT,
        _guard: Arc::new(EndGuard {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
        }),
    };
    let b = PipeEnd {
        incoming: a_to_b.clone(),
        outgoing: b_to_a.clone(),
        timeout: DEFAULT_PIPE_TIMEOUT,
        _guard: Arc::new(EndGuard {
            incoming: a_to_b,
            outgoing: b_to_a,
        }),
    };
    (a, b)
}

impl PipeEnd {
    /// Another handle on the same end
    pub fn clone_handle(&self) -> PipeEnd {
        PipeEnd {
            incoming: self.incoming.clone(),
            outgoing: self.outgoing.clone(),
            timeout: self.timeout,
            _guard: self._guard.clone(),
        }
    }

    /// Bytes waiting to be read on this end
    pub fn available(&self) -> usize {
        self.incoming
            .buffer
            .lock()
            .map(|buffer| buffer.data.len())
            .unwrap_or(0)
    }

    /// Whether the other end has gone away
    pub fn peer_closed(&self) -> bool {
        self.incoming
            .buffer
            .lock()
            .map(|buffer| buffer.closed)
            .unwrap_or(true)
    }
}

fn poisoned() -> io::Error {
    io::Error::other("pipe lock poisoned")
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.timeout;
        let mut buffer = self.incoming.buffer.lock().map_err(|_| poisoned())?;
        loop {
            if !buffer.data.is_empty() {
                let n = buf.len().min(buffer.data.len());
                for (slot, byte) in buf.iter_mut().zip(buffer.data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if buffer.closed {
                return Ok(0);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timed out"));
            }
            buffer = self
                .incoming
                .ready
                .wait_timeout(buffer, remaining)
                .map_err(|_| poisoned())?
                .0;
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.outgoing.buffer.lock().map_err(|_| poisoned())?;
        if buffer.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        buffer.data.extend(buf);
        drop(buffer);
        self.outgoing.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for PipeEnd {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut buffer = self.incoming.buffer.lock().map_err(|_| poisoned())?;
        buffer.data.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteStream>> {
        Ok(Box::new(self.clone_handle()))
    }
}
