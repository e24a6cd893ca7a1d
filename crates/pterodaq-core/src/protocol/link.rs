//! LinkChannel: the always-open command/telemetry link
//!
//! A background reader thread owns the receive side of the stream and
//! demultiplexes every incoming frame:
//! - responses go to the single pending command slot,
//! - device error reports and telemetry go out as [`LinkEvent`]s, in wire order.
//!
//! Commands are written from the caller's thread. Only one command may be
//! outstanding; the writer lock enforces that.

use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::packet::{CommandFrame, Frame, FrameReader};
use super::{
    ByteStream, LinkError, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_FRAME_TIMEOUT_MS,
    DEFAULT_READ_TIMEOUT_MS,
};

/// Something the reader thread saw that is not a command response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Telemetry payload (timestamp plus samples), checksum already verified
    Telemetry(Vec<u8>),

    /// Payload of a device error report
    DeviceError(Vec<u8>),

    /// The reader stopped; `None` when the link was closed on request
    Closed(Option<String>),
}

/// Timing knobs for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// How long `send_command` waits for a matching response
    pub command_timeout: Duration,

    /// Stream read timeout; bounds how long `close` takes
    pub read_timeout: Duration,

    /// How long the rest of a frame may take once its prefix arrived
    pub frame_timeout: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
        }
    }
}

/// Snapshot of the reader's frame statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    /// Valid frames of any kind
    pub frames: u64,
    /// Command responses
    pub responses: u64,
    /// Telemetry frames
    pub telemetry: u64,
    /// Device error reports
    pub device_errors: u64,
    /// Frames dropped for a bad checksum
    pub checksum_errors: u64,
    /// Bytes skipped because they did not start a frame
    pub framing_errors: u64,
    /// Frames abandoned mid-way
    pub truncated_frames: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    responses: AtomicU64,
    telemetry: AtomicU64,
    device_errors: AtomicU64,
    checksum_errors: AtomicU64,
    framing_errors: AtomicU64,
    truncated_frames: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkCounters {
        LinkCounters {
            frames: self.frames.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            telemetry: self.telemetry.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            truncated_frames: self.truncated_frames.load(Ordering::Relaxed),
        }
    }
}

/// Write side of the link plus the pending-response slot
struct CommandPort {
    stream: Box<dyn ByteStream>,
    responses: Receiver<CommandFrame>,
}

/// An open link to a board
pub struct LinkChannel {
    port: Mutex<CommandPort>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    reader: Option<JoinHandle<()>>,
    options: LinkOptions,
}

impl LinkChannel {
    /// Take ownership of `stream` and start the reader thread.
    ///
    /// Telemetry, device errors and the final close notice are sent on `events`.
    pub fn open(
        mut stream: Box<dyn ByteStream>,
        options: LinkOptions,
        events: Sender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        stream.set_timeout(options.read_timeout)?;
        let reader_stream = stream.try_clone()?;

        let (response_tx, response_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let thread_running = running.clone();
        let thread_counters = counters.clone();
        let frame_timeout = options.frame_timeout;
        let reader = thread::Builder::new()
            .name("pterodaq-link".into())
            .spawn(move || {
                read_loop(
                    FrameReader::new(reader_stream, frame_timeout),
                    thread_running,
                    thread_counters,
                    response_tx,
                    events,
                )
            })?;

        Ok(Self {
            port: Mutex::new(CommandPort {
                stream,
                responses: response_rx,
            }),
            running,
            counters,
            reader: Some(reader),
            options,
        })
    }

    /// Send a command and wait for the response with the same code.
    ///
    /// Responses with another code are logged and ignored while waiting.
    /// Responses left over from an earlier timed-out command are discarded
    /// before sending.
    pub fn send_command(&self, code: u8, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let frame = CommandFrame::new(code, payload.to_vec())?;
        let mut port = self.port.lock().map_err(|_| LinkError::Closed)?;
        if !self.is_open() {
            return Err(LinkError::Closed);
        }

        while let Ok(stale) = port.responses.try_recv() {
            warn!(
                "Discarding stale '{}' response ({} bytes)",
                char::from(stale.code),
                stale.payload.len()
            );
        }

        let bytes = frame.to_bytes();
        debug!(
            "Sending '{}' command ({} payload bytes)",
            char::from(code),
            frame.payload.len()
        );
        port.stream.write_all(&bytes)?;
        port.stream.flush()?;

        let deadline = Instant::now() + self.options.command_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match port.responses.recv_timeout(remaining) {
                Ok(response) if response.code == code => return Ok(response.payload),
                Ok(response) => {
                    warn!(
                        "Invalid command response: sent '{}', got '{}' ({} bytes)",
                        char::from(code),
                        char::from(response.code),
                        response.payload.len()
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!("No response to '{}' command", char::from(code));
                    return Err(LinkError::Timeout { code });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
            }
        }
    }

    /// Whether the reader thread is still running
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frame statistics so far
    pub fn counters(&self) -> LinkCounters {
        self.counters.snapshot()
    }

    /// Timing options in effect
    pub fn options(&self) -> LinkOptions {
        self.options
    }

    /// Stop the reader and release the stream.
    ///
    /// Returns once the reader's current read times out.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("Link reader thread panicked");
            }
        }
    }
}

impl Drop for LinkChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(
    mut reader: FrameReader<Box<dyn ByteStream>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    responses: Sender<CommandFrame>,
    events: Sender<LinkEvent>,
) {
    let reason = loop {
        if !running.load(Ordering::SeqCst) {
            break None;
        }

        match reader.next_frame() {
            Ok(None) => {}
            Ok(Some(frame)) => {
                Counters::bump(&counters.frames);
                match frame {
                    Frame::Response(response) => {
                        Counters::bump(&counters.responses);
                        debug!(
                            "Received '{}' response ({} bytes)",
                            char::from(response.code),
                            response.payload.len()
                        );
                        // Nobody waiting is fine; the next command drains it
                        let _ = responses.send(response);
                    }
                    Frame::DeviceError(payload) => {
                        Counters::bump(&counters.device_errors);
                        debug!("Received device error report {:?}", payload);
                        let _ = events.send(LinkEvent::DeviceError(payload));
                    }
                    Frame::Telemetry(telemetry) => {
                        Counters::bump(&counters.telemetry);
                        let _ = events.send(LinkEvent::Telemetry(telemetry.payload));
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                match e {
                    LinkError::ChecksumMismatch { .. } => Counters::bump(&counters.checksum_errors),
                    LinkError::Framing(_) => Counters::bump(&counters.framing_errors),
                    _ => Counters::bump(&counters.truncated_frames),
                }
                warn!("Discarding frame: {}", e);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!("Link reader stopped: {}", e);
                    break Some(e.to_string());
                }
                break None;
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    debug!("Link reader exiting");
    let _ = events.send(LinkEvent::Closed(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::TelemetryFrame;
    use crate::sim::pipe::duplex;

    fn quick_options() -> LinkOptions {
        LinkOptions {
            command_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(10),
            frame_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_response_and_events() {
        let (host, board) = duplex();
        let (tx, rx) = mpsc::channel();
        let link = LinkChannel::open(Box::new(host), quick_options(), tx).unwrap();

        let responder = thread::spawn(move || {
            let mut reader = FrameReader::new(board, Duration::from_millis(50));
            let command = loop {
                if let Some(Frame::Response(frame)) = reader.next_frame().unwrap() {
                    break frame;
                }
            };
            let board = reader.get_mut();
            // Telemetry ahead of the response must still come out as an event
            board
                .write_all(&TelemetryFrame::new(vec![5, 0, 0, 0]).unwrap().to_bytes())
                .unwrap();
            board
                .write_all(&CommandFrame::new(b'S', Vec::new()).unwrap().to_bytes())
                .unwrap();
            board
                .write_all(&CommandFrame::new(command.code, b"v0.2".to_vec()).unwrap().to_bytes())
                .unwrap();
        });

        assert_eq!(link.send_command(b'V', &[]).unwrap(), b"v0.2".to_vec());
        responder.join().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            LinkEvent::Telemetry(vec![5, 0, 0, 0])
        );
        assert_eq!(link.counters().telemetry, 1);
    }

    #[test]
    fn test_timeout_without_response() {
        let (host, _board) = duplex();
        let (tx, _rx) = mpsc::channel();
        let link = LinkChannel::open(Box::new(host), quick_options(), tx).unwrap();

        let started = Instant::now();
        assert!(matches!(
            link.send_command(b'H', b"DAQ"),
            Err(LinkError::Timeout { code: b'H' })
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_close_sends_closed_event() {
        let (host, _board) = duplex();
        let (tx, rx) = mpsc::channel();
        let mut link = LinkChannel::open(Box::new(host), quick_options(), tx).unwrap();
        link.close();
        assert!(!link.is_open());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), LinkEvent::Closed(None));
        assert!(matches!(link.send_command(b'S', &[]), Err(LinkError::Closed)));
    }
}
