//! Simulated board firmware
//!
//! Answers the command protocol on one end of a [`duplex`] pipe the way the
//! board firmware does: every command gets one response frame, `G` starts a
//! stream of telemetry frames that lasts until `S`. Input values come from
//! the test, optionally jittered by a seeded generator.

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::pipe::{duplex, PipeEnd};
use super::SimError;
use crate::board::{model_response, DeviceProfile, TimerParams};
use crate::protocol::{
    Command, CommandFrame, DeviceErrorKind, Frame, FrameReader, LinkError, PayloadBuilder,
    TelemetryFrame, ERROR_CODE, HANDSHAKE_REPLY, PROTOCOL_VERSION,
};
use crate::session::encode::{FORCE_FLUSH, TRIGGER_EDGE, TRIGGER_TIMED};

const KIND_ANALOG: u8 = 1;
const KIND_DIGITAL: u8 = 2;
const KIND_FREQUENCY: u8 = 3;

/// Longest the timer thread sleeps before checking for a stop
const TIMER_SLICE: Duration = Duration::from_millis(10);

/// Trigger section of a parsed configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimTrigger {
    /// Timer-driven
    Timed(TimerParams),
    /// Pin-edge driven
    Edge {
        /// Sense code
        sense: u8,
        /// Interrupt pin code
        pin: u8,
    },
    /// A trigger type the firmware does not know
    Illegal(u8),
}

/// A configuration as the firmware understood it
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Trigger settings
    pub trigger: SimTrigger,
    /// Flush after every frame
    pub flush: bool,
    /// Reference code
    pub reference: u8,
    /// Averaging code
    pub averaging: u8,
    /// Probe codes in stream order
    pub probes: Vec<u16>,
}

impl SimConfig {
    /// Parse a configure payload; `None` if it is cut short
    pub fn parse(blob: &[u8]) -> Option<SimConfig> {
        let tag = *blob.first()?;
        let flush = tag & FORCE_FLUSH != 0;
        let (trigger, mut pos) = match tag & !FORCE_FLUSH {
            TRIGGER_TIMED => {
                let reload = LittleEndian::read_u32(blob.get(2..6)?);
                let prescale = *blob.get(1)?;
                (SimTrigger::Timed(TimerParams { prescale, reload }), 6)
            }
            TRIGGER_EDGE => (
                SimTrigger::Edge {
                    sense: *blob.get(1)?,
                    pin: *blob.get(2)?,
                },
                3,
            ),
            other => (SimTrigger::Illegal(other), 1),
        };
        let reference = *blob.get(pos)?;
        let averaging = *blob.get(pos + 1)?;
        pos += 2;
        let probes = blob
            .get(pos..)?
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(LittleEndian::read_u16)
            .collect();
        Some(SimConfig {
            trigger,
            flush,
            reference,
            averaging,
            probes,
        })
    }

    /// Telemetry payload length this configuration produces
    pub fn payload_len(&self) -> usize {
        let timestamp = match self.trigger {
            SimTrigger::Edge { .. } => 8,
            _ => 4,
        };
        let mut digital = 0;
        let mut len = timestamp;
        for probe in &self.probes {
            match (*probe & 0xff) as u8 {
                KIND_ANALOG => len += 2,
                KIND_FREQUENCY => len += 4,
                KIND_DIGITAL => digital += 1,
                _ => {}
            }
        }
        len + (digital + 7) / 8
    }
}

/// Input values and protocol knobs shared with the firmware threads
struct Firmware {
    handshake_reply: Vec<u8>,
    version: Vec<u8>,
    model: Vec<u8>,
    config: Option<SimConfig>,
    analog: HashMap<u16, u16>,
    digital: HashMap<u16, bool>,
    frequency: HashMap<u16, u32>,
    jitter: Option<(StdRng, u16)>,
    drops: HashMap<u8, u32>,
    received: Vec<u8>,
    readcount: u32,
    clock_start: Instant,
}

impl Firmware {
    /// One sample of every configured channel, timestamp first
    fn sample(&mut self, timestamp: SampleClock) -> Option<Vec<u8>> {
        let config = self.config.as_ref()?;
        let mut builder = PayloadBuilder::new();
        builder = match timestamp {
            SampleClock::Count(count) => builder.u32_le(count),
            SampleClock::Ticks(ticks) => builder.u64_le(ticks),
        };

        let mut bits = 0u8;
        let mut digital = 0usize;
        for probe in &config.probes {
            match (*probe & 0xff) as u8 {
                KIND_ANALOG => {
                    let mut value = self.analog.get(probe).copied().unwrap_or(0);
                    if let Some((rng, amplitude)) = self.jitter.as_mut() {
                        let offset = rng.gen_range(-i32::from(*amplitude)..=i32::from(*amplitude));
                        value = (i32::from(value) + offset).clamp(0, 65535) as u16;
                    }
                    builder = builder.u16_le(value);
                }
                KIND_FREQUENCY => {
                    builder = builder.u32_le(self.frequency.get(probe).copied().unwrap_or(0));
                }
                KIND_DIGITAL => {
                    if self.digital.get(probe).copied().unwrap_or(false) {
                        bits |= 1 << (digital % 8);
                    }
                    digital += 1;
                    if digital % 8 == 0 {
                        builder = builder.byte(bits);
                        bits = 0;
                    }
                }
                _ => {}
            }
        }
        if digital % 8 != 0 {
            builder = builder.byte(bits);
        }
        Some(builder.build())
    }
}

#[derive(Debug, Clone, Copy)]
enum SampleClock {
    Count(u32),
    Ticks(u64),
}

struct Sampler {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    firmware: Mutex<Firmware>,
    writer: Mutex<PipeEnd>,
    profile: DeviceProfile,
    sampler: Mutex<Option<Sampler>>,
    edge_armed: AtomicBool,
    frames_sent: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn write(&self, bytes: &[u8]) {
        if let Err(e) = lock(&self.writer).write_all(bytes) {
            debug!("Simulated board write failed: {}", e);
        }
    }

    fn respond(&self, code: u8, payload: &[u8]) {
        match CommandFrame::new(code, payload.to_vec()) {
            Ok(frame) => self.write(&frame.to_bytes()),
            Err(e) => warn!("Simulated board cannot respond: {}", e),
        }
    }

    fn report_error(&self, kind: DeviceErrorKind) {
        self.respond(ERROR_CODE, &kind.to_payload());
    }

    fn emit(&self, clock: SampleClock) {
        let payload = lock(&self.firmware).sample(clock);
        let Some(payload) = payload else {
            return;
        };
        match TelemetryFrame::new(payload) {
            Ok(frame) => {
                self.write(&frame.to_bytes());
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Simulated board cannot send telemetry: {}", e),
        }
    }

    /// Timed trigger handler: timestamp is the trigger count
    fn trigger(&self) {
        let count = {
            let mut firmware = lock(&self.firmware);
            firmware.readcount = firmware.readcount.wrapping_add(1);
            firmware.readcount.wrapping_sub(1)
        };
        self.emit(SampleClock::Count(count));
    }

    fn edge_ticks(&self) -> u64 {
        let start = lock(&self.firmware).clock_start;
        (start.elapsed().as_secs_f64() / self.profile.timestamp_resolution()) as u64
    }

    fn stop_sampling(&self) {
        self.edge_armed.store(false, Ordering::SeqCst);
        let sampler = lock(&self.sampler).take();
        if let Some(mut sampler) = sampler {
            sampler.running.store(false, Ordering::SeqCst);
            if let Some(thread) = sampler.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn start_sampling(self: &Arc<Self>) {
        self.stop_sampling();
        let trigger = lock(&self.firmware).config.as_ref().map(|c| c.trigger);
        match trigger {
            None => {}
            Some(SimTrigger::Illegal(value)) => {
                self.report_error(DeviceErrorKind::IllegalTriggerType(value))
            }
            Some(SimTrigger::Edge { .. }) => {
                lock(&self.firmware).clock_start = Instant::now();
                self.edge_armed.store(true, Ordering::SeqCst);
            }
            Some(SimTrigger::Timed(params)) => {
                lock(&self.firmware).readcount = 0;
                let period = Duration::from_secs_f64(self.profile.timer_period(params));
                let running = Arc::new(AtomicBool::new(true));
                let shared = self.clone();
                let flag = running.clone();
                let thread = thread::Builder::new()
                    .name("pterodaq-sim-timer".into())
                    .spawn(move || {
                        let mut next = Instant::now();
                        while flag.load(Ordering::SeqCst) {
                            shared.trigger();
                            next += period;
                            loop {
                                let now = Instant::now();
                                if next <= now || !flag.load(Ordering::SeqCst) {
                                    break;
                                }
                                thread::sleep((next - now).min(TIMER_SLICE));
                            }
                        }
                    });
                match thread {
                    Ok(thread) => {
                        *lock(&self.sampler) = Some(Sampler {
                            running,
                            thread: Some(thread),
                        })
                    }
                    Err(e) => warn!("Simulated board timer failed to start: {}", e),
                }
            }
        }
    }

    fn handle(self: &Arc<Self>, command: CommandFrame) {
        {
            let mut firmware = lock(&self.firmware);
            firmware.received.push(command.code);
            if let Some(remaining) = firmware.drops.get_mut(&command.code) {
                if *remaining > 0 {
                    *remaining -= 1;
                    debug!("Simulated board ignoring '{}'", char::from(command.code));
                    return;
                }
            }
        }

        let Some(known) = Command::from_code(command.code) else {
            debug!("Simulated board: unknown command {:#04x}", command.code);
            return;
        };
        match known {
            Command::Handshake => {
                self.stop_sampling();
                let reply = {
                    let mut firmware = lock(&self.firmware);
                    firmware.readcount = 0;
                    firmware.clock_start = Instant::now();
                    firmware.handshake_reply.clone()
                };
                self.respond(command.code, &reply);
            }
            Command::Version => {
                let version = lock(&self.firmware).version.clone();
                self.respond(command.code, &version);
            }
            Command::Model => {
                let model = lock(&self.firmware).model.clone();
                self.respond(command.code, &model);
            }
            Command::Configure => {
                let parsed = SimConfig::parse(&command.payload);
                if let Some(SimTrigger::Illegal(value)) = parsed.as_ref().map(|c| c.trigger) {
                    self.report_error(DeviceErrorKind::IllegalTriggerType(value));
                }
                if parsed.is_none() {
                    warn!("Simulated board: short configuration {:?}", command.payload);
                }
                lock(&self.firmware).config = parsed;
                self.respond(command.code, &[]);
            }
            Command::Go => {
                // the first timed trigger fires before the response goes out,
                // but its frame is queued behind it
                self.respond(command.code, &[]);
                self.start_sampling();
            }
            Command::Stop => {
                self.stop_sampling();
                self.respond(command.code, &[]);
            }
            Command::SingleRead => {
                self.respond(command.code, &[]);
                let edge = matches!(
                    lock(&self.firmware).config.as_ref().map(|c| c.trigger),
                    Some(SimTrigger::Edge { .. })
                );
                if edge {
                    self.emit(SampleClock::Ticks(self.edge_ticks()));
                } else {
                    self.trigger();
                }
            }
        }
    }
}

fn command_loop(mut reader: FrameReader<PipeEnd>, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match reader.next_frame() {
            Ok(None) => {}
            Ok(Some(Frame::Response(command))) => shared.handle(command),
            Ok(Some(other)) => debug!("Simulated board ignoring {:?}", other),
            // the firmware silently drops anything that fails its checksum
            Err(e) if e.is_recoverable() => debug!("Simulated board discarding input: {}", e),
            Err(LinkError::Closed) => break,
            Err(e) => {
                warn!("Simulated board stopped: {}", e);
                break;
            }
        }
    }
    shared.stop_sampling();
}

/// An emulated board on the far end of an in-memory pipe
pub struct SimulatedBoard {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    handler: Option<JoinHandle<()>>,
}

impl SimulatedBoard {
    /// Start a board answering with `model` and return it with the host end
    pub fn spawn(model: Vec<u8>) -> Result<(SimulatedBoard, PipeEnd), SimError> {
        let profile = DeviceProfile::resolve(&model)?;
        let (host, board) = duplex();
        let shared = Arc::new(Shared {
            firmware: Mutex::new(Firmware {
                handshake_reply: HANDSHAKE_REPLY.to_vec(),
                version: PROTOCOL_VERSION.to_vec(),
                model,
                config: None,
                analog: HashMap::new(),
                digital: HashMap::new(),
                frequency: HashMap::new(),
                jitter: None,
                drops: HashMap::new(),
                received: Vec::new(),
                readcount: 0,
                clock_start: Instant::now(),
            }),
            writer: Mutex::new(board.clone_handle()),
            profile,
            sampler: Mutex::new(None),
            edge_armed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
        });

        let running = Arc::new(AtomicBool::new(true));
        let reader = FrameReader::new(board, Duration::from_millis(500));
        let thread_shared = shared.clone();
        let thread_running = running.clone();
        let handler = thread::Builder::new()
            .name("pterodaq-sim".into())
            .spawn(move || command_loop(reader, thread_shared, thread_running))?;

        Ok((
            SimulatedBoard {
                shared,
                running,
                handler: Some(handler),
            },
            host,
        ))
    }

    /// FRDM-KL25Z at 3.3 V
    pub fn kl25z() -> Result<(SimulatedBoard, PipeEnd), SimError> {
        Self::spawn(model_response(5, 19859, None))
    }

    /// 16 MHz Arduino Uno at 5 V
    pub fn uno() -> Result<(SimulatedBoard, PipeEnd), SimError> {
        Self::spawn(model_response(1, 14418, Some(16000)))
    }

    /// The board's own profile
    pub fn profile(&self) -> &DeviceProfile {
        &self.shared.profile
    }

    fn firmware(&self) -> MutexGuard<'_, Firmware> {
        lock(&self.shared.firmware)
    }

    /// Answer handshakes with `reply` instead of `DAQ`
    pub fn set_handshake_reply(&self, reply: &[u8]) {
        self.firmware().handshake_reply = reply.to_vec();
    }

    /// Report `version` instead of the host's protocol version
    pub fn set_version(&self, version: &[u8]) {
        self.firmware().version = version.to_vec();
    }

    /// Change the model response (e.g. a new supply reading)
    pub fn set_model(&self, model: Vec<u8>) {
        self.firmware().model = model;
    }

    /// Silently ignore the next `count` `command`s
    pub fn drop_responses(&self, command: Command, count: u32) {
        self.firmware().drops.insert(command.code(), count);
    }

    /// Reading for an analog probe
    pub fn set_analog(&self, probe: u16, value: u16) {
        self.firmware().analog.insert(probe, value);
    }

    /// Level of a digital probe
    pub fn set_digital(&self, probe: u16, level: bool) {
        self.firmware().digital.insert(probe, level);
    }

    /// Edges counted per sample on a frequency probe
    pub fn set_frequency_count(&self, probe: u16, count: u32) {
        self.firmware().frequency.insert(probe, count);
    }

    /// Add up to ±`amplitude` of seeded noise to analog readings
    pub fn set_jitter(&self, seed: u64, amplitude: u16) {
        self.firmware().jitter = Some((StdRng::seed_from_u64(seed), amplitude));
    }

    /// Write raw bytes to the host
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.shared.write(bytes);
    }

    /// Send a device error report
    pub fn send_error(&self, kind: DeviceErrorKind) {
        self.shared.report_error(kind);
    }

    /// Fire an edge trigger; ignored unless an edge run is active
    pub fn pulse(&self) {
        if self.shared.edge_armed.load(Ordering::SeqCst) {
            self.shared.emit(SampleClock::Ticks(self.shared.edge_ticks()));
        }
    }

    /// Command codes received so far, in order
    pub fn received(&self) -> Vec<u8> {
        self.firmware().received.clone()
    }

    /// How many times `command` was received
    pub fn command_count(&self, command: Command) -> usize {
        self.firmware()
            .received
            .iter()
            .filter(|code| **code == command.code())
            .count()
    }

    /// Configuration last received
    pub fn config(&self) -> Option<SimConfig> {
        self.firmware().config.clone()
    }

    /// Whether a run is in progress
    pub fn is_sampling(&self) -> bool {
        self.shared.edge_armed.load(Ordering::SeqCst) || lock(&self.shared.sampler).is_some()
    }

    /// Telemetry frames sent so far
    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    /// Stop the firmware threads
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.stop_sampling();
        if let Some(handler) = self.handler.take() {
            let _ = handler.join();
        }
    }
}

impl Drop for SimulatedBoard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::probe_code;
    use crate::board::ChannelKind;
    use crate::protocol::ByteStream;
    use std::io::Read;

    fn exchange(host: &mut PipeEnd, command: Command, payload: &[u8]) -> CommandFrame {
        let frame = CommandFrame::new(command.code(), payload.to_vec()).unwrap();
        host.write_all(&frame.to_bytes()).unwrap();
        let mut reader = FrameReader::new(host.clone_handle(), Duration::from_secs(1));
        loop {
            match reader.next_frame().unwrap() {
                Some(Frame::Response(response)) => return response,
                Some(_) | None => {}
            }
        }
    }

    #[test]
    fn test_identification() {
        let (_board, mut host) = SimulatedBoard::kl25z().unwrap();
        host.set_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(exchange(&mut host, Command::Handshake, &[]).payload, b"DAQ");
        assert_eq!(exchange(&mut host, Command::Version, &[]).payload, b"v0.2");
        assert_eq!(
            exchange(&mut host, Command::Model, &[]).payload,
            model_response(5, 19859, None)
        );
    }

    #[test]
    fn test_parse_config() {
        let config = SimConfig::parse(&[0x11, 3, 0xa8, 0x61, 0, 0, 1, 1, 0x01, 0x00, 0x02, 0x32])
            .unwrap();
        assert!(config.flush);
        assert_eq!(
            config.trigger,
            SimTrigger::Timed(TimerParams {
                prescale: 3,
                reload: 25000
            })
        );
        assert_eq!(config.probes, vec![0x0001, 0x3202]);
        assert_eq!(config.payload_len(), 4 + 2 + 1);

        let edge = SimConfig::parse(&[0x12, 2, 100, 0, 7, 0x01, 15]).unwrap();
        assert_eq!(edge.trigger, SimTrigger::Edge { sense: 2, pin: 100 });
        assert_eq!(edge.payload_len(), 8 + 2);

        assert_eq!(SimConfig::parse(&[0x01, 3]), None);
    }

    #[test]
    fn test_single_read_packs_digitals() {
        let (board, mut host) = SimulatedBoard::kl25z().unwrap();
        host.set_timeout(Duration::from_millis(50)).unwrap();
        let d0 = probe_code(ChannelKind::Digital, 1);
        let d1 = probe_code(ChannelKind::Digital, 2);
        let a0 = probe_code(ChannelKind::Analog, 8);
        board.set_digital(d1, true);
        board.set_analog(a0, 0x1234);

        let blob = PayloadBuilder::new()
            .byte(0x11)
            .byte(1)
            .u32_le(47_999)
            .byte(0)
            .byte(4)
            .u16_le(d0)
            .u16_le(a0)
            .u16_le(d1)
            .build();
        exchange(&mut host, Command::Configure, &blob);
        exchange(&mut host, Command::SingleRead, &[]);

        let mut reader = FrameReader::new(host.clone_handle(), Duration::from_secs(1));
        let frame = loop {
            if let Some(Frame::Telemetry(frame)) = reader.next_frame().unwrap() {
                break frame;
            }
        };
        assert_eq!(frame.payload, vec![0, 0, 0, 0, 0x34, 0x12, 0b10]);
    }

    #[test]
    fn test_dropped_command_gets_no_response() {
        let (board, mut host) = SimulatedBoard::kl25z().unwrap();
        host.set_timeout(Duration::from_millis(50)).unwrap();
        board.drop_responses(Command::Handshake, 1);
        let frame = CommandFrame::new(b'H', Vec::new()).unwrap();
        host.write_all(&frame.to_bytes()).unwrap();
        thread::sleep(Duration::from_millis(100));
        let mut buf = [0u8; 16];
        assert!(host.read(&mut buf).is_err());
        assert_eq!(exchange(&mut host, Command::Handshake, &[]).payload, b"DAQ");
        assert_eq!(board.command_count(Command::Handshake), 2);
    }
}
