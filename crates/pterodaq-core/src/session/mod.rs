//! Acquisition Session
//!
//! [`Session`] drives one board through its lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Idle -> Configured -> Running -> Configured
//! ```
//!
//! Connecting opens a [`LinkChannel`] and identifies the board (handshake,
//! version, model). A consumer thread drains the link's events into the shared
//! sample buffer, so telemetry is decoded in wire order while the caller keeps
//! issuing commands.

pub mod channel;
pub mod decode;
pub mod encode;
mod error;

pub use channel::{
    AcquisitionConfig, ChannelDescriptor, Interpretation, SampleRow, SampleValue, TriggerSpec,
};
pub use decode::{append_row, frequency_rate, DecodeError, TelemetryDecoder};
pub use encode::{encode_config, EncodedConfig};
pub use error::{ConnectError, SessionError};

use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::board::DeviceProfile;
use crate::config::{AcquisitionPlan, ConnectionConfig};
use crate::datalog::{save_recording, HeaderChannel, RecordingHeader};
use crate::protocol::{
    open_port, port_names, reset_and_open, ByteStream, Command, DeviceErrorKind, LinkChannel,
    LinkCounters, LinkError, LinkEvent, SerialChannel, HANDSHAKE_REPLY, PROTOCOL_VERSION,
};

/// Message shown while the board reports trigger overruns
pub const TRIGGER_OVERRUN_MESSAGE: &str = "triggering too fast, next trigger before finished";

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Board identified, nothing configured
    Idle,
    /// Configuration sent
    Configured,
    /// Streaming telemetry
    Running,
}

impl SessionState {
    /// Lower-case name for messages
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// State shared with the event consumer thread
struct Acquisition {
    state: SessionState,
    config: Option<AcquisitionConfig>,
    decoder: Option<TelemetryDecoder>,
    actual_period: Option<f64>,
    rows: Vec<SampleRow>,
    saved: usize,
    baseline: Option<usize>,
    trigger_error: Option<String>,
    fault: Option<u8>,
    telemetry_handled: u64,
    link_lost: Option<String>,
}

impl Acquisition {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            config: None,
            decoder: None,
            actual_period: None,
            rows: Vec::new(),
            saved: 0,
            baseline: None,
            trigger_error: None,
            fault: None,
            telemetry_handled: 0,
            link_lost: None,
        }
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.saved = 0;
        self.baseline = None;
        self.trigger_error = None;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.restart();
        }
    }

    fn on_telemetry(&mut self, payload: &[u8]) {
        self.telemetry_handled += 1;
        let Some(decoder) = self.decoder.as_mut() else {
            warn!(
                "Telemetry before configuration ({} bytes), dropping",
                payload.len()
            );
            return;
        };
        match decoder.decode(payload) {
            Ok(row) => append_row(&mut self.rows, row, decoder.channels()),
            Err(e) => warn!("Dropping telemetry frame: {}", e),
        }
    }

    fn on_device_error(&mut self, payload: &[u8]) {
        match DeviceErrorKind::parse(payload) {
            None => warn!("Empty device error report"),
            Some(DeviceErrorKind::TriggerOverrun) => {
                warn!("Board reports trigger overrun");
                self.trigger_error = Some(TRIGGER_OVERRUN_MESSAGE.to_string());
            }
            Some(DeviceErrorKind::IllegalTriggerType(value)) => {
                error!("Board rejected trigger type {}", value);
                self.fault = Some(value);
            }
            Some(DeviceErrorKind::Unknown(kind)) => {
                warn!("Unknown device error kind {} ({:?})", kind, payload)
            }
        }
    }

    fn on_closed(&mut self, reason: Option<String>) {
        match reason {
            None => debug!("Link closed"),
            Some(reason) => {
                error!("Link lost: {}", reason);
                self.state = SessionState::Disconnected;
                self.link_lost = Some(reason);
            }
        }
    }
}

fn lock(shared: &Mutex<Acquisition>) -> MutexGuard<'_, Acquisition> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn consume_events(events: Receiver<LinkEvent>, shared: Arc<Mutex<Acquisition>>) {
    for event in events {
        let mut acquisition = lock(&shared);
        match event {
            LinkEvent::Telemetry(payload) => acquisition.on_telemetry(&payload),
            LinkEvent::DeviceError(payload) => acquisition.on_device_error(&payload),
            LinkEvent::Closed(reason) => acquisition.on_closed(reason),
        }
    }
}

/// Send a command, resending after timeouts up to `attempts` times
fn send_with_retry(
    link: &LinkChannel,
    command: Command,
    payload: &[u8],
    attempts: u32,
) -> Result<Vec<u8>, LinkError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match link.send_command(command.code(), payload) {
            Err(LinkError::Timeout { .. }) if attempt < attempts => {
                warn!(
                    "Command timeout for {} (attempt {}/{})",
                    command, attempt, attempts
                );
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Handshake attempts, independent of the runtime retry setting
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Handshake, version check and model lookup
fn identify(link: &LinkChannel, attempts: u32) -> Result<(DeviceProfile, String), ConnectError> {
    match send_with_retry(link, Command::Handshake, &[], HANDSHAKE_ATTEMPTS) {
        Ok(reply) if reply == HANDSHAKE_REPLY => {}
        Ok(reply) => {
            return Err(ConnectError::HandshakeFailed {
                got: String::from_utf8_lossy(&reply).into_owned(),
            })
        }
        Err(LinkError::Timeout { .. }) => return Err(ConnectError::HandshakeTimeout),
        Err(e) => return Err(e.into()),
    }

    let version = request(link, Command::Version, attempts)?;
    if version != PROTOCOL_VERSION {
        return Err(ConnectError::VersionMismatch {
            got: String::from_utf8_lossy(&version).into_owned(),
            want: String::from_utf8_lossy(PROTOCOL_VERSION).into_owned(),
        });
    }

    let model = request(link, Command::Model, attempts)?;
    let profile = DeviceProfile::resolve(&model)?;
    Ok((profile, String::from_utf8_lossy(&version).into_owned()))
}

fn request(link: &LinkChannel, command: Command, attempts: u32) -> Result<Vec<u8>, ConnectError> {
    send_with_retry(link, command, &[], attempts).map_err(|e| match e {
        LinkError::Timeout { .. } => ConnectError::CommandTimeout { command },
        other => other.into(),
    })
}

/// A connection to one board and the samples recorded from it
pub struct Session {
    settings: ConnectionConfig,
    shared: Arc<Mutex<Acquisition>>,
    link: Option<LinkChannel>,
    consumer: Option<JoinHandle<()>>,
    profile: Option<DeviceProfile>,
    version: Option<String>,
    port_name: Option<String>,
}

impl Session {
    /// A disconnected session
    pub fn new(settings: ConnectionConfig) -> Self {
        Self {
            settings,
            shared: Arc::new(Mutex::new(Acquisition::new())),
            link: None,
            consumer: None,
            profile: None,
            version: None,
            port_name: None,
        }
    }

    /// Connection settings
    pub fn settings(&self) -> &ConnectionConfig {
        &self.settings
    }

    fn acquisition(&self) -> MutexGuard<'_, Acquisition> {
        lock(&self.shared)
    }

    /// Connect over an already-open stream.
    ///
    /// On failure the link is torn down and the session is left disconnected.
    pub fn connect(&mut self, stream: Box<dyn ByteStream>) -> Result<(), ConnectError> {
        if self.link.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        *self.acquisition() = Acquisition::new();
        self.acquisition().state = SessionState::Connecting;

        let result = self.open_and_identify(stream);
        match result {
            Ok((profile, version)) => {
                info!(
                    "Connected to {} (firmware {}, supply {:.3} V)",
                    profile.name(),
                    version,
                    profile.power_voltage()
                );
                self.profile = Some(profile);
                self.version = Some(version);
                self.acquisition().state = SessionState::Idle;
                Ok(())
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn open_and_identify(
        &mut self,
        stream: Box<dyn ByteStream>,
    ) -> Result<(DeviceProfile, String), ConnectError> {
        let (events_tx, events_rx) = mpsc::channel();
        let link = LinkChannel::open(stream, self.settings.link_options(), events_tx)?;
        let shared = self.shared.clone();
        let consumer = thread::Builder::new()
            .name("pterodaq-session".into())
            .spawn(move || consume_events(events_rx, shared))
            .map_err(LinkError::from)?;
        self.consumer = Some(consumer);
        let link = self.link.insert(link);
        identify(link, self.settings.command_attempts)
    }

    /// Open the configured serial port (or the first one found) and connect.
    ///
    /// Returns the port actually used, which differs from the requested one
    /// when the board re-enumerated during the reset sequence.
    pub fn connect_port(&mut self) -> Result<String, ConnectError> {
        let requested = match &self.settings.port_name {
            Some(name) => name.clone(),
            None => port_names()
                .into_iter()
                .next()
                .ok_or_else(|| LinkError::PortNotFound("no serial ports found".into()))?,
        };
        info!("Opening {}", requested);

        let (channel, name) = if self.settings.reset_on_open {
            reset_and_open(&requested, Some(self.settings.baud_rate))?
        } else {
            let port = open_port(&requested, Some(self.settings.baud_rate))?;
            (SerialChannel::new(port), requested)
        };
        self.connect(Box::new(channel))?;
        self.port_name = Some(name.clone());
        Ok(name)
    }

    /// Connect on a worker thread and report the outcome to `done`.
    ///
    /// The join handle gives the session back.
    pub fn connect_in_background<F>(
        mut self,
        stream: Box<dyn ByteStream>,
        done: F,
    ) -> std::io::Result<JoinHandle<Session>>
    where
        F: FnOnce(Result<(), ConnectError>) + Send + 'static,
    {
        thread::Builder::new()
            .name("pterodaq-connect".into())
            .spawn(move || {
                let result = self.connect(stream);
                done(result);
                self
            })
    }

    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        // the consumer ends once the reader drops its event sender
        if let Some(consumer) = self.consumer.take() {
            if consumer.join().is_err() {
                error!("Session event thread panicked");
            }
        }
        self.profile = None;
        self.version = None;
        self.acquisition().state = SessionState::Disconnected;
    }

    /// Close the link, stopping the board first if it is sampling
    pub fn disconnect(&mut self) {
        if self.link.is_none() {
            return;
        }
        if self.state() == SessionState::Running {
            if let Some(link) = self.open_link() {
                if let Err(e) = link.send_command(Command::Stop.code(), &[]) {
                    warn!("Stop before disconnect failed: {}", e);
                }
            }
        }
        self.teardown();
        info!("Disconnected");
    }

    fn open_link(&self) -> Option<&LinkChannel> {
        self.link.as_ref().filter(|link| link.is_open())
    }

    /// Latched device fault, then link presence
    fn ready(&self) -> Result<&LinkChannel, SessionError> {
        if let Some(value) = self.acquisition().fault {
            return Err(SessionError::IllegalTriggerType(value));
        }
        self.open_link().ok_or(SessionError::NotConnected)
    }

    fn command(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        let link = self.ready()?;
        let attempts = self.settings.command_attempts.max(1);
        send_with_retry(link, command, payload, attempts).map_err(|e| match e {
            LinkError::Timeout { .. } => {
                warn!("{} failed after {} attempts", command, attempts);
                SessionError::CommandFailed { command, attempts }
            }
            other => other.into(),
        })
    }

    fn connected_profile(&self) -> Result<&DeviceProfile, SessionError> {
        self.ready()?;
        self.profile.as_ref().ok_or(SessionError::NotConnected)
    }

    /// Send a configuration.
    ///
    /// Recorded rows survive unless the channel count changes.
    pub fn configure(&mut self, config: AcquisitionConfig) -> Result<(), SessionError> {
        let profile = self.connected_profile()?;
        if self.state() == SessionState::Running {
            return Err(SessionError::Running);
        }
        let encoded = encode_config(&config, profile)?;
        let decoder = TelemetryDecoder::new(&config, profile);

        // session state follows the board only once it has accepted the blob
        self.command(Command::Configure, &encoded.blob)?;

        let channels = config.channels.len();
        {
            let mut acquisition = self.acquisition();
            let changed = acquisition
                .config
                .as_ref()
                .is_some_and(|old| old.channels.len() != channels);
            if changed {
                debug!("Channel count changed, clearing recorded rows");
                acquisition.clear();
            }
            acquisition.decoder = Some(decoder);
            acquisition.actual_period = encoded.actual_period;
            acquisition.config = Some(config);
            acquisition.state = SessionState::Configured;
        }
        info!(
            "Configured {} channels ({} bytes)",
            channels,
            encoded.blob.len()
        );
        Ok(())
    }

    /// Resolve `plan` against the connected board and send it
    pub fn configure_plan(&mut self, plan: &AcquisitionPlan) -> Result<(), SessionError> {
        let config = plan.resolve(self.connected_profile()?)?;
        self.configure(config)
    }

    /// Start continuous sampling
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.ready()?;
        match self.state() {
            SessionState::Configured => {}
            SessionState::Idle => return Err(SessionError::NotConfigured),
            other => {
                return Err(SessionError::InvalidState {
                    operation: "start",
                    state: other.name(),
                })
            }
        }

        {
            let mut acquisition = self.acquisition();
            acquisition.trigger_error = None;
            acquisition.baseline = Some(acquisition.rows.len());
            if let Some(decoder) = acquisition.decoder.as_mut() {
                decoder.restart();
            }
            acquisition.state = SessionState::Running;
        }

        if let Err(e) = self.command(Command::Go, &[]) {
            self.acquisition().state = SessionState::Configured;
            return Err(e);
        }
        info!("Sampling started");
        Ok(())
    }

    /// Stop sampling and re-measure the supply voltage
    pub fn stop(&mut self) -> Result<(), SessionError> {
        self.command(Command::Stop, &[])?;
        {
            let mut acquisition = self.acquisition();
            if acquisition.state == SessionState::Running {
                acquisition.state = SessionState::Configured;
            }
        }
        self.settle();

        let model = self.command(Command::Model, &[])?;
        if let Some(profile) = self.profile.as_mut() {
            profile.refresh(&model)?;
            info!(
                "Sampling stopped, supply now {:.3} V",
                profile.power_voltage()
            );
        }
        Ok(())
    }

    /// Ask for exactly one sample
    pub fn single_trigger(&mut self) -> Result<(), SessionError> {
        self.ready()?;
        match self.state() {
            SessionState::Configured => {}
            SessionState::Running => return Err(SessionError::Running),
            _ => return Err(SessionError::NotConfigured),
        }
        self.acquisition().trigger_error = None;
        self.command(Command::SingleRead, &[])?;
        Ok(())
    }

    /// Drop every recorded row
    pub fn clear(&mut self) -> Result<(), SessionError> {
        let mut acquisition = self.acquisition();
        if acquisition.state == SessionState::Running {
            return Err(SessionError::Running);
        }
        acquisition.clear();
        Ok(())
    }

    /// Wait until every telemetry frame the link has received is decoded
    fn settle(&self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let deadline = Instant::now() + self.settings.link_options().command_timeout;
        while self.acquisition().telemetry_handled < link.counters().telemetry {
            if Instant::now() >= deadline {
                warn!("Telemetry still queued after stop");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Save the recorded rows.
    ///
    /// Channel names come from `naming` when given (so a renamed but not yet
    /// sent configuration labels the columns); pins and downsampling always
    /// come from the configuration the rows were recorded with. Without any
    /// configuration sent, `naming` supplies both.
    pub fn save<P: AsRef<Path>>(
        &mut self,
        path: P,
        notes: &str,
        convert_to_volts: bool,
        naming: Option<&AcquisitionConfig>,
    ) -> Result<(), SessionError> {
        let profile = self.profile.as_ref().ok_or(SessionError::NotConnected)?;
        let (recorded, rows) = {
            let acquisition = self.acquisition();
            let recorded = acquisition
                .config
                .clone()
                .or_else(|| naming.cloned())
                .ok_or(SessionError::NotConfigured)?;
            (recorded, acquisition.rows.clone())
        };
        let names = naming.unwrap_or(&recorded);

        let channels = names
            .channels
            .iter()
            .zip(&recorded.channels)
            .map(|(named, probed)| HeaderChannel {
                name: named.name.clone(),
                pin: profile
                    .name_for_probe(probed.probe)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{:#06x}", probed.probe)),
                downsample: probed.interpretation.downsample,
            })
            .collect();
        let header = RecordingHeader {
            recorded_at: chrono::Local::now(),
            board: profile.name().to_string(),
            trigger: recorded.trigger.clone(),
            reference: recorded.reference.clone(),
            averaging: recorded
                .averaging
                .clone()
                .unwrap_or_else(|| profile.default_averaging().to_string()),
            power_voltage: profile.power_voltage(),
            convert_to_volts,
            channels,
            notes: notes.to_string(),
        };

        save_recording(path.as_ref(), &header, &recorded.channels, &rows)?;
        info!("Saved {} samples to {}", rows.len(), path.as_ref().display());
        self.acquisition().saved = rows.len();
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.acquisition().state
    }

    /// Whether the link is up
    pub fn is_connected(&self) -> bool {
        self.open_link().is_some()
    }

    /// Connected board
    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    /// Firmware protocol version reported at connect
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Serial port in use, when connected through [`Session::connect_port`]
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Configuration last sent
    pub fn config(&self) -> Option<AcquisitionConfig> {
        self.acquisition().config.clone()
    }

    /// Snapshot of the recorded rows
    pub fn rows(&self) -> Vec<SampleRow> {
        self.acquisition().rows.clone()
    }

    /// Number of recorded rows
    pub fn row_count(&self) -> usize {
        self.acquisition().rows.len()
    }

    /// Rows recorded since the last save
    pub fn unsaved_count(&self) -> usize {
        let acquisition = self.acquisition();
        acquisition.rows.len().saturating_sub(acquisition.saved)
    }

    /// Sticky trigger overrun message
    pub fn trigger_error(&self) -> Option<String> {
        self.acquisition().trigger_error.clone()
    }

    /// Trigger type the board rejected; once set, every operation fails
    pub fn device_fault(&self) -> Option<u8> {
        self.acquisition().fault
    }

    /// Why the link went down, if it failed on its own
    pub fn link_lost(&self) -> Option<String> {
        self.acquisition().link_lost.clone()
    }

    /// Timed samples missing since the last start.
    ///
    /// Timed rows carry their trigger number in the timestamp, so the last
    /// row tells how many rows there should be.
    pub fn dropped_packets(&self) -> u64 {
        let acquisition = self.acquisition();
        let period = acquisition
            .config
            .as_ref()
            .and_then(|config| config.trigger.period());
        let (Some(baseline), Some(period), Some(last)) =
            (acquisition.baseline, period, acquisition.rows.last())
        else {
            return 0;
        };
        let count = acquisition.rows.len();
        if count <= baseline {
            return 0;
        }
        let implied = baseline as f64 + (last.time / period + 1.1).floor();
        (implied - count as f64).max(0.0) as u64
    }

    /// Period the board timer really runs at
    pub fn actual_period(&self) -> Option<f64> {
        self.acquisition().actual_period
    }

    /// Frame statistics of the current link
    pub fn link_counters(&self) -> LinkCounters {
        self.link
            .as_ref()
            .map(LinkChannel::counters)
            .unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
