//! Board Descriptions
//!
//! Resolves the model response of a board into a [`DeviceProfile`]: its pin
//! names and probe codes, trigger timer quantization, reference/averaging/
//! edge-sense codes, and the calibration needed to turn readings into volts.

mod catalog;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from board lookups
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    /// Model id not in the catalog
    #[error("Unknown board model {0}")]
    UnknownModel(u16),

    /// Model response shorter than id plus bandgap reading
    #[error("Model response too short: {0} bytes")]
    MalformedModel(usize),

    /// Pin name the board does not have
    #[error("Unknown pin '{0}'")]
    UnknownPin(String),

    /// Reference name the board does not offer
    #[error("Unknown analog reference '{0}'")]
    UnknownReference(String),

    /// Averaging option the board does not offer
    #[error("Unknown averaging option '{0}'")]
    UnknownAveraging(String),

    /// Edge sense name not recognised
    #[error("Unknown edge sense '{0}'")]
    UnknownEdgeSense(String),

    /// Pin without edge interrupt support
    #[error("Pin '{0}' cannot be used as a trigger")]
    NotATriggerPin(String),

    /// Period outside the trigger timer range
    #[error("Invalid sampling period {0} s")]
    InvalidPeriod(f64),
}

/// What a probe measures; the low byte of every probe code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// 16-bit ADC reading
    Analog,
    /// One bit, packed with the other digital channels
    Digital,
    /// 32-bit edge count over the sample interval
    Frequency,
}

impl ChannelKind {
    /// Probe kind tag
    pub fn tag(self) -> u8 {
        match self {
            ChannelKind::Analog => 1,
            ChannelKind::Digital => 2,
            ChannelKind::Frequency => 3,
        }
    }

    /// Kind from a probe kind tag
    pub fn from_tag(tag: u8) -> Option<ChannelKind> {
        match tag {
            1 => Some(ChannelKind::Analog),
            2 => Some(ChannelKind::Digital),
            3 => Some(ChannelKind::Frequency),
            _ => None,
        }
    }

    /// Bytes a channel of this kind occupies in telemetry (digital is packed)
    pub fn sample_bytes(self) -> usize {
        match self {
            ChannelKind::Analog => 2,
            ChannelKind::Digital => 0,
            ChannelKind::Frequency => 4,
        }
    }
}

/// Build a probe code: kind tag in the low byte, hardware index in the high byte
pub fn probe_code(kind: ChannelKind, index: u8) -> u16 {
    u16::from(kind.tag()) | (u16::from(index) << 8)
}

/// Split a probe code into (kind tag, hardware index)
pub fn split_probe(probe: u16) -> (u8, u8) {
    ((probe & 0xff) as u8, (probe >> 8) as u8)
}

/// Processor family; decides timer, calibration and option tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardFamily {
    /// Arduino boards with AVR processors (Timer1 triggers)
    Avr,
    /// Freescale Kinetis boards (SysTick triggers)
    Kinetis,
}

const AVR_EDGE_SENSES: &[(&str, u8)] = &[("rises", 3), ("falls", 2), ("changes", 1)];
const KINETIS_EDGE_SENSES: &[(&str, u8)] = &[("rises", 1), ("falls", 2), ("changes", 3)];

const AVR_AVERAGING: &[(&str, u8)] = &[("1", 1)];
const KINETIS_AVERAGING: &[(&str, u8)] = &[("1", 0), ("4", 4), ("8", 5), ("16", 6), ("32", 7)];

const AVR_PRESCALES: [u32; 5] = [1, 8, 64, 256, 1024];
const KINETIS_CLOCK_HZ: f64 = 48e6;

impl BoardFamily {
    /// Nominal bandgap voltage the model response is measured against
    pub fn bandgap(self) -> f64 {
        match self {
            BoardFamily::Avr => 1.1,
            BoardFamily::Kinetis => 1.0,
        }
    }

    /// Seconds per tick of the edge-trigger timestamp
    pub fn timestamp_resolution(self) -> f64 {
        match self {
            BoardFamily::Avr => 0.5e-6,
            BoardFamily::Kinetis => 1.0 / 24e6,
        }
    }

    /// Time per sample during which the frequency counters are disabled
    pub fn frequency_dead_time(self) -> f64 {
        match self {
            BoardFamily::Avr => 0.0,
            BoardFamily::Kinetis => 0.33e-6,
        }
    }

    /// Number of hardware edge counters
    pub fn frequency_counters(self) -> usize {
        match self {
            BoardFamily::Avr => 0,
            BoardFamily::Kinetis => 3,
        }
    }

    /// (name, code) edge senses in display order
    pub fn edge_senses(self) -> &'static [(&'static str, u8)] {
        match self {
            BoardFamily::Avr => AVR_EDGE_SENSES,
            BoardFamily::Kinetis => KINETIS_EDGE_SENSES,
        }
    }

    /// (name, code) hardware averaging options
    pub fn averaging(self) -> &'static [(&'static str, u8)] {
        match self {
            BoardFamily::Avr => AVR_AVERAGING,
            BoardFamily::Kinetis => KINETIS_AVERAGING,
        }
    }

    /// Averaging used when none is requested
    pub fn default_averaging(self) -> &'static str {
        match self {
            BoardFamily::Avr => "1",
            BoardFamily::Kinetis => "4",
        }
    }
}

/// Raw trigger timer settings sent in the configuration blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerParams {
    /// Prescaler code (family specific)
    pub prescale: u8,
    /// Counter top or reload value
    pub reload: u32,
}

/// One selectable input
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    /// Name as printed on the board
    pub name: String,
    /// Probe code sent in the configuration
    pub probe: u16,
    /// What the probe measures
    pub kind: ChannelKind,
    /// Differential channels read two's complement
    pub signed: bool,
    /// Divide readings by this to undo on-chip amplification
    pub gain: f64,
}

impl Pin {
    fn new(name: impl Into<String>, kind: ChannelKind, index: u8) -> Self {
        Self {
            name: name.into(),
            probe: probe_code(kind, index),
            kind,
            signed: false,
            gain: 1.0,
        }
    }
}

/// A connected board's capabilities and calibration
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    model: u16,
    family: BoardFamily,
    names: &'static [&'static str],
    pins: Vec<Pin>,
    triggers: Vec<(String, u8)>,
    references: &'static [(&'static str, u8)],
    power_voltage: f64,
    timer_base: f64,
}

impl DeviceProfile {
    /// Resolve the model command response.
    ///
    /// Bytes [0..2] are the little-endian model id; the rest is calibration.
    pub fn resolve(model: &[u8]) -> Result<Self, BoardError> {
        if model.len() < 2 {
            return Err(BoardError::MalformedModel(model.len()));
        }
        let id = LittleEndian::read_u16(&model[..2]);
        let spec = catalog::find(id).ok_or(BoardError::UnknownModel(id))?;

        let mut pins = Vec::new();
        for (name, mux) in spec.analogs {
            pins.push(Pin::new(*name, ChannelKind::Analog, *mux));
        }
        for (name, mux, amplifier) in spec.differentials {
            let mut pin = Pin::new(*name, ChannelKind::Analog, *mux);
            pin.signed = true;
            pin.gain = 0.5 * amplifier;
            pins.push(pin);
        }
        let digitals = digital_pins(&spec.digitals);
        for (name, code) in &digitals {
            pins.push(Pin::new(name.clone(), ChannelKind::Digital, *code));
        }
        for (name, code) in &digitals {
            if on_ports(name, spec.frequency_ports) {
                pins.push(Pin::new(name.clone(), ChannelKind::Frequency, *code));
            }
        }

        let triggers = match &spec.triggers {
            catalog::TriggerPins::Listed(list) => list
                .iter()
                .map(|(name, code)| (name.to_string(), *code))
                .collect(),
            catalog::TriggerPins::DigitalPorts(ports) => digitals
                .iter()
                .filter(|(name, _)| on_ports(name, ports))
                .cloned()
                .collect(),
        };

        let mut profile = Self {
            model: id,
            family: spec.family,
            names: spec.names,
            pins,
            triggers,
            references: spec.references,
            power_voltage: 0.0,
            timer_base: 1.0 / KINETIS_CLOCK_HZ,
        };
        profile.calibrate(&model[2..])?;
        Ok(profile)
    }

    /// Recalibrate from a fresh model response (supply voltage drifts with load)
    pub fn refresh(&mut self, model: &[u8]) -> Result<(), BoardError> {
        if model.len() < 2 {
            return Err(BoardError::MalformedModel(model.len()));
        }
        let id = LittleEndian::read_u16(&model[..2]);
        if id != self.model {
            return Err(BoardError::UnknownModel(id));
        }
        self.calibrate(&model[2..])
    }

    /// Apply calibration bytes (model response after the id)
    fn calibrate(&mut self, calibration: &[u8]) -> Result<(), BoardError> {
        let needed = match self.family {
            BoardFamily::Avr => 4,
            BoardFamily::Kinetis => 2,
        };
        if calibration.len() < needed {
            return Err(BoardError::MalformedModel(calibration.len() + 2));
        }
        let bandgap_reading = f64::from(LittleEndian::read_u16(&calibration[..2]));
        self.power_voltage = 65536.0 / (bandgap_reading / self.family.bandgap());
        if self.family == BoardFamily::Avr {
            let khz = f64::from(LittleEndian::read_u16(&calibration[2..4]));
            self.timer_base = 1.0 / (khz * 1000.0);
        }
        Ok(())
    }

    /// Model id
    pub fn model(&self) -> u16 {
        self.model
    }

    /// Processor family
    pub fn family(&self) -> BoardFamily {
        self.family
    }

    /// Primary board name
    pub fn name(&self) -> &'static str {
        self.names.first().copied().unwrap_or("unknown board")
    }

    /// Every board name this model covers
    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }

    /// All selectable inputs
    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    /// Find a pin by name, optionally restricted to one kind.
    ///
    /// Without a kind, analog beats digital beats frequency for shared names.
    pub fn pin(&self, name: &str, kind: Option<ChannelKind>) -> Result<&Pin, BoardError> {
        self.pins
            .iter()
            .find(|p| p.name == name && kind.map_or(true, |k| k == p.kind))
            .ok_or_else(|| BoardError::UnknownPin(name.to_string()))
    }

    /// Pin behind a probe code
    pub fn pin_for_probe(&self, probe: u16) -> Option<&Pin> {
        self.pins.iter().find(|p| p.probe == probe)
    }

    /// Pin name behind a probe code
    pub fn name_for_probe(&self, probe: u16) -> Option<&str> {
        self.pin_for_probe(probe).map(|p| p.name.as_str())
    }

    /// Names of the edge-trigger pins
    pub fn trigger_pins(&self) -> impl Iterator<Item = &str> {
        self.triggers.iter().map(|(name, _)| name.as_str())
    }

    /// Interrupt code for an edge-trigger pin
    pub fn trigger_pin_code(&self, name: &str) -> Result<u8, BoardError> {
        self.triggers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, code)| *code)
            .ok_or_else(|| BoardError::NotATriggerPin(name.to_string()))
    }

    /// Code for an edge sense (`rises`, `falls`, `changes`)
    pub fn edge_sense_code(&self, sense: &str) -> Result<u8, BoardError> {
        lookup(self.family.edge_senses(), sense)
            .ok_or_else(|| BoardError::UnknownEdgeSense(sense.to_string()))
    }

    /// Analog reference names
    pub fn references(&self) -> impl Iterator<Item = &'static str> {
        self.references.iter().map(|(name, _)| *name)
    }

    /// Code for an analog reference
    pub fn reference_code(&self, name: &str) -> Result<u8, BoardError> {
        lookup(self.references, name).ok_or_else(|| BoardError::UnknownReference(name.to_string()))
    }

    /// Averaging option names
    pub fn averaging_options(&self) -> impl Iterator<Item = &'static str> {
        self.family.averaging().iter().map(|(name, _)| *name)
    }

    /// Averaging used when none is requested
    pub fn default_averaging(&self) -> &'static str {
        self.family.default_averaging()
    }

    /// Code for an averaging option, falling back to the default
    pub fn averaging_code(&self, name: Option<&str>) -> Result<u8, BoardError> {
        let name = name.unwrap_or(self.default_averaging());
        lookup(self.family.averaging(), name)
            .ok_or_else(|| BoardError::UnknownAveraging(name.to_string()))
    }

    /// Quantize a sampling period to what the trigger timer can do.
    ///
    /// Returns the period actually achieved and the raw timer settings.
    pub fn quantize_timer(&self, period: f64) -> Result<(f64, TimerParams), BoardError> {
        if !period.is_finite() || period <= 0.0 {
            return Err(BoardError::InvalidPeriod(period));
        }
        let base = self.timer_base;
        Ok(match self.family {
            BoardFamily::Avr => {
                let max_top = f64::from((1u32 << 16) - 2);
                let (index, prescale) = AVR_PRESCALES
                    .iter()
                    .enumerate()
                    .find(|(_, pr)| period <= max_top * f64::from(**pr) * base)
                    .map(|(i, pr)| (i + 1, *pr))
                    .unwrap_or((AVR_PRESCALES.len(), 1024));
                let ticks = (period / (f64::from(prescale) * base)).round_ties_even();
                let top = ticks.clamp(3.0, 65535.0) as u32;
                let actual = f64::from(prescale) * f64::from(top) * base;
                (
                    actual,
                    TimerParams {
                        prescale: index as u8,
                        reload: top,
                    },
                )
            }
            BoardFamily::Kinetis => {
                let (prescale, code) = if period <= f64::from(1u32 << 24) * base {
                    (1u32, 1u8)
                } else {
                    (16, 0)
                };
                let ticks = (period / (f64::from(prescale) * base)).round_ties_even() - 1.0;
                let reload = ticks.clamp(1.0, f64::from((1u32 << 24) - 1)) as u32;
                let actual = f64::from(reload + 1) * f64::from(prescale) * base;
                (
                    actual,
                    TimerParams {
                        prescale: code,
                        reload,
                    },
                )
            }
        })
    }

    /// Period the trigger timer runs at with `params`
    pub fn timer_period(&self, params: TimerParams) -> f64 {
        let base = self.timer_base;
        match self.family {
            BoardFamily::Avr => {
                let prescale = usize::from(params.prescale)
                    .checked_sub(1)
                    .and_then(|i| AVR_PRESCALES.get(i))
                    .copied()
                    .unwrap_or(1024);
                f64::from(prescale) * f64::from(params.reload) * base
            }
            BoardFamily::Kinetis => {
                let prescale = if params.prescale == 0 { 16.0 } else { 1.0 };
                (f64::from(params.reload) + 1.0) * prescale * base
            }
        }
    }

    /// Seconds per tick of the edge-trigger timestamp
    pub fn timestamp_resolution(&self) -> f64 {
        self.family.timestamp_resolution()
    }

    /// Frequency counter dead time per sample, in seconds
    pub fn frequency_dead_time(&self) -> f64 {
        self.family.frequency_dead_time()
    }

    /// How many frequency channels one configuration may use
    pub fn max_frequency_channels(&self) -> usize {
        self.family.frequency_counters()
    }

    /// Calibrated supply voltage
    pub fn power_voltage(&self) -> f64 {
        self.power_voltage
    }

    /// Trigger timer tick length before prescaling, in seconds
    pub fn timer_base(&self) -> f64 {
        self.timer_base
    }

    /// Convert a 16-bit reading to volts
    pub fn volts(&self, raw: f64, gain: f64) -> f64 {
        raw / 65536.0 * self.power_voltage / gain
    }
}

fn lookup(table: &[(&str, u8)], name: &str) -> Option<u8> {
    table.iter().find(|(n, _)| *n == name).map(|(_, code)| *code)
}

fn digital_pins(source: &catalog::DigitalPins) -> Vec<(String, u8)> {
    match source {
        catalog::DigitalPins::Listed(list) => list
            .iter()
            .map(|(name, code)| (name.to_string(), *code))
            .collect(),
        catalog::DigitalPins::Ports(ports) => ports
            .iter()
            .enumerate()
            .flat_map(|(n, (port, bits))| {
                bits.iter()
                    .map(move |bit| (format!("PT{}{}", port, bit), (n as u8) * 32 + bit))
            })
            .collect(),
    }
}

/// Whether a `PT<port><bit>` pin name is on one of `ports`
fn on_ports(name: &str, ports: &[char]) -> bool {
    name.strip_prefix("PT")
        .and_then(|rest| rest.chars().next())
        .is_some_and(|port| ports.contains(&port))
}

/// Model response for a board, as the firmware would send it
pub fn model_response(model: u16, bandgap_reading: u16, cpu_khz: Option<u16>) -> Vec<u8> {
    let mut bytes = vec![0u8; if cpu_khz.is_some() { 6 } else { 4 }];
    LittleEndian::write_u16(&mut bytes[0..2], model);
    LittleEndian::write_u16(&mut bytes[2..4], bandgap_reading);
    if let Some(khz) = cpu_khz {
        LittleEndian::write_u16(&mut bytes[4..6], khz);
    }
    bytes
}
