//! Channel and trigger descriptions
//!
//! What the session needs to know about each configured channel to encode the
//! configuration and to interpret its samples.

use serde::{Deserialize, Serialize};

use crate::board::{ChannelKind, Pin};

/// Decode and scaling rules for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    /// What the probe measures
    pub kind: ChannelKind,
    /// Two's complement analog reading (differential inputs)
    pub signed: bool,
    /// Keep only every nth sample; the rest repeat the previous value
    pub downsample: u32,
    /// Divide by this to undo hardware amplification
    pub gain: f64,
}

impl Interpretation {
    /// Unsigned analog with unity gain
    pub fn analog() -> Self {
        Self {
            kind: ChannelKind::Analog,
            signed: false,
            downsample: 1,
            gain: 1.0,
        }
    }

    /// Digital input
    pub fn digital() -> Self {
        Self {
            kind: ChannelKind::Digital,
            ..Self::analog()
        }
    }

    /// Edge counter
    pub fn frequency() -> Self {
        Self {
            kind: ChannelKind::Frequency,
            ..Self::analog()
        }
    }

    /// Same interpretation with a downsample factor (at least 1)
    pub fn with_downsample(mut self, factor: u32) -> Self {
        self.downsample = factor.max(1);
        self
    }

    /// Same interpretation, reading two's complement
    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Same interpretation with an amplifier gain
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Analog channel
    pub fn is_analog(&self) -> bool {
        self.kind == ChannelKind::Analog
    }

    /// Digital channel
    pub fn is_digital(&self) -> bool {
        self.kind == ChannelKind::Digital
    }

    /// Frequency channel
    pub fn is_frequency(&self) -> bool {
        self.kind == ChannelKind::Frequency
    }
}

/// One configured channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Name used in saved recordings
    pub name: String,
    /// Device probe code
    pub probe: u16,
    /// How to read the samples
    pub interpretation: Interpretation,
}

impl ChannelDescriptor {
    /// Create a channel
    pub fn new(name: impl Into<String>, probe: u16, interpretation: Interpretation) -> Self {
        Self {
            name: name.into(),
            probe,
            interpretation,
        }
    }

    /// Channel reading a board pin
    pub fn from_pin(name: impl Into<String>, pin: &Pin, downsample: u32) -> Self {
        let interpretation = Interpretation {
            kind: pin.kind,
            signed: pin.signed,
            downsample: downsample.max(1),
            gain: pin.gain,
        };
        Self::new(name, pin.probe, interpretation)
    }

    /// Convert a raw analog reading to volts
    pub fn volts(&self, raw: f64, power_voltage: f64) -> f64 {
        raw / 65536.0 * power_voltage / self.interpretation.gain
    }
}

/// What makes the board take a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerSpec {
    /// Every `period` seconds
    Timed {
        /// Requested period in seconds
        period: f64,
    },
    /// On an edge of a pin
    Edge {
        /// Interrupt-capable pin name
        pin: String,
        /// `rises`, `falls` or `changes`
        sense: String,
    },
}

impl TriggerSpec {
    /// Time-based trigger
    pub fn timed(period: f64) -> Self {
        TriggerSpec::Timed { period }
    }

    /// Pin-edge trigger
    pub fn edge(pin: impl Into<String>, sense: impl Into<String>) -> Self {
        TriggerSpec::Edge {
            pin: pin.into(),
            sense: sense.into(),
        }
    }

    /// Whether samples come from the timer
    pub fn is_timed(&self) -> bool {
        matches!(self, TriggerSpec::Timed { .. })
    }

    /// Requested period of a timed trigger
    pub fn period(&self) -> Option<f64> {
        match self {
            TriggerSpec::Timed { period } => Some(*period),
            TriggerSpec::Edge { .. } => None,
        }
    }

    /// Width of the telemetry timestamp field
    pub fn timestamp_width(&self) -> usize {
        if self.is_timed() {
            4
        } else {
            8
        }
    }
}

impl std::fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSpec::Timed { period } => {
                write!(f, "every {} sec ({} Hz)", period, 1.0 / period)
            }
            TriggerSpec::Edge { pin, sense } => write!(f, "when {} {}", pin, sense),
        }
    }
}

/// A decoded channel value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    /// Raw ADC reading (16-bit, signed or unsigned)
    Analog(i32),
    /// Pin level
    Digital(bool),
    /// Edge rate in Hz
    Frequency(f64),
}

impl SampleValue {
    /// Numeric value (digital as 0/1)
    pub fn as_f64(&self) -> f64 {
        match self {
            SampleValue::Analog(raw) => f64::from(*raw),
            SampleValue::Digital(level) => f64::from(u8::from(*level)),
            SampleValue::Frequency(rate) => *rate,
        }
    }
}

impl From<bool> for SampleValue {
    fn from(level: bool) -> Self {
        SampleValue::Digital(level)
    }
}

/// One sample: timestamp in seconds and a value per channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    /// Seconds since sampling started
    pub time: f64,
    /// Values in configuration order
    pub values: Vec<SampleValue>,
}

impl SampleRow {
    /// Create a row
    pub fn new(time: f64, values: Vec<SampleValue>) -> Self {
        Self { time, values }
    }
}

/// A complete acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sampling trigger
    pub trigger: TriggerSpec,
    /// Analog reference name
    pub reference: String,
    /// Hardware averaging name; the board default when `None`
    pub averaging: Option<String>,
    /// Channels in the order the board streams them
    pub channels: Vec<ChannelDescriptor>,
}

impl AcquisitionConfig {
    /// Create a configuration
    pub fn new(
        trigger: TriggerSpec,
        reference: impl Into<String>,
        averaging: Option<String>,
        channels: Vec<ChannelDescriptor>,
    ) -> Self {
        Self {
            trigger,
            reference: reference.into(),
            averaging,
            channels,
        }
    }

    fn count(&self, kind: ChannelKind) -> usize {
        self.channels
            .iter()
            .filter(|c| c.interpretation.kind == kind)
            .count()
    }

    /// Number of analog channels
    pub fn analog_count(&self) -> usize {
        self.count(ChannelKind::Analog)
    }

    /// Number of digital channels
    pub fn digital_count(&self) -> usize {
        self.count(ChannelKind::Digital)
    }

    /// Number of frequency channels
    pub fn frequency_count(&self) -> usize {
        self.count(ChannelKind::Frequency)
    }

    /// Bytes of samples in one telemetry payload (after the timestamp)
    pub fn sample_bytes(&self) -> usize {
        2 * self.analog_count() + 4 * self.frequency_count() + self.digital_count().div_ceil(8)
    }

    /// Expected telemetry payload length, timestamp included
    pub fn telemetry_len(&self) -> usize {
        self.trigger.timestamp_width() + self.sample_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_len() {
        let config = AcquisitionConfig::new(
            TriggerSpec::timed(0.1),
            "Power",
            None,
            vec![
                ChannelDescriptor::new("a", 0x0001, Interpretation::analog()),
                ChannelDescriptor::new("f", 0x0103, Interpretation::frequency()),
                ChannelDescriptor::new("d1", 0x0202, Interpretation::digital()),
                ChannelDescriptor::new("d2", 0x0302, Interpretation::digital()),
            ],
        );
        assert_eq!(config.sample_bytes(), 2 + 4 + 1);
        assert_eq!(config.telemetry_len(), 11);

        let edge = AcquisitionConfig {
            trigger: TriggerSpec::edge("D2", "rises"),
            ..config
        };
        assert_eq!(edge.telemetry_len(), 15);
    }

    #[test]
    fn test_trigger_description() {
        assert_eq!(TriggerSpec::timed(0.5).to_string(), "every 0.5 sec (2 Hz)");
        assert_eq!(TriggerSpec::edge("D2", "rises").to_string(), "when D2 rises");
    }

    #[test]
    fn test_downsample_floor() {
        assert_eq!(Interpretation::analog().with_downsample(0).downsample, 1);
    }
}
