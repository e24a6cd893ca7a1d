//! Telemetry decoding
//!
//! Payload layout: timestamp (u32 tick count for timed triggers, u64 clock
//! ticks for edge triggers), then channel samples in configuration order:
//! - analog: 2 bytes LE, signed or unsigned
//! - frequency: 4 bytes LE edge count
//! - digital: one bit each, LSB first; a packing byte follows every 8th
//!   digital channel and a final byte holds any remainder

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::channel::{AcquisitionConfig, ChannelDescriptor, SampleRow, SampleValue, TriggerSpec};
use crate::board::{ChannelKind, DeviceProfile};

/// Why a telemetry payload was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload length differs from the configured layout
    #[error("Telemetry payload is {actual} bytes, configuration expects {expected}")]
    LengthMismatch {
        /// Configured payload length
        expected: usize,
        /// Received payload length
        actual: usize,
    },
}

/// How the timestamp field turns into seconds
#[derive(Debug, Clone, Copy, PartialEq)]
enum Clock {
    /// Sample counter times the requested period
    Timed { period: f64 },
    /// Free-running tick counter
    Edge { resolution: f64 },
}

/// Decodes telemetry payloads for one configuration
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    clock: Clock,
    dead_time: f64,
    channels: Vec<ChannelDescriptor>,
    expected_len: usize,
    previous_time: Option<f64>,
}

impl TelemetryDecoder {
    /// Decoder for `config` on `profile`
    pub fn new(config: &AcquisitionConfig, profile: &DeviceProfile) -> Self {
        let clock = match config.trigger {
            TriggerSpec::Timed { period } => Clock::Timed { period },
            TriggerSpec::Edge { .. } => Clock::Edge {
                resolution: profile.timestamp_resolution(),
            },
        };
        Self {
            clock,
            dead_time: profile.frequency_dead_time(),
            channels: config.channels.clone(),
            expected_len: config.telemetry_len(),
            previous_time: None,
        }
    }

    /// Payload length every frame must have
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Channels in decode order
    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    /// Forget the previous timestamp (the board restarts its clock on go)
    pub fn restart(&mut self) {
        self.previous_time = None;
    }

    /// Decode one payload into a row of fresh values
    pub fn decode(&mut self, payload: &[u8]) -> Result<SampleRow, DecodeError> {
        if payload.len() != self.expected_len {
            return Err(DecodeError::LengthMismatch {
                expected: self.expected_len,
                actual: payload.len(),
            });
        }

        let (time, mut pos) = match self.clock {
            Clock::Timed { period } => (f64::from(LittleEndian::read_u32(payload)) * period, 4),
            Clock::Edge { resolution } => (LittleEndian::read_u64(payload) as f64 * resolution, 8),
        };
        let elapsed = time - self.previous_time.unwrap_or(0.0);

        // first pass: byte-aligned values, collecting the digital packing bytes
        let mut values = Vec::with_capacity(self.channels.len());
        let mut packed = Vec::new();
        let mut digital_count = 0usize;
        for channel in &self.channels {
            let interpretation = &channel.interpretation;
            match interpretation.kind {
                ChannelKind::Analog => {
                    let raw = if interpretation.signed {
                        i32::from(LittleEndian::read_i16(&payload[pos..]))
                    } else {
                        i32::from(LittleEndian::read_u16(&payload[pos..]))
                    };
                    values.push(Some(SampleValue::Analog(raw)));
                    pos += 2;
                }
                ChannelKind::Frequency => {
                    let count = f64::from(LittleEndian::read_u32(&payload[pos..]));
                    values.push(Some(SampleValue::Frequency(self.rate(count, elapsed))));
                    pos += 4;
                }
                ChannelKind::Digital => {
                    values.push(None);
                    digital_count += 1;
                    if digital_count % 8 == 0 {
                        packed.push(payload[pos]);
                        pos += 1;
                    }
                }
            }
        }
        if digital_count % 8 != 0 {
            packed.push(payload[pos]);
        }

        // second pass: hand out bits in channel order
        let mut bit = 0usize;
        let values = values
            .into_iter()
            .map(|value| {
                value.unwrap_or_else(|| {
                    let level = (packed[bit / 8] >> (bit % 8)) & 1 == 1;
                    bit += 1;
                    SampleValue::Digital(level)
                })
            })
            .collect();

        self.previous_time = Some(time);
        Ok(SampleRow::new(time, values))
    }

    /// Edge count to rate in Hz
    fn rate(&self, count: f64, elapsed: f64) -> f64 {
        match self.clock {
            Clock::Timed { period } => frequency_rate(count, period, self.dead_time),
            Clock::Edge { .. } => {
                if elapsed > 0.0 {
                    count / elapsed
                } else {
                    0.0
                }
            }
        }
    }
}

/// Edge rate over one timed period, compensating for counter dead time.
///
/// Edges missed while the counter was disabled add
/// `(dead_time * rate - 1) / period` once more than one edge could be missed.
pub fn frequency_rate(count: f64, period: f64, dead_time: f64) -> f64 {
    let rate = count / period;
    let missed = dead_time * rate;
    if missed > 1.0 {
        rate + (missed - 1.0) / period
    } else {
        rate
    }
}

/// Append a decoded row, applying the first-sample patch and downsampling.
///
/// Frequency channels have no valid interval on the very first row, so it
/// takes the second row's values. A channel whose downsample factor does not
/// divide the current row count repeats the previous row's value.
pub fn append_row(rows: &mut Vec<SampleRow>, mut row: SampleRow, channels: &[ChannelDescriptor]) {
    if rows.len() == 1 {
        let first = &mut rows[0];
        for (n, channel) in channels.iter().enumerate() {
            if channel.interpretation.is_frequency() {
                if let (Some(slot), Some(value)) = (first.values.get_mut(n), row.values.get(n)) {
                    *slot = *value;
                }
            }
        }
    }

    if let Some(previous) = rows.last() {
        let count = rows.len() as u64;
        for (n, channel) in channels.iter().enumerate() {
            if count % u64::from(channel.interpretation.downsample.max(1)) != 0 {
                if let (Some(slot), Some(value)) = (row.values.get_mut(n), previous.values.get(n)) {
                    *slot = *value;
                }
            }
        }
    }

    rows.push(row);
}
