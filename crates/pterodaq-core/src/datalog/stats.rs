//! Per-channel summary statistics

use crate::session::{ChannelDescriptor, SampleRow};

/// Running sums for a mean and RMS deviation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    sum_squares: f64,
}

impl RunningStats {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        self.sum += x;
        self.sum_squares += x * x;
    }

    /// Values added
    pub fn count(&self) -> u64 {
        self.count
    }

    /// DC level
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// RMS of the deviation from the mean
    pub fn rms(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self.sum_squares / self.count as f64 - mean * mean;
        // rounding can push a constant signal slightly negative
        Some(variance.max(0.0).sqrt())
    }
}

/// Statistics for every channel over `rows`.
///
/// With a supply voltage, analog channels are accumulated in volts.
pub fn channel_stats(
    rows: &[SampleRow],
    channels: &[ChannelDescriptor],
    power_voltage: Option<f64>,
) -> Vec<RunningStats> {
    let mut stats = vec![RunningStats::new(); channels.len()];
    for row in rows {
        for ((stat, channel), value) in stats.iter_mut().zip(channels).zip(&row.values) {
            let x = value.as_f64();
            match power_voltage {
                Some(vcc) if channel.interpretation.is_analog() => stat.push(channel.volts(x, vcc)),
                _ => stat.push(x),
            }
        }
    }
    stats
}
