//! Recording file format
//!
//! A commented header followed by one tab-separated line per sample:
//!
//! ```text
//! # PteroDAQ recording
//! # 2024 Mar 05 14:02:11
//! ...
//! # 2 samples
//! 0.0000000	1.650000	1
//! 0.1000000	1.651200	0
//! ```
//!
//! The first column is seconds since the first sample. When time goes
//! backwards (sampling was restarted) a blank line is written and the
//! offset resets.

use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::stats::channel_stats;
use crate::session::{ChannelDescriptor, SampleRow, SampleValue, TriggerSpec};

/// First line of every recording
pub const RECORDING_MAGIC: &str = "# PteroDAQ recording";

/// A channel as listed in the header
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderChannel {
    /// User-facing channel name
    pub name: String,
    /// Board pin name
    pub pin: String,
    /// Downsample factor
    pub downsample: u32,
}

/// Everything in a recording besides the rows
#[derive(Debug, Clone)]
pub struct RecordingHeader {
    /// When the file was written
    pub recorded_at: DateTime<Local>,
    /// Board name
    pub board: String,
    /// Sampling trigger
    pub trigger: TriggerSpec,
    /// Analog reference name
    pub reference: String,
    /// Averaging option name
    pub averaging: String,
    /// Calibrated supply voltage
    pub power_voltage: f64,
    /// Write analog values in volts
    pub convert_to_volts: bool,
    /// Channels in column order
    pub channels: Vec<HeaderChannel>,
    /// Free-form notes, may span lines
    pub notes: String,
}

/// Format one value for a data line
pub fn format_value(value: &SampleValue, channel: &ChannelDescriptor, volts: Option<f64>) -> String {
    match (value, volts) {
        (SampleValue::Analog(raw), Some(vcc)) if channel.interpretation.is_analog() => {
            format!("{:.6}", channel.volts(f64::from(*raw), vcc))
        }
        (SampleValue::Analog(raw), _) => raw.to_string(),
        (SampleValue::Digital(level), _) => u8::from(*level).to_string(),
        (SampleValue::Frequency(rate), _) => format!("{:.3}", rate),
    }
}

/// Write a complete recording
pub fn write_recording<W: Write>(
    out: &mut W,
    header: &RecordingHeader,
    channels: &[ChannelDescriptor],
    rows: &[SampleRow],
) -> io::Result<()> {
    writeln!(out, "{}", RECORDING_MAGIC)?;
    writeln!(out, "# {}", header.recorded_at.format("%Y %b %d %H:%M:%S"))?;
    writeln!(out, "# Board: {}", header.board)?;
    writeln!(out, "# Recording {}", header.trigger)?;
    writeln!(out, "# Analog reference is {}", header.reference)?;
    if header.averaging != "1" {
        writeln!(out, "# Averaging {} readings together", header.averaging)?;
    }
    if header.convert_to_volts {
        writeln!(out, "# Scale: 0 to {:.4} volts", header.power_voltage)?;
    } else {
        writeln!(out, "# Scale: 0 to 65535")?;
    }

    writeln!(out, "# Recording channels:")?;
    writeln!(out, "#   timestamp (in seconds)")?;
    for channel in &header.channels {
        if channel.downsample > 1 {
            writeln!(
                out,
                "#   {} : {} downsample by {}",
                channel.name, channel.pin, channel.downsample
            )?;
        } else {
            writeln!(out, "#   {} : {}", channel.name, channel.pin)?;
        }
    }

    let volts = header.convert_to_volts.then_some(header.power_voltage);
    let stats = channel_stats(rows, channels, volts);
    writeln!(out, "# Channel summary (DC, RMS):")?;
    for (channel, stat) in header.channels.iter().zip(&stats) {
        match (stat.mean(), stat.rms()) {
            (Some(mean), Some(rms)) => {
                writeln!(out, "#   {} : DC {:.6} RMS {:.6}", channel.name, mean, rms)?
            }
            _ => writeln!(out, "#   {} : no data", channel.name)?,
        }
    }

    writeln!(out, "# Notes:")?;
    for line in header.notes.split('\n') {
        writeln!(out, "#   {}", line)?;
    }
    writeln!(out, "# {} samples", rows.len())?;

    let mut old_time = 0.0;
    let mut offset: Option<f64> = None;
    for row in rows {
        let time = row.time;
        let base = match offset {
            Some(base) if time >= old_time => base,
            Some(_) => {
                writeln!(out)?;
                time
            }
            None => time,
        };
        offset = Some(base);
        old_time = time;

        write!(out, "{:.7}", time - base)?;
        for (value, channel) in row.values.iter().zip(channels) {
            write!(out, "\t{}", format_value(value, channel, volts))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Write a recording to a file
pub fn save_recording<P: AsRef<Path>>(
    path: P,
    header: &RecordingHeader,
    channels: &[ChannelDescriptor],
    rows: &[SampleRow],
) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_recording(&mut writer, header, channels, rows)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Interpretation;

    fn header(volts: bool) -> RecordingHeader {
        RecordingHeader {
            recorded_at: Local::now(),
            board: "FRDM-KL25Z".into(),
            trigger: TriggerSpec::timed(0.1),
            reference: "Power".into(),
            averaging: "4".into(),
            power_voltage: 3.3,
            convert_to_volts: volts,
            channels: vec![
                HeaderChannel {
                    name: "light".into(),
                    pin: "PTB0".into(),
                    downsample: 1,
                },
                HeaderChannel {
                    name: "switch".into(),
                    pin: "PTA1".into(),
                    downsample: 3,
                },
            ],
            notes: "first line\nsecond line".into(),
        }
    }

    fn channels() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new("light", 0x0801, Interpretation::analog()),
            ChannelDescriptor::new("switch", 0x0102, Interpretation::digital().with_downsample(3)),
        ]
    }

    fn render(volts: bool, rows: &[SampleRow]) -> String {
        let mut out = Vec::new();
        write_recording(&mut out, &header(volts), &channels(), rows).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_header_lines() {
        let text = render(false, &[]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], RECORDING_MAGIC);
        assert!(lines.contains(&"# Recording every 0.1 sec (10 Hz)"));
        assert!(lines.contains(&"# Averaging 4 readings together"));
        assert!(lines.contains(&"# Scale: 0 to 65535"));
        assert!(lines.contains(&"#   light : PTB0"));
        assert!(lines.contains(&"#   switch : PTA1 downsample by 3"));
        assert!(lines.contains(&"#   light : no data"));
        assert!(lines.contains(&"#   second line"));
        assert_eq!(*lines.last().unwrap(), "# 0 samples");
    }

    #[test]
    fn test_rows_in_volts() {
        let rows = vec![
            SampleRow::new(2.0, vec![SampleValue::Analog(32768), SampleValue::Digital(true)]),
            SampleRow::new(2.1, vec![SampleValue::Analog(0), SampleValue::Digital(false)]),
        ];
        let text = render(true, &rows);
        assert!(text.contains("# Scale: 0 to 3.3000 volts"));
        assert!(text.contains("#   light : DC 0.825000 RMS 0.825000"));
        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data, vec!["0.0000000\t1.650000\t1", "0.1000000\t0.000000\t0"]);
    }

    #[test]
    fn test_time_going_backwards_starts_new_block() {
        let rows = vec![
            SampleRow::new(5.0, vec![SampleValue::Analog(1), SampleValue::Digital(true)]),
            SampleRow::new(5.5, vec![SampleValue::Analog(2), SampleValue::Digital(true)]),
            SampleRow::new(0.25, vec![SampleValue::Analog(3), SampleValue::Digital(false)]),
            SampleRow::new(0.5, vec![SampleValue::Analog(4), SampleValue::Digital(false)]),
        ];
        let text = render(false, &rows);
        let data: Vec<&str> = text.lines().skip_while(|l| l.starts_with('#')).collect();
        assert_eq!(
            data,
            vec![
                "0.0000000\t1\t1",
                "0.5000000\t2\t1",
                "",
                "0.0000000\t3\t0",
                "0.2500000\t4\t0",
            ]
        );
    }

    #[test]
    fn test_frequency_format() {
        let channel = ChannelDescriptor::new("f", 0x4503, Interpretation::frequency());
        assert_eq!(
            format_value(&SampleValue::Frequency(1234.56789), &channel, Some(3.3)),
            "1234.568"
        );
    }
}
