//! Recording playback
//!
//! Reads saved recordings back for analysis.

use std::fs;
use std::io;
use std::path::Path;

/// One data line of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRow {
    /// Seconds since the start of its segment
    pub elapsed: f64,
    /// Column values
    pub values: Vec<f64>,
}

/// A parsed recording
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recording {
    /// Header lines without the leading `# `
    pub header: Vec<String>,
    /// Channel names from the header
    pub channels: Vec<String>,
    /// Runs of rows; a new segment starts wherever sampling restarted
    pub segments: Vec<Vec<PlaybackRow>>,
}

impl Recording {
    /// All rows, segment after segment
    pub fn rows(&self) -> impl Iterator<Item = &PlaybackRow> {
        self.segments.iter().flatten()
    }

    /// Total number of rows
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Player over every row
    pub fn player(&self) -> RecordingPlayer {
        RecordingPlayer::new(self.channels.clone(), self.rows().cloned().collect())
    }
}

fn invalid(line: usize, message: impl std::fmt::Display) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line {}: {}", line, message),
    )
}

/// Channel names listed under "Recording channels:"
fn channel_names(header: &[String]) -> Vec<String> {
    header
        .iter()
        .skip_while(|line| line.as_str() != "Recording channels:")
        .skip(1)
        .take_while(|line| line.starts_with("  "))
        .filter_map(|line| line.split_once(" : ").map(|(name, _)| name.trim().to_string()))
        .collect()
}

/// Parse recording text
pub fn parse_recording(text: &str) -> io::Result<Recording> {
    let mut recording = Recording::default();
    let mut segment = Vec::new();

    for (n, line) in text.lines().enumerate() {
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.strip_prefix(' ').unwrap_or(comment);
            recording.header.push(comment.to_string());
            continue;
        }
        if line.trim().is_empty() {
            if !segment.is_empty() {
                recording.segments.push(std::mem::take(&mut segment));
            }
            continue;
        }

        let mut fields = line.split('\t').map(str::trim).map(|field| {
            field
                .parse::<f64>()
                .map_err(|e| invalid(n + 1, format!("{:?}: {}", field, e)))
        });
        let elapsed = fields
            .next()
            .ok_or_else(|| invalid(n + 1, "missing timestamp"))??;
        let values = fields.collect::<io::Result<Vec<f64>>>()?;
        segment.push(PlaybackRow { elapsed, values });
    }
    if !segment.is_empty() {
        recording.segments.push(segment);
    }

    recording.channels = channel_names(&recording.header);
    Ok(recording)
}

/// Read a saved recording
pub fn read_recording<P: AsRef<Path>>(path: P) -> io::Result<Recording> {
    let text = fs::read_to_string(path)?;
    parse_recording(&text)
}

/// Cursor over recorded rows
pub struct RecordingPlayer {
    /// Rows in file order
    rows: Vec<PlaybackRow>,
    /// Channel names
    channels: Vec<String>,
    /// Current position
    position: usize,
}

impl RecordingPlayer {
    /// Create a player
    pub fn new(channels: Vec<String>, rows: Vec<PlaybackRow>) -> Self {
        Self {
            rows,
            channels,
            position: 0,
        }
    }

    /// Get the number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get the channel names
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Get the current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Seek to a position
    pub fn seek(&mut self, position: usize) {
        self.position = position.min(self.rows.len().saturating_sub(1));
    }

    /// Seek to the first row at or after `elapsed` seconds
    pub fn seek_to_time(&mut self, elapsed: f64) {
        self.position = self
            .rows
            .iter()
            .position(|row| row.elapsed >= elapsed)
            .unwrap_or(self.rows.len().saturating_sub(1));
    }

    /// Get the current row
    pub fn current(&self) -> Option<&PlaybackRow> {
        self.rows.get(self.position)
    }

    /// Advance to the next row
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&PlaybackRow> {
        if self.position + 1 < self.rows.len() {
            self.position += 1;
            self.current()
        } else {
            None
        }
    }

    /// Go to the previous row
    pub fn previous(&mut self) -> Option<&PlaybackRow> {
        if self.position > 0 {
            self.position -= 1;
            self.current()
        } else {
            None
        }
    }

    /// Find the index of a channel by name
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == name)
    }

    /// Get values for a specific channel
    pub fn channel_values(&self, channel: &str) -> Vec<f64> {
        let Some(idx) = self.channel_index(channel) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.values.get(idx).copied())
            .collect()
    }
}
