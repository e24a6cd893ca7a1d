//! Data Logging
//!
//! Saves recorded samples as commented, tab-separated text and reads them
//! back.

mod format;
mod playback;
mod stats;

pub use format::{
    format_value, save_recording, write_recording, HeaderChannel, RecordingHeader,
    RECORDING_MAGIC,
};
pub use playback::{parse_recording, read_recording, PlaybackRow, Recording, RecordingPlayer};
pub use stats::{channel_stats, RunningStats};
