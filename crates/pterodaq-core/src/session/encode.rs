//! Configuration blob encoding
//!
//! Layout of the configure command payload:
//! - timed trigger: `0x01|flush, prescale, reload (u32 LE)`
//! - edge trigger:  `0x02|0x10, sense code, interrupt pin code`
//! - analog reference code
//! - averaging code
//! - per channel: probe low byte (kind tag), probe high byte (index)

use tracing::debug;

use super::channel::{AcquisitionConfig, TriggerSpec};
use super::SessionError;
use crate::board::DeviceProfile;
use crate::protocol::PayloadBuilder;

/// Trigger type tag for timed sampling
pub const TRIGGER_TIMED: u8 = 0x01;

/// Trigger type tag for pin-edge sampling
pub const TRIGGER_EDGE: u8 = 0x02;

/// Added to the trigger tag to make the board flush after every frame
pub const FORCE_FLUSH: u8 = 0x10;

/// Largest configuration the firmware command buffer accepts
pub const MAX_CONFIG_SIZE: usize = 64;

/// Board-side output buffer size used in the flush decision
const FLUSH_BUFFER_BYTES: f64 = 63.0;

/// Below this many buffer-fulls per second the board must flush every frame
const MIN_BUFFERS_PER_SEC: f64 = 20.0;

/// An encoded configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedConfig {
    /// Configure command payload
    pub blob: Vec<u8>,
    /// Period the timer actually runs at (timed triggers only)
    pub actual_period: Option<f64>,
    /// Whether the flush bit was set
    pub force_flush: bool,
}

/// Whether a timed trigger streams too slowly to fill the board's buffer.
///
/// A whole telemetry frame is the payload plus marker, length and checksum.
pub fn needs_flush(config: &AcquisitionConfig, period: f64) -> bool {
    let frame_len = (7 + config.sample_bytes()) as f64;
    let bytes_per_sec = frame_len / period;
    bytes_per_sec / FLUSH_BUFFER_BYTES < MIN_BUFFERS_PER_SEC
}

/// Encode `config` for `profile`
pub fn encode_config(
    config: &AcquisitionConfig,
    profile: &DeviceProfile,
) -> Result<EncodedConfig, SessionError> {
    if config.channels.is_empty() {
        return Err(SessionError::EmptyChannelList);
    }
    let frequencies = config.frequency_count();
    if frequencies > profile.max_frequency_channels() {
        return Err(SessionError::TooManyChannels(format!(
            "{} frequency channels, {} supports {}",
            frequencies,
            profile.name(),
            profile.max_frequency_channels()
        )));
    }

    let mut builder = PayloadBuilder::new();
    let mut actual_period = None;
    let force_flush;
    match &config.trigger {
        TriggerSpec::Timed { period } => {
            let (actual, timer) = profile.quantize_timer(*period)?;
            force_flush = needs_flush(config, *period);
            let tag = TRIGGER_TIMED | if force_flush { FORCE_FLUSH } else { 0 };
            builder = builder.byte(tag).byte(timer.prescale).u32_le(timer.reload);
            actual_period = Some(actual);
        }
        TriggerSpec::Edge { pin, sense } => {
            let sense_code = profile.edge_sense_code(sense)?;
            let pin_code = profile.trigger_pin_code(pin)?;
            // the next edge may never come
            force_flush = true;
            builder = builder
                .byte(TRIGGER_EDGE | FORCE_FLUSH)
                .byte(sense_code)
                .byte(pin_code);
        }
    }

    builder = builder
        .byte(profile.reference_code(&config.reference)?)
        .byte(profile.averaging_code(config.averaging.as_deref())?);

    for channel in &config.channels {
        builder = builder.u16_le(channel.probe);
    }

    if builder.len() > MAX_CONFIG_SIZE {
        return Err(SessionError::TooManyChannels(format!(
            "{} channels need {} configuration bytes, limit is {}",
            config.channels.len(),
            builder.len(),
            MAX_CONFIG_SIZE
        )));
    }

    let blob = builder.build();
    debug!(
        "Encoded configuration: {} channels, {} bytes, flush {}",
        config.channels.len(),
        blob.len(),
        force_flush
    );
    Ok(EncodedConfig {
        blob,
        actual_period,
        force_flush,
    })
}
