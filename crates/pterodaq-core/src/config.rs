//! Configuration Files
//!
//! JSON-backed settings: how to reach the board ([`ConnectionConfig`]) and
//! what to record ([`AcquisitionPlan`]). A plan names pins the way they are
//! printed on the board and is resolved against the connected board's
//! [`DeviceProfile`] into an [`AcquisitionConfig`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::board::{BoardError, ChannelKind, DeviceProfile};
use crate::protocol::link::LinkOptions;
use crate::protocol::{
    DEFAULT_BAUD_RATE, DEFAULT_COMMAND_ATTEMPTS, DEFAULT_COMMAND_TIMEOUT_MS,
    DEFAULT_FRAME_TIMEOUT_MS, DEFAULT_READ_TIMEOUT_MS,
};
use crate::session::{AcquisitionConfig, ChannelDescriptor, TriggerSpec};

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> io::Result<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> io::Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, content)
}

/// How to reach a board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name; `None` picks the first listed port
    pub port_name: Option<String>,

    /// UART baud rate (ignored by native USB boards)
    pub baud_rate: u32,

    /// Wait for a command response
    pub command_timeout_ms: u64,

    /// Stream read timeout; bounds link shutdown
    pub read_timeout_ms: u64,

    /// Time allowed to finish a frame once started
    pub frame_timeout_ms: u64,

    /// Attempts per command before giving up
    pub command_attempts: u32,

    /// Run the bootloader-exit reset sequence when opening the port
    pub reset_on_open: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            command_attempts: DEFAULT_COMMAND_ATTEMPTS,
            reset_on_open: true,
        }
    }
}

impl ConnectionConfig {
    /// Default settings for a named port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: Some(port_name.into()),
            ..Self::default()
        }
    }

    /// Link timing derived from these settings
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
        }
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        load_json(path.as_ref())
    }

    /// Save as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        save_json(self, path.as_ref())
    }
}

fn default_reference() -> String {
    "Power".to_string()
}

fn default_downsample() -> u32 {
    1
}

/// One requested channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Name in recordings; the pin name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Pin name as printed on the board
    pub pin: String,

    /// Force a kind for pins that have several (e.g. `A0` digital)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChannelKind>,

    /// Keep every nth sample
    #[serde(default = "default_downsample")]
    pub downsample: u32,
}

impl ChannelSpec {
    /// Channel on a pin with default settings
    pub fn pin(pin: impl Into<String>) -> Self {
        Self {
            name: None,
            pin: pin.into(),
            kind: None,
            downsample: 1,
        }
    }
}

/// A declarative description of what to record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Sampling trigger
    pub trigger: TriggerSpec,

    /// Analog reference name
    #[serde(default = "default_reference")]
    pub reference: String,

    /// Hardware averaging; the board default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub averaging: Option<String>,

    /// Channels in streaming order
    pub channels: Vec<ChannelSpec>,
}

impl AcquisitionPlan {
    /// Resolve pin names into probe codes for `profile`
    pub fn resolve(&self, profile: &DeviceProfile) -> Result<AcquisitionConfig, BoardError> {
        if let TriggerSpec::Edge { pin, sense } = &self.trigger {
            profile.trigger_pin_code(pin)?;
            profile.edge_sense_code(sense)?;
        }
        profile.reference_code(&self.reference)?;
        profile.averaging_code(self.averaging.as_deref())?;

        let channels = self
            .channels
            .iter()
            .map(|spec| {
                let pin = profile.pin(&spec.pin, spec.kind)?;
                let name = spec.name.clone().unwrap_or_else(|| spec.pin.clone());
                Ok(ChannelDescriptor::from_pin(name, pin, spec.downsample))
            })
            .collect::<Result<Vec<_>, BoardError>>()?;

        Ok(AcquisitionConfig::new(
            self.trigger.clone(),
            self.reference.clone(),
            self.averaging.clone(),
            channels,
        ))
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        load_json(path.as_ref())
    }

    /// Save as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        save_json(self, path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::model_response;

    fn kl25z() -> DeviceProfile {
        DeviceProfile::resolve(&model_response(5, 19859, None)).unwrap()
    }

    #[test]
    fn test_connection_defaults_from_partial_json() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{ "port_name": "/dev/ttyACM0", "command_attempts": 5 }"#)
                .unwrap();
        assert_eq!(config.port_name.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.command_attempts, 5);
        assert_eq!(config.baud_rate, 1_000_000);
        assert_eq!(config.command_timeout_ms, 5000);
        assert!(config.reset_on_open);
    }

    #[test]
    fn test_plan_from_json() {
        let plan: AcquisitionPlan = serde_json::from_str(
            r#"{
                "trigger": { "type": "timed", "period": 0.01 },
                "averaging": "16",
                "channels": [
                    { "pin": "PTB0", "name": "light" },
                    { "pin": "PTC5", "kind": "frequency", "downsample": 4 },
                    { "pin": "PTA1" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(plan.reference, "Power");

        let config = plan.resolve(&kl25z()).unwrap();
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.channels[0].name, "light");
        assert_eq!(config.channels[0].probe, 0x0801);
        assert_eq!(config.channels[1].name, "PTC5");
        assert!(config.channels[1].interpretation.is_frequency());
        assert_eq!(config.channels[1].interpretation.downsample, 4);
        assert!(config.channels[2].interpretation.is_digital());
    }

    #[test]
    fn test_plan_rejects_unknown_names() {
        let profile = kl25z();
        let mut plan = AcquisitionPlan {
            trigger: TriggerSpec::edge("PTB0", "rises"),
            reference: "Power".into(),
            averaging: None,
            channels: vec![ChannelSpec::pin("PTB0")],
        };
        assert!(matches!(plan.resolve(&profile), Err(BoardError::NotATriggerPin(_))));

        plan.trigger = TriggerSpec::edge("PTD4", "wiggles");
        assert!(matches!(plan.resolve(&profile), Err(BoardError::UnknownEdgeSense(_))));

        plan.trigger = TriggerSpec::timed(0.1);
        plan.channels.push(ChannelSpec::pin("D13"));
        assert!(matches!(plan.resolve(&profile), Err(BoardError::UnknownPin(_))));
    }

    #[test]
    fn test_plan_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let plan = AcquisitionPlan {
            trigger: TriggerSpec::timed(0.25),
            reference: "External".into(),
            averaging: Some("8".into()),
            channels: vec![ChannelSpec::pin("PTE20-PTE21")],
        };
        plan.save(&path).unwrap();
        assert_eq!(AcquisitionPlan::load(&path).unwrap(), plan);
    }
}
