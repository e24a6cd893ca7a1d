//! # PteroDAQ Core Library
//!
//! Host side of the PteroDAQ data acquisition system.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The framed serial protocol and the always-open link to a board
//! - The catalog of supported boards and their calibration
//! - Acquisition sessions: configuration, telemetry decoding, recording
//! - Saving and reading recordings
//! - A simulated board for tests and demos
//!
//! ## Supported boards
//!
//! - Arduino Uno, Nano/Mini, Mega and Leonardo
//! - FRDM-KL25Z
//!
//! ## Example
//!
//! ```rust,ignore
//! use pterodaq_core::prelude::*;
//!
//! let mut session = Session::new(ConnectionConfig::for_port("/dev/ttyACM0"));
//! session.connect_port()?;
//! session.configure_plan(&AcquisitionPlan::load("plan.json")?)?;
//! session.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! session.stop()?;
//! session.save("run.txt", "", true, None)?;
//! ```

pub mod board;
pub mod config;
pub mod datalog;
pub mod protocol;
pub mod session;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::board::{ChannelKind, DeviceProfile};
    pub use crate::config::{AcquisitionPlan, ChannelSpec, ConnectionConfig};
    pub use crate::datalog::{read_recording, Recording};
    pub use crate::protocol::{LinkChannel, LinkEvent};
    pub use crate::session::{
        AcquisitionConfig, ChannelDescriptor, ConnectError, SampleRow, SampleValue, Session,
        SessionError, SessionState, TriggerSpec,
    };
    pub use crate::sim::SimulatedBoard;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
