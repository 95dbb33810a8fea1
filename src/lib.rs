//! `qardioarm-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, the BlueZ backend
//! and process exit codes. The protocol logic lives in [`crate::session`] and
//! [`crate::supervisor`], driven through the [`platform`] traits so it can be
//! tested deterministically with injected fakes.

pub mod app;
pub mod decoder;
pub mod device_info;
pub mod duration;
pub mod logging;
pub mod peripheral;
pub mod platform;
pub mod profile;
pub mod reading;
pub mod session;
pub mod sink;
pub mod state;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{Options, RunError, run_until};
pub use decoder::{DecodeError, Sample, decode};
pub use peripheral::PeripheralHandle;
pub use platform::{BleError, Central, GattLink};
pub use reading::{DeviceIdentity, Reading};
pub use session::{MeasurementSession, SessionConfig, SessionEnd};
pub use sink::{OutputFormat, OutputFormatter, Sink, SinkError, WriterSink};
pub use state::SessionState;
pub use status::{Status, StatusBoard};
pub use supervisor::{MatchPolicy, NameFilter, Supervisor, SupervisorConfig, SupervisorHandle};
