//! Caller-visible status events.
//!
//! The core never owns presentation state. It emits [`Status`] events and
//! consumers fold them into whatever they display; [`StatusBoard`] is the
//! fold used by the command-line front end.

use crate::peripheral::PeripheralHandle;
use crate::platform::BleError;
use crate::reading::{DeviceIdentity, Reading};
use crate::state::SessionState;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    StateChanged(SessionState),
    Scanning { pattern: String },
    DeviceFound {
        peripheral: PeripheralHandle,
        name: String,
    },
    Identified(DeviceIdentity),
    /// Start command written, waiting for the cuff to report
    Armed,
    Measuring(Reading),
    MeasurementFailed,
    MeasurementComplete(Reading),
    SinkAccepted,
    SinkFailed(String),
    /// Replacement text for the reading display
    ReadingText(String),
    Error(BleError),
    NoDeviceFound,
    /// Supervisor finished; a new `start()` is needed to connect again
    Idle,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::StateChanged(SessionState::Connecting) => write!(f, "Connecting..."),
            Status::StateChanged(SessionState::DiscoveringServices) => {
                write!(f, "Connected, discovering services...")
            }
            Status::StateChanged(SessionState::Disconnected) => write!(f, "Disconnected"),
            Status::StateChanged(state) => write!(f, "State: {state}"),
            Status::Scanning { pattern } => write!(f, "Scanning for {pattern}..."),
            Status::DeviceFound { peripheral, name } => {
                write!(f, "Found {name} ({peripheral}), connecting...")
            }
            Status::Identified(identity) => write!(f, "Connected to {identity}"),
            Status::Armed => write!(f, "Measurement started"),
            Status::Measuring(_) => write!(f, "Measuring..."),
            Status::MeasurementFailed => write!(f, "Measurement failed, please retry"),
            Status::MeasurementComplete(_) => write!(f, "Final measurement complete"),
            Status::SinkAccepted => write!(f, "Reading stored"),
            Status::SinkFailed(e) => write!(f, "Failed to store reading: {e}"),
            Status::ReadingText(text) => f.write_str(text),
            Status::Error(e) => write!(f, "Error: {e}"),
            Status::NoDeviceFound => write!(f, "No device found"),
            Status::Idle => write!(f, "Waiting to connect..."),
        }
    }
}

/// Sending half of the status stream. Sends never block and never fail the
/// sender: a consumer that went away simply stops observing.
#[derive(Debug, Clone)]
pub struct StatusSender(mpsc::UnboundedSender<Status>);

impl StatusSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Status>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn emit(&self, status: Status) {
        let _ = self.0.send(status);
    }
}

/// The two values a UI displays: current status and current reading text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBoard {
    status: String,
    reading: String,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            status: Status::Idle.to_string(),
            reading: String::new(),
        }
    }
}

impl StatusBoard {
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn reading(&self) -> &str {
        &self.reading
    }

    /// Fold one event in. Returns `true` when either displayed value changed.
    pub fn apply(&mut self, status: &Status) -> bool {
        let (status_text, reading_text) = match status {
            Status::ReadingText(text) => (None, Some(text.clone())),
            Status::MeasurementFailed => (Some(status.to_string()), Some(String::new())),
            // Intermediate states between the user-facing milestones
            Status::StateChanged(
                SessionState::Discovering
                | SessionState::ReadingDeviceInfo
                | SessionState::ArmingMeasurement
                | SessionState::AwaitingMeasurement,
            ) => (None, None),
            _ => (Some(status.to_string()), None),
        };

        let mut changed = false;
        if let Some(text) = status_text
            && text != self.status
        {
            self.status = text;
            changed = true;
        }
        if let Some(text) = reading_text
            && text != self.reading
        {
            self.reading = text;
            changed = true;
        }
        changed
    }
}

/// Reading text shown for a decoded packet, optionally with the raw bytes.
pub fn reading_text(reading: &Reading, raw: Option<&[u8]>) -> String {
    match raw {
        Some(bytes) => {
            let raw: Vec<String> = bytes.iter().map(u8::to_string).collect();
            format!("{reading}\nRaw: {}", raw.join(" "))
        }
        None => reading.to_string(),
    }
}
