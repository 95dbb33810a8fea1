//! Blood-pressure reading data structures.

use crate::decoder::Sample;
use std::fmt;
use std::time::SystemTime;

/// Placeholder used when a Device Information characteristic is absent.
pub const UNKNOWN: &str = "Unknown";

/// Manufacturer and model reported by the cuff's Device Information service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
}

impl DeviceIdentity {
    pub fn new(manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.manufacturer, self.model)
    }
}

/// A decoded measurement with its device identity and receive time attached.
///
/// When `is_failed` is set the pressure values carry the cuff's failure
/// sentinel and must not be forwarded to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Systolic pressure in mmHg
    pub systolic_mmhg: u16,
    /// Diastolic pressure in mmHg
    pub diastolic_mmhg: u16,
    /// Pulse rate in beats per minute
    pub pulse_bpm: u16,
    /// In-progress sample emitted while the cuff is still deflating
    pub is_intermediate: bool,
    /// The cuff could not determine a result
    pub is_failed: bool,
    /// Wall-clock time the notification was received
    pub timestamp: SystemTime,
    /// Device that produced the reading
    pub identity: DeviceIdentity,
}

impl Reading {
    pub fn from_sample(sample: Sample, identity: DeviceIdentity, timestamp: SystemTime) -> Self {
        Self {
            systolic_mmhg: sample.systolic_mmhg,
            diastolic_mmhg: sample.diastolic_mmhg,
            pulse_bpm: sample.pulse_bpm,
            is_intermediate: sample.is_intermediate,
            is_failed: sample.is_failed,
            timestamp,
            identity,
        }
    }

    /// Final, non-failed readings are the only ones a sink may receive.
    pub fn is_final(&self) -> bool {
        !self.is_intermediate && !self.is_failed
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BP: {}/{}  Pulse: {} bpm",
            self.systolic_mmhg, self.diastolic_mmhg, self.pulse_bpm
        )
    }
}
