//! Wire constants for the QardioARM blood-pressure cuff.
//!
//! The cuff exposes the standard Blood Pressure service (0x1810) and Device
//! Information service (0x180A), plus one vendor characteristic used to start
//! and cancel a measurement.

use std::time::Duration;
use uuid::Uuid;

/// Blood Pressure service.
pub const BLOOD_PRESSURE_SERVICE: Uuid = Uuid::from_u128(0x00001810_0000_1000_8000_00805f9b34fb);

/// Blood Pressure Measurement characteristic (indications only).
pub const MEASUREMENT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a35_0000_1000_8000_00805f9b34fb);

/// Vendor control characteristic receiving [`ControlCommand`]s.
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x583cb5b3_875d_40ed_9098_c39eb0c1983d);

/// Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Manufacturer Name String characteristic.
pub const MANUFACTURER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// Model Number String characteristic.
pub const MODEL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor.
pub const CLIENT_CONFIG_DESCRIPTOR: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling indications (little-endian 0x0002).
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Advertised name fragment of the cuff.
pub const DEFAULT_NAME_PATTERN: &str = "QardioARM";

/// Delay between enabling indications and writing the start command.
///
/// The cuff firmware cannot arbitrate a control write that collides with the
/// CCCD write, so the start command must wait.
pub const ARMING_DELAY: Duration = Duration::from_millis(800);

/// Commands accepted by the vendor control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Inflate the cuff and start a measurement
    StartMeasurement,
    /// Abort a running measurement and deflate
    CancelMeasurement,
}

impl ControlCommand {
    /// Raw bytes written to [`CONTROL_CHARACTERISTIC`].
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::StartMeasurement => &[0xF1, 0x01],
            Self::CancelMeasurement => &[0xF1, 0x02],
        }
    }
}
