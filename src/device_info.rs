//! Device Information service reader.

use crate::platform::{BleError, CharacteristicRef, GattLink};
use crate::profile::{DEVICE_INFO_SERVICE, MANUFACTURER_CHARACTERISTIC, MODEL_CHARACTERISTIC};
use crate::reading::{DeviceIdentity, UNKNOWN};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read manufacturer and model names from the Device Information service.
///
/// The two reads are strictly sequential; the cuff does not service
/// concurrent reads reliably. The identity is advisory: a field that is
/// absent or cannot be read becomes `"Unknown"`. Only a lost link is returned.
pub async fn read_identity(link: &dyn GattLink) -> Result<DeviceIdentity, BleError> {
    let manufacturer = read_string(link, MANUFACTURER_CHARACTERISTIC).await?;
    let model = read_string(link, MODEL_CHARACTERISTIC).await?;

    let identity = DeviceIdentity {
        manufacturer,
        model,
    };
    info!(manufacturer = %identity.manufacturer, model = %identity.model, "device identified");
    Ok(identity)
}

async fn read_string(link: &dyn GattLink, characteristic: Uuid) -> Result<String, BleError> {
    let target = CharacteristicRef::new(DEVICE_INFO_SERVICE, characteristic);
    match link.read_characteristic(target).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).trim().to_string()),
        Err(BleError::Disconnected) => Err(BleError::Disconnected),
        Err(e) if e.is_missing_attribute() => {
            debug!(%characteristic, "device info characteristic absent");
            Ok(UNKNOWN.to_string())
        }
        Err(e) => {
            warn!(%characteristic, error = %e, "device info read failed");
            Ok(UNKNOWN.to_string())
        }
    }
}
