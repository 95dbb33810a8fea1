//! Bluetooth LE stack abstraction.
//!
//! Everything above this module talks to the radio through the [`Central`]
//! and [`GattLink`] traits, so the session logic can be driven in tests by
//! injecting synthetic events instead of a live adapter.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::peripheral::PeripheralHandle;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel buffer size for advertisements and link events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 64;

/// Errors raised by the Bluetooth stack or by the GATT setup sequence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BleError {
    /// The OS refused Bluetooth access; the caller must fix permissions and start again
    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),
    #[error("no matching device found within {0:?}")]
    NoDeviceFound(Duration),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("peripheral disconnected")]
    Disconnected,
    #[error("service {0} not found")]
    ServiceMissing(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),
    #[error("descriptor {descriptor} not found on characteristic {characteristic}")]
    DescriptorMissing { characteristic: Uuid, descriptor: Uuid },
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

impl BleError {
    /// Absence of a service, characteristic or descriptor on the peripheral.
    pub fn is_missing_attribute(&self) -> bool {
        matches!(
            self,
            BleError::ServiceMissing(_)
                | BleError::CharacteristicMissing(_)
                | BleError::DescriptorMissing { .. }
        )
    }
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral: PeripheralHandle,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Addresses one characteristic within one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicRef {
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Services and characteristics found on a connected peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattDatabase {
    services: Vec<ServiceInfo>,
}

impl GattDatabase {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    pub fn service(&self, uuid: Uuid) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub fn characteristic(&self, target: CharacteristicRef) -> Option<&CharacteristicInfo> {
        self.service(target.service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == target.uuid)
    }

    /// Find a characteristic by UUID in whichever service carries it.
    pub fn locate(&self, characteristic: Uuid) -> Option<CharacteristicRef> {
        self.services.iter().find_map(|service| {
            service
                .characteristics
                .iter()
                .any(|c| c.uuid == characteristic)
                .then(|| CharacteristicRef::new(service.uuid, characteristic))
        })
    }

    /// Check that `target` exists, naming the first missing attribute otherwise.
    pub fn require(&self, target: CharacteristicRef) -> Result<(), BleError> {
        if self.service(target.service).is_none() {
            return Err(BleError::ServiceMissing(target.service));
        }
        self.characteristic(target)
            .map(|_| ())
            .ok_or(BleError::CharacteristicMissing(target.uuid))
    }
}

/// Whether a characteristic write waits for the peripheral's acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// A notification or indication payload. Consumed immediately, never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
}

/// Events delivered for one connection, in order, on a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Notification(RawNotification),
}

/// GATT client operations on a connected peripheral.
///
/// Implementations do not serialise operations; callers must not issue a new
/// operation before the previous one completed.
pub trait GattLink: Send + Sync {
    fn discover_services(&self) -> BoxFuture<'_, Result<GattDatabase, BleError>>;

    fn read_characteristic(
        &self,
        target: CharacteristicRef,
    ) -> BoxFuture<'_, Result<Vec<u8>, BleError>>;

    fn write_characteristic<'a>(
        &'a self,
        target: CharacteristicRef,
        value: &'a [u8],
        mode: WriteMode,
    ) -> BoxFuture<'a, Result<(), BleError>>;

    fn write_descriptor<'a>(
        &'a self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), BleError>>;

    /// Start or stop delivery of [`LinkEvent::Notification`]s for `target`.
    fn set_notifications_enabled(
        &self,
        target: CharacteristicRef,
        enabled: bool,
    ) -> BoxFuture<'_, Result<(), BleError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BleError>>;
}

/// An established connection: the GATT client plus its ordered event stream.
pub struct Connection {
    pub link: Box<dyn GattLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// The adapter side of the Bluetooth stack.
pub trait Central: Send + Sync {
    /// Start discovery; advertisements arrive on the returned channel until
    /// [`Central::stop_scan`] is called.
    fn scan(&self) -> BoxFuture<'_, Result<mpsc::Receiver<Advertisement>, BleError>>;

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), BleError>>;

    /// Connect to `peripheral`. The returned event channel reports
    /// [`LinkEvent::Connected`] once the link is up.
    fn connect(&self, peripheral: PeripheralHandle) -> BoxFuture<'_, Result<Connection, BleError>>;
}
