//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    Advertisement, BleError, Central, CharacteristicInfo, CharacteristicRef, Connection,
    EVENT_CHANNEL_BUFFER_SIZE, GattDatabase, GattLink, LinkEvent, RawNotification, ServiceInfo,
    WriteMode,
};
use crate::peripheral::PeripheralHandle;
use crate::profile::CLIENT_CONFIG_DESCRIPTOR;
use bluer::gatt::WriteOp;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, ErrorKind, Session};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, pin_mut};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// BlueZ resolves services asynchronously after connecting.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICE_RESOLVE_POLL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for BleError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
                BleError::PermissionDenied(err.to_string())
            }
            ErrorKind::ConnectionAttemptFailed => BleError::ConnectionFailed(err.to_string()),
            _ => BleError::Bluetooth(err.to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The local adapter, as seen through BlueZ.
pub struct BluerCentral {
    _session: Session,
    adapter: Adapter,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluerCentral {
    /// Open `adapter_name` (e.g. `hci0`), or the default adapter, and power it on.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, BleError> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;
        info!(adapter = adapter.name(), "using Bluetooth adapter");

        Ok(Self {
            _session: session,
            adapter,
            scan_task: Mutex::new(None),
        })
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<Advertisement>, BleError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let adapter = self.adapter.clone();

        // Discovery runs for as long as the event stream is alive. Property
        // changes are reported too: BlueZ often learns the name from a scan
        // response after the device object was created.
        let task = tokio::spawn(async move {
            let events = match adapter.discover_devices_with_changes().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            pin_mut!(events);
            while let Some(event) = events.next().await {
                let Some(address) = seen_address(&event) else {
                    continue;
                };
                match advertisement(&adapter, address).await {
                    Ok(advertisement) => {
                        if tx.send(advertisement).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(%address, error = %e, "failed to query device"),
                }
            }
        });

        started(ready_rx).await?;
        if let Some(previous) = lock(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn open(&self, peripheral: PeripheralHandle) -> Result<Connection, BleError> {
        let device = self.adapter.device(peripheral.into())?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

        // Subscribe before connecting so a drop right after connect is seen
        let (ready_tx, ready_rx) = oneshot::channel();
        let watched = device.clone();
        let disconnect_tx = tx.clone();
        let watcher = tokio::spawn(async move {
            let device_events = match watched.events().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            pin_mut!(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    let _ = disconnect_tx.send(LinkEvent::Disconnected).await;
                    break;
                }
            }
        });
        started(ready_rx).await?;

        if !device.is_connected().await? {
            info!(%peripheral, "connecting");
            if let Err(e) = device.connect().await {
                watcher.abort();
                return Err(e.into());
            }
        }
        let _ = tx.send(LinkEvent::Connected).await;

        let link = BluerLink {
            device,
            events: tx,
            watcher,
            characteristics: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
        };
        Ok(Connection {
            link: Box::new(link),
            events: rx,
        })
    }
}

/// Wait for a spawned task to report that its event stream is open.
async fn started(ready: oneshot::Receiver<bluer::Result<()>>) -> Result<(), BleError> {
    match ready.await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BleError::Bluetooth("event task ended early".into())),
    }
}

/// Address of a device that was added or whose properties changed.
fn seen_address(event: &AdapterEvent) -> Option<Address> {
    match event {
        AdapterEvent::DeviceAdded(address) => Some(*address),
        _ => None,
    }
}

async fn advertisement(adapter: &Adapter, address: Address) -> Result<Advertisement, BleError> {
    let device = adapter.device(address)?;
    Ok(Advertisement {
        peripheral: address.into(),
        name: device.name().await?,
        rssi: device.rssi().await?,
    })
}

impl Central for BluerCentral {
    fn scan(&self) -> BoxFuture<'_, Result<mpsc::Receiver<Advertisement>, BleError>> {
        self.start_discovery().boxed()
    }

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), BleError>> {
        async move {
            if let Some(task) = lock(&self.scan_task).take() {
                task.abort();
                debug!("discovery stopped");
            }
            Ok(())
        }
        .boxed()
    }

    fn connect(&self, peripheral: PeripheralHandle) -> BoxFuture<'_, Result<Connection, BleError>> {
        self.open(peripheral).boxed()
    }
}

impl Drop for BluerCentral {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
    }
}

/// GATT client for one connected device.
pub struct BluerLink {
    device: bluer::Device,
    events: mpsc::Sender<LinkEvent>,
    watcher: JoinHandle<()>,
    characteristics: Mutex<HashMap<CharacteristicRef, Characteristic>>,
    notifiers: Mutex<HashMap<CharacteristicRef, JoinHandle<()>>>,
}

impl BluerLink {
    fn characteristic(&self, target: CharacteristicRef) -> Result<Characteristic, BleError> {
        let characteristics = lock(&self.characteristics);
        if let Some(characteristic) = characteristics.get(&target) {
            return Ok(characteristic.clone());
        }
        if characteristics.keys().any(|r| r.service == target.service) {
            Err(BleError::CharacteristicMissing(target.uuid))
        } else {
            Err(BleError::ServiceMissing(target.service))
        }
    }

    async fn resolve_services(&self) -> Result<GattDatabase, BleError> {
        let deadline = Instant::now() + SERVICE_RESOLVE_TIMEOUT;
        while !self.device.is_services_resolved().await? {
            if Instant::now() >= deadline {
                return Err(BleError::Bluetooth("services not resolved in time".into()));
            }
            tokio::time::sleep(SERVICE_RESOLVE_POLL).await;
        }

        let mut services = Vec::new();
        let mut found = HashMap::new();
        for service in self.device.services().await? {
            let service_uuid = service.uuid().await?;
            let mut characteristics = Vec::new();

            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                let flags = characteristic.flags().await?;
                let mut descriptors = Vec::new();
                for descriptor in characteristic.descriptors().await? {
                    descriptors.push(descriptor.uuid().await?);
                }
                // BlueZ manages the CCCD itself and does not export it
                if (flags.notify || flags.indicate) && !descriptors.contains(&CLIENT_CONFIG_DESCRIPTOR)
                {
                    descriptors.push(CLIENT_CONFIG_DESCRIPTOR);
                }

                characteristics.push(CharacteristicInfo { uuid, descriptors });
                found.insert(CharacteristicRef::new(service_uuid, uuid), characteristic);
            }
            services.push(ServiceInfo {
                uuid: service_uuid,
                characteristics,
            });
        }

        *lock(&self.characteristics) = found;
        Ok(GattDatabase::new(services))
    }

    async fn write(
        &self,
        target: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let characteristic = self.characteristic(target)?;
        match mode {
            WriteMode::WithResponse => characteristic.write(value).await?,
            WriteMode::WithoutResponse => {
                let request = CharacteristicWriteRequest {
                    op_type: WriteOp::Command,
                    ..Default::default()
                };
                characteristic.write_ext(value, &request).await?
            }
        }
        Ok(())
    }

    async fn write_descriptor_value(
        &self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let characteristic = self.characteristic(target)?;
        let missing = BleError::DescriptorMissing {
            characteristic: target.uuid,
            descriptor,
        };

        if descriptor == CLIENT_CONFIG_DESCRIPTOR {
            // Applied when the notify session starts
            let flags = characteristic.flags().await?;
            if !(flags.notify || flags.indicate) {
                return Err(missing);
            }
            debug!(characteristic = %target.uuid, ?value, "CCCD write deferred to BlueZ");
            return Ok(());
        }

        for candidate in characteristic.descriptors().await? {
            if candidate.uuid().await? == descriptor {
                candidate.write(value).await?;
                return Ok(());
            }
        }
        Err(missing)
    }

    async fn enable_notifications(
        &self,
        target: CharacteristicRef,
        enabled: bool,
    ) -> Result<(), BleError> {
        if !enabled {
            if let Some(task) = lock(&self.notifiers).remove(&target) {
                task.abort();
            }
            return Ok(());
        }

        let characteristic = self.characteristic(target)?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let tx = self.events.clone();
        let uuid = target.uuid;
        let task = tokio::spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            pin_mut!(notifications);
            while let Some(bytes) = notifications.next().await {
                let notification = RawNotification {
                    characteristic: uuid,
                    bytes,
                };
                if tx.send(LinkEvent::Notification(notification)).await.is_err() {
                    break;
                }
            }
            debug!(characteristic = %uuid, "notification stream ended");
        });

        started(ready_rx).await?;
        if let Some(previous) = lock(&self.notifiers).insert(target, task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_notifiers(&self) {
        for (_, task) in lock(&self.notifiers).drain() {
            task.abort();
        }
    }
}

impl GattLink for BluerLink {
    fn discover_services(&self) -> BoxFuture<'_, Result<GattDatabase, BleError>> {
        self.resolve_services().boxed()
    }

    fn read_characteristic(
        &self,
        target: CharacteristicRef,
    ) -> BoxFuture<'_, Result<Vec<u8>, BleError>> {
        async move { Ok(self.characteristic(target)?.read().await?) }.boxed()
    }

    fn write_characteristic<'a>(
        &'a self,
        target: CharacteristicRef,
        value: &'a [u8],
        mode: WriteMode,
    ) -> BoxFuture<'a, Result<(), BleError>> {
        self.write(target, value, mode).boxed()
    }

    fn write_descriptor<'a>(
        &'a self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), BleError>> {
        self.write_descriptor_value(target, descriptor, value)
            .boxed()
    }

    fn set_notifications_enabled(
        &self,
        target: CharacteristicRef,
        enabled: bool,
    ) -> BoxFuture<'_, Result<(), BleError>> {
        self.enable_notifications(target, enabled).boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BleError>> {
        async move {
            self.stop_notifiers();
            match self.device.disconnect().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "disconnect failed");
                    Err(e.into())
                }
            }
        }
        .boxed()
    }
}

impl Drop for BluerLink {
    fn drop(&mut self) {
        self.stop_notifiers();
        self.watcher.abort();
    }
}
