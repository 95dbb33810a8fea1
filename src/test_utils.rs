//! In-memory fakes for the platform and sink seams.

use crate::peripheral::PeripheralHandle;
use crate::platform::{
    Advertisement, BleError, Central, CharacteristicInfo, CharacteristicRef, Connection,
    GattDatabase, GattLink, LinkEvent, ServiceInfo, WriteMode,
};
use crate::profile::*;
use crate::reading::{DeviceIdentity, Reading};
use crate::sink::{Sink, SinkError};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

/// A stable cuff address for unit tests.
pub const TEST_PERIPHERAL: PeripheralHandle =
    PeripheralHandle::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

pub fn qardio_identity() -> DeviceIdentity {
    DeviceIdentity::new("Qardio", "QardioARM")
}

/// A final, non-failed reading from the test cuff at 1 s past the epoch.
pub fn reading(systolic: u16, diastolic: u16, pulse: u16) -> Reading {
    Reading {
        systolic_mmhg: systolic,
        diastolic_mmhg: diastolic,
        pulse_bpm: pulse,
        is_intermediate: false,
        is_failed: false,
        timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(1),
        identity: qardio_identity(),
    }
}

/// The GATT layout a QardioARM exposes.
pub fn qardio_database() -> GattDatabase {
    GattDatabase::new(vec![
        ServiceInfo {
            uuid: BLOOD_PRESSURE_SERVICE,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: MEASUREMENT_CHARACTERISTIC,
                    descriptors: vec![CLIENT_CONFIG_DESCRIPTOR],
                },
                CharacteristicInfo {
                    uuid: CONTROL_CHARACTERISTIC,
                    descriptors: vec![],
                },
            ],
        },
        ServiceInfo {
            uuid: DEVICE_INFO_SERVICE,
            characteristics: vec![
                CharacteristicInfo {
                    uuid: MANUFACTURER_CHARACTERISTIC,
                    descriptors: vec![],
                },
                CharacteristicInfo {
                    uuid: MODEL_CHARACTERISTIC,
                    descriptors: vec![],
                },
            ],
        },
    ])
}

/// [`qardio_database`] with one characteristic removed.
pub fn database_without(characteristic: Uuid) -> GattDatabase {
    let services = qardio_database()
        .services()
        .iter()
        .cloned()
        .map(|mut service| {
            service.characteristics.retain(|c| c.uuid != characteristic);
            service
        })
        .collect();
    GattDatabase::new(services)
}

/// One GATT call made against a [`FakeLink`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOp {
    Discover,
    Read(CharacteristicRef),
    Write {
        target: CharacteristicRef,
        value: Vec<u8>,
        mode: WriteMode,
    },
    WriteDescriptor {
        target: CharacteristicRef,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Notifications {
        target: CharacteristicRef,
        enabled: bool,
    },
    Disconnect,
}

/// Shared, timestamped record of link operations.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    entries: Arc<Mutex<Vec<(Instant, LinkOp)>>>,
    changed: Arc<Notify>,
}

impl OpLog {
    fn record(&self, op: LinkOp) {
        self.entries.lock().unwrap().push((Instant::now(), op));
        self.changed.notify_waiters();
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Time of the first operation matching `pred`.
    pub fn time_of(&self, pred: impl Fn(&LinkOp) -> bool) -> Instant {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(_, op)| pred(op))
            .map(|(at, _)| *at)
            .expect("no matching operation recorded")
    }

    /// Wait until an operation matching `pred` has been recorded.
    pub async fn wait_for(&self, pred: impl Fn(&LinkOp) -> bool) {
        loop {
            let changed = self.changed.notified();
            if self.entries.lock().unwrap().iter().any(|(_, op)| pred(op)) {
                return;
            }
            changed.await;
        }
    }
}

/// Releases operations parked by [`FakeLink::hold`], one per call.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn release(&self) {
        self.0.add_permits(1);
    }

    async fn pass(&self) {
        self.0.acquire().await.expect("gate closed").forget();
    }
}

struct Hold {
    matches: fn(&LinkOp) -> bool,
    gate: Gate,
}

impl std::fmt::Debug for Hold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hold").finish_non_exhaustive()
    }
}

/// Scripted GATT link backed by a fixed database.
///
/// Every call is recorded. Attributes missing from the database fail with the
/// matching `BleError`; reads return the configured value or an empty buffer.
#[derive(Debug, Default)]
pub struct FakeLink {
    database: GattDatabase,
    values: HashMap<Uuid, Vec<u8>>,
    read_error: Option<BleError>,
    write_error: Option<BleError>,
    notify_error: Option<BleError>,
    hold: Option<Hold>,
    log: OpLog,
}

impl FakeLink {
    pub fn new(database: GattDatabase) -> Self {
        Self {
            database,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.values.insert(characteristic, value);
        self
    }

    pub fn fail_reads(mut self, err: BleError) -> Self {
        self.read_error = Some(err);
        self
    }

    pub fn fail_writes(mut self, err: BleError) -> Self {
        self.write_error = Some(err);
        self
    }

    pub fn fail_notifications(mut self, err: BleError) -> Self {
        self.notify_error = Some(err);
        self
    }

    /// Keep operations matching `matches` pending after they are recorded,
    /// until [`Gate::release`] lets them through.
    pub fn hold(mut self, matches: fn(&LinkOp) -> bool) -> Self {
        self.hold = Some(Hold {
            matches,
            gate: Gate(Arc::new(Semaphore::new(0))),
        });
        self
    }

    pub fn gate(&self) -> Gate {
        self.hold.as_ref().expect("link has no hold").gate.clone()
    }

    pub fn log(&self) -> OpLog {
        self.log.clone()
    }

    async fn enter(&self, op: LinkOp) {
        let held = self
            .hold
            .as_ref()
            .filter(|hold| (hold.matches)(&op))
            .map(|hold| hold.gate.clone());
        self.log.record(op);
        if let Some(gate) = held {
            gate.pass().await;
        }
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.log.ops()
    }

    fn check(&self, target: CharacteristicRef, err: &Option<BleError>) -> Result<(), BleError> {
        self.database.require(target)?;
        match err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl GattLink for FakeLink {
    fn discover_services(&self) -> BoxFuture<'_, Result<GattDatabase, BleError>> {
        async move {
            self.enter(LinkOp::Discover).await;
            Ok(self.database.clone())
        }
        .boxed()
    }

    fn read_characteristic(
        &self,
        target: CharacteristicRef,
    ) -> BoxFuture<'_, Result<Vec<u8>, BleError>> {
        async move {
            self.enter(LinkOp::Read(target)).await;
            self.check(target, &self.read_error)?;
            Ok(self.values.get(&target.uuid).cloned().unwrap_or_default())
        }
        .boxed()
    }

    fn write_characteristic<'a>(
        &'a self,
        target: CharacteristicRef,
        value: &'a [u8],
        mode: WriteMode,
    ) -> BoxFuture<'a, Result<(), BleError>> {
        async move {
            self.enter(LinkOp::Write {
                target,
                value: value.to_vec(),
                mode,
            })
            .await;
            self.check(target, &self.write_error)
        }
        .boxed()
    }

    fn write_descriptor<'a>(
        &'a self,
        target: CharacteristicRef,
        descriptor: Uuid,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), BleError>> {
        async move {
            self.enter(LinkOp::WriteDescriptor {
                target,
                descriptor,
                value: value.to_vec(),
            })
            .await;
            self.database.require(target)?;
            let has_descriptor = self
                .database
                .characteristic(target)
                .is_some_and(|c| c.descriptors.contains(&descriptor));
            if !has_descriptor {
                return Err(BleError::DescriptorMissing {
                    characteristic: target.uuid,
                    descriptor,
                });
            }
            Ok(())
        }
        .boxed()
    }

    fn set_notifications_enabled(
        &self,
        target: CharacteristicRef,
        enabled: bool,
    ) -> BoxFuture<'_, Result<(), BleError>> {
        async move {
            self.enter(LinkOp::Notifications { target, enabled }).await;
            self.check(target, &self.notify_error)
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), BleError>> {
        async move {
            self.enter(LinkOp::Disconnect).await;
            Ok(())
        }
        .boxed()
    }
}

/// Calls made against a [`FakeCentral`].
#[derive(Debug, Clone, PartialEq)]
pub enum CentralOp {
    Scan,
    StopScan,
    Connect(PeripheralHandle),
}

/// Scripted adapter. `scan` replays the configured advertisements and keeps
/// the channel open until `stop_scan`; `connect` hands out the prepared
/// connection once.
#[derive(Default)]
pub struct FakeCentral {
    advertisements: Vec<Advertisement>,
    scan_error: Option<BleError>,
    connect_error: Option<BleError>,
    connection: Mutex<Option<Connection>>,
    scan_tx: Mutex<Option<mpsc::Sender<Advertisement>>>,
    ops: Mutex<Vec<CentralOp>>,
}

impl FakeCentral {
    pub fn new(advertisements: Vec<Advertisement>) -> Self {
        Self {
            advertisements,
            ..Default::default()
        }
    }

    pub fn with_connection(self, connection: Connection) -> Self {
        *self.connection.lock().unwrap() = Some(connection);
        self
    }

    pub fn fail_scan(mut self, err: BleError) -> Self {
        self.scan_error = Some(err);
        self
    }

    pub fn fail_connect(mut self, err: BleError) -> Self {
        self.connect_error = Some(err);
        self
    }

    pub fn ops(&self) -> Vec<CentralOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl Central for FakeCentral {
    fn scan(&self) -> BoxFuture<'_, Result<mpsc::Receiver<Advertisement>, BleError>> {
        async move {
            self.ops.lock().unwrap().push(CentralOp::Scan);
            if let Some(e) = &self.scan_error {
                return Err(e.clone());
            }
            let (tx, rx) = mpsc::channel(self.advertisements.len().max(1));
            for advertisement in &self.advertisements {
                tx.try_send(advertisement.clone()).unwrap();
            }
            *self.scan_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }
        .boxed()
    }

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), BleError>> {
        async move {
            self.ops.lock().unwrap().push(CentralOp::StopScan);
            self.scan_tx.lock().unwrap().take();
            Ok(())
        }
        .boxed()
    }

    fn connect(&self, peripheral: PeripheralHandle) -> BoxFuture<'_, Result<Connection, BleError>> {
        async move {
            self.ops.lock().unwrap().push(CentralOp::Connect(peripheral));
            if let Some(e) = &self.connect_error {
                return Err(e.clone());
            }
            self.connection
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BleError::ConnectionFailed("no scripted connection".into()))
        }
        .boxed()
    }
}

/// A [`FakeLink`] wrapped in a connection whose event channel already
/// reports `Connected`. Keep the sender to inject further events.
pub fn connected(link: FakeLink) -> (Connection, mpsc::Sender<LinkEvent>) {
    let (tx, rx) = mpsc::channel(16);
    tx.try_send(LinkEvent::Connected).unwrap();
    (
        Connection {
            link: Box::new(link),
            events: rx,
        },
        tx,
    )
}

pub fn advertisement(name: &str) -> Advertisement {
    Advertisement {
        peripheral: TEST_PERIPHERAL,
        name: Some(name.to_string()),
        rssi: Some(-60),
    }
}

/// Sink that records every submitted reading.
#[derive(Debug, Default)]
pub struct RecordingSink {
    readings: Mutex<Vec<Reading>>,
    failure: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().unwrap().clone()
    }

    /// Make every later submission fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

impl Sink for RecordingSink {
    fn submit<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            if let Some(message) = self.failure.lock().unwrap().clone() {
                return Err(SinkError::Unavailable(message));
            }
            self.readings.lock().unwrap().push(reading.clone());
            Ok(())
        }
        .boxed()
    }
}
