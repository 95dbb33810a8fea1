//! Measurement session for one connected cuff.
//!
//! Sequence once the link is up:
//!
//! 1. discover services and require the Blood Pressure measurement characteristic
//! 2. read the device identity
//! 3. write the CCCD to enable indications, then enable local delivery
//! 4. after the arming delay, write the start command (unacknowledged)
//! 5. decode every measurement indication until the link goes away
//!
//! GATT operations never overlap. Each one is raced against the link's event
//! channel and the stop signal; when the link drops or the caller stops
//! mid-operation, the operation still runs to completion and its result is
//! discarded.

use crate::decoder::{self, DecodeError};
use crate::device_info;
use crate::platform::{
    BleError, CharacteristicRef, Connection, GattDatabase, GattLink, LinkEvent, RawNotification,
    WriteMode,
};
use crate::profile::{
    ARMING_DELAY, BLOOD_PRESSURE_SERVICE, CLIENT_CONFIG_DESCRIPTOR, CONTROL_CHARACTERISTIC,
    ControlCommand, ENABLE_INDICATION_VALUE, MEASUREMENT_CHARACTERISTIC,
};
use crate::reading::{DeviceIdentity, Reading};
use crate::sink::Sink;
use crate::state::{Lifecycle, SessionEvent, SessionState};
use crate::status::{self, Status};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const MEASUREMENT: CharacteristicRef =
    CharacteristicRef::new(BLOOD_PRESSURE_SERVICE, MEASUREMENT_CHARACTERISTIC);

/// Upper bound for the final disconnect request.
pub(crate) const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between enabling indications and writing the start command
    pub arming_delay: Duration,
    /// Append the raw packet bytes to the reading text
    pub raw_text: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            arming_delay: ARMING_DELAY,
            raw_text: false,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The peripheral dropped the link
    Disconnected,
    /// The caller asked to stop
    Stopped,
    /// Setup failed; the link was closed
    Aborted(BleError),
}

impl From<BleError> for SessionEnd {
    fn from(err: BleError) -> Self {
        match err {
            BleError::Disconnected => SessionEnd::Disconnected,
            other => SessionEnd::Aborted(other),
        }
    }
}

/// Resolves once the stop flag is raised. A dropped sender never resolves.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Ask `link` to disconnect, giving up after [`DISCONNECT_TIMEOUT`].
pub(crate) async fn close_link(link: &dyn GattLink) {
    match tokio::time::timeout(DISCONNECT_TIMEOUT, link.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "disconnect failed"),
        Err(_) => warn!("disconnect timed out"),
    }
}

pub struct MeasurementSession {
    link: Arc<dyn GattLink>,
    events: mpsc::Receiver<LinkEvent>,
    stop: watch::Receiver<bool>,
    sink: Arc<dyn Sink>,
    config: SessionConfig,
    lifecycle: Lifecycle,
    database: GattDatabase,
    identity: DeviceIdentity,
    backlog: VecDeque<RawNotification>,
    /// The start command went out, even if its result was discarded
    start_sent: bool,
}

impl MeasurementSession {
    /// Take over `connection`. `lifecycle` must already be in
    /// [`SessionState::DiscoveringServices`].
    pub fn new(
        connection: Connection,
        lifecycle: Lifecycle,
        sink: Arc<dyn Sink>,
        stop: watch::Receiver<bool>,
        config: SessionConfig,
    ) -> Self {
        Self {
            link: Arc::from(connection.link),
            events: connection.events,
            stop,
            sink,
            config,
            lifecycle,
            database: GattDatabase::default(),
            identity: DeviceIdentity::default(),
            backlog: VecDeque::new(),
            start_sent: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    /// Drive the session until the link drops, the caller stops, or setup fails.
    pub async fn run(mut self) -> SessionEnd {
        let end = match self.setup().await {
            Ok(()) => self.listen().await,
            Err(end) => end,
        };
        self.finish(&end).await;
        end
    }

    async fn setup(&mut self) -> Result<(), SessionEnd> {
        let link = Arc::clone(&self.link);

        let database = self.guarded(link.discover_services()).await?;
        database.require(MEASUREMENT)?;
        debug!(services = database.services().len(), "services discovered");
        self.database = database;
        self.lifecycle.apply(SessionEvent::ServicesDiscovered);

        let identity = self.guarded(device_info::read_identity(link.as_ref())).await?;
        self.status(Status::Identified(identity.clone()));
        self.identity = identity;
        self.lifecycle.apply(SessionEvent::IdentityRead);

        // Indications are the only way a result can be observed, so a failure
        // here ends the session before any control write.
        self.guarded(link.write_descriptor(
            MEASUREMENT,
            CLIENT_CONFIG_DESCRIPTOR,
            &ENABLE_INDICATION_VALUE,
        ))
        .await?;
        self.guarded(link.set_notifications_enabled(MEASUREMENT, true))
            .await?;
        info!(delay = ?self.config.arming_delay, "indications enabled, arming");
        Ok(())
    }

    async fn listen(&mut self) -> SessionEnd {
        let arming = tokio::time::sleep(self.config.arming_delay);
        tokio::pin!(arming);
        let mut armed = false;

        loop {
            while let Some(notification) = self.backlog.pop_front() {
                self.handle_notification(notification).await;
            }

            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop) => return SessionEnd::Stopped,
                event = self.events.recv() => match event {
                    Some(LinkEvent::Notification(notification)) => {
                        self.handle_notification(notification).await;
                    }
                    Some(LinkEvent::Disconnected) | None => return SessionEnd::Disconnected,
                    Some(LinkEvent::Connected) => {}
                },
                () = &mut arming, if !armed => {
                    armed = true;
                    if let Err(end) = self.start_measurement().await {
                        return end;
                    }
                }
            }
        }
    }

    /// Write the start command. A failed write is reported but the session
    /// keeps listening: the cuff may already be measuring.
    async fn start_measurement(&mut self) -> Result<(), SessionEnd> {
        match self.database.locate(CONTROL_CHARACTERISTIC) {
            Some(control) => {
                if *self.stop.borrow() {
                    return Err(SessionEnd::Stopped);
                }
                self.start_sent = true;
                let link = Arc::clone(&self.link);
                let command = ControlCommand::StartMeasurement;
                let write =
                    link.write_characteristic(control, command.as_bytes(), WriteMode::WithoutResponse);
                match self.guarded(write).await {
                    Ok(()) => {
                        info!("start command written");
                        self.status(Status::Armed);
                    }
                    Err(SessionEnd::Aborted(e)) => {
                        warn!(error = %e, "start command failed, still listening");
                        self.status(Status::Error(e));
                    }
                    Err(end) => return Err(end),
                }
            }
            None => {
                warn!("control characteristic missing, still listening");
                self.status(Status::Error(BleError::CharacteristicMissing(
                    CONTROL_CHARACTERISTIC,
                )));
            }
        }
        self.lifecycle.apply(SessionEvent::Armed);
        Ok(())
    }

    async fn handle_notification(&mut self, notification: RawNotification) {
        if notification.characteristic != MEASUREMENT_CHARACTERISTIC {
            debug!(characteristic = %notification.characteristic, "ignoring notification");
            return;
        }

        let sample = match decoder::decode(&notification.bytes) {
            Ok(sample) => sample,
            Err(DecodeError::Empty) => {
                debug!("empty measurement notification");
                return;
            }
        };
        let reading = Reading::from_sample(sample, self.identity.clone(), SystemTime::now());
        debug!(bytes = ?notification.bytes, ?reading, "measurement packet");

        if reading.is_failed {
            warn!("cuff reported a failed measurement");
            self.status(Status::MeasurementFailed);
            return;
        }

        let raw = self.config.raw_text.then_some(notification.bytes.as_slice());
        self.status(Status::ReadingText(status::reading_text(&reading, raw)));

        if !reading.is_final() {
            self.status(Status::Measuring(reading));
            return;
        }

        info!(
            systolic = reading.systolic_mmhg,
            diastolic = reading.diastolic_mmhg,
            pulse = reading.pulse_bpm,
            "final reading"
        );
        self.status(Status::MeasurementComplete(reading.clone()));
        match self.sink.submit(&reading).await {
            Ok(()) => self.status(Status::SinkAccepted),
            Err(e) => {
                warn!(error = %e, "sink rejected reading");
                self.status(Status::SinkFailed(e.to_string()));
            }
        }
    }

    async fn finish(&mut self, end: &SessionEnd) {
        match end {
            SessionEnd::Disconnected => info!("peripheral disconnected"),
            SessionEnd::Stopped => {
                info!("session stopped");
                if self.start_sent {
                    self.cancel_measurement().await;
                }
                self.disconnect().await;
            }
            SessionEnd::Aborted(e) => {
                warn!(error = %e, "session setup failed");
                self.status(Status::Error(e.clone()));
                self.disconnect().await;
            }
        }

        self.lifecycle.apply(SessionEvent::LinkDown);
    }

    async fn cancel_measurement(&self) {
        let Some(control) = self.database.locate(CONTROL_CHARACTERISTIC) else {
            return;
        };
        let command = ControlCommand::CancelMeasurement;
        if let Err(e) = self
            .link
            .write_characteristic(control, command.as_bytes(), WriteMode::WithoutResponse)
            .await
        {
            debug!(error = %e, "cancel command failed");
        }
    }

    async fn disconnect(&self) {
        close_link(self.link.as_ref()).await;
    }

    /// Run one GATT operation while watching for link loss and stop requests.
    async fn guarded<T>(
        &mut self,
        op: impl Future<Output = Result<T, BleError>>,
    ) -> Result<T, SessionEnd> {
        if *self.stop.borrow() {
            return Err(SessionEnd::Stopped);
        }
        tokio::pin!(op);
        let mut interrupted = None;

        loop {
            tokio::select! {
                biased;
                result = &mut op => {
                    return match interrupted {
                        Some(end) => {
                            debug!("discarding result of in-flight operation");
                            Err(end)
                        }
                        None => result.map_err(SessionEnd::from),
                    };
                }
                event = self.events.recv(), if interrupted.is_none() => match event {
                    Some(LinkEvent::Notification(notification)) => {
                        if self.lifecycle.state().accepts_measurements() {
                            self.backlog.push_back(notification);
                        } else {
                            debug!("notification before indications enabled, dropped");
                        }
                    }
                    Some(LinkEvent::Disconnected) | None => {
                        interrupted = Some(SessionEnd::Disconnected);
                    }
                    Some(LinkEvent::Connected) => {}
                },
                _ = wait_for_stop(&mut self.stop), if interrupted.is_none() => {
                    interrupted = Some(SessionEnd::Stopped);
                }
            }
        }
    }

    fn status(&self, status: Status) {
        self.lifecycle.status().emit(status);
    }
}
