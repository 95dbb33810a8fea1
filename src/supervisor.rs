//! Scan, connect and hand over to a [`MeasurementSession`].
//!
//! One `start()` runs one attempt: scan until a matching peripheral shows up
//! (or the scan timeout passes), connect, run the session, then report
//! [`Status::Idle`] and close the status stream. Reconnecting is the caller's
//! decision.

use crate::peripheral::PeripheralHandle;
use crate::platform::{Advertisement, BleError, Central, Connection, LinkEvent};
use crate::profile::DEFAULT_NAME_PATTERN;
use crate::session::{MeasurementSession, SessionConfig, close_link, wait_for_stop};
use crate::sink::Sink;
use crate::state::{Lifecycle, SessionEvent};
use crate::status::{Status, StatusSender};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Default time to scan before giving up.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// How an advertised name is compared with the configured pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MatchPolicy {
    /// The advertised name contains the pattern
    #[default]
    Contains,
    /// The advertised name equals the pattern
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    pub pattern: String,
    pub policy: MatchPolicy,
}

impl NameFilter {
    pub fn new(pattern: impl Into<String>, policy: MatchPolicy) -> Self {
        Self {
            pattern: pattern.into(),
            policy,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self.policy {
            MatchPolicy::Contains => name.contains(&self.pattern),
            MatchPolicy::Exact => name == self.pattern,
        }
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_PATTERN, MatchPolicy::Contains)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub filter: NameFilter,
    /// Connect only to this address; the name filter is then ignored
    pub address: Option<PeripheralHandle>,
    /// `None` scans until stopped
    pub scan_timeout: Option<Duration>,
    pub session: SessionConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            filter: NameFilter::default(),
            address: None,
            scan_timeout: Some(DEFAULT_SCAN_TIMEOUT),
            session: SessionConfig::default(),
        }
    }
}

impl SupervisorConfig {
    fn accepts(&self, advertisement: &Advertisement) -> bool {
        if let Some(address) = self.address {
            return advertisement.peripheral == address;
        }
        advertisement
            .name
            .as_deref()
            .is_some_and(|name| self.filter.matches(name))
    }

    fn target(&self) -> String {
        match self.address {
            Some(address) => address.to_string(),
            None => self.filter.pattern.clone(),
        }
    }
}

/// Owns the platform and sink, and starts connection attempts.
pub struct Supervisor {
    central: Arc<dyn Central>,
    sink: Arc<dyn Sink>,
    config: SupervisorConfig,
}

/// Control handle for a running attempt.
pub struct SupervisorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Ask the attempt to wind down: scanning stops, an active session
    /// cancels the measurement and disconnects.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the attempt to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "supervisor task failed");
        }
    }
}

impl Supervisor {
    pub fn new(central: Arc<dyn Central>, sink: Arc<dyn Sink>, config: SupervisorConfig) -> Self {
        Self {
            central,
            sink,
            config,
        }
    }

    /// Spawn one scan-connect-measure attempt. The status stream ends after
    /// the final [`Status::Idle`].
    pub fn start(&self) -> (SupervisorHandle, mpsc::UnboundedReceiver<Status>) {
        let (status, statuses) = StatusSender::channel();
        let (stop_tx, stop) = watch::channel(false);

        let attempt = Attempt {
            central: Arc::clone(&self.central),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
            status,
            stop,
        };
        let task = tokio::spawn(attempt.run());

        (
            SupervisorHandle {
                stop: stop_tx,
                task,
            },
            statuses,
        )
    }
}

enum AttemptEnd {
    Stopped,
    Failed(BleError),
}

impl From<BleError> for AttemptEnd {
    fn from(err: BleError) -> Self {
        AttemptEnd::Failed(err)
    }
}

struct Attempt {
    central: Arc<dyn Central>,
    sink: Arc<dyn Sink>,
    config: SupervisorConfig,
    status: StatusSender,
    stop: watch::Receiver<bool>,
}

impl Attempt {
    async fn run(mut self) {
        let mut lifecycle = Lifecycle::new(self.status.clone());

        match self.connect(&mut lifecycle).await {
            Ok(connection) => {
                let session = MeasurementSession::new(
                    connection,
                    lifecycle,
                    Arc::clone(&self.sink),
                    self.stop.clone(),
                    self.config.session.clone(),
                );
                let end = session.run().await;
                debug!(?end, "session ended");
            }
            Err(AttemptEnd::Stopped) => {
                info!("stopped before connecting");
                lifecycle.apply(SessionEvent::LinkDown);
            }
            Err(AttemptEnd::Failed(BleError::NoDeviceFound(timeout))) => {
                info!(?timeout, "no matching device found");
                lifecycle.apply(SessionEvent::LinkDown);
                self.status.emit(Status::NoDeviceFound);
            }
            Err(AttemptEnd::Failed(e)) => {
                warn!(error = %e, "connection attempt failed");
                lifecycle.apply(SessionEvent::LinkDown);
                self.status.emit(Status::Error(e));
            }
        }

        self.status.emit(Status::Idle);
    }

    async fn connect(&mut self, lifecycle: &mut Lifecycle) -> Result<Connection, AttemptEnd> {
        let advertisement = self.scan().await?;
        let peripheral = advertisement.peripheral;
        let name = advertisement.name.unwrap_or_default();
        info!(%peripheral, %name, rssi = ?advertisement.rssi, "found peripheral");
        self.status.emit(Status::DeviceFound {
            peripheral,
            name,
        });
        lifecycle.apply(SessionEvent::PeripheralMatched);

        let mut connection = self.open(peripheral).await?;
        self.await_link_up(&mut connection).await?;
        lifecycle.apply(SessionEvent::LinkUp);
        Ok(connection)
    }

    async fn scan(&mut self) -> Result<Advertisement, AttemptEnd> {
        self.status.emit(Status::Scanning {
            pattern: self.config.target(),
        });
        let mut advertisements = self.central.scan().await?;
        info!(target = %self.config.target(), timeout = ?self.config.scan_timeout, "scanning");

        let deadline = self.config.scan_timeout.map(|t| Instant::now() + t);
        let timeout = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        let result = loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop) => break Err(AttemptEnd::Stopped),
                () = &mut timeout => {
                    let waited = self.config.scan_timeout.unwrap_or_default();
                    break Err(AttemptEnd::Failed(BleError::NoDeviceFound(waited)));
                }
                advertisement = advertisements.recv() => match advertisement {
                    Some(advertisement) if self.config.accepts(&advertisement) => {
                        break Ok(advertisement);
                    }
                    Some(advertisement) => {
                        trace!(peripheral = %advertisement.peripheral, name = ?advertisement.name, "ignoring advertisement");
                    }
                    None => {
                        break Err(AttemptEnd::Failed(BleError::Bluetooth(
                            "scan ended unexpectedly".into(),
                        )));
                    }
                },
            }
        };

        if let Err(e) = self.central.stop_scan().await {
            warn!(error = %e, "failed to stop scan");
        }
        result
    }

    /// Connect, letting an in-flight attempt finish if a stop arrives meanwhile.
    async fn open(&mut self, peripheral: PeripheralHandle) -> Result<Connection, AttemptEnd> {
        let central = Arc::clone(&self.central);
        let connect = central.connect(peripheral);
        tokio::pin!(connect);

        let mut stopped = false;
        let result = loop {
            tokio::select! {
                biased;
                result = &mut connect => break result,
                _ = wait_for_stop(&mut self.stop), if !stopped => stopped = true,
            }
        };

        match result {
            Ok(connection) if stopped => {
                close_link(connection.link.as_ref()).await;
                Err(AttemptEnd::Stopped)
            }
            Ok(connection) => Ok(connection),
            Err(_) if stopped => Err(AttemptEnd::Stopped),
            Err(e @ (BleError::PermissionDenied(_) | BleError::ConnectionFailed(_))) => {
                Err(AttemptEnd::Failed(e))
            }
            Err(e) => Err(AttemptEnd::Failed(BleError::ConnectionFailed(e.to_string()))),
        }
    }

    async fn await_link_up(&mut self, connection: &mut Connection) -> Result<(), AttemptEnd> {
        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut self.stop) => {
                    close_link(connection.link.as_ref()).await;
                    return Err(AttemptEnd::Stopped);
                }
                event = connection.events.recv() => match event {
                    Some(LinkEvent::Connected) => return Ok(()),
                    Some(LinkEvent::Notification(_)) => {}
                    Some(LinkEvent::Disconnected) | None => {
                        return Err(AttemptEnd::Failed(BleError::ConnectionFailed(
                            "link dropped before it came up".into(),
                        )));
                    }
                },
            }
        }
    }
}
