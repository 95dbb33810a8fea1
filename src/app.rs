//! Core application runner for `qardioarm-listener`.
//!
//! This module is decoupled from the BlueZ backend and process exit codes so
//! it can be tested deterministically with an injected [`Central`] and
//! [`Sink`].

use crate::duration::parse_duration;
use crate::peripheral::PeripheralHandle;
use crate::platform::{BleError, Central};
use crate::profile::DEFAULT_NAME_PATTERN;
use crate::session::SessionConfig;
use crate::sink::influxdb::DEFAULT_MEASUREMENT_NAME;
use crate::sink::{OutputFormat, Sink};
use crate::status::{Status, StatusBoard};
use crate::supervisor::{MatchPolicy, NameFilter, Supervisor, SupervisorConfig};
use clap::Parser;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Pause between a finished attempt and the next scan with `--rescan`.
const RESCAN_DELAY: Duration = Duration::from_secs(1);

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Advertised name of the cuff to connect to
    #[arg(long, default_value = DEFAULT_NAME_PATTERN)]
    pub name: String,

    /// How the advertised name is compared with --name
    #[arg(long, default_value_t, value_enum)]
    pub match_policy: MatchPolicy,

    /// Connect only to this address, e.g. AA:BB:CC:DD:EE:FF. Overrides --name
    #[arg(long)]
    pub address: Option<PeripheralHandle>,

    /// Bluetooth adapter to use, e.g. hci1. Defaults to the system default
    #[arg(long)]
    pub adapter: Option<String>,

    /// Give up scanning after this long; 0 scans until interrupted.
    /// Accepts duration with suffix: 30s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub scan_timeout: Duration,

    /// Delay between enabling indications and starting the measurement
    #[arg(long, default_value = "800ms", value_parser = parse_duration)]
    pub arming_delay: Duration,

    /// Output format for final readings on stdout
    #[arg(long, default_value_t, value_enum)]
    pub format: OutputFormat,

    /// The name of the measurement in InfluxDB line protocol.
    #[arg(long, default_value = DEFAULT_MEASUREMENT_NAME)]
    pub influxdb_measurement: String,

    /// Show the raw packet bytes under each reading
    #[arg(long)]
    pub raw: bool,

    /// Scan again after each disconnect instead of exiting
    #[arg(long)]
    pub rescan: bool,

    /// Verbose output, log protocol details
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            filter: NameFilter::new(self.name.clone(), self.match_policy),
            address: self.address,
            scan_timeout: (!self.scan_timeout.is_zero()).then_some(self.scan_timeout),
            session: SessionConfig {
                arming_delay: self.arming_delay,
                raw_text: self.raw,
            },
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Ble(#[from] BleError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fold `status` into `board` and print whatever changed.
fn show(board: &mut StatusBoard, status: &Status, err: &mut dyn Write) -> io::Result<()> {
    let before = board.clone();
    if !board.apply(status) {
        return Ok(());
    }
    if board.status() != before.status() {
        writeln!(err, "{}", board.status())?;
    }
    if board.reading() != before.reading() && !board.reading().is_empty() {
        writeln!(err, "{}", board.reading())?;
    }
    Ok(())
}

/// How one attempt ended, judged from its status stream.
fn attempt_failure(status: &Status, scan_timeout: Duration) -> Option<BleError> {
    match status {
        Status::Error(e) => Some(e.clone()),
        Status::NoDeviceFound => Some(BleError::NoDeviceFound(scan_timeout)),
        _ => None,
    }
}

/// Run attempts until one ends (or, with `rescan`, until `shutdown` resolves),
/// printing status lines to `err`.
///
/// - Final readings go to `sink`.
/// - An attempt whose last event before going idle was an error (or an empty
///   scan) makes the run fail, unless `rescan` is set.
/// - Permission errors always end the run.
pub async fn run_until(
    options: &Options,
    central: Arc<dyn Central>,
    sink: Arc<dyn Sink>,
    err: &mut dyn Write,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let supervisor = Supervisor::new(central, sink, options.supervisor_config());
    let mut board = StatusBoard::default();
    tokio::pin!(shutdown);
    let mut shutting_down = false;

    loop {
        let (handle, mut statuses) = supervisor.start();
        let mut failure = None;

        loop {
            tokio::select! {
                () = &mut shutdown, if !shutting_down => {
                    info!("shutting down");
                    shutting_down = true;
                    handle.stop();
                }
                status = statuses.recv() => {
                    let Some(status) = status else { break };
                    show(&mut board, &status, err)?;
                    if !matches!(status, Status::StateChanged(_) | Status::Idle) {
                        failure = attempt_failure(&status, options.scan_timeout);
                    }
                }
            }
        }
        handle.join().await;

        if shutting_down {
            return Ok(());
        }
        match failure {
            Some(e @ BleError::PermissionDenied(_)) => return Err(e.into()),
            Some(e) if !options.rescan => return Err(e.into()),
            _ if !options.rescan => return Ok(()),
            _ => {}
        }
        info!("scanning again");
        tokio::select! {
            () = &mut shutdown => return Ok(()),
            () = tokio::time::sleep(RESCAN_DELAY) => {}
        }
    }
}
