//! Result sinks for finalized readings.
//!
//! A [`Sink`] receives every final, non-failed reading exactly once.
//! Submission is best-effort: the measurement session reports a failure as a
//! status and keeps running.

pub mod influxdb;
pub mod json;

use crate::reading::Reading;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::io::{self, Write};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// External store for finalized readings.
pub trait Sink: Send + Sync {
    fn submit<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// Trait for formatting readings into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a reading as a single line without the trailing newline.
    fn format(&self, reading: &Reading) -> String;
}

/// Output line format selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// InfluxDB line protocol (Telegraf `execd` compatible)
    #[default]
    Influxdb,
    /// One JSON object per line
    Json,
}

impl OutputFormat {
    pub fn formatter(self, measurement_name: String) -> Box<dyn OutputFormatter> {
        match self {
            OutputFormat::Influxdb => Box::new(influxdb::InfluxDbFormatter::new(measurement_name)),
            OutputFormat::Json => Box::new(json::JsonFormatter),
        }
    }
}

/// Sink writing one formatted line per reading to an `io::Write`.
pub struct WriterSink<W> {
    formatter: Box<dyn OutputFormatter>,
    out: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(formatter: Box<dyn OutputFormatter>, out: W) -> Self {
        Self {
            formatter,
            out: Mutex::new(out),
        }
    }

    fn write_line(&self, reading: &Reading) -> Result<(), SinkError> {
        let line = self.formatter.format(reading);
        let mut out = self
            .out
            .lock()
            .map_err(|_| SinkError::Unavailable("output lock poisoned".into()))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn submit<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), SinkError>> {
        let result = self.write_line(reading);
        async move { result }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::reading;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writer_sink_writes_one_line_per_reading() {
        let sink = WriterSink::new(OutputFormat::Influxdb.formatter("bp".into()), Vec::new());
        sink.submit(&reading(120, 80, 72)).await.unwrap();
        sink.submit(&reading(118, 79, 70)).await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().all(|l| l.starts_with("bp,")));
        assert!(out.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_writer_sink_reports_io_errors() {
        let sink = WriterSink::new(OutputFormat::Json.formatter(String::new()), BrokenPipe);
        let err = sink.submit(&reading(120, 80, 72)).await.unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
        assert_eq!(err.to_string(), "broken pipe");
    }
}
