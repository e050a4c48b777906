//! Operator event log
//!
//! Produces time-stamped textual log lines to a process-wide stdout sink, an
//! optional append-only file sink for hex packet lines, and at most one
//! subscription callback used by the control surface to stream lines to live
//! consumers.
//!
//! The callback may re-enter the proxy (e.g. a subscriber fan-out that
//! broadcasts), so it is always invoked after the internal sink lock has
//! been released.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::hex;

/// Size cap of the buffered file sink
const FILE_BUFFER_SIZE: usize = 4096;

/// Interval of the periodic file flush
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Subscription callback receiving every formatted line
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Log severity tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Pkt,
}

impl Level {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Pkt => "PKT",
        }
    }
}

/// Direction tag of a packet log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from the upstream, fanned out to clients
    FromUpstream,
    /// Bytes written toward the upstream
    ToUpstream,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FromUpstream => "UP->",
            Self::ToUpstream => "->UP",
        }
    }
}

struct Sinks {
    out: Box<dyn Write + Send>,
    file: Option<BufWriter<std::fs::File>>,
}

/// Process-wide event logger
pub struct Logger {
    log_packets: bool,
    sinks: Mutex<Sinks>,
    callback: Mutex<Option<LogCallback>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Logger {
    /// Create the logger
    ///
    /// When packet logging is enabled and `log_file` names a path, the file
    /// is opened append-only and flushed on a 1-second tick. A file that
    /// cannot be opened downgrades to a warning; packet lines then go to
    /// stdout only.
    ///
    /// The flush tick requires a running tokio runtime when a file sink is
    /// configured.
    #[must_use]
    pub fn new(log_packets: bool, log_file: Option<&str>) -> Arc<Self> {
        let logger = Arc::new(Self {
            log_packets,
            sinks: Mutex::new(Sinks {
                out: Box::new(io::stdout()),
                file: None,
            }),
            callback: Mutex::new(None),
            flush_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if log_packets {
            if let Some(path) = log_file.filter(|p| !p.is_empty()) {
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => {
                        logger.sinks.lock().file =
                            Some(BufWriter::with_capacity(FILE_BUFFER_SIZE, file));
                        logger.start_flush_task();
                    }
                    Err(e) => {
                        logger.warn(format!(
                            "Failed to open log file {path}: {e}, packet logging to file disabled"
                        ));
                    }
                }
            }
        }

        logger
    }

    fn start_flush_task(self: &Arc<Self>) {
        let logger = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                logger.flush_file();
            }
        });
        *self.flush_handle.lock() = Some(handle);
    }

    fn flush_file(&self) {
        let mut sinks = self.sinks.lock();
        if let Some(file) = sinks.file.as_mut() {
            let _ = file.flush();
        }
    }

    fn timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn log(&self, level: Level, msg: &str) {
        let line = format!("{} [{}] {}\n", Self::timestamp(), level.as_str(), msg);

        {
            let mut sinks = self.sinks.lock();
            let _ = sinks.out.write_all(line.as_bytes());
            let _ = sinks.out.flush();
        }

        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb(&line);
        }
    }

    /// Emit an informational line
    pub fn info(&self, msg: impl AsRef<str>) {
        self.log(Level::Info, msg.as_ref());
    }

    /// Emit a warning line
    pub fn warn(&self, msg: impl AsRef<str>) {
        self.log(Level::Warn, msg.as_ref());
    }

    /// Emit an error line
    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(Level::Error, msg.as_ref());
    }

    /// Emit a hex packet line
    ///
    /// No-op unless packet logging is enabled or a callback is attached.
    /// When enabled, the line goes to stdout and the buffered file sink;
    /// an attached callback always receives the formatted line.
    pub fn log_packet(&self, direction: Direction, data: &[u8], source: Option<&str>) {
        let callback = self.callback.lock().clone();
        if !self.log_packets && callback.is_none() {
            return;
        }

        let hex = hex::encode_spaced(data);
        let line = match source {
            Some(src) => format!(
                "{} [{}] [{}] {} ({} bytes) from {}\n",
                Self::timestamp(),
                Level::Pkt.as_str(),
                direction.as_str(),
                hex,
                data.len(),
                src
            ),
            None => format!(
                "{} [{}] [{}] {} ({} bytes)\n",
                Self::timestamp(),
                Level::Pkt.as_str(),
                direction.as_str(),
                hex,
                data.len()
            ),
        };

        if self.log_packets {
            let mut sinks = self.sinks.lock();
            let _ = sinks.out.write_all(line.as_bytes());
            let _ = sinks.out.flush();
            if let Some(file) = sinks.file.as_mut() {
                let _ = file.write_all(line.as_bytes());
            }
        }

        if let Some(cb) = callback {
            cb(&line);
        }
    }

    /// Replace the subscription callback
    pub fn set_callback(&self, callback: LogCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Remove the subscription callback
    pub fn clear_callback(&self) {
        *self.callback.lock() = None;
    }

    /// Whether packet lines are written to stdout/file
    #[must_use]
    pub const fn is_packet_logging_enabled(&self) -> bool {
        self.log_packets
    }

    /// Replace the stdout sink (used by tests)
    pub fn set_output(&self, out: Box<dyn Write + Send>) {
        self.sinks.lock().out = out;
    }

    /// Stop the periodic flush, flush the file buffer, and close the file
    ///
    /// Idempotent. Lines logged afterwards still reach stdout and the
    /// callback.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.flush_handle.lock().take() {
            handle.abort();
        }
        let mut sinks = self.sinks.lock();
        if let Some(mut file) = sinks.file.take() {
            let _ = file.flush();
        }
    }
}
