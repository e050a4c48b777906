//! Upstream connector
//!
//! Maintains the single best-effort TCP connection to the remote serial
//! bridge with bounded exponential backoff. Inbound bytes are delivered to
//! the engine through an injected channel sink; outbound writes are
//! serialized so write boundaries are preserved.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::trace;

use crate::error::UpstreamError;
use crate::io::BufferPool;
use crate::logging::Logger;

/// Connect deadline for each dial attempt
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Read deadline, refreshed before each read, so a wedged link is detected
/// even without TCP errors
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a single outbound write
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// State of the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; set only by [`UpstreamConnector::stop`]
    Stopped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// The single connection to the remote serial bridge
pub struct UpstreamConnector {
    addr: String,
    logger: Arc<Logger>,
    sink: mpsc::Sender<Bytes>,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    state: RwLock<LinkState>,
    /// Live write half; `Some` implies state == Connected. A tokio mutex so
    /// concurrent writers serialize without blocking state reads.
    writer: tokio::sync::Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    last_connected: Mutex<Option<DateTime<Utc>>>,
    read_pool: Arc<BufferPool>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamConnector {
    /// Create the connector
    ///
    /// `sink` receives one owned buffer per upstream read. Sends happen
    /// outside any connector lock.
    #[must_use]
    pub fn new(
        addr: impl Into<String>,
        logger: Arc<Logger>,
        sink: mpsc::Sender<Bytes>,
        reconnect_initial: Duration,
        reconnect_max: Duration,
        read_pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            addr: addr.into(),
            logger,
            sink,
            reconnect_initial,
            reconnect_max,
            state: RwLock::new(LinkState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            last_connected: Mutex::new(None),
            read_pool,
            stopped: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            loop_handle: Mutex::new(None),
        })
    }

    /// Begin the reconnect loop; non-blocking
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock();
        if handle.is_some() {
            return;
        }
        let connector = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            connector.connection_loop().await;
        }));
    }

    /// Transition to Stopped, close the handle, and wait for the loop to
    /// observe termination; idempotent
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(LinkState::Stopped);
        let _ = self.shutdown_tx.send(true);
        self.writer.lock().await.take();

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.logger.info("Upstream connection stopped");
    }

    /// Current link state
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Whether the link is currently Connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Time of the most recent Connected transition
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected.lock()
    }

    /// Remote address this connector dials
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write the entire buffer to the upstream
    ///
    /// Concurrent callers are serialized so write boundaries are preserved.
    /// A write failure bubbles to the caller without tearing the connection
    /// down; the read pump observes the broken socket and reconnects.
    ///
    /// # Errors
    ///
    /// `UpstreamError::Disconnected` when no live handle exists,
    /// `UpstreamError::WriteTimeout` after the 5-second deadline, or the
    /// underlying I/O error.
    pub async fn write(&self, data: &[u8]) -> Result<(), UpstreamError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(UpstreamError::Disconnected)?;
        match timeout(WRITE_TIMEOUT, writer.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(UpstreamError::Io(e)),
            Err(_) => Err(UpstreamError::WriteTimeout {
                timeout: WRITE_TIMEOUT,
            }),
        }
    }

    fn set_state(&self, next: LinkState) {
        let mut state = self.state.write();
        // Stopped is terminal
        if *state == LinkState::Stopped && next != LinkState::Stopped {
            return;
        }
        *state = next;
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn connection_loop(self: Arc<Self>) {
        let mut backoff = self.reconnect_initial;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if self.is_stopped() {
                return;
            }

            self.set_state(LinkState::Connecting);
            self.logger
                .info(format!("Connecting to upstream {}", self.addr));

            let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    self.logger
                        .error(format!("Failed to connect to upstream: {e}"));
                    None
                }
                Err(_) => {
                    self.logger.error(format!(
                        "Failed to connect to upstream: dial timed out after {DIAL_TIMEOUT:?}"
                    ));
                    None
                }
            };

            let Some(stream) = stream else {
                self.set_state(LinkState::Disconnected);
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown_rx.changed() => return,
                }
                backoff = (backoff * 2).min(self.reconnect_max);
                continue;
            };

            let (reader, writer) = stream.into_split();
            *self.writer.lock().await = Some(writer);
            *self.last_connected.lock() = Some(Utc::now());
            backoff = self.reconnect_initial;
            self.set_state(LinkState::Connected);
            self.logger
                .info(format!("Connected to upstream {}", self.addr));

            self.read_pump(reader, &mut shutdown_rx).await;

            self.writer.lock().await.take();
            if !self.is_stopped() {
                self.set_state(LinkState::Disconnected);
                self.logger.warn("Upstream connection lost, reconnecting...");
            }
        }
    }

    async fn read_pump(&self, mut reader: OwnedReadHalf, shutdown: &mut watch::Receiver<bool>) {
        let mut buf = self.read_pool.get();

        loop {
            let read = tokio::select! {
                r = timeout(READ_TIMEOUT, reader.read(&mut buf[..])) => r,
                _ = shutdown.changed() => return,
            };

            let n = match read {
                Ok(Ok(0)) => {
                    if !self.is_stopped() {
                        self.logger.warn("Upstream read error: connection closed");
                    }
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    if !self.is_stopped() {
                        self.logger.warn(format!("Upstream read error: {e}"));
                    }
                    return;
                }
                Err(_) => {
                    if !self.is_stopped() {
                        self.logger.warn(format!(
                            "Upstream read error: no data within {READ_TIMEOUT:?}"
                        ));
                    }
                    return;
                }
            };

            trace!(bytes = n, "upstream read");

            // The pool buffer is reused; hand the sink its own copy.
            let data = Bytes::copy_from_slice(&buf[..n]);
            if self.sink.send(data).await.is_err() {
                return;
            }
        }
    }
}
