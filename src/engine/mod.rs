//! Proxy engine
//!
//! Owns the listening socket, drives accept, runs one read pump per
//! connected client, and wires upstream inbound bytes into the registry
//! broadcast. Routing is strictly one-way per direction: bytes observed on
//! a client peer are forwarded only to the upstream; bytes observed on the
//! upstream are forwarded only to currently-registered proxy clients.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{EngineError, ProxyError, UpstreamError};
use crate::io::BufferPool;
use crate::logging::{Direction, Logger};
use crate::registry::{AcceptedClient, ClientRegistry};
use crate::upstream::{LinkState, UpstreamConnector};

/// Read deadline per client, refreshed before each read. Clients idle
/// beyond this are disconnected and may simply reconnect.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace window for client pumps to finish before they are force-closed
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval of the shutdown drain loop
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Depth of the upstream inbound channel between connector and engine
const SINK_QUEUE_DEPTH: usize = 64;

/// Source tag attached to injected packet log lines
const INJECT_SOURCE: &str = "INJECT";

/// Side a packet injection is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectTarget {
    /// Write the payload to the upstream, as if a client had sent it
    Upstream,
    /// Broadcast the payload to all proxy clients, as if the upstream had
    /// sent it
    Downstream,
}

impl FromStr for InjectTarget {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upstream" => Ok(Self::Upstream),
            "downstream" => Ok(Self::Downstream),
            other => Err(EngineError::InvalidTarget(other.to_string())),
        }
    }
}

/// Point-in-time view of the engine, served to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub upstream_state: String,
    pub upstream_addr: String,
    pub listen_addr: String,
    pub connected_clients: usize,
    pub max_clients: usize,
    pub start_time: Option<String>,
}

/// The proxy engine
pub struct ProxyEngine {
    config: Config,
    logger: Arc<Logger>,
    upstream: Arc<UpstreamConnector>,
    registry: Arc<ClientRegistry>,
    client_read_pool: Arc<BufferPool>,
    sink_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    listening: AtomicBool,
    start_time: Mutex<Option<DateTime<Utc>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    core_tasks: Mutex<Vec<JoinHandle<()>>>,
    client_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyEngine {
    /// Create the engine and its subsystems
    #[must_use]
    pub fn new(config: Config, logger: Arc<Logger>) -> Arc<Self> {
        let (sink_tx, sink_rx) = mpsc::channel(SINK_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let upstream = UpstreamConnector::new(
            config.upstream_addr(),
            Arc::clone(&logger),
            sink_tx,
            config.reconnect_initial(),
            config.reconnect_max(),
            Arc::new(BufferPool::with_defaults()),
        );
        let registry = ClientRegistry::new(config.max_clients, Arc::clone(&logger));

        Arc::new(Self {
            config,
            logger,
            upstream,
            registry,
            client_read_pool: Arc::new(BufferPool::with_defaults()),
            sink_rx: Mutex::new(Some(sink_rx)),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            start_time: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            core_tasks: Mutex::new(Vec::new()),
            client_tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the upstream connector, bind the listener, and begin accepting
    ///
    /// # Errors
    ///
    /// `EngineError::AlreadyStarted` on a second call, or
    /// `EngineError::BindFailed` when the listen socket cannot be bound
    /// (fatal at startup).
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted.into());
        }

        self.upstream.start();

        let listen_addr = self.config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| EngineError::bind(listen_addr.clone(), e))?;
        *self.local_addr.lock() = listener.local_addr().ok();
        *self.start_time.lock() = Some(Utc::now());
        self.listening.store(true, Ordering::SeqCst);
        self.logger.info(format!("Listening on {listen_addr}"));

        let mut core = self.core_tasks.lock();
        if let Some(rx) = self.sink_rx.lock().take() {
            let engine = Arc::clone(self);
            core.push(tokio::spawn(engine.upstream_sink_pump(rx)));
        }
        let engine = Arc::clone(self);
        core.push(tokio::spawn(engine.accept_loop(listener)));

        Ok(())
    }

    /// Graceful shutdown: drain client pumps for up to 5 seconds, then
    /// force-close everything; idempotent
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        self.logger.info("Shutting down proxy server...");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.registry.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if self.registry.count() > 0 {
            self.logger
                .warn("Timeout waiting for clients, forcing shutdown");
        }

        self.registry.close_all();

        let client_tasks: Vec<_> = std::mem::take(&mut *self.client_tasks.lock());
        for handle in client_tasks {
            let _ = handle.await;
        }

        self.upstream.stop().await;

        let core_tasks: Vec<_> = std::mem::take(&mut *self.core_tasks.lock());
        for handle in core_tasks {
            let _ = handle.await;
        }

        self.logger.close();
        self.logger.info("Proxy server stopped");
    }

    /// Inject a byte buffer as if it had arrived from the indicated side
    ///
    /// The packet log line carries source `INJECT` in either direction.
    ///
    /// # Errors
    ///
    /// `UpstreamError::Disconnected` when `Upstream` is requested without a
    /// live upstream connection.
    pub async fn inject(&self, target: InjectTarget, data: &[u8]) -> Result<(), ProxyError> {
        match target {
            InjectTarget::Upstream => {
                if !self.upstream.is_connected() {
                    return Err(UpstreamError::Disconnected.into());
                }
                self.logger
                    .log_packet(Direction::ToUpstream, data, Some(INJECT_SOURCE));
                self.upstream.write(data).await?;
                Ok(())
            }
            InjectTarget::Downstream => {
                self.logger
                    .log_packet(Direction::FromUpstream, data, Some(INJECT_SOURCE));
                self.registry.broadcast(data).await;
                Ok(())
            }
        }
    }

    /// Snapshot of the engine state
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            upstream_state: self.upstream.state().to_string(),
            upstream_addr: self.config.upstream_addr(),
            listen_addr: self.config.listen_addr(),
            connected_clients: self.registry.count(),
            max_clients: self.config.max_clients,
            start_time: (*self.start_time.lock()).map(|t| t.to_rfc3339()),
        }
    }

    /// Whether the accept loop is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Whether the upstream link is Connected
    #[must_use]
    pub fn is_upstream_connected(&self) -> bool {
        self.upstream.is_connected()
    }

    /// Current upstream link state
    #[must_use]
    pub fn upstream_state(&self) -> LinkState {
        self.upstream.state()
    }

    /// Time `start()` completed
    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock()
    }

    /// Time of the most recent upstream Connected transition
    #[must_use]
    pub fn upstream_last_connected(&self) -> Option<DateTime<Utc>> {
        self.upstream.last_connected_at()
    }

    /// Actual bound listen address (differs from the configured one when
    /// port 0 was requested, e.g. in tests)
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// The client registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The event logger
    #[must_use]
    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// The immutable configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => self.handle_accept(stream, peer),
                    Err(e) => {
                        self.logger.error(format!("Accept error: {e}"));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        self.listening.store(false, Ordering::SeqCst);
    }

    fn handle_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        match self.registry.add(stream) {
            Ok(accepted) => {
                let engine = Arc::clone(self);
                let handle = tokio::spawn(engine.client_pump(accepted));
                let mut tasks = self.client_tasks.lock();
                tasks.retain(|h| !h.is_finished());
                tasks.push(handle);
            }
            Err(e) => {
                // The stream was dropped (closed) by the failed add.
                self.logger
                    .warn(format!("Rejecting connection from {peer}: {e}"));
            }
        }
    }

    async fn client_pump(self: Arc<Self>, accepted: AcceptedClient) {
        let AcceptedClient {
            info,
            mut reader,
            mut closed,
        } = accepted;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut buf = self.client_read_pool.get();

        loop {
            let read = tokio::select! {
                r = timeout(CLIENT_READ_TIMEOUT, reader.read(&mut buf[..])) => r,
                _ = closed.changed() => break,
                _ = shutdown_rx.changed() => break,
            };

            let n = match read {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => n,
            };

            // The pool buffer is reused; forward an owned copy.
            let data = Bytes::copy_from_slice(&buf[..n]);
            self.logger
                .log_packet(Direction::ToUpstream, &data, Some(&info.id));

            if self.upstream.is_connected() {
                if let Err(e) = self.upstream.write(&data).await {
                    self.logger.warn(format!(
                        "Failed to write to upstream from {}: {e}",
                        info.id
                    ));
                }
            } else {
                self.logger.warn(format!(
                    "Upstream not connected, dropping packet from {}",
                    info.id
                ));
            }
        }

        self.registry.remove(&info.id);
    }

    async fn upstream_sink_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let data = tokio::select! {
                d = rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            self.logger.log_packet(Direction::FromUpstream, &data, None);
            self.registry.broadcast(&data).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn quiet_logger() -> Arc<Logger> {
        let logger = Logger::new(false, None);
        logger.set_output(Box::new(io::sink()));
        logger
    }

    fn test_config() -> Config {
        Config {
            upstream_host: "127.0.0.1".into(),
            upstream_port: 1,
            listen_port: 1, // replaced by an ephemeral port in start tests
            max_clients: 4,
            ..Config::default()
        }
    }

    #[test]
    fn test_inject_target_parsing() {
        assert_eq!(
            "upstream".parse::<InjectTarget>().unwrap(),
            InjectTarget::Upstream
        );
        assert_eq!(
            "downstream".parse::<InjectTarget>().unwrap(),
            InjectTarget::Downstream
        );
        assert!(matches!(
            "sideways".parse::<InjectTarget>(),
            Err(EngineError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let engine = ProxyEngine::new(test_config(), quiet_logger());
        let status = engine.status();

        assert_eq!(status.upstream_state, "Disconnected");
        assert_eq!(status.upstream_addr, "127.0.0.1:1");
        assert_eq!(status.connected_clients, 0);
        assert_eq!(status.max_clients, 4);
        assert!(status.start_time.is_none());
        assert!(!engine.is_listening());
        assert!(!engine.is_upstream_connected());
    }

    #[tokio::test]
    async fn test_inject_upstream_requires_connection() {
        let engine = ProxyEngine::new(test_config(), quiet_logger());
        let result = engine.inject(InjectTarget::Upstream, b"Hello").await;
        assert!(matches!(
            result,
            Err(ProxyError::Upstream(UpstreamError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_inject_downstream_without_clients_is_ok() {
        let engine = ProxyEngine::new(test_config(), quiet_logger());
        engine
            .inject(InjectTarget::Downstream, &[0x01, 0x02])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut config = test_config();
        config.listen_port = 0;
        let engine = ProxyEngine::new(config, quiet_logger());

        engine.start().await.unwrap();
        assert!(engine.is_listening());
        assert!(engine.local_addr().is_some());
        assert!(engine.start_time().is_some());

        let result = engine.start().await;
        assert!(matches!(
            result,
            Err(ProxyError::Engine(EngineError::AlreadyStarted))
        ));

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_quiesces() {
        let mut config = test_config();
        config.listen_port = 0;
        let engine = ProxyEngine::new(config, quiet_logger());

        engine.start().await.unwrap();
        engine.stop().await;
        engine.stop().await;

        assert!(!engine.is_listening());
        assert_eq!(engine.upstream_state(), LinkState::Stopped);
        assert_eq!(engine.registry().count(), 0);
    }
}
