//! Client registry
//!
//! Tracks active downstream peers, enforces the capacity cap shared between
//! proxy clients and web subscribers, and fans a byte buffer out to every
//! registered peer with per-peer write deadlines and failure eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use crate::error::RegistryError;
use crate::logging::Logger;

/// Per-peer write deadline during a broadcast; a peer missing it is evicted
const BROADCAST_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Snapshot of one registered client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Stable id of the form `client#<n>`, monotone within the process
    pub id: String,
    /// Remote address of the peer
    pub addr: String,
    /// Time of the successful accept
    pub connected_at: DateTime<Utc>,
}

/// Result of a successful [`ClientRegistry::add`]
///
/// The caller owns the read half and drives the read pump; the registry
/// keeps the write half for broadcast. `closed` fires when the record is
/// removed, so the pump can exit promptly.
pub struct AcceptedClient {
    pub info: ClientInfo,
    pub reader: OwnedReadHalf,
    pub closed: watch::Receiver<bool>,
}

struct ClientRecord {
    info: ClientInfo,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    close_tx: watch::Sender<bool>,
}

struct Inner {
    clients: HashMap<String, ClientRecord>,
    web_count: usize,
}

/// Registry of connected downstream peers
pub struct ClientRegistry {
    inner: Mutex<Inner>,
    max_clients: usize,
    counter: AtomicU64,
    logger: Arc<Logger>,
}

impl ClientRegistry {
    /// Create a registry with the given shared capacity cap
    #[must_use]
    pub fn new(max_clients: usize, logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                web_count: 0,
            }),
            max_clients,
            counter: AtomicU64::new(0),
            logger,
        })
    }

    /// Register a newly-accepted connection
    ///
    /// The cap check and insertion are atomic under one lock; a rejected
    /// stream is dropped (closed) before this returns.
    ///
    /// # Errors
    ///
    /// `RegistryError::CapacityExceeded` when proxy clients plus web
    /// subscribers already reach `max_clients`.
    pub fn add(&self, stream: TcpStream) -> Result<AcceptedClient, RegistryError> {
        let addr = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
        let (reader, writer) = stream.into_split();
        let (close_tx, close_rx) = watch::channel(false);

        let (info, total) = {
            let mut inner = self.inner.lock();
            let total = inner.clients.len() + inner.web_count;
            if total >= self.max_clients {
                return Err(RegistryError::capacity(total, self.max_clients));
            }

            let id = format!("client#{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
            let info = ClientInfo {
                id: id.clone(),
                addr,
                connected_at: Utc::now(),
            };
            inner.clients.insert(
                id,
                ClientRecord {
                    info: info.clone(),
                    writer: Arc::new(tokio::sync::Mutex::new(writer)),
                    close_tx,
                },
            );
            (info, inner.clients.len() + inner.web_count)
        };

        self.logger.info(format!(
            "Client connected: {} [{}] (total: {})",
            info.addr, info.id, total
        ));

        Ok(AcceptedClient {
            info,
            reader,
            closed: close_rx,
        })
    }

    /// Close and remove one client; no-op when the id is absent
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            let record = inner.clients.remove(id);
            let total = inner.clients.len() + inner.web_count;
            record.map(|r| (r, total))
        };

        if let Some((record, total)) = removed {
            let _ = record.close_tx.send(true);
            self.logger.info(format!(
                "Client disconnected: {} [{}] (total: {})",
                record.info.addr, id, total
            ));
        }
    }

    /// Look up one client by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ClientInfo> {
        self.inner.lock().clients.get(id).map(|r| r.info.clone())
    }

    /// Snapshot of all proxy clients, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .inner
            .lock()
            .clients
            .values()
            .map(|r| r.info.clone())
            .collect();
        clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        clients
    }

    /// Number of proxy clients
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Number of reserved web subscribers
    #[must_use]
    pub fn web_count(&self) -> usize {
        self.inner.lock().web_count
    }

    /// Proxy clients plus web subscribers
    #[must_use]
    pub fn total_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.clients.len() + inner.web_count
    }

    /// Configured capacity cap
    #[must_use]
    pub const fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Reserve a web-subscriber slot against the shared cap
    ///
    /// # Errors
    ///
    /// `RegistryError::CapacityExceeded` when the cap is already reached.
    pub fn reserve_web(&self) -> Result<(), RegistryError> {
        let total = {
            let mut inner = self.inner.lock();
            let total = inner.clients.len() + inner.web_count;
            if total >= self.max_clients {
                return Err(RegistryError::capacity(total, self.max_clients));
            }
            inner.web_count += 1;
            inner.clients.len() + inner.web_count
        };
        self.logger
            .info(format!("Web client connected (total: {total})"));
        Ok(())
    }

    /// Release one web-subscriber slot; never drives the counter negative
    pub fn release_web(&self) {
        let total = {
            let mut inner = self.inner.lock();
            if inner.web_count == 0 {
                return;
            }
            inner.web_count -= 1;
            inner.clients.len() + inner.web_count
        };
        self.logger
            .info(format!("Web client disconnected (total: {total})"));
    }

    /// Write the buffer to every registered proxy client
    ///
    /// The live set is snapshotted under the lock and written without it.
    /// Each peer either receives the whole buffer as one contiguous write
    /// or fails and is evicted after the iteration. Web subscribers are not
    /// broadcast targets.
    pub async fn broadcast(&self, data: &[u8]) {
        let targets: Vec<(ClientInfo, Arc<tokio::sync::Mutex<OwnedWriteHalf>>)> = {
            let inner = self.inner.lock();
            inner
                .clients
                .values()
                .map(|r| (r.info.clone(), Arc::clone(&r.writer)))
                .collect()
        };

        let mut failed: Vec<String> = Vec::new();
        for (info, writer) in targets {
            let result = timeout(BROADCAST_WRITE_TIMEOUT, async {
                writer.lock().await.write_all(data).await
            })
            .await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.logger.warn(format!(
                        "Failed to write to {} [{}]: {e}",
                        info.addr, info.id
                    ));
                    failed.push(info.id);
                }
                Err(_) => {
                    self.logger.warn(format!(
                        "Failed to write to {} [{}]: write deadline exceeded",
                        info.addr, info.id
                    ));
                    failed.push(info.id);
                }
            }
        }

        if !failed.is_empty() {
            debug!(evicted = failed.len(), "evicting peers after broadcast");
        }
        for id in failed {
            self.remove(&id);
        }
    }

    /// Close and remove every proxy client
    pub fn close_all(&self) {
        let drained: Vec<ClientRecord> = {
            let mut inner = self.inner.lock();
            inner.clients.drain().map(|(_, r)| r).collect()
        };
        for record in &drained {
            let _ = record.close_tx.send(true);
        }
        self.logger.info("All clients disconnected");
    }
}
