//! Control surface adapter
//!
//! Thin adapter the external control plane drives: status snapshot, public
//! config, live log streaming with history, client enumeration and
//! eviction, and packet injection. The surface registers itself as the
//! logger's subscription callback; the callback runs outside the logger's
//! lock, so fan-out here may safely re-enter the proxy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::payload::{ClientEntry, ClientKind, InjectRequest};
use crate::config::PublicConfig;
use crate::engine::{EngineStatus, InjectTarget, ProxyEngine};
use crate::error::{ProxyError, RegistryError};
use crate::registry::ClientRegistry;

/// Number of historical log lines replayed to a new subscriber
pub const LOG_HISTORY_CAPACITY: usize = 1000;

/// Bounded queue depth per log subscriber; overflow drops the newest line
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 10;

struct Subscriber {
    id: String,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
}

/// Control-plane adapter over the proxy engine
pub struct ControlSurface {
    engine: Arc<ProxyEngine>,
    history: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    subscriber_counter: AtomicU64,
}

impl ControlSurface {
    /// Create the surface and attach it to the engine's logger
    #[must_use]
    pub fn new(engine: Arc<ProxyEngine>) -> Arc<Self> {
        let surface = Arc::new(Self {
            engine,
            history: Mutex::new(VecDeque::with_capacity(LOG_HISTORY_CAPACITY)),
            subscribers: Mutex::new(Vec::new()),
            subscriber_counter: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&surface);
        surface
            .engine
            .logger()
            .set_callback(Arc::new(move |line| {
                if let Some(surface) = weak.upgrade() {
                    surface.on_log_line(line);
                }
            }));

        surface
    }

    /// Status snapshot, as the engine reports it
    #[must_use]
    pub fn snapshot(&self) -> EngineStatus {
        self.engine.status()
    }

    /// Projection of the configuration safe for external display
    #[must_use]
    pub fn public_config(&self) -> PublicConfig {
        self.engine.config().public_view()
    }

    /// Subscribe to the live log stream
    ///
    /// The subscription carries a snapshot of up to the last 1,000 lines
    /// and a bounded queue of depth 10 for live lines; a slow consumer
    /// loses the newest lines rather than blocking the logger. The
    /// subscriber counts against the shared client cap until dropped.
    ///
    /// # Errors
    ///
    /// `RegistryError::CapacityExceeded` when the shared cap is reached.
    pub fn subscribe_logs(self: &Arc<Self>) -> Result<LogSubscription, RegistryError> {
        self.engine.registry().reserve_web()?;

        let id = format!(
            "web#{}",
            self.subscriber_counter.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let history: Vec<String> = self.history.lock().iter().cloned().collect();
        self.subscribers.lock().push(Subscriber {
            id: id.clone(),
            connected_at: Utc::now(),
            tx,
        });

        Ok(LogSubscription {
            id,
            history,
            rx,
            surface: Arc::downgrade(self),
            registry: Arc::downgrade(self.engine.registry()),
        })
    }

    /// Decode and route an injection request
    ///
    /// # Errors
    ///
    /// `EngineError::InvalidTarget` for unknown targets,
    /// `ControlError::InvalidPayload` for undecodable data, and
    /// `UpstreamError::Disconnected` when upstream injection is requested
    /// without a live link.
    pub async fn inject(&self, request: &InjectRequest) -> Result<(), ProxyError> {
        let target: InjectTarget = request.target.parse()?;
        let data = request.decode_payload()?;
        self.engine.inject(target, &data).await
    }

    /// Enumerate all client records, proxy clients first
    #[must_use]
    pub fn list_clients(&self) -> Vec<ClientEntry> {
        let mut entries: Vec<ClientEntry> = self
            .engine
            .registry()
            .list()
            .into_iter()
            .map(|c| ClientEntry {
                id: c.id,
                addr: c.addr,
                connected_at: c.connected_at.to_rfc3339(),
                kind: ClientKind::Tcp,
            })
            .collect();

        for sub in self.subscribers.lock().iter() {
            entries.push(ClientEntry {
                id: sub.id.clone(),
                addr: "web".into(),
                connected_at: sub.connected_at.to_rfc3339(),
                kind: ClientKind::Web,
            });
        }

        entries
    }

    /// Forcibly remove one client by id; no-op for unknown ids
    ///
    /// For a web subscriber this ends its stream; the cap slot is released
    /// when the consumer drops its subscription.
    pub fn disconnect_client(&self, id: &str) {
        if id.starts_with("web#") {
            self.subscribers.lock().retain(|s| s.id != id);
        } else {
            self.engine.registry().remove(id);
        }
    }

    /// Reserve a web-subscriber slot against the shared cap
    ///
    /// # Errors
    ///
    /// `RegistryError::CapacityExceeded` when the cap is reached.
    pub fn reserve_web(&self) -> Result<(), RegistryError> {
        self.engine.registry().reserve_web()
    }

    /// Release one web-subscriber slot
    pub fn release_web(&self) {
        self.engine.registry().release_web();
    }

    fn on_log_line(&self, line: &str) {
        {
            let mut history = self.history.lock();
            if history.len() == LOG_HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(line.to_string());
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(line.to_string()) {
            Ok(()) => true,
            // Queue full: the newest line is discarded for this subscriber
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn remove_subscriber(&self, id: &str) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

/// A single-consumer live log stream
///
/// Dropping the subscription cancels it and releases its cap slot.
pub struct LogSubscription {
    id: String,
    history: Vec<String>,
    rx: mpsc::Receiver<String>,
    surface: Weak<ControlSurface>,
    registry: Weak<ClientRegistry>,
}

impl LogSubscription {
    /// Id of this subscriber, as reported by the client enumeration
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Historical lines captured before this subscription, oldest first
    #[must_use]
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Receive the next live line; `None` when the stream ended
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Receive without waiting; `None` when the queue is currently empty
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.upgrade() {
            surface.remove_subscriber(&self.id);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release_web();
        }
    }
}
