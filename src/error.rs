//! Error types for serial-fanout
//!
//! Errors are categorized by subsystem and include recovery hints. Transient
//! peer errors are handled locally (evict, log, continue); upstream errors
//! trigger a state transition and reconnect; startup errors are fatal.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for serial-fanout
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream link errors
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Client registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Engine lifecycle and injection errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Control surface errors
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Upstream(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Engine(e) => e.is_recoverable(),
            Self::Control(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// JSON parsing error in the options file
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors require user intervention and are never recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create an environment variable error
    pub fn env(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvError {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Upstream link errors
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// No live upstream handle
    #[error("Upstream is not connected")]
    Disconnected,

    /// Write did not complete within the deadline
    #[error("Upstream write timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    /// I/O error on the upstream socket
    #[error("Upstream I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UpstreamError {
    /// Upstream errors are transient; the connector reconnects on its own
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Disconnected | Self::WriteTimeout { .. } => true,
            Self::Io(e) => !matches!(e.kind(), io::ErrorKind::PermissionDenied),
        }
    }
}

/// Client registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The shared client cap is exhausted
    #[error("Max clients ({max}) reached (current: {current})")]
    CapacityExceeded { current: usize, max: usize },

    /// A broadcast write to one peer failed; the peer is evicted
    #[error("Write to peer {id} failed: {reason}")]
    PeerWriteFailed { id: String, reason: String },
}

impl RegistryError {
    /// Registry errors resolve themselves as peers come and go
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a capacity error
    pub const fn capacity(current: usize, max: usize) -> Self {
        Self::CapacityExceeded { current, max }
    }

    /// Create a peer write failure
    pub fn peer_write(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PeerWriteFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Engine lifecycle and injection errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to bind the listen socket; fatal at startup
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Unknown injection target
    #[error("invalid target: must be 'upstream' or 'downstream' (got '{0}')")]
    InvalidTarget(String),

    /// Engine was already started
    #[error("Engine already started")]
    AlreadyStarted,
}

impl EngineError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::BindFailed { .. } => false,
            Self::InvalidTarget(_) | Self::AlreadyStarted => true,
        }
    }

    /// Create a bind error
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BindFailed {
            addr: addr.into(),
            source,
        }
    }
}

/// Control surface errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Injection payload could not be decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] crate::logging::HexDecodeError),

    /// Unknown payload format
    #[error("Unknown payload format: {0}")]
    UnknownFormat(String),
}

/// Type alias for Result with `ProxyError`
pub type Result<T> = std::result::Result<T, ProxyError>;
