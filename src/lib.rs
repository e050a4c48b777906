//! serial-fanout: transparent TCP fan-out proxy
//!
//! Mediates between a single long-lived upstream serial-to-TCP bridge
//! (e.g. an RS-485 gateway) and multiple local client connections, so that
//! several consumers can share one physical serial link simultaneously.
//!
//! # Architecture
//!
//! ```text
//! Upstream <--write-- Engine <--read-- Client[i]    (unicast to upstream)
//! Upstream --read--> Engine --broadcast--> Client[*] (fan-out to all)
//! Injector --write--> Engine --(upstream | broadcast)->
//! Logger   --tee-->   Control Surface
//! ```
//!
//! Data read from the upstream link is broadcast to every connected client;
//! data written by any client is forwarded only to the upstream, never to
//! peer clients. The control surface additionally permits packet injection
//! in either direction for debugging.
//!
//! # Quick Start
//!
//! ```no_run
//! use serial_fanout::config;
//! use serial_fanout::control::ControlSurface;
//! use serial_fanout::engine::ProxyEngine;
//! use serial_fanout::logging::Logger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = config::load(None)?;
//! let logger = Logger::new(config.log_packets, Some(config.log_file.as_str()));
//! let engine = ProxyEngine::new(config, logger);
//! let _control = ControlSurface::new(engine.clone());
//!
//! engine.start().await?;
//! // ... run until a shutdown signal ...
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`control`]: Control surface adapter (status, log stream, injection)
//! - [`engine`]: Proxy engine (accept loop, pumps, shutdown)
//! - [`error`]: Error types
//! - [`io`]: Read buffer pools
//! - [`logging`]: Operator event log and hex packet formatting
//! - [`registry`]: Client registry with capacity control and broadcast
//! - [`upstream`]: Upstream connector with reconnect

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
pub mod registry;
pub mod upstream;

pub use config::{Config, PublicConfig};
pub use control::{ControlSurface, InjectRequest, LogSubscription, PayloadFormat};
pub use engine::{EngineStatus, InjectTarget, ProxyEngine};
pub use error::{
    ConfigError, ControlError, EngineError, ProxyError, RegistryError, Result, UpstreamError,
};
pub use logging::{Direction, Level, Logger};
pub use registry::{ClientInfo, ClientRegistry};
pub use upstream::{LinkState, UpstreamConnector};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
