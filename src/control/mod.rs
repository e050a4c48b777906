//! Control surface
//!
//! Interface between the proxy core and the external control plane.

mod payload;
mod surface;

pub use payload::{ClientEntry, ClientKind, InjectRequest, PayloadFormat};
pub use surface::{ControlSurface, LogSubscription, LOG_HISTORY_CAPACITY, SUBSCRIBER_QUEUE_DEPTH};
