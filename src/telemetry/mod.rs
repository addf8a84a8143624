//! Connection tracking and periodic telemetry over per-connection side-channels.

mod broadcaster;
mod connection;
mod message;
mod registry;

pub use broadcaster::{BroadcasterHandle, TelemetryBroadcaster, TickReport};
pub use connection::{Connection, ConnectionRole, QueuedChannel, SendFuture, SideChannel};
pub use message::{now_millis, RttProbe, TelemetryMessage, TelemetryStats};
pub use registry::ConnectionRegistry;
