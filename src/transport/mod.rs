//! Side-channel transports for telemetry.
//!
//! Session negotiation and media relay live outside this crate; what is here
//! only carries the newline-delimited JSON telemetry records.

pub mod tcp;

pub use tcp::{is_loopback_addr, TelemetryListener, MAX_LINE_BYTES};
