//! # droidcast-adb: debug bridge glue
//!
//! Everything that talks to `adb` lives here:
//! - [DeviceMonitor]: event-driven device enumeration via `adb track-devices`.
//! - [DeviceRegistry]: cached per-serial device info with property enrichment.
//! - [AgentFactory] / [AgentSource]: pushes the capture agent to a device,
//!   tunnels a TCP connection to its abstract socket, and exposes the raw
//!   H.264 byte stream as a [droidcast_stream::MediaSource].
//!
//! The binary `adb` must be on `PATH` at runtime.

mod agent;
mod bridge;
mod device;
mod monitor;
mod registry;

pub use agent::*;
pub use device::*;
pub use monitor::*;
pub use registry::*;
