//! # droidcast-capture: server-side JPEG capture
//!
//! While at least one capture client holds a device, a [CaptureWorker] keeps
//! an ffmpeg decoder fed from the ingest session and maintains the latest
//! decoded frame in memory. A capture request waits for a frame strictly
//! newer than the request, encodes it to JPEG with a short-lived ffmpeg
//! child, and optionally persists it to disk.
//!
//! The worker survives screen rotation: the decoder is restarted whenever
//! the SPS changes, and the raw-frame reader re-cuts its buffer when the
//! decoder reports a new resolution.
//!
//! The binary `ffmpeg` must be on `PATH` at runtime.

mod decoder;
mod encode;
mod error;
mod frame;
mod manager;
mod worker;

pub use error::*;
pub use frame::*;
pub use manager::*;
pub use worker::*;
