//! # droidcast-stream: per-device H.264 ingest and fan-out
//!
//! Each attached Android device gets one [IngestSession]: it opens a byte
//! stream from the on-device capture agent (via [MediaSource]), reframes it
//! into Annex-B NAL units, and multicasts those units to any number of
//! [Subscriber]s.
//!
//! The interesting part is late-join correctness: a decoder can only start on
//! an IDR, so the session keeps a [GopCache] of the parameter sets plus the
//! current group of pictures. A subscriber that joins mid-stream receives
//! that snapshot (SPS, PPS, IDR, trailing slices) before any live unit, so
//! its first VCL unit is always an IDR.
//!
//! [SessionManager] owns the per-serial sessions, rebuilding dead ones on
//! demand and idling them out once the last subscriber leaves.

mod config;
mod error;
mod gop;
mod manager;
mod nal;
mod session;
mod source;

pub use config::*;
pub use error::*;
pub use gop::*;
pub use manager::*;
pub use nal::*;
pub use session::*;
pub use source::*;
