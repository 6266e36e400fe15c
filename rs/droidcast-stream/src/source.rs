//! Seams between the ingest pipeline and its collaborators.
//!
//! The session never references a concrete agent client and the capture
//! worker never references a concrete session: both sides talk through these
//! traits so the gateway (and the tests) decide the wiring.

use std::sync::Arc;

use bytes::Bytes;

use crate::{Result, StreamConfig, Subscriber};

/// A live byte stream from a capture agent.
#[async_trait::async_trait]
pub trait MediaStream: Send {
	/// The next chunk of encoded video, or `None` at end of stream.
	async fn read_chunk(&mut self) -> Result<Option<Bytes>>;

	/// Tear the stream down. Safe to call more than once.
	async fn stop(&mut self);
}

/// Something that can produce a [MediaStream], e.g. by launching the
/// on-device agent and tunneling a TCP connection to it.
#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
	async fn open(&self) -> Result<Box<dyn MediaStream>>;
}

/// Builds a [MediaSource] for a device, capturing whatever the transport
/// needs (agent path, forwarding setup) behind the seam.
pub trait SourceFactory: Send + Sync {
	fn create(&self, serial: &str, config: &StreamConfig) -> Arc<dyn MediaSource>;
}

/// A subscribable per-device NAL stream; implemented by
/// [crate::SessionManager] and faked in capture-worker tests.
#[async_trait::async_trait]
pub trait Subscribe: Send + Sync {
	async fn subscribe(&self, serial: &str) -> Result<Subscriber>;
}
