/// A list of possible errors produced by the ingest pipeline.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The capture agent could not be pushed to or launched on the device.
	#[error("agent launch failed: {0}")]
	AgentLaunchFailed(String),

	/// The host-to-device port forwarding could not be installed.
	#[error("tunnel setup failed: {0}")]
	TunnelSetupFailed(String),

	/// The agent never accepted a TCP connection within the retry window.
	#[error("connect timeout")]
	ConnectTimeout,

	/// A late-join prefill snapshot did not fit the subscriber queue.
	///
	/// The snapshot is bounded well below the queue capacity, so this
	/// indicates a budget bug rather than a slow client.
	#[error("subscriber overflow")]
	SubscriberOverflow,

	/// The session stopped while the operation was in flight.
	#[error("session closed")]
	SessionClosed,

	#[error("i/o: {0}")]
	Io(String),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
