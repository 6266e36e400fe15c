/// A list of possible errors produced by the capture pipeline.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The decoder subprocess failed to spawn or died prematurely.
	#[error("decoder unavailable: {0}")]
	DecoderUnavailable(String),

	/// No decoded frame arrived within the deadline.
	#[error("capture timeout")]
	CaptureTimeout,

	/// The JPEG encoder produced something that is not a JPEG.
	#[error("encode failed: {0}")]
	EncodeFailed(String),

	#[error("stream: {0}")]
	Stream(#[from] droidcast_stream::Error),

	#[error("i/o: {0}")]
	Io(String),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
