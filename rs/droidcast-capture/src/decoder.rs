//! The long-lived H.264 to raw-video decoder child.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::{Error, Result};

/// Grace period for the child to exit once stdin closes.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// ffmpeg reading Annex-B H.264 on stdin, writing raw yuv420p on stdout.
///
/// Started with low-latency flags: no probe window, no pre-buffer, no
/// frame-rate resampling. Stream info (including the resolution) goes to
/// stderr, which the worker parses.
pub(crate) struct Decoder {
	child: Child,
	pub stdin: Option<ChildStdin>,
	pub stdout: Option<ChildStdout>,
	pub stderr: Option<ChildStderr>,
}

impl Decoder {
	pub fn spawn(serial: &str) -> Result<Self> {
		let mut child = Command::new("ffmpeg")
			.args([
				// info level: the `Video:` stream line carries the resolution
				"-loglevel",
				"info",
				"-fflags",
				"nobuffer",
				"-flags",
				"low_delay",
				"-probesize",
				"32",
				"-analyzeduration",
				"0",
				"-f",
				"h264",
				"-i",
				"pipe:0",
				"-f",
				"rawvideo",
				"-pix_fmt",
				"yuv420p",
				"-vsync",
				"passthrough",
				"pipe:1",
			])
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|err| Error::DecoderUnavailable(err.to_string()))?;

		tracing::info!(serial, "capture decoder started");

		Ok(Self {
			stdin: child.stdin.take(),
			stdout: child.stdout.take(),
			stderr: child.stderr.take(),
			child,
		})
	}

	/// Close stdin, give the child a grace period, then kill it.
	/// Safe to call more than once.
	pub async fn stop(&mut self, serial: &str) {
		self.stdin.take();

		match tokio::time::timeout(STOP_TIMEOUT, self.child.wait()).await {
			Ok(_) => {}
			Err(_) => {
				tracing::warn!(serial, "decoder did not exit, killing");
				let _ = self.child.start_kill();
				let _ = self.child.wait().await;
			}
		}

		tracing::info!(serial, "capture decoder stopped");
	}
}
