//! One-shot JPEG encoding of a raw frame.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{Error, RawFrame, Result};

/// Map a 1-100 quality percent to the encoder's quality scale (2-31).
///
/// The mjpeg `-q:v` scale is inverted: smaller is better. Callers get the
/// familiar "bigger is better" percentage instead.
pub(crate) fn qscale_for_quality(quality: u8) -> u32 {
	let q = quality.clamp(1, 100) as f64;
	// 1 -> 31 (worst), 100 -> 2 (best)
	let qscale = (31.0 - (q - 1.0) * (29.0 / 99.0)).round() as u32;
	qscale.clamp(2, 31)
}

/// A complete JPEG starts with SOI and ends with EOI.
pub(crate) fn is_complete_jpeg(data: &[u8]) -> bool {
	data.len() >= 4 && data.starts_with(&[0xff, 0xd8]) && data.ends_with(&[0xff, 0xd9])
}

/// Encode a single raw frame to JPEG via a short-lived ffmpeg child.
pub(crate) async fn encode_jpeg(frame: &RawFrame, qscale: u32) -> Result<Vec<u8>> {
	let size = format!("{}x{}", frame.width, frame.height);

	let mut child = Command::new("ffmpeg")
		.args([
			"-loglevel",
			"error",
			"-f",
			"rawvideo",
			"-pix_fmt",
			frame.pix_fmt,
			"-s",
			&size,
			"-i",
			"pipe:0",
			"-f",
			"mjpeg",
			"-q:v",
			&qscale.to_string(),
			"-frames:v",
			"1",
			"pipe:1",
		])
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.spawn()
		.map_err(|err| Error::EncodeFailed(err.to_string()))?;

	let mut stdin = child
		.stdin
		.take()
		.ok_or_else(|| Error::EncodeFailed("no stdin handle".to_string()))?;
	stdin
		.write_all(&frame.data)
		.await
		.map_err(|err| Error::EncodeFailed(err.to_string()))?;
	drop(stdin);

	let output = child
		.wait_with_output()
		.await
		.map_err(|err| Error::EncodeFailed(err.to_string()))?;

	if !output.status.success() {
		let stderr = String::from_utf8_lossy(&output.stderr);
		return Err(Error::EncodeFailed(stderr.trim().to_string()));
	}

	if !is_complete_jpeg(&output.stdout) {
		return Err(Error::EncodeFailed("output is not a complete JPEG".to_string()));
	}

	Ok(output.stdout)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_qscale_bounds() {
		assert_eq!(qscale_for_quality(1), 31);
		assert_eq!(qscale_for_quality(100), 2);
	}

	#[test]
	fn test_qscale_clamps_input() {
		assert_eq!(qscale_for_quality(0), 31);
		assert_eq!(qscale_for_quality(255), 2);
	}

	#[test]
	fn test_qscale_monotonic() {
		let mut previous = qscale_for_quality(1);
		for quality in 2..=100 {
			let qscale = qscale_for_quality(quality);
			assert!(qscale <= previous, "quality {quality} regressed");
			previous = qscale;
		}
	}

	#[test]
	fn test_is_complete_jpeg() {
		assert!(is_complete_jpeg(&[0xff, 0xd8, 0x00, 0xff, 0xd9]));
		assert!(!is_complete_jpeg(&[0xff, 0xd8, 0x00]));
		assert!(!is_complete_jpeg(&[0x00, 0x00, 0xff, 0xd9]));
		assert!(!is_complete_jpeg(&[]));
		assert!(!is_complete_jpeg(&[0xff, 0xd8]));
	}
}
