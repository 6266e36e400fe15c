//! The latest decoded frame and the machinery that produces it.

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Raw bytes buffered before the resolution is known; the decoder prints
/// its stream info well before this fills up.
const MAX_UNSIZED_BUFFER: usize = 32 * 1024 * 1024;

/// One decoded frame of raw video.
#[derive(Debug, Clone)]
pub struct RawFrame {
	pub width: u32,
	pub height: u32,
	pub pix_fmt: &'static str,
	pub captured_at: DateTime<Utc>,
	pub data: Bytes,
}

/// The worker's latest-frame cell, published through a watch channel.
///
/// `seq` increases only in the reader task; capture waiters use it to block
/// for a frame strictly newer than their request.
#[derive(Debug, Clone, Default)]
pub struct FrameCell {
	pub seq: u64,
	pub frame: Option<Arc<RawFrame>>,
}

/// Cuts the decoder's raw stdout into frames of `width * height * 3/2`
/// bytes, keeping only the newest complete frame.
#[derive(Default)]
pub(crate) struct FrameAssembler {
	resolution: Option<(u32, u32)>,
	buf: BytesMut,
}

impl FrameAssembler {
	/// Adopt a new resolution. Buffered bytes were produced at the old one,
	/// so they are discarded on change.
	pub fn set_resolution(&mut self, width: u32, height: u32) {
		if self.resolution != Some((width, height)) {
			self.resolution = Some((width, height));
			self.buf.clear();
		}
	}

	/// Feed decoder output; returns the newest complete frame, if any.
	pub fn push(&mut self, data: &[u8]) -> Option<RawFrame> {
		self.buf.extend_from_slice(data);

		let (width, height) = match self.resolution {
			Some(resolution) => resolution,
			None => {
				if self.buf.len() > MAX_UNSIZED_BUFFER {
					let excess = self.buf.len() - MAX_UNSIZED_BUFFER;
					self.buf.advance(excess);
				}
				return None;
			}
		};

		let frame_size = (width as usize) * (height as usize) * 3 / 2;
		let complete = self.buf.len() / frame_size;
		if complete == 0 {
			return None;
		}

		// Only the newest complete frame matters.
		self.buf.advance((complete - 1) * frame_size);
		let data = self.buf.split_to(frame_size).freeze();

		Some(RawFrame {
			width,
			height,
			pix_fmt: "yuv420p",
			captured_at: Utc::now(),
			data,
		})
	}
}

/// Pull a `WxH` pair out of a decoder stream-info line.
///
/// Only lines mentioning `Video:` are considered, e.g.
/// `Stream #0:0: Video: h264 (Baseline), yuv420p(progressive), 720x1280, 30 fps, ...`
pub(crate) fn parse_video_line(line: &str) -> Option<(u32, u32)> {
	let rest = line.split("Video:").nth(1)?;

	for token in rest.split([' ', ',']) {
		if let Some((width, height)) = token.split_once('x') {
			if let (Ok(width), Ok(height)) = (width.parse::<u32>(), height.parse::<u32>()) {
				if width > 0 && height > 0 {
					return Some((width, height));
				}
			}
		}
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_no_frame_before_resolution_known() {
		let mut assembler = FrameAssembler::default();
		assert!(assembler.push(&vec![0u8; 1024 * 1024]).is_none());
	}

	#[test]
	fn test_cuts_complete_frames() {
		let mut assembler = FrameAssembler::default();
		assembler.set_resolution(4, 4);
		let frame_size = 4 * 4 * 3 / 2;

		assert!(assembler.push(&vec![1u8; frame_size - 1]).is_none());
		let frame = assembler.push(&[1u8]).unwrap();
		assert_eq!(frame.width, 4);
		assert_eq!(frame.height, 4);
		assert_eq!(frame.pix_fmt, "yuv420p");
		assert_eq!(frame.data.len(), frame_size);
	}

	#[test]
	fn test_keeps_only_newest_frame() {
		let mut assembler = FrameAssembler::default();
		assembler.set_resolution(4, 4);
		let frame_size = 4 * 4 * 3 / 2;

		let mut data = vec![1u8; frame_size];
		data.extend(vec![2u8; frame_size]);
		data.extend(vec![3u8; frame_size]);

		let frame = assembler.push(&data).unwrap();
		assert_eq!(frame.data[0], 3);
	}

	#[test]
	fn test_resolution_change_discards_buffer() {
		// Scenario: the decoder reports 720x1280, emits a partial frame,
		// then rotation switches it to 1080x1920. Nothing may be emitted
		// until a complete frame at the new size exists.
		let mut assembler = FrameAssembler::default();
		assembler.set_resolution(720, 1280);
		assert!(assembler.push(&vec![0u8; 100_000]).is_none());

		assembler.set_resolution(1080, 1920);
		let frame_size = 1080 * 1920 * 3 / 2;
		assert!(assembler.push(&vec![0u8; frame_size - 1]).is_none());

		let frame = assembler.push(&[0u8]).unwrap();
		assert_eq!(frame.data.len(), frame_size);
		assert_eq!((frame.width, frame.height), (1080, 1920));
	}

	#[test]
	fn test_same_resolution_keeps_buffer() {
		let mut assembler = FrameAssembler::default();
		assembler.set_resolution(4, 4);
		let frame_size = 4 * 4 * 3 / 2;

		assert!(assembler.push(&vec![1u8; frame_size / 2]).is_none());
		assembler.set_resolution(4, 4);
		assert!(assembler.push(&vec![1u8; frame_size / 2 - 1]).is_none());
		assert!(assembler.push(&[1u8]).is_some());
	}

	#[test]
	fn test_parse_video_line() {
		let line = "  Stream #0:0: Video: h264 (Baseline), yuv420p(progressive), 720x1280, 30 fps, 30 tbr, 1200k tbn";
		assert_eq!(parse_video_line(line), Some((720, 1280)));

		let rotated = "  Stream #0:0: Video: h264, yuv420p, 1080x1920, 60 fps";
		assert_eq!(parse_video_line(rotated), Some((1080, 1920)));

		assert_eq!(parse_video_line("Stream #0:0: Audio: aac, 44100 Hz"), None);
		assert_eq!(parse_video_line("[h264 @ 0x55aa] non-existing PPS"), None);
		assert_eq!(parse_video_line("Video: h264 (avc1 / 0x31637661)"), None);
	}
}
