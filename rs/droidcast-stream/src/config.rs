use serde::{Deserialize, Serialize};

/// The video codec requested from the on-device encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
	H264,
	H265,
	Av1,
}

impl std::fmt::Display for Codec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Codec::H264 => write!(f, "h264"),
			Codec::H265 => write!(f, "h265"),
			Codec::Av1 => write!(f, "av1"),
		}
	}
}

/// Per-session encoder settings, rendered into agent arguments on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
	/// Longest side of the encoded video in pixels.
	pub max_size: u32,

	pub max_fps: u32,

	/// Target bitrate in bits per second.
	pub bit_rate: u32,

	pub codec: Codec,

	/// Keyframe interval in seconds. One second keeps late joins cheap: the
	/// GOP cache never holds more than a second of slices.
	pub i_frame_interval: u32,

	/// Ask the encoder to repeat SPS/PPS in front of every keyframe
	/// (encoder dependent, improves late-join robustness).
	pub prepend_header_to_sync_frames: bool,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			max_size: 720,
			max_fps: 30,
			bit_rate: 2_000_000,
			codec: Codec::H264,
			i_frame_interval: 1,
			prepend_header_to_sync_frames: true,
		}
	}
}

impl StreamConfig {
	/// 720p / 15 fps / 1 Mbps, for constrained links.
	pub fn low_bandwidth() -> Self {
		Self {
			max_size: 720,
			max_fps: 15,
			bit_rate: 1_000_000,
			..Default::default()
		}
	}

	/// 1080p / 30 fps / 4 Mbps.
	pub fn balanced() -> Self {
		Self {
			max_size: 1080,
			max_fps: 30,
			bit_rate: 4_000_000,
			..Default::default()
		}
	}

	/// 1080p / 60 fps / 8 Mbps.
	pub fn high_quality() -> Self {
		Self {
			max_size: 1080,
			max_fps: 60,
			bit_rate: 8_000_000,
			..Default::default()
		}
	}

	/// Render the key=value arguments appended to the agent launch command.
	pub fn to_agent_args(&self) -> Vec<String> {
		let mut codec_options = vec![format!("i-frame-interval={}", self.i_frame_interval)];
		if self.prepend_header_to_sync_frames {
			codec_options.push("prepend-header-to-sync-frames=1".to_string());
		}

		let mut args = vec![
			format!("max_size={}", self.max_size),
			format!("max_fps={}", self.max_fps),
			format!("video_bit_rate={}", self.bit_rate),
			format!("video_codec_options={}", codec_options.join(",")),
		];
		if self.codec != Codec::H264 {
			args.push(format!("video_codec={}", self.codec));
		}
		args
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_args() {
		let args = StreamConfig::default().to_agent_args();
		assert_eq!(
			args,
			vec![
				"max_size=720",
				"max_fps=30",
				"video_bit_rate=2000000",
				"video_codec_options=i-frame-interval=1,prepend-header-to-sync-frames=1",
			]
		);
	}

	#[test]
	fn test_non_default_codec_is_explicit() {
		let config = StreamConfig {
			codec: Codec::H265,
			prepend_header_to_sync_frames: false,
			..StreamConfig::high_quality()
		};
		let args = config.to_agent_args();
		assert!(args.contains(&"video_codec=h265".to_string()));
		assert!(args.contains(&"video_codec_options=i-frame-interval=1".to_string()));
	}
}
