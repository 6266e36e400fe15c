use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Gateway configuration; every flag is environment-backed.
#[derive(clap::Parser, Clone, Debug)]
pub struct Config {
	/// Listen for HTTP/WebSocket connections on the given address.
	#[arg(long, env = "BIND", default_value = "0.0.0.0:8000")]
	pub bind: SocketAddr,

	/// Path of the capture-agent jar pushed to devices.
	#[arg(long, env = "AGENT_JAR_PATH", default_value = "/app/vendor/scrcpy-server.jar")]
	pub agent_jar_path: PathBuf,

	/// Comma-separated allowed CORS origins, `*` for all.
	#[arg(long, env = "CORS_ALLOW_ORIGINS", default_value = "*")]
	pub cors_allow_origins: String,

	/// Directory captures are saved under, one subdirectory per serial.
	#[arg(long, env = "CAPTURE_OUTPUT_DIR", default_value = "captures")]
	pub capture_output_dir: PathBuf,

	/// Default JPEG quality (1-100).
	#[arg(long, env = "CAPTURE_JPEG_QUALITY", default_value_t = 80)]
	pub capture_jpeg_quality: u8,

	/// How long an ingest session survives without any client, in seconds.
	#[arg(long, env = "STREAM_IDLE_TIMEOUT_SEC", default_value_t = 5)]
	pub stream_idle_timeout_sec: u64,
}

impl Config {
	pub fn jpeg_quality(&self) -> u8 {
		self.capture_jpeg_quality.clamp(1, 100)
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.stream_idle_timeout_sec)
	}

	pub fn cors_layer(&self) -> CorsLayer {
		let origins: Vec<&str> = self
			.cors_allow_origins
			.split(',')
			.map(str::trim)
			.filter(|o| !o.is_empty())
			.collect();

		if origins.is_empty() || origins.contains(&"*") {
			return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
		}

		let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
		CorsLayer::new()
			.allow_origin(AllowOrigin::list(origins))
			.allow_methods(Any)
			.allow_headers(Any)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[test]
	fn test_defaults() {
		let config = Config::parse_from(["droidcast-gateway"]);
		assert_eq!(config.bind.port(), 8000);
		assert_eq!(config.capture_jpeg_quality, 80);
		assert_eq!(config.stream_idle_timeout_sec, 5);
		assert_eq!(config.capture_output_dir, PathBuf::from("captures"));
		assert_eq!(config.cors_allow_origins, "*");
	}

	#[test]
	fn test_quality_clamped() {
		let config = Config::parse_from(["droidcast-gateway", "--capture-jpeg-quality", "0"]);
		assert_eq!(config.jpeg_quality(), 1);

		let config = Config::parse_from(["droidcast-gateway", "--capture-jpeg-quality", "200"]);
		assert_eq!(config.jpeg_quality(), 100);
	}
}
