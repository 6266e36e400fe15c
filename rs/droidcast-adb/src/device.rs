use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state as reported by `adb track-devices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
	/// `device`: attached and usable.
	#[serde(rename = "device")]
	Attached,
	Offline,
	Unauthorized,
	Connecting,
	Unknown,
}

impl DeviceState {
	pub fn parse(state: &str) -> Self {
		match state.to_ascii_lowercase().as_str() {
			"device" => DeviceState::Attached,
			"offline" => DeviceState::Offline,
			"unauthorized" => DeviceState::Unauthorized,
			"connecting" => DeviceState::Connecting,
			_ => DeviceState::Unknown,
		}
	}
}

/// Everything we know about one attached device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
	pub serial: String,
	pub state: DeviceState,
	pub model: Option<String>,
	pub manufacturer: Option<String>,
	pub is_emulator: bool,
	pub last_seen: DateTime<Utc>,
}

impl DeviceInfo {
	pub fn new(serial: &str, state: DeviceState) -> Self {
		Self {
			serial: serial.to_string(),
			state,
			model: None,
			manufacturer: None,
			is_emulator: serial.starts_with("emulator-"),
			last_seen: Utc::now(),
		}
	}
}
