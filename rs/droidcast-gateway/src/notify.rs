//! Fan-out of device-list changes to SSE clients.

use droidcast_adb::DeviceInfo;
use tokio::sync::broadcast;

/// Broadcasts the serialized device list to every `/api/events` client.
pub struct Notifier {
	tx: broadcast::Sender<String>,
}

impl Default for Notifier {
	fn default() -> Self {
		let (tx, _) = broadcast::channel(16);
		Self { tx }
	}
}

impl Notifier {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn notify_devices(&self, devices: &[DeviceInfo]) {
		match serde_json::to_string(devices) {
			// Send fails only when nobody is listening, which is fine.
			Ok(payload) => {
				let _ = self.tx.send(payload);
			}
			Err(err) => tracing::error!(%err, "failed to serialize device list"),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<String> {
		self.tx.subscribe()
	}
}
