//! Cached per-serial device info.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::{bridge, DeviceInfo, DeviceState};

/// Holds one [DeviceInfo] per serial.
///
/// Model and manufacturer are read from device properties the first time a
/// serial is seen attached; the lookup runs in the background so
/// registration never waits on the bridge.
#[derive(Default)]
pub struct DeviceRegistry {
	devices: Mutex<HashMap<String, DeviceInfo>>,
}

impl DeviceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(self: &Arc<Self>, serial: &str, state: DeviceState) -> DeviceInfo {
		let mut devices = self.devices.lock();

		if let Some(device) = devices.get_mut(serial) {
			device.state = state;
			device.last_seen = Utc::now();
			return device.clone();
		}

		let device = DeviceInfo::new(serial, state);
		devices.insert(serial.to_string(), device.clone());

		if state == DeviceState::Attached {
			self.spawn_enrichment(serial);
		}

		device
	}

	pub fn update_state(self: &Arc<Self>, serial: &str, state: DeviceState) -> Option<DeviceInfo> {
		let mut devices = self.devices.lock();
		let device = devices.get_mut(serial)?;

		device.state = state;
		device.last_seen = Utc::now();

		// Enrichment may have been skipped (or failed) while the device was
		// not yet authorized.
		if state == DeviceState::Attached && device.model.is_none() {
			self.spawn_enrichment(serial);
		}

		Some(device.clone())
	}

	pub fn unregister(&self, serial: &str) -> Option<DeviceInfo> {
		self.devices.lock().remove(serial)
	}

	pub fn get(&self, serial: &str) -> Option<DeviceInfo> {
		self.devices.lock().get(serial).cloned()
	}

	pub fn list_all(&self) -> Vec<DeviceInfo> {
		let mut devices: Vec<_> = self.devices.lock().values().cloned().collect();
		devices.sort_by(|a, b| a.serial.cmp(&b.serial));
		devices
	}

	pub fn list_attached(&self) -> Vec<DeviceInfo> {
		self.list_all()
			.into_iter()
			.filter(|d| d.state == DeviceState::Attached)
			.collect()
	}

	fn spawn_enrichment(self: &Arc<Self>, serial: &str) {
		let registry = self.clone();
		let serial = serial.to_string();

		tokio::spawn(async move {
			let (model, manufacturer) = tokio::join!(
				bridge::getprop(&serial, "ro.product.model"),
				bridge::getprop(&serial, "ro.product.manufacturer"),
			);

			match (&model, &manufacturer) {
				(Ok(model), Ok(manufacturer)) => {
					tracing::info!(serial, model, manufacturer, "fetched device details");
				}
				_ => {
					tracing::warn!(serial, "failed to fetch device details");
				}
			}

			let mut devices = registry.devices.lock();
			if let Some(device) = devices.get_mut(&serial) {
				if let Ok(model) = model {
					device.model = Some(model);
				}
				if let Ok(manufacturer) = manufacturer {
					device.manufacturer = Some(manufacturer);
				}
			}
		});
	}
}
