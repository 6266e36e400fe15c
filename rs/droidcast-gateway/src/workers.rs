//! Tracks how many WebSocket clients each device has.
//!
//! Stream and capture clients are counted separately; when both hit zero the
//! registry schedules an idle stop that shuts the device's ingest session
//! down after a grace window. Any new client within the window cancels it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use droidcast_stream::SessionManager;

/// A snapshot row for one device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerState {
	pub serial: String,
	pub stream_clients: usize,
	pub capture_clients: usize,
	pub last_activity: DateTime<Utc>,
}

struct Entry {
	stream_clients: usize,
	capture_clients: usize,
	last_activity: DateTime<Utc>,
	idle_stop: Option<JoinHandle<()>>,
}

impl Entry {
	fn new() -> Self {
		Self {
			stream_clients: 0,
			capture_clients: 0,
			last_activity: Utc::now(),
			idle_stop: None,
		}
	}

	fn is_idle(&self) -> bool {
		self.stream_clients == 0 && self.capture_clients == 0
	}
}

pub struct WorkerRegistry {
	sessions: Arc<SessionManager>,
	idle_timeout: Duration,
	states: Mutex<HashMap<String, Entry>>,
}

impl WorkerRegistry {
	pub fn new(sessions: Arc<SessionManager>, idle_timeout: Duration) -> Self {
		Self {
			sessions,
			idle_timeout,
			states: Mutex::new(HashMap::new()),
		}
	}

	pub fn on_stream_connect(self: &Arc<Self>, serial: &str) {
		self.on_connect(serial, |entry| entry.stream_clients += 1);
	}

	pub fn on_stream_disconnect(self: &Arc<Self>, serial: &str) {
		self.on_disconnect(serial, |entry| {
			entry.stream_clients = entry.stream_clients.saturating_sub(1)
		});
	}

	pub fn on_capture_connect(self: &Arc<Self>, serial: &str) {
		self.on_connect(serial, |entry| entry.capture_clients += 1);
	}

	pub fn on_capture_disconnect(self: &Arc<Self>, serial: &str) {
		self.on_disconnect(serial, |entry| {
			entry.capture_clients = entry.capture_clients.saturating_sub(1)
		});
	}

	pub fn snapshot(&self) -> Vec<WorkerState> {
		let states = self.states.lock();
		let mut snapshot: Vec<_> = states
			.iter()
			.map(|(serial, entry)| WorkerState {
				serial: serial.clone(),
				stream_clients: entry.stream_clients,
				capture_clients: entry.capture_clients,
				last_activity: entry.last_activity,
			})
			.collect();
		snapshot.sort_by(|a, b| a.serial.cmp(&b.serial));
		snapshot
	}

	fn on_connect(self: &Arc<Self>, serial: &str, bump: impl FnOnce(&mut Entry)) {
		let mut states = self.states.lock();
		let entry = states.entry(serial.to_string()).or_insert_with(Entry::new);

		bump(entry);
		entry.last_activity = Utc::now();

		if let Some(pending) = entry.idle_stop.take() {
			pending.abort();
		}
	}

	fn on_disconnect(self: &Arc<Self>, serial: &str, drop_one: impl FnOnce(&mut Entry)) {
		let mut states = self.states.lock();
		let entry = match states.get_mut(serial) {
			Some(entry) => entry,
			None => return,
		};

		drop_one(entry);
		entry.last_activity = Utc::now();

		if !entry.is_idle() {
			return;
		}

		if let Some(pending) = entry.idle_stop.take() {
			pending.abort();
		}

		tracing::info!(serial, timeout = ?self.idle_timeout, "no clients left, scheduling idle stop");

		let registry = self.clone();
		let serial = serial.to_string();
		entry.idle_stop = Some(tokio::spawn(async move {
			tokio::time::sleep(registry.idle_timeout).await;
			tracing::info!(serial = %serial, "idle timeout expired, stopping session");
			registry.sessions.stop_session(&serial).await;

			let mut states = registry.states.lock();
			if let Some(entry) = states.get_mut(&serial) {
				if entry.is_idle() {
					entry.idle_stop = None;
				}
			}
		}));
	}
}
