//! Event-driven device enumeration via `adb track-devices`.
//!
//! The track channel emits length-prefixed snapshots of the full device
//! list: a 4 byte ASCII hex length, then that many bytes of
//! `serial<TAB>state` lines. The monitor diffs consecutive snapshots into
//! connect/disconnect/state-change events.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::DeviceState;

/// Cooling period before the track channel is reopened after an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// How long `stop` waits for the subprocess before giving up on it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
	Connected { serial: String, state: DeviceState },
	Disconnected { serial: String },
	StateChanged { serial: String, state: DeviceState },
}

/// Watches `adb track-devices` and emits [DeviceEvent]s.
///
/// Self-healing: any subprocess error or closed stream is retried after a
/// cooling period until [DeviceMonitor::stop] is called.
#[derive(Default)]
pub struct DeviceMonitor {
	running: Arc<AtomicBool>,
	child: Arc<Mutex<Option<Child>>>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Start the monitor, returning the event stream.
	pub fn start(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
		let (tx, rx) = mpsc::unbounded_channel();

		self.running.store(true, Ordering::SeqCst);
		let running = self.running.clone();
		let child_slot = self.child.clone();

		let task = tokio::spawn(async move {
			let mut snapshot = HashMap::new();

			while running.load(Ordering::SeqCst) {
				if let Err(err) = track_devices(&running, &child_slot, &tx, &mut snapshot).await {
					tracing::error!(%err, "track-devices error");
				}
				if running.load(Ordering::SeqCst) {
					tokio::time::sleep(RECONNECT_DELAY).await;
				}
			}

			tracing::info!("device monitor stopped");
		});

		*self.task.lock() = Some(task);
		tracing::info!("device monitor started");

		rx
	}

	/// Stop the monitor. Safe to call more than once.
	pub async fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);

		let child = self.child.lock().take();
		if let Some(mut child) = child {
			let _ = child.start_kill();
			if tokio::time::timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
				tracing::warn!("track-devices did not exit in time");
			}
		}

		let task = self.task.lock().take();
		if let Some(task) = task {
			task.abort();
			let _ = task.await;
		}
	}
}

async fn track_devices(
	running: &AtomicBool,
	child_slot: &Mutex<Option<Child>>,
	tx: &mpsc::UnboundedSender<DeviceEvent>,
	snapshot: &mut HashMap<String, DeviceState>,
) -> std::io::Result<()> {
	let mut child = Command::new("adb")
		.arg("track-devices")
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.spawn()?;

	let mut stdout = child.stdout.take().expect("stdout was piped");
	*child_slot.lock() = Some(child);

	tracing::info!("started adb track-devices");

	loop {
		let frame = next_frame(&mut stdout).await?;
		if !running.load(Ordering::SeqCst) {
			return Ok(());
		}

		let devices = parse_device_list(&frame);
		for event in diff_snapshots(snapshot, &devices) {
			match &event {
				DeviceEvent::Connected { serial, state } => {
					tracing::info!(serial, ?state, "device connected");
				}
				DeviceEvent::Disconnected { serial } => {
					tracing::info!(serial, "device disconnected");
				}
				DeviceEvent::StateChanged { serial, state } => {
					tracing::info!(serial, ?state, "device state changed");
				}
			}
			if tx.send(event).is_err() {
				return Ok(());
			}
		}

		*snapshot = devices;
	}
}

/// Read one length-prefixed snapshot: 4 ASCII hex digits, then the payload.
async fn next_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
	let mut len_hex = [0u8; 4];
	reader.read_exact(&mut len_hex).await?;

	let len_hex = std::str::from_utf8(&len_hex)
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "length prefix is not utf-8"))?;
	let len = usize::from_str_radix(len_hex, 16)
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "length prefix is not hex"))?;

	let mut payload = vec![0u8; len];
	if len > 0 {
		reader.read_exact(&mut payload).await?;
	}

	Ok(String::from_utf8_lossy(&payload).into_owned())
}

/// Parse `serial<TAB>state` lines into a snapshot. Empty input means no
/// devices.
fn parse_device_list(data: &str) -> HashMap<String, DeviceState> {
	let mut devices = HashMap::new();

	for line in data.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let mut parts = line.split('\t');
		if let (Some(serial), Some(state)) = (parts.next(), parts.next()) {
			devices.insert(serial.to_string(), DeviceState::parse(state));
		}
	}

	devices
}

fn diff_snapshots(
	old: &HashMap<String, DeviceState>,
	new: &HashMap<String, DeviceState>,
) -> Vec<DeviceEvent> {
	let mut events = Vec::new();

	for (serial, state) in new {
		match old.get(serial) {
			None => events.push(DeviceEvent::Connected {
				serial: serial.clone(),
				state: *state,
			}),
			Some(previous) if previous != state => events.push(DeviceEvent::StateChanged {
				serial: serial.clone(),
				state: *state,
			}),
			Some(_) => {}
		}
	}

	for serial in old.keys() {
		if !new.contains_key(serial) {
			events.push(DeviceEvent::Disconnected {
				serial: serial.clone(),
			});
		}
	}

	events
}
