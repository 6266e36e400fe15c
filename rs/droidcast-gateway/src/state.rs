use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use droidcast_adb::DeviceRegistry;
use droidcast_capture::CaptureManager;
use droidcast_stream::SessionManager;

use crate::config::Config;
use crate::notify::Notifier;
use crate::workers::WorkerRegistry;

/// Process-wide singletons, passed explicitly through the router.
#[derive(Clone)]
pub struct AppState {
	pub config: Arc<Config>,
	pub devices: Arc<DeviceRegistry>,
	pub sessions: Arc<SessionManager>,
	pub captures: Arc<CaptureManager>,
	pub workers: Arc<WorkerRegistry>,
	pub notifier: Arc<Notifier>,

	// Flipped once startup completes; WS requests racing the lifecycle get
	// a clean "server not ready" close instead of a half-wired pipeline.
	ready: Arc<AtomicBool>,
}

impl AppState {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Arc<Config>,
		devices: Arc<DeviceRegistry>,
		sessions: Arc<SessionManager>,
		captures: Arc<CaptureManager>,
		workers: Arc<WorkerRegistry>,
		notifier: Arc<Notifier>,
	) -> Self {
		Self {
			config,
			devices,
			sessions,
			captures,
			workers,
			notifier,
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn set_ready(&self) {
		self.ready.store(true, Ordering::SeqCst);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::SeqCst)
	}
}
