//! Per-device registry of capture workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use droidcast_stream::Subscribe;

use crate::{CaptureWorker, DEFAULT_FRAME_TIMEOUT};

/// Owns one [CaptureWorker] per serial.
///
/// Workers exist while someone holds them: `acquire` creates on demand and
/// bumps the refcount, `release` drops the worker from the registry once
/// the count returns to zero.
pub struct CaptureManager {
	source: Arc<dyn Subscribe>,
	output_dir: PathBuf,
	default_quality: u8,
	workers: Mutex<HashMap<String, Arc<CaptureWorker>>>,
}

impl CaptureManager {
	pub fn new(source: Arc<dyn Subscribe>, output_dir: impl Into<PathBuf>, default_quality: u8) -> Self {
		Self {
			source,
			output_dir: output_dir.into(),
			default_quality,
			workers: Mutex::new(HashMap::new()),
		}
	}

	/// The worker for a device, created on demand; the decoder pipeline
	/// starts on the first acquisition.
	pub async fn acquire(&self, serial: &str) -> Arc<CaptureWorker> {
		let worker = {
			let mut workers = self.workers.lock().await;
			workers
				.entry(serial.to_string())
				.or_insert_with(|| {
					Arc::new(CaptureWorker::new(
						serial,
						self.source.clone(),
						self.output_dir.clone(),
						self.default_quality,
						DEFAULT_FRAME_TIMEOUT,
					))
				})
				.clone()
		};

		worker.acquire().await;
		worker
	}

	pub async fn release(&self, serial: &str) {
		let worker = self.workers.lock().await.get(serial).cloned();
		let worker = match worker {
			Some(worker) => worker,
			None => return,
		};

		if worker.release().await > 0 {
			return;
		}

		// Fully released: drop it from the registry, unless someone
		// re-acquired in the meantime.
		let mut workers = self.workers.lock().await;
		if let Some(current) = workers.get(serial) {
			if Arc::ptr_eq(current, &worker) && worker.refcount().await == 0 {
				workers.remove(serial);
			}
		}
	}

	/// `serial -> pipeline running` for every registered worker.
	pub async fn snapshot_running(&self) -> HashMap<String, bool> {
		let workers: Vec<_> = {
			let workers = self.workers.lock().await;
			workers.values().cloned().collect()
		};

		let mut snapshot = HashMap::new();
		for worker in workers {
			snapshot.insert(worker.serial().to_string(), worker.refcount().await > 0);
		}
		snapshot
	}

	/// Force-release every worker, e.g. on shutdown.
	pub async fn stop_all(&self) {
		let workers = std::mem::take(&mut *self.workers.lock().await);
		for worker in workers.into_values() {
			worker.shutdown().await;
		}
	}
}
