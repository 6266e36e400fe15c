//! Per-device registry of ingest sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::{IngestSession, Result, SourceFactory, StreamConfig, Subscribe, Subscriber};

/// Owns one [IngestSession] per serial, rebuilding dead sessions on demand.
pub struct SessionManager {
	factory: Arc<dyn SourceFactory>,
	default_config: StreamConfig,
	idle_timeout: Duration,
	sessions: Mutex<HashMap<String, Arc<IngestSession>>>,
}

impl SessionManager {
	pub fn new(factory: Arc<dyn SourceFactory>, default_config: StreamConfig, idle_timeout: Duration) -> Self {
		Self {
			factory,
			default_config,
			idle_timeout,
			sessions: Mutex::new(HashMap::new()),
		}
	}

	/// The running session for a device, starting one if needed.
	///
	/// A session that died on its own (agent crash, device yanked) is
	/// dropped and replaced.
	pub async fn get_or_create(&self, serial: &str, config: Option<StreamConfig>) -> Result<Arc<IngestSession>> {
		let mut sessions = self.sessions.lock().await;

		if let Some(session) = sessions.get(serial).cloned() {
			if session.is_running() {
				return Ok(session);
			}
			tracing::info!(serial, "session is not running, recreating");
			session.stop().await;
			sessions.remove(serial);
		}

		let session = Arc::new(IngestSession::new(
			serial,
			self.factory.clone(),
			config.unwrap_or_else(|| self.default_config.clone()),
			self.idle_timeout,
		));
		session.start().await?;
		sessions.insert(serial.to_string(), session.clone());

		Ok(session)
	}

	pub async fn get(&self, serial: &str) -> Option<Arc<IngestSession>> {
		self.sessions.lock().await.get(serial).cloned()
	}

	pub async fn stop_session(&self, serial: &str) {
		let session = self.sessions.lock().await.remove(serial);
		if let Some(session) = session {
			session.stop().await;
		}
	}

	pub async fn stop_all(&self) {
		let sessions = std::mem::take(&mut *self.sessions.lock().await);
		for session in sessions.into_values() {
			session.stop().await;
		}
	}

	pub async fn active_serials(&self) -> Vec<String> {
		self.sessions
			.lock()
			.await
			.values()
			.filter(|s| s.is_running())
			.map(|s| s.serial().to_string())
			.collect()
	}
}

#[async_trait::async_trait]
impl Subscribe for SessionManager {
	async fn subscribe(&self, serial: &str) -> Result<Subscriber> {
		let session = self.get_or_create(serial, None).await?;
		session.subscribe().await
	}
}
