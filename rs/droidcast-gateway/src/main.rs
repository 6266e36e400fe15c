//! Android screen streaming and capture gateway.
//!
//! Per attached device: ingest the capture agent's H.264 stream once, fan
//! it out to WebSocket stream clients, and serve on-demand JPEG captures
//! decoded from the same ingest.

mod api;
mod config;
mod notify;
mod state;
mod workers;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use droidcast_adb::{AgentFactory, DeviceEvent, DeviceMonitor, DeviceRegistry};
use droidcast_capture::CaptureManager;
use droidcast_stream::{SessionManager, StreamConfig};

use crate::config::Config;
use crate::notify::Notifier;
use crate::state::AppState;
use crate::workers::WorkerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::parse();

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	tracing::info!(agent_jar = %config.agent_jar_path.display(), "starting services");

	let devices = Arc::new(DeviceRegistry::new());
	let notifier = Arc::new(Notifier::new());

	let factory = Arc::new(AgentFactory::new(&config.agent_jar_path));
	let sessions = Arc::new(SessionManager::new(
		factory,
		StreamConfig::balanced(),
		config.idle_timeout(),
	));
	let captures = Arc::new(CaptureManager::new(
		sessions.clone(),
		&config.capture_output_dir,
		config.jpeg_quality(),
	));
	let workers = Arc::new(WorkerRegistry::new(sessions.clone(), config.idle_timeout()));

	let monitor = DeviceMonitor::new();
	let events = monitor.start();
	let pump = spawn_device_pump(devices.clone(), notifier.clone(), events);

	let state = AppState::new(
		Arc::new(config.clone()),
		devices,
		sessions.clone(),
		captures.clone(),
		workers,
		notifier,
	);

	let app = api::router(state.clone());
	let listener = tokio::net::TcpListener::bind(config.bind).await?;
	tracing::info!(addr = %config.bind, "listening");
	state.set_ready();

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	// Teardown in reverse construction order.
	tracing::info!("stopping services");
	captures.stop_all().await;
	sessions.stop_all().await;
	monitor.stop().await;
	pump.abort();

	Ok(())
}

/// Apply monitor events to the registry and push the new device list to SSE
/// clients.
fn spawn_device_pump(
	devices: Arc<DeviceRegistry>,
	notifier: Arc<Notifier>,
	mut events: tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			match event {
				DeviceEvent::Connected { serial, state } => {
					devices.register(&serial, state);
				}
				DeviceEvent::StateChanged { serial, state } => {
					if devices.update_state(&serial, state).is_none() {
						devices.register(&serial, state);
					}
				}
				DeviceEvent::Disconnected { serial } => {
					devices.unregister(&serial);
				}
			}

			notifier.notify_devices(&devices.list_all());
		}
	})
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
