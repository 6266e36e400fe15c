//! HTTP/WebSocket surface.

mod capture;
mod devices;
mod events;
mod healthz;
mod sessions;
mod stream;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
	let cors = state.config.cors_layer();

	Router::new()
		.route("/healthz", get(healthz::healthz))
		.route("/api/healthz", get(healthz::healthz))
		.route("/api/devices", get(devices::list_devices))
		.route("/api/devices/{serial}", get(devices::get_device))
		.route("/api/sessions", get(sessions::list_sessions))
		.route("/api/events", get(events::events))
		.route("/api/ws/stream/{serial}", get(stream::ws_stream))
		.route("/api/ws/capture/{serial}", get(capture::ws_capture))
		// Compatibility aliases for clients that skip the /api prefix.
		.route("/ws/stream/{serial}", get(stream::ws_stream))
		.route("/ws/capture/{serial}", get(capture::ws_capture))
		.layer(cors)
		.with_state(state)
}
