use axum::extract::State;
use axum::Json;

use droidcast_stream::{SessionStats, StreamConfig};

use crate::state::AppState;
use crate::workers::WorkerState;

#[derive(serde::Serialize)]
pub struct SessionEntry {
	pub serial: String,
	pub config: StreamConfig,
	pub stats: SessionStats,
}

#[derive(serde::Serialize)]
pub struct SessionsResponse {
	pub sessions: Vec<SessionEntry>,
	pub workers: Vec<WorkerState>,
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
	let mut sessions = Vec::new();
	for serial in state.sessions.active_serials().await {
		if let Some(session) = state.sessions.get(&serial).await {
			sessions.push(SessionEntry {
				serial,
				config: session.config(),
				stats: session.stats(),
			});
		}
	}

	Json(SessionsResponse {
		sessions,
		workers: state.workers.snapshot(),
	})
}
