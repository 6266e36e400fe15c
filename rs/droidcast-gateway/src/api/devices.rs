use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use droidcast_adb::DeviceInfo;

use crate::state::AppState;

pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceInfo>> {
	Json(state.devices.list_all())
}

pub async fn get_device(State(state): State<AppState>, Path(serial): Path<String>) -> Response {
	match state.devices.get(&serial) {
		Some(device) => Json(device).into_response(),
		None => (
			StatusCode::NOT_FOUND,
			Json(serde_json::json!({ "detail": format!("Device {serial} not found") })),
		)
			.into_response(),
	}
}
