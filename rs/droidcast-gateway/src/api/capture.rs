//! `WS /api/ws/capture/{serial}`: JSON requests in, JSON metadata plus one
//! binary JPEG frame out.
//!
//! While at least one capture client is connected the worker keeps a decoder
//! running, so the first capture pays the pipeline spin-up and later ones
//! return in tens of milliseconds.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;

use droidcast_capture::{CaptureResult, Error as CaptureError};

use crate::api::stream::close;
use crate::state::AppState;

#[derive(Debug, PartialEq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
	Capture {
		format: Option<String>,
		quality: Option<u8>,
		save: Option<bool>,
	},
}

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
	CaptureResult {
		#[serde(flatten)]
		result: CaptureResult,
	},
	Error {
		code: &'static str,
		message: String,
	},
}

pub async fn ws_capture(
	ws: WebSocketUpgrade,
	Path(serial): Path<String>,
	State(state): State<AppState>,
) -> Response {
	ws.on_upgrade(move |socket| handle_capture(socket, serial, state))
}

async fn handle_capture(mut socket: WebSocket, serial: String, state: AppState) {
	if !state.is_ready() {
		close(socket, 1011, "Server not ready".to_string()).await;
		return;
	}

	if state.devices.get(&serial).is_none() {
		close(socket, 4004, format!("Device {serial} not found")).await;
		return;
	}

	let worker = state.captures.acquire(&serial).await;
	state.workers.on_capture_connect(&serial);
	tracing::info!(serial, "capture client connected");

	loop {
		let message = match socket.recv().await {
			Some(Ok(message)) => message,
			_ => break,
		};

		let reply = match message {
			Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
				Ok(ClientMessage::Capture { format, quality, save }) => {
					let format = format.unwrap_or_else(|| "jpeg".to_string()).to_ascii_lowercase();
					if format != "jpeg" {
						ServerMessage::Error {
							code: "UNSUPPORTED_FORMAT",
							message: format!("format {format} is not supported"),
						}
					} else {
						match worker.capture_jpeg(quality, save.unwrap_or(false)).await {
							Ok((result, jpeg)) => {
								let reply = ServerMessage::CaptureResult { result };
								if send_json(&mut socket, &reply).await.is_err() {
									break;
								}
								if socket.send(Message::Binary(jpeg.into())).await.is_err() {
									break;
								}
								continue;
							}
							Err(CaptureError::CaptureTimeout) => ServerMessage::Error {
								code: "CAPTURE_TIMEOUT",
								message: "Timed out waiting for a decoded frame".to_string(),
							},
							Err(err) => ServerMessage::Error {
								code: "CAPTURE_FAILED",
								message: err.to_string(),
							},
						}
					}
				}
				Err(_) => ServerMessage::Error {
					code: "BAD_REQUEST",
					message: "Unknown message type".to_string(),
				},
			},
			Message::Close(_) => break,
			Message::Ping(_) | Message::Pong(_) => continue,
			Message::Binary(_) => ServerMessage::Error {
				code: "BAD_REQUEST",
				message: "Expected a text frame".to_string(),
			},
		};

		if send_json(&mut socket, &reply).await.is_err() {
			break;
		}
	}

	state.captures.release(&serial).await;
	state.workers.on_capture_disconnect(&serial);
	tracing::info!(serial, "capture client disconnected");
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
	let payload = serde_json::to_string(message).unwrap_or_else(|_| {
		r#"{"type":"error","code":"CAPTURE_FAILED","message":"serialization failed"}"#.to_string()
	});
	socket.send(Message::Text(payload.into())).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_capture_request() {
		let message: ClientMessage =
			serde_json::from_str(r#"{"type":"capture","format":"jpeg","quality":90,"save":true}"#).unwrap();
		assert_eq!(
			message,
			ClientMessage::Capture {
				format: Some("jpeg".to_string()),
				quality: Some(90),
				save: Some(true),
			}
		);
	}

	#[test]
	fn test_parse_minimal_capture_request() {
		let message: ClientMessage = serde_json::from_str(r#"{"type":"capture"}"#).unwrap();
		assert_eq!(
			message,
			ClientMessage::Capture {
				format: None,
				quality: None,
				save: None,
			}
		);
	}

	#[test]
	fn test_unknown_type_is_rejected() {
		assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"screenshot"}"#).is_err());
		assert!(serde_json::from_str::<ClientMessage>(r#"{"quality":90}"#).is_err());
		assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
	}

	#[test]
	fn test_error_message_shape() {
		let message = ServerMessage::Error {
			code: "UNSUPPORTED_FORMAT",
			message: "format png is not supported".to_string(),
		};
		let json: serde_json::Value = serde_json::to_value(&message).unwrap();
		assert_eq!(json["type"], "error");
		assert_eq!(json["code"], "UNSUPPORTED_FORMAT");
	}

	#[test]
	fn test_capture_result_shape() {
		let message = ServerMessage::CaptureResult {
			result: CaptureResult {
				capture_id: "abc".to_string(),
				captured_at: chrono::Utc::now(),
				serial: "emulator-5554".to_string(),
				width: 720,
				height: 1280,
				bytes: 4096,
				path: None,
			},
		};
		let json: serde_json::Value = serde_json::to_value(&message).unwrap();
		assert_eq!(json["type"], "capture_result");
		assert_eq!(json["serial"], "emulator-5554");
		assert_eq!(json["width"], 720);
		assert_eq!(json["path"], serde_json::Value::Null);
	}
}
