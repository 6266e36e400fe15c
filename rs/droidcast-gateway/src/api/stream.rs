//! `WS /api/ws/stream/{serial}`: binary Annex-B NAL units, in emission
//! order, until the client leaves or the session ends.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;

use crate::state::AppState;

pub async fn ws_stream(
	ws: WebSocketUpgrade,
	Path(serial): Path<String>,
	State(state): State<AppState>,
) -> Response {
	ws.on_upgrade(move |socket| handle_stream(socket, serial, state))
}

async fn handle_stream(mut socket: WebSocket, serial: String, state: AppState) {
	if !state.is_ready() {
		close(socket, 1011, "Server not ready".to_string()).await;
		return;
	}

	if state.devices.get(&serial).is_none() {
		close(socket, 4004, format!("Device {serial} not found")).await;
		return;
	}

	state.workers.on_stream_connect(&serial);
	tracing::info!(serial, "stream client connected");

	if let Err(err) = pump_stream(&mut socket, &serial, &state).await {
		tracing::error!(serial, %err, "stream session failed");
	}

	state.workers.on_stream_disconnect(&serial);
	close(socket, 1000, String::new()).await;
	tracing::info!(serial, "stream client disconnected");
}

async fn pump_stream(
	socket: &mut WebSocket,
	serial: &str,
	state: &AppState,
) -> Result<(), droidcast_stream::Error> {
	let session = state.sessions.get_or_create(serial, None).await?;
	let mut subscriber = session.subscribe().await?;

	loop {
		tokio::select! {
			nal = subscriber.next() => match nal {
				Some(nal) => {
					if socket.send(Message::Binary(nal)).await.is_err() {
						return Ok(());
					}
				}
				// Session stopped.
				None => return Ok(()),
			},
			message = socket.recv() => match message {
				// The stream is one-way; ignore anything the client says.
				Some(Ok(_)) => {}
				// Client is gone.
				_ => return Ok(()),
			},
		}
	}
}

pub(crate) async fn close(mut socket: WebSocket, code: u16, reason: String) {
	let _ = socket
		.send(Message::Close(Some(CloseFrame {
			code,
			reason: reason.into(),
		})))
		.await;
}
