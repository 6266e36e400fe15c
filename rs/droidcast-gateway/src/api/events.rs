use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

/// Server-Sent Events: `event: devices` carries the full device list, once
/// on connect and again on every change.
pub async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	let initial = serde_json::to_string(&state.devices.list_all()).unwrap_or_else(|_| "[]".to_string());
	let mut changes = state.notifier.subscribe();

	let stream = async_stream::stream! {
		yield Ok(Event::default().event("devices").data(initial));

		loop {
			match changes.recv().await {
				Ok(payload) => yield Ok(Event::default().event("devices").data(payload)),
				// A slow client missed some updates; the next one carries
				// the full list anyway.
				Err(RecvError::Lagged(_)) => continue,
				Err(RecvError::Closed) => break,
			}
		}
	};

	Sse::new(stream).keep_alive(KeepAlive::default())
}
