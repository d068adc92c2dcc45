//! WebSocket transport: one `/mcp` socket per connection, one RPC message
//! per text frame. Connections are fully independent, with no shared
//! session state beyond the `Host` they all dispatch against, same as the
//! stdio transport's per-process singleton but multiplied per socket.
//!
//! Each inbound frame is dispatched on its own task, same as stdio, so a
//! slow upstream call on one request doesn't block replies to requests
//! queued behind it on the same socket; responses are written in
//! completion order by a single writer task fed over an mpsc channel.

use crate::host::Host;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn router(host: Arc<Host>) -> Router {
	Router::new().route("/mcp", get(upgrade)).with_state(host)
}

pub async fn serve(host: Arc<Host>, port: u16) -> std::io::Result<()> {
	let app = router(host);
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
	tracing::info!(%port, "websocket transport listening");
	axum::serve(listener, app).await
}

async fn upgrade(ws: WebSocketUpgrade, State(host): State<Arc<Host>>) -> Response {
	ws.on_upgrade(move |socket| handle_socket(socket, host))
}

async fn handle_socket(socket: WebSocket, host: Arc<Host>) {
	let (mut sink, mut stream) = socket.split();
	let (tx, mut rx) = mpsc::channel::<String>(256);

	let writer_task = tokio::spawn(async move {
		while let Some(text) = rx.recv().await {
			if sink.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
	});

	let mut in_flight = tokio::task::JoinSet::new();
	while let Some(message) = stream.next().await {
		let message = match message {
			Ok(m) => m,
			Err(e) => {
				tracing::debug!(error = %e, "websocket recv error, closing connection");
				break;
			},
		};

		let text = match message {
			Message::Text(text) => text,
			Message::Close(_) => break,
			Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
		};

		let host = host.clone();
		let tx = tx.clone();
		in_flight.spawn(async move {
			if let Some(response) = crate::rpc::dispatch(&host, text.as_str()).await {
				if let Ok(serialized) = serde_json::to_string(&response) {
					let _ = tx.send(serialized).await;
				}
			}
		});
	}

	while in_flight.join_next().await.is_some() {}
	drop(tx);
	let _ = writer_task.await;
}
