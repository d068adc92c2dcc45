//! SSE transport: kept as a compatibility shim for clients that still
//! expect the older two-endpoint MCP shape. `GET /mcp-sse` opens an event
//! stream and announces an `endpoint` event carrying a session id;
//! `POST /mcp-sse/message?sessionId=...` delivers one request per call and
//! its reply arrives asynchronously as a `message` event on the stream.
//! Session bookkeeping follows the same shape as other SSE/MCP bridges
//! (`txs` map keyed by a random session id, one mpsc channel per open
//! stream) without the RBAC/JWT/xDS machinery that doesn't apply here.

use crate::host::Host;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

type SessionId = Arc<str>;

fn session_id() -> SessionId {
	Arc::from(format!("{:016x}", rand::random::<u128>()))
}

#[derive(Clone)]
pub struct SseState {
	host: Arc<Host>,
	senders: Arc<RwLock<HashMap<SessionId, mpsc::Sender<String>>>>,
}

pub fn router(host: Arc<Host>) -> Router {
	let state = SseState {
		host,
		senders: Arc::new(RwLock::new(HashMap::new())),
	};
	Router::new()
		.route("/mcp-sse", get(open_stream))
		.route("/mcp-sse/message", axum::routing::post(post_message))
		.with_state(state)
}

pub async fn serve(host: Arc<Host>, port: u16) -> std::io::Result<()> {
	let app = router(host);
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
	tracing::info!(%port, "sse transport listening");
	axum::serve(listener, app).await
}

async fn open_stream(
	State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
	let session = session_id();
	let (tx, rx) = mpsc::channel::<String>(64);
	state.senders.write().await.insert(session.clone(), tx);

	let announce = futures::stream::once(futures::future::ok(
		Event::default().event("endpoint").data(format!("?sessionId={session}")),
	));
	let messages = tokio_stream::wrappers::ReceiverStream::new(rx)
		.map(|body| Ok(Event::default().event("message").data(body)));

	Sse::new(announce.chain(messages))
}

#[derive(serde::Deserialize)]
struct MessageQuery {
	#[serde(rename = "sessionId")]
	session_id: String,
}

async fn post_message(
	State(state): State<SseState>,
	Query(query): Query<MessageQuery>,
	Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
	let sender = {
		let senders = state.senders.read().await;
		match senders.get(query.session_id.as_str()) {
			Some(tx) => tx.clone(),
			None => return StatusCode::NOT_FOUND,
		}
	};

	let raw = body.to_string();
	let host = state.host.clone();
	tokio::spawn(async move {
		if let Some(response) = crate::rpc::dispatch(&host, &raw).await {
			if let Ok(serialized) = serde_json::to_string(&response) {
				let _ = sender.send(serialized).await;
			}
		}
	});

	StatusCode::ACCEPTED
}
