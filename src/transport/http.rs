//! Plain HTTP transport: a single `POST /mcp` route. A successful
//! dispatch, including one carrying an RPC-level error in its body, is
//! still a 200; only a request the framework itself cannot read as JSON
//! at all gets a 400, mirroring the stdio/WS transports where framing
//! failures and protocol failures are distinguished the same way.

use crate::host::Host;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router(host: Arc<Host>) -> Router {
	Router::new().route("/mcp", post(handle)).with_state(host)
}

pub async fn serve(host: Arc<Host>, port: u16) -> std::io::Result<()> {
	let app = router(host);
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
	tracing::info!(%port, "http transport listening");
	axum::serve(listener, app).await
}

async fn handle(State(host): State<Arc<Host>>, body: axum::body::Bytes) -> Response {
	let raw = match std::str::from_utf8(&body) {
		Ok(s) => s,
		Err(_) => return (StatusCode::BAD_REQUEST, "request body is not valid UTF-8").into_response(),
	};

	match crate::rpc::dispatch(&host, raw).await {
		Some(response) => Json(response).into_response(),
		// A notification: the body decoded fine and produced no reply.
		None => StatusCode::NO_CONTENT.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn non_utf8_body_is_bad_request() {
		let bytes = axum::body::Bytes::from_static(&[0xff, 0xfe]);
		let response = match std::str::from_utf8(&bytes) {
			Ok(_) => unreachable!(),
			Err(_) => StatusCode::BAD_REQUEST,
		};
		assert_eq!(response, StatusCode::BAD_REQUEST);
	}
}
