//! The JSON-RPC-2.0-flavoured wire protocol shared by all four transports:
//! one dispatcher consumed identically everywhere, serving this crate's
//! own three-method envelope (see DESIGN.md's rpc.rs entry).

use crate::error::{CallError, RpcError};
use crate::host::Host;
use crate::policy::{HasStatus, PolicyOutcome};
use crate::tool::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "toolbridge";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct Request {
	#[serde(default)]
	pub jsonrpc: Option<String>,
	#[serde(default)]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default)]
	pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Response {
	pub jsonrpc: &'static str,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcError>,
}

impl Response {
	fn ok(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: Some(result),
			error: None,
		}
	}

	fn err(id: Value, error: RpcError) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: None,
			error: Some(error),
		}
	}
}

impl HasStatus for CallError {
	fn status(&self) -> u16 {
		match self {
			CallError::Upstream(e) => e.status,
			_ => 0,
		}
	}
}

/// Parses a raw request body and dispatches it. Returns `None` for
/// notifications (no `id`), which produce no reply.
pub async fn dispatch(host: &Host, raw: &str) -> Option<Response> {
	let request: Request = match serde_json::from_str(raw) {
		Ok(r) => r,
		Err(e) => return Some(Response::err(Value::Null, RpcError::parse_error(e.to_string()))),
	};

	let id = request.id.clone();
	let is_notification = id.is_none();
	let response = handle(host, request).await;

	if is_notification {
		None
	} else {
		Some(match response {
			Ok(result) => Response::ok(id.unwrap_or(Value::Null), result),
			Err(error) => Response::err(id.unwrap_or(Value::Null), error),
		})
	}
}

async fn handle(host: &Host, request: Request) -> Result<Value, RpcError> {
	match request.method.as_str() {
		"initialize" => Ok(serde_json::json!({
			"protocolVersion": PROTOCOL_VERSION,
			"serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
			"capabilities": { "tools": {} },
		})),
		"tools/list" => {
			let tools = host.registry.list();
			Ok(serde_json::json!({ "tools": tools }))
		},
		"tools/call" => {
			let params = request.params.unwrap_or(Value::Null);
			let name = params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| RpcError::parse_error("tools/call requires a string `name` parameter"))?;
			let arguments = params
				.get("arguments")
				.and_then(Value::as_object)
				.cloned()
				.unwrap_or_default();

			let result = host.call_tool(name, arguments).await;
			match result {
				Ok(ToolResult::Json(json)) => Ok(serde_json::json!({
					"content": [{ "type": "json", "json": json }],
				})),
				Ok(ToolResult::Raw(text)) => Ok(serde_json::json!({
					"content": [{ "type": "json", "json": text }],
				})),
				Err(PolicyOutcome::Policy(policy_err)) => Err(CallError::Policy(policy_err).into()),
				Err(PolicyOutcome::Call(call_err)) => Err(call_err.into()),
			}
		},
		other => Err(RpcError::unknown_method(other)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_notification_without_id() {
		let raw = r#"{"jsonrpc":"2.0","method":"initialize","params":{}}"#;
		let request: Request = serde_json::from_str(raw).unwrap();
		assert!(request.id.is_none());
	}

	#[test]
	fn malformed_envelope_is_parse_error() {
		let err = serde_json::from_str::<Request>("{not json").unwrap_err();
		let rpc_err = RpcError::parse_error(err.to_string());
		assert_eq!(rpc_err.code, crate::error::codes::PARSE_ERROR);
	}
}
