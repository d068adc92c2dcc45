//! Four concurrent entry points speaking the same RPC (`rpc::dispatch`).
//! Each module owns its own accept loop; `main.rs` starts whichever
//! subset the operator selected via `--transport`.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod ws;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
	Stdio,
	Http,
	WebSocket,
	Sse,
}

impl std::str::FromStr for TransportKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"stdio" => Ok(TransportKind::Stdio),
			"http" => Ok(TransportKind::Http),
			"ws" => Ok(TransportKind::WebSocket),
			"sse" => Ok(TransportKind::Sse),
			other => Err(format!("unknown transport {other}")),
		}
	}
}

impl std::fmt::Display for TransportKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			TransportKind::Stdio => "stdio",
			TransportKind::Http => "http",
			TransportKind::WebSocket => "ws",
			TransportKind::Sse => "sse",
		};
		f.write_str(s)
	}
}
