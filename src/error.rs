use serde_json::Value;

/// Failures while loading or dereferencing an OpenAPI document.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
	#[error("io error reading {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("fetching {url}: {source}")]
	Fetch {
		url: String,
		#[source]
		source: reqwest::Error,
	},
	#[error("fetching {url}: server returned {status}")]
	FetchStatus { url: String, status: u16 },
	#[error("fetching {url}: timed out")]
	FetchTimeout { url: String },
	#[error("body is neither JSON nor YAML nor an embedded swaggerDoc")]
	UndecodableBody,
	#[error("invalid reference: {0}")]
	InvalidReference(String),
	#[error("missing components section")]
	MissingComponents,
	#[error("unresolved reference: {0}")]
	MissingReference(String),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
	#[error("yaml error: {0}")]
	Yaml(#[from] serde_yaml::Error),
}

/// Failures compiling operation records out of a loaded spec.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
	#[error("no resolvable base URL for service {service}")]
	NoBaseUrl { service: String },
	#[error("duplicate tool name {name} in service {service}")]
	DuplicateTool { service: String, name: String },
	#[error("invalid filter regex {pattern}: {source}")]
	BadFilterRegex {
		pattern: String,
		#[source]
		source: regex::Error,
	},
	#[error(transparent)]
	Spec(#[from] SpecError),
}

/// Failures resolving or applying a security scheme.
#[derive(Debug, thiserror::Error, Clone)]
pub enum AuthError {
	#[error("no credential source configured for {scheme} on service {service}")]
	MissingCredentialSource { service: String, scheme: String },
	#[error("missing required argument {0:?} for credential scheme")]
	MissingArgument(String),
	#[error("token endpoint {endpoint} returned status {status}")]
	TokenEndpointStatus { endpoint: String, status: u16 },
	#[error("token endpoint {endpoint} request failed: {message}")]
	TokenEndpointError { endpoint: String, message: String },
	#[error("token endpoint {endpoint} response missing access_token")]
	TokenEndpointMalformed { endpoint: String },
}

/// Failures enforcing call policy, raised before the upstream call.
#[derive(Debug, thiserror::Error, Clone)]
pub enum PolicyError {
	#[error("method {0} is not in the allowed method set")]
	MethodNotAllowed(String),
	#[error("path template {0} does not match any allowed path pattern")]
	PathNotAllowed(String),
	#[error("rate limit exceeded: {limit} calls per {window_ms}ms")]
	RateLimited { limit: u32, window_ms: u64 },
	#[error("concurrency limit reached")]
	ConcurrencyLimited,
}

/// A structured upstream HTTP failure (status >= 400), or a transport-level
/// failure at the same call site (connect/timeout/cancel).
#[derive(Debug, Clone)]
pub struct UpstreamError {
	pub status: u16,
	pub status_text: String,
	pub body: Value,
	pub headers: std::collections::BTreeMap<String, String>,
}

impl std::fmt::Display for UpstreamError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"API Error: {} {} - {}",
			self.status, self.status_text, self.body
		)
	}
}

impl std::error::Error for UpstreamError {}

/// Failures invoking a tool handler, the union surfaced by `tools/call`.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CallError {
	#[error("unknown tool {0}")]
	UnknownTool(String),
	#[error("missing required parameter {0}")]
	MissingParameter(String),
	#[error(transparent)]
	Auth(#[from] AuthError),
	#[error(transparent)]
	Policy(#[from] PolicyError),
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	#[error("transport error: {0}")]
	Transport(String),
	#[error("call cancelled")]
	Cancelled,
}

/// JSON-RPC numeric error codes used on the wire.
pub mod codes {
	pub const PARSE_ERROR: i64 = -32700;
	pub const UNKNOWN_METHOD: i64 = -32601;
	pub const UNKNOWN_TOOL: i64 = -32601;
	pub const SERVER_ERROR: i64 = -32000;
}

/// The wire-facing error shape every transport serialises into the
/// response envelope's `error` field. Constructed from the internal enums
/// above at the RPC dispatch boundary (see `rpc::dispatch`), never
/// constructed directly by component code.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcError {
	pub code: i64,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

impl RpcError {
	pub fn parse_error(message: impl Into<String>) -> Self {
		Self {
			code: codes::PARSE_ERROR,
			message: message.into(),
			data: None,
		}
	}

	pub fn unknown_method(method: &str) -> Self {
		Self {
			code: codes::UNKNOWN_METHOD,
			message: format!("unknown method {method}"),
			data: None,
		}
	}
}

impl From<CallError> for RpcError {
	fn from(err: CallError) -> Self {
		match &err {
			CallError::UnknownTool(name) => Self {
				code: codes::UNKNOWN_TOOL,
				message: format!("unknown tool {name}"),
				data: None,
			},
			CallError::Upstream(upstream) => Self {
				code: codes::SERVER_ERROR,
				message: err.to_string(),
				data: Some(serde_json::json!({
					"statusCode": upstream.status,
					"statusText": upstream.status_text,
					"body": upstream.body,
					"headers": upstream.headers,
				})),
			},
			_ => Self {
				code: codes::SERVER_ERROR,
				message: err.to_string(),
				data: None,
			},
		}
	}
}
