//! Builds a descriptor and an invocable handler per operation record. The
//! handler performs preflight (auth, path substitution, query/header/cookie
//! accumulation, body), issues the upstream request, and decodes the
//! response, resolving credentials first and failing with a structured
//! `UpstreamError` rather than a stringly-typed one.

use crate::auth::{self, ServiceCredentials, TokenCache};
use crate::compile::{Method, OperationRecord, ParamLocation};
use crate::error::{CallError, UpstreamError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Which parameters of a tool's input schema land in the path, query,
/// headers, or cookies of the outbound request.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterPartition {
	pub path: Vec<String>,
	pub query: Vec<String>,
	pub header: Vec<String>,
	pub cookie: Vec<String>,
}

/// Metadata describing how a tool maps onto its upstream operation, for
/// offline catalogues and code emitters that need more than the bare
/// name/description/inputSchema triple to regenerate a client.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializationInfo {
	pub path: String,
	pub method: String,
	pub parameters: ParameterPartition,
	pub security: Vec<crate::compile::SecurityScheme>,
	pub input_schema: Value,
}

impl SerializationInfo {
	fn from_record(record: &OperationRecord) -> Self {
		let mut parameters = ParameterPartition::default();
		for (location, param) in &record.parameters {
			match location {
				ParamLocation::Path => parameters.path.push(param.name.clone()),
				ParamLocation::Query => parameters.query.push(param.name.clone()),
				ParamLocation::Header => parameters.header.push(param.name.clone()),
				ParamLocation::Cookie => parameters.cookie.push(param.name.clone()),
			}
		}
		Self {
			path: record.path_template.clone(),
			method: method_name(record.method).to_string(),
			parameters,
			security: record.security.iter().map(|(scheme, _)| scheme.clone()).collect(),
			input_schema: record.input_schema.clone(),
		}
	}
}

/// The wire-visible metadata for a tool. Serialisable, no executable
/// content.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDescriptor {
	pub name: String,
	pub description: String,
	#[serde(rename = "inputSchema")]
	pub input_schema: Value,
	#[serde(rename = "serializationInfo")]
	pub serialization_info: SerializationInfo,
}

impl ToolDescriptor {
	pub fn from_record(record: &OperationRecord) -> Self {
		Self {
			name: record.qualified_name(),
			description: record.description.clone(),
			input_schema: record.input_schema.clone(),
			serialization_info: SerializationInfo::from_record(record),
		}
	}
}

pub struct Tool {
	pub descriptor: ToolDescriptor,
	pub record: Arc<OperationRecord>,
}

pub enum ToolResult {
	Json(Value),
	Raw(String),
}

/// Per-service context a handler needs at call time: credentials and the
/// shared HTTP client and token cache. Constructed once in `host::build`
/// and shared by every tool in the service.
pub struct ServiceContext {
	pub credentials: ServiceCredentials,
	pub http: reqwest::Client,
	pub token_cache: Arc<TokenCache>,
}

#[tracing::instrument(level = "debug", skip_all, fields(tool = %record.qualified_name()))]
pub async fn invoke(
	record: &OperationRecord,
	ctx: &ServiceContext,
	args: serde_json::Map<String, Value>,
) -> Result<ToolResult, CallError> {
	// Preflight: path params are required before anything else happens, so
	// a missing path argument never reaches the network.
	let mut path = record.path_template.clone();
	for param in record.path_params() {
		match args.get(&param.name) {
			Some(value) => {
				let encoded = percent_encode(&value_to_string(value));
				path = path.replace(&format!("{{{}}}", param.name), &encoded);
			},
			None => {
				if param.required {
					return Err(CallError::MissingParameter(param.name.clone()));
				}
			},
		}
	}

	let body = if record.has_body { args.get("body").cloned() } else { None };
	let url = format!("{}{}", record.base_url.trim_end_matches('/'), path);

	let credentials = auth::resolve(&record.security, &ctx.credentials, &args, &ctx.token_cache, &ctx.http)
		.await
		.map_err(CallError::Auth)?;
	let (status, headers_out, text) = send_request(record, ctx, &args, &url, &body, credentials).await?;

	// An OAuth2 client-credentials token the upstream just rejected is
	// refreshed and the call retried exactly once, rather than surfacing a
	// 401 the caller could have avoided.
	let (status, headers_out, text) = if status.as_u16() == 401 && uses_oauth2(record) {
		invalidate_oauth2_tokens(record, &args, ctx).await;
		let retry_credentials = auth::resolve(&record.security, &ctx.credentials, &args, &ctx.token_cache, &ctx.http)
			.await
			.map_err(CallError::Auth)?;
		send_request(record, ctx, &args, &url, &body, retry_credentials).await?
	} else {
		(status, headers_out, text)
	};

	if status.as_u16() >= 400 {
		let parsed_body = serde_json::from_str(&text).unwrap_or(Value::String(text));
		return Err(CallError::Upstream(UpstreamError {
			status: status.as_u16(),
			status_text: status.canonical_reason().unwrap_or("").to_string(),
			body: parsed_body,
			headers: headers_out,
		}));
	}

	match serde_json::from_str::<Value>(&text) {
		Ok(json) => Ok(ToolResult::Json(json)),
		Err(_) => Ok(ToolResult::Raw(text)),
	}
}

fn uses_oauth2(record: &OperationRecord) -> bool {
	record
		.security
		.iter()
		.any(|(scheme, _)| matches!(scheme, crate::compile::SecurityScheme::Oauth2ClientCredentials { .. }))
}

async fn invalidate_oauth2_tokens(record: &OperationRecord, args: &serde_json::Map<String, Value>, ctx: &ServiceContext) {
	for (scheme, _) in &record.security {
		if let crate::compile::SecurityScheme::Oauth2ClientCredentials { token_url } = scheme {
			let client_id = ctx
				.credentials
				.field_value("clientId")
				.or_else(|| args.get("clientId").and_then(|v| v.as_str()).map(str::to_string));
			if let Some(client_id) = client_id {
				ctx.token_cache.invalidate(token_url, &client_id).await;
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn send_request(
	record: &OperationRecord,
	ctx: &ServiceContext,
	args: &serde_json::Map<String, Value>,
	url: &str,
	body: &Option<Value>,
	credentials: auth::CredentialBag,
) -> Result<(reqwest::StatusCode, BTreeMap<String, String>, String), CallError> {
	let mut query: Vec<(String, String)> = credentials.query;
	let mut header_values: Vec<(String, String)> = credentials.headers;
	let mut cookies: Vec<(String, String)> = credentials.cookies;

	for (location, param) in &record.parameters {
		let Some(value) = args.get(&param.name) else {
			continue;
		};
		let Some(as_str) = value_as_string(value) else {
			tracing::warn!(
				tool = %record.qualified_name(),
				parameter = %param.name,
				"parameter value is not a scalar, skipping"
			);
			continue;
		};
		match location {
			ParamLocation::Query => query.push((param.name.clone(), as_str)),
			ParamLocation::Header => header_values.push((param.name.clone(), as_str)),
			ParamLocation::Cookie => cookies.push((param.name.clone(), as_str)),
			ParamLocation::Path => {},
		}
	}

	if !cookies.is_empty() {
		let cookie_header = cookies
			.iter()
			.map(|(k, v)| format!("{k}={v}"))
			.collect::<Vec<_>>()
			.join("; ");
		header_values.push(("Cookie".to_string(), cookie_header));
	}

	let method = to_reqwest_method(record.method);
	let mut builder = ctx.http.request(method, url).timeout(UPSTREAM_TIMEOUT);
	if !query.is_empty() {
		builder = builder.query(&query);
	}
	let mut headers = reqwest::header::HeaderMap::new();
	for (name, value) in &header_values {
		match (
			reqwest::header::HeaderName::try_from(name.as_str()),
			reqwest::header::HeaderValue::from_str(value),
		) {
			(Ok(name), Ok(value)) => {
				headers.insert(name, value);
			},
			_ => tracing::warn!(
				tool = %record.qualified_name(),
				header = %name,
				"invalid header name or value, skipping"
			),
		}
	}
	builder = builder.headers(headers);
	if let Some(body) = body {
		builder = builder.json(body);
	}

	if std::env::var("DEBUG_HTTP").is_ok() {
		tracing::debug!(
			tool = %record.qualified_name(),
			method = %method_name(record.method),
			%url,
			"sending upstream request"
		);
	}

	let response = builder.send().await.map_err(|e| CallError::Transport(e.to_string()))?;

	let status = response.status();
	if std::env::var("DEBUG_HTTP").is_ok() {
		tracing::debug!(
			tool = %record.qualified_name(),
			status = status.as_u16(),
			"received upstream response"
		);
	}
	let mut headers_out = BTreeMap::new();
	for (name, value) in response.headers() {
		if let Ok(v) = value.to_str() {
			headers_out.insert(name.to_string(), v.to_string());
		}
	}
	let text = response.text().await.map_err(|e| CallError::Transport(e.to_string()))?;
	Ok((status, headers_out, text))
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
	match method {
		Method::Get => reqwest::Method::GET,
		Method::Post => reqwest::Method::POST,
		Method::Put => reqwest::Method::PUT,
		Method::Patch => reqwest::Method::PATCH,
		Method::Delete => reqwest::Method::DELETE,
		Method::Head => reqwest::Method::HEAD,
		Method::Options => reqwest::Method::OPTIONS,
	}
}

fn method_name(method: Method) -> &'static str {
	method.as_str()
}

fn value_to_string(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn value_as_string(value: &Value) -> Option<String> {
	match value {
		Value::String(s) => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		_ => None,
	}
}

fn percent_encode(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for byte in raw.bytes() {
		match byte {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
			_ => out.push_str(&format!("%{byte:02X}")),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::compile::{ApiKeyLocation, ParamSpec, SecurityScheme};
	use serde_json::json;
	use wiremock::matchers::{body_json, header, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn ctx() -> ServiceContext {
		ServiceContext {
			credentials: ServiceCredentials::default(),
			http: reqwest::Client::new(),
			token_cache: Arc::new(TokenCache::new()),
		}
	}

	fn base_record(server: &MockServer) -> OperationRecord {
		OperationRecord {
			service: "svc".into(),
			tool_name: "listUsers".into(),
			description: "d".into(),
			method: Method::Get,
			path_template: "/users".into(),
			base_url: server.uri(),
			parameters: vec![],
			has_body: false,
			body_required: false,
			input_schema: json!({"type":"object","properties":{},"required":[]}),
			security: vec![],
		}
	}

	#[tokio::test]
	async fn minimal_get_returns_json() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
			.mount(&server)
			.await;

		let record = base_record(&server);
		let result = invoke(&record, &ctx(), serde_json::Map::new()).await.unwrap();
		match result {
			ToolResult::Json(value) => assert_eq!(value, json!([{"id": 1}])),
			ToolResult::Raw(_) => panic!("expected JSON"),
		}
	}

	#[tokio::test]
	async fn path_and_query_params() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users/7"))
			.and(query_param("verbose", "true"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "7"})))
			.mount(&server)
			.await;

		let mut record = base_record(&server);
		record.path_template = "/users/{id}".into();
		record.parameters = vec![
			(
				ParamLocation::Path,
				ParamSpec {
					name: "id".into(),
					required: true,
					schema: json!({"type": "string"}),
				},
			),
			(
				ParamLocation::Query,
				ParamSpec {
					name: "verbose".into(),
					required: false,
					schema: json!({"type": "boolean"}),
				},
			),
		];

		let mut args = serde_json::Map::new();
		args.insert("id".into(), json!("7"));
		args.insert("verbose".into(), json!(true));
		let result = invoke(&record, &ctx(), args).await.unwrap();
		assert!(matches!(result, ToolResult::Json(_)));

		let missing_id = invoke(&record, &ctx(), serde_json::Map::new()).await;
		assert!(matches!(missing_id, Err(CallError::MissingParameter(field)) if field == "id"));
	}

	#[tokio::test]
	async fn post_with_body() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/users"))
			.and(body_json(json!({"name": "alice"})))
			.respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "u1"})))
			.mount(&server)
			.await;

		let mut record = base_record(&server);
		record.method = Method::Post;
		record.has_body = true;
		record.body_required = true;

		let mut args = serde_json::Map::new();
		args.insert("body".into(), json!({"name": "alice"}));
		let result = invoke(&record, &ctx(), args).await.unwrap();
		match result {
			ToolResult::Json(value) => assert_eq!(value, json!({"id": "u1"})),
			ToolResult::Raw(_) => panic!("expected JSON"),
		}
	}

	#[tokio::test]
	async fn api_key_in_query() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.and(query_param("api_key_query", "secret"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
			.mount(&server)
			.await;

		let mut record = base_record(&server);
		record.security = vec![(
			SecurityScheme::ApiKey {
				location: ApiKeyLocation::Query,
				name: "api_key_query".into(),
			},
			"apiKeyQuery".into(),
		)];

		let mut args = serde_json::Map::new();
		args.insert("api_key_query".into(), json!("secret"));
		let result = invoke(&record, &ctx(), args).await.unwrap();
		assert!(matches!(result, ToolResult::Json(_)));
	}

	#[tokio::test]
	async fn bearer_auth_header() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.and(header("Authorization", "Bearer t"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
			.mount(&server)
			.await;

		let mut record = base_record(&server);
		record.security = vec![(SecurityScheme::HttpBearer, "bearerAuth".into())];

		let mut args = serde_json::Map::new();
		args.insert("bearerToken".into(), json!("t"));
		let result = invoke(&record, &ctx(), args).await.unwrap();
		assert!(matches!(result, ToolResult::Json(_)));
	}

	#[tokio::test]
	async fn retries_once_on_401_with_refreshed_oauth2_token() {
		use crate::auth::ServiceAuthConfig;

		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "stale", "expires_in": 3600})))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fresh", "expires_in": 3600})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.and(header("Authorization", "Bearer stale"))
			.respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "expired"})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.and(header("Authorization", "Bearer fresh"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
			.mount(&server)
			.await;

		let mut record = base_record(&server);
		record.security = vec![(
			SecurityScheme::Oauth2ClientCredentials {
				token_url: format!("{}/token", server.uri()),
			},
			"oauth2".into(),
		)];

		let mut service_ctx = ctx();
		service_ctx.credentials.fields.insert(
			"clientId".into(),
			ServiceAuthConfig {
				value: Some("cid".into()),
				env: None,
			},
		);
		service_ctx.credentials.fields.insert(
			"clientSecret".into(),
			ServiceAuthConfig {
				value: Some("secret".into()),
				env: None,
			},
		);

		let result = invoke(&record, &service_ctx, serde_json::Map::new()).await.unwrap();
		assert!(matches!(result, ToolResult::Json(_)));
	}

	#[tokio::test]
	async fn upstream_400_is_structured() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "Invalid input"})))
			.mount(&server)
			.await;

		let record = base_record(&server);
		let err = invoke(&record, &ctx(), serde_json::Map::new()).await.unwrap_err();
		match err {
			CallError::Upstream(upstream) => {
				assert_eq!(upstream.status, 400);
				assert_eq!(upstream.body, json!({"error": "Invalid input"}));
			},
			_ => panic!("expected UpstreamError"),
		}
	}

	#[tokio::test]
	async fn non_json_response_is_raw_string() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/users"))
			.respond_with(ResponseTemplate::new(200).set_body_string("This is plain text"))
			.mount(&server)
			.await;

		let record = base_record(&server);
		let result = invoke(&record, &ctx(), serde_json::Map::new()).await.unwrap();
		match result {
			ToolResult::Raw(text) => assert_eq!(text, "This is plain text"),
			ToolResult::Json(_) => panic!("expected raw string"),
		}
	}
}
