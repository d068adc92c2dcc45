//! Maps a security scheme plus process configuration into header/query/
//! cookie mutations, and owns the OAuth2 client-credentials token cache
//! with single-flight refresh.

use crate::compile::{ApiKeyLocation, SecurityScheme};
use crate::error::AuthError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// The three mutation targets a scheme can write into, assembled by the
/// tool synthesiser into the outbound request.
#[derive(Debug, Default)]
pub struct CredentialBag {
	pub headers: Vec<(String, String)>,
	pub query: Vec<(String, String)>,
	pub cookies: Vec<(String, String)>,
}

/// A per-service credential source, highest priority first: a
/// host-supplied fixed value, then an environment variable, then (absent
/// both) the caller-supplied argument is used as-is by the synthesiser
/// without broker involvement.
#[derive(Debug, Clone, Default)]
pub struct ServiceAuthConfig {
	pub value: Option<String>,
	pub env: Option<String>,
}

impl ServiceAuthConfig {
	fn resolve(&self) -> Option<String> {
		self
			.value
			.clone()
			.or_else(|| self.env.as_ref().and_then(|name| std::env::var(name).ok()))
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServiceCredentials {
	/// Keyed by credential field name (e.g. `bearerToken`, the apiKey
	/// parameter name, `username`/`password`, `clientId`/`clientSecret`).
	pub fields: HashMap<String, ServiceAuthConfig>,
}

impl ServiceCredentials {
	pub fn has_source_for(&self, scheme: &SecurityScheme) -> bool {
		crate::compile::credential_fields(scheme)
			.iter()
			.all(|field| self.fields.get(field).map(|c| c.resolve().is_some()).unwrap_or(false))
	}

	fn field(&self, name: &str) -> Option<String> {
		self.fields.get(name).and_then(ServiceAuthConfig::resolve)
	}

	/// Public wrapper used by the 401-retry path to learn the client id a
	/// cached OAuth2 token was issued for, without exposing the whole
	/// priority-resolution internals.
	pub fn field_value(&self, name: &str) -> Option<String> {
		self.field(name)
	}
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedToken {
	access_token: String,
	earliest_refetch: Instant,
}

/// Process-wide, keyed by (token endpoint URL, client id). A per-key
/// async mutex gives single-flight refresh: concurrent callers for the
/// same key block on the same lock rather than issuing duplicate token
/// requests.
#[derive(Default)]
pub struct TokenCache {
	entries: Mutex<HashMap<(String, String), Arc<Mutex<Option<CachedToken>>>>>,
}

impl TokenCache {
	pub fn new() -> Self {
		Self::default()
	}

	async fn slot(&self, endpoint: &str, client_id: &str) -> Arc<Mutex<Option<CachedToken>>> {
		let mut entries = self.entries.lock().await;
		entries
			.entry((endpoint.to_string(), client_id.to_string()))
			.or_insert_with(|| Arc::new(Mutex::new(None)))
			.clone()
	}

	/// Drops the cached token for (endpoint, client id) so the next
	/// `acquire_token` call fetches fresh rather than serving a token the
	/// upstream just rejected with 401.
	pub async fn invalidate(&self, endpoint: &str, client_id: &str) {
		let slot = self.slot(endpoint, client_id).await;
		*slot.lock().await = None;
	}
}

/// Resolves every applicable scheme for one operation into a
/// `CredentialBag`, in declared order, consulting `args` (caller-supplied
/// values) where the host has no fixed source configured.
pub async fn resolve(
	schemes: &[(SecurityScheme, String)],
	service_creds: &ServiceCredentials,
	args: &serde_json::Map<String, serde_json::Value>,
	token_cache: &TokenCache,
	http: &reqwest::Client,
) -> Result<CredentialBag, AuthError> {
	let mut bag = CredentialBag::default();
	for (scheme, scheme_name) in schemes {
		apply_scheme(scheme, scheme_name, service_creds, args, token_cache, http, &mut bag).await?;
	}
	Ok(bag)
}

async fn apply_scheme(
	scheme: &SecurityScheme,
	scheme_name: &str,
	service_creds: &ServiceCredentials,
	args: &serde_json::Map<String, serde_json::Value>,
	token_cache: &TokenCache,
	http: &reqwest::Client,
	bag: &mut CredentialBag,
) -> Result<(), AuthError> {
	match scheme {
		SecurityScheme::ApiKey { location, name } => {
			let value = credential_value(service_creds, args, name)?;
			match location {
				ApiKeyLocation::Header => bag.headers.push((name.clone(), value)),
				ApiKeyLocation::Query => bag.query.push((name.clone(), value)),
				ApiKeyLocation::Cookie => bag.cookies.push((name.clone(), value)),
			}
			Ok(())
		},
		SecurityScheme::HttpBearer => {
			let token = credential_value(service_creds, args, "bearerToken")?;
			bag.headers.push(("Authorization".to_string(), format!("Bearer {token}")));
			Ok(())
		},
		SecurityScheme::HttpBasic => {
			let username = credential_value(service_creds, args, "username")?;
			let password = credential_value(service_creds, args, "password")?;
			let encoded = BASE64.encode(format!("{username}:{password}"));
			bag
				.headers
				.push(("Authorization".to_string(), format!("Basic {encoded}")));
			Ok(())
		},
		SecurityScheme::Oauth2ClientCredentials { token_url } => {
			let client_id = credential_value(service_creds, args, "clientId")?;
			let client_secret = credential_value(service_creds, args, "clientSecret")?;
			let token = acquire_token(token_url, &client_id, &client_secret, token_cache, http).await?;
			bag.headers.push(("Authorization".to_string(), format!("Bearer {token}")));
			let _ = scheme_name;
			Ok(())
		},
	}
}

/// Priority: service-specific fixed value/env var, then caller-supplied
/// argument. A missing value after both is an `AuthError`.
fn credential_value(
	service_creds: &ServiceCredentials,
	args: &serde_json::Map<String, serde_json::Value>,
	field: &str,
) -> Result<String, AuthError> {
	if let Some(value) = service_creds.field(field) {
		return Ok(value);
	}
	if let Some(value) = args.get(field).and_then(|v| v.as_str()) {
		return Ok(value.to_string());
	}
	Err(AuthError::MissingArgument(field.to_string()))
}

/// Connect failures against the token endpoint get a bounded, short
/// retry; any other failure (DNS resolved but non-2xx, malformed body) is
/// not retried here and surfaces immediately.
const TOKEN_CONNECT_RETRIES: u32 = 2;
const TOKEN_CONNECT_BACKOFF: Duration = Duration::from_millis(200);

async fn post_token_with_backoff(
	http: &reqwest::Client,
	token_url: &str,
	client_id: &str,
	client_secret: &str,
) -> Result<reqwest::Response, AuthError> {
	let mut attempt = 0;
	loop {
		let result = http
			.post(token_url)
			.form(&[
				("grant_type", "client_credentials"),
				("client_id", client_id),
				("client_secret", client_secret),
			])
			.send()
			.await;
		match result {
			Ok(response) => return Ok(response),
			Err(e) if e.is_connect() && attempt < TOKEN_CONNECT_RETRIES => {
				attempt += 1;
				tokio::time::sleep(TOKEN_CONNECT_BACKOFF * attempt).await;
			},
			Err(e) => {
				return Err(AuthError::TokenEndpointError {
					endpoint: token_url.to_string(),
					message: e.to_string(),
				});
			},
		}
	}
}

async fn acquire_token(
	token_url: &str,
	client_id: &str,
	client_secret: &str,
	token_cache: &TokenCache,
	http: &reqwest::Client,
) -> Result<String, AuthError> {
	let slot = token_cache.slot(token_url, client_id).await;
	let mut guard = slot.lock().await;

	if let Some(cached) = guard.as_ref() {
		if cached.earliest_refetch > Instant::now() {
			return Ok(cached.access_token.clone());
		}
	}

	let response = post_token_with_backoff(http, token_url, client_id, client_secret).await?;

	if !response.status().is_success() {
		return Err(AuthError::TokenEndpointStatus {
			endpoint: token_url.to_string(),
			status: response.status().as_u16(),
		});
	}

	let body: TokenResponse = response.json().await.map_err(|_| AuthError::TokenEndpointMalformed {
		endpoint: token_url.to_string(),
	})?;

	let ttl = Duration::from_secs(body.expires_in.unwrap_or(3600));
	let cached = CachedToken {
		access_token: body.access_token.clone(),
		earliest_refetch: Instant::now() + ttl,
	};
	*guard = Some(cached);
	Ok(body.access_token)
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{body_string_contains, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[tokio::test]
	async fn oauth2_client_credentials_round_trips_and_caches() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("grant_type=client_credentials"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"access_token": "tok-abc",
				"expires_in": 3600,
			})))
			.expect(1)
			.mount(&server)
			.await;

		let token_url = format!("{}/token", server.uri());
		let cache = TokenCache::new();
		let http = reqwest::Client::new();

		let first = acquire_token(&token_url, "cid", "secret", &cache, &http).await.unwrap();
		assert_eq!(first, "tok-abc");

		// Cached: a second call within the TTL must not hit the mock again
		// (the `.expect(1)` above asserts exactly one request landed).
		let second = acquire_token(&token_url, "cid", "secret", &cache, &http).await.unwrap();
		assert_eq!(second, "tok-abc");
	}

	#[test]
	fn basic_auth_header_is_base64_user_colon_pass() {
		let encoded = BASE64.encode("up:p");
		assert_eq!(encoded, "dXA6cA==");
	}

	#[test]
	fn missing_credential_source_is_auth_error() {
		let creds = ServiceCredentials::default();
		let args = serde_json::Map::new();
		let err = credential_value(&creds, &args, "bearerToken").unwrap_err();
		assert!(matches!(err, AuthError::MissingArgument(field) if field == "bearerToken"));
	}
}
