//! `services.json` shape, environment variable defaults, and `${ENV}`
//! interpolation applied before any value is used. Centralising the env
//! reads here (rather than scattering `std::env::var` calls through the
//! component modules) reads configuration once into a typed struct with
//! `#[serde(default)]` fields.

use crate::compile::Filters;
use crate::policy::{AuditSink, FileAuditSink, LogFormat, NoopAuditSink, PolicyConfig};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
	pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
	pub name: String,
	#[serde(default = "default_service_type")]
	pub r#type: String,
	pub spec_file: Option<String>,
	pub spec_url: Option<String>,
	pub base_url: Option<String>,
	#[serde(default)]
	pub auth: Option<ServiceAuthEntry>,
	#[serde(default)]
	pub filters: Filters,
	/// DESIGN.md Open Question 2: whether to still register (and fail at
	/// call time) or skip entirely when no credential source is available.
	#[serde(default)]
	pub on_missing_credentials: OnMissingCredentials,
}

fn default_service_type() -> String {
	"openapi".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissingCredentials {
	#[default]
	Register,
	Skip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAuthEntry {
	pub kind: String,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub r#in: Option<String>,
	#[serde(default)]
	pub env: Option<String>,
	#[serde(default)]
	pub value: Option<String>,
}

pub fn load_host_config(path: &std::path::Path) -> Result<HostConfig, String> {
	let raw = std::fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
	let mut value: serde_json::Value =
		serde_json::from_str(&raw).map_err(|e| format!("parsing {}: {e}", path.display()))?;
	let env: HashMap<String, String> = std::env::vars().collect();
	crate::spec::interpolate_env(&mut value, &env);
	serde_json::from_value(value).map_err(|e| format!("decoding {}: {e}", path.display()))
}

/// Environment-variable defaults recognised by the core.
pub fn policy_config_from_env() -> PolicyConfig {
	let mut config = PolicyConfig::default();
	if let Ok(v) = std::env::var("ALLOWED_METHODS") {
		config.allowed_methods = v.split(',').map(|s| s.trim().to_uppercase()).collect();
	}
	if let Ok(v) = std::env::var("ALLOWED_PATHS") {
		config.allowed_paths = v.split(',').map(|s| s.trim().to_string()).collect();
	}
	if let Ok(v) = std::env::var("RATE_LIMIT").and_then(|s| s.parse::<u32>().map_err(|_| std::env::VarError::NotPresent)) {
		config.rate_limit = v;
	}
	if let Ok(v) = std::env::var("RATE_WINDOW_MS").and_then(|s| s.parse::<u64>().map_err(|_| std::env::VarError::NotPresent)) {
		config.rate_window_ms = v;
	}
	if let Ok(v) = std::env::var("RATE_LIMIT_BURST").and_then(|s| s.parse::<u32>().map_err(|_| std::env::VarError::NotPresent)) {
		config.rate_limit_burst = Some(v);
	}
	if let Ok(v) = std::env::var("CONCURRENCY").and_then(|s| s.parse::<usize>().map_err(|_| std::env::VarError::NotPresent)) {
		config.concurrency = Some(v);
	}
	if let Ok(v) = std::env::var("CONCURRENCY_PER_PATH").and_then(|s| s.parse::<usize>().map_err(|_| std::env::VarError::NotPresent)) {
		config.concurrency_per_path = Some(v);
	}
	config
}

/// Builds the audit sink from `LOG_FILE`/`LOG_MAX_SIZE`/`LOG_MAX_FILES`/
/// `LOG_FORMAT`. With no `LOG_FILE` set, the sink is a no-op; a `LOG_FILE`
/// that fails to open falls back to no-op with a stderr warning rather
/// than blocking startup over an audit-logging misconfiguration.
pub fn audit_sink_from_env() -> Box<dyn AuditSink> {
	let Ok(path) = std::env::var("LOG_FILE") else {
		return Box::new(NoopAuditSink);
	};
	let max_size = std::env::var("LOG_MAX_SIZE")
		.ok()
		.and_then(|v| v.parse::<u64>().ok())
		.unwrap_or(10 * 1024 * 1024);
	let max_files = std::env::var("LOG_MAX_FILES")
		.ok()
		.and_then(|v| v.parse::<u32>().ok())
		.unwrap_or(5);
	let format = std::env::var("LOG_FORMAT")
		.ok()
		.and_then(|v| v.parse::<LogFormat>().ok())
		.unwrap_or(LogFormat::Json);

	match FileAuditSink::open(&path, max_size, max_files, format) {
		Ok(sink) => Box::new(sink),
		Err(e) => {
			eprintln!("audit log: failed to open {path}: {e}, falling back to no-op");
			Box::new(NoopAuditSink)
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_service_entry() {
		let raw = r#"{"services":[{"name":"svc","specFile":"./openapi.json"}]}"#;
		let value: serde_json::Value = serde_json::from_str(raw).unwrap();
		let config: HostConfig = serde_json::from_value(value).unwrap();
		assert_eq!(config.services.len(), 1);
		assert_eq!(config.services[0].name, "svc");
		assert_eq!(config.services[0].r#type, "openapi");
	}
}
