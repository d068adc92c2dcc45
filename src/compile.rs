//! Iterates `paths × methods`, applies include/exclude filters, and
//! produces one immutable `OperationRecord` per surviving operation,
//! including the synthesised `inputSchema`.

use crate::error::CompileError;
use crate::schema::map_schema;
use crate::spec::{resolve_nested_schema, resolve_parameter, resolve_request_body};
use openapiv3::{OpenAPI, Operation, Parameter};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Method {
	Get,
	Post,
	Put,
	Patch,
	Delete,
	Head,
	Options,
}

impl Method {
	pub fn as_str(&self) -> &'static str {
		match self {
			Method::Get => "GET",
			Method::Post => "POST",
			Method::Put => "PUT",
			Method::Patch => "PATCH",
			Method::Delete => "DELETE",
			Method::Head => "HEAD",
			Method::Options => "OPTIONS",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
	Path,
	Query,
	Header,
	Cookie,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
	pub name: String,
	pub required: bool,
	pub schema: Value,
}

/// A scheme reference applicable to one operation. Credential field names
/// are the keys the tool handler and auth resolver look for in call
/// arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SecurityScheme {
	ApiKey {
		location: ApiKeyLocation,
		name: String,
	},
	HttpBearer,
	HttpBasic,
	Oauth2ClientCredentials {
		token_url: String,
	},
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
	Header,
	Query,
	Cookie,
}

/// The compiled, immutable description of one operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
	pub service: String,
	pub tool_name: String,
	pub description: String,
	pub method: Method,
	pub path_template: String,
	pub base_url: String,
	pub parameters: Vec<(ParamLocation, ParamSpec)>,
	pub has_body: bool,
	pub body_required: bool,
	pub input_schema: Value,
	pub security: Vec<(SecurityScheme, String)>,
}

impl OperationRecord {
	pub fn qualified_name(&self) -> String {
		format!("{}.{}", self.service, self.tool_name)
	}

	pub fn path_params(&self) -> impl Iterator<Item = &ParamSpec> {
		self
			.parameters
			.iter()
			.filter(|(loc, _)| *loc == ParamLocation::Path)
			.map(|(_, p)| p)
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filters {
	pub include_tags: Vec<String>,
	pub exclude_tags: Vec<String>,
	pub include_tags_re: Vec<String>,
	pub exclude_tags_re: Vec<String>,
	pub include_ops: Vec<String>,
	pub exclude_ops: Vec<String>,
	pub include_ops_re: Vec<String>,
	pub exclude_ops_re: Vec<String>,
	pub include_paths: Vec<String>,
	pub exclude_paths: Vec<String>,
	pub include_paths_re: Vec<String>,
	pub exclude_paths_re: Vec<String>,
	pub include_text: Option<String>,
	pub exclude_text: Option<String>,
}

struct CompiledFilters {
	tags: DimensionMatch,
	ops: DimensionMatch,
	paths: DimensionMatch,
	include_text: Option<Regex>,
	exclude_text: Option<Regex>,
}

struct DimensionMatch {
	include_exact: BTreeSet<String>,
	exclude_exact: BTreeSet<String>,
	include_re: Vec<Regex>,
	exclude_re: Vec<Regex>,
}

impl DimensionMatch {
	fn compile(
		include_exact: &[String],
		exclude_exact: &[String],
		include_re: &[String],
		exclude_re: &[String],
	) -> Result<Self, CompileError> {
		Ok(Self {
			include_exact: include_exact.iter().map(|s| s.to_lowercase()).collect(),
			exclude_exact: exclude_exact.iter().map(|s| s.to_lowercase()).collect(),
			include_re: compile_all(include_re)?,
			exclude_re: compile_all(exclude_re)?,
		})
	}

	/// `include_exact`/`include_re` restrict: with any inclusion rule
	/// present, candidate must satisfy at least one. Exclusions always
	/// override, regardless of inclusion result.
	fn allows(&self, candidates: &[&str]) -> bool {
		let has_inclusion = !self.include_exact.is_empty() || !self.include_re.is_empty();
		let included = !has_inclusion
			|| candidates.iter().any(|c| {
				self.include_exact.contains(&c.to_lowercase()) || self.include_re.iter().any(|r| r.is_match(c))
			});
		let excluded = candidates.iter().any(|c| {
			self.exclude_exact.contains(&c.to_lowercase()) || self.exclude_re.iter().any(|r| r.is_match(c))
		});
		included && !excluded
	}
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, CompileError> {
	patterns
		.iter()
		.map(|p| Regex::new(p).map_err(|source| CompileError::BadFilterRegex {
			pattern: p.clone(),
			source,
		}))
		.collect()
}

impl CompiledFilters {
	fn compile(filters: &Filters) -> Result<Self, CompileError> {
		Ok(Self {
			tags: DimensionMatch::compile(
				&filters.include_tags,
				&filters.exclude_tags,
				&filters.include_tags_re,
				&filters.exclude_tags_re,
			)?,
			ops: DimensionMatch::compile(
				&filters.include_ops,
				&filters.exclude_ops,
				&filters.include_ops_re,
				&filters.exclude_ops_re,
			)?,
			paths: DimensionMatch::compile(
				&filters.include_paths,
				&filters.exclude_paths,
				&filters.include_paths_re,
				&filters.exclude_paths_re,
			)?,
			include_text: filters
				.include_text
				.as_deref()
				.map(Regex::new)
				.transpose()
				.map_err(|source| CompileError::BadFilterRegex {
					pattern: filters.include_text.clone().unwrap_or_default(),
					source,
				})?,
			exclude_text: filters
				.exclude_text
				.as_deref()
				.map(Regex::new)
				.transpose()
				.map_err(|source| CompileError::BadFilterRegex {
					pattern: filters.exclude_text.clone().unwrap_or_default(),
					source,
				})?,
		})
	}

	fn passes(&self, op: &Operation, path: &str, op_id: &str) -> bool {
		let tags: Vec<&str> = op.tags.iter().map(String::as_str).collect();
		if !self.tags.allows(&tags) {
			return false;
		}
		if !self.ops.allows(&[op_id]) {
			return false;
		}
		if !self.paths.allows(&[path]) {
			return false;
		}
		let combined = format!(
			"{} {}",
			op.summary.as_deref().unwrap_or(""),
			op.description.as_deref().unwrap_or("")
		);
		if let Some(re) = &self.include_text {
			if !re.is_match(&combined) {
				return false;
			}
		}
		if let Some(re) = &self.exclude_text {
			if re.is_match(&combined) {
				return false;
			}
		}
		true
	}
}

const METHODS: &[(Method, fn(&openapiv3::PathItem) -> &Option<Operation>)] = &[
	(Method::Get, |p| &p.get),
	(Method::Post, |p| &p.post),
	(Method::Put, |p| &p.put),
	(Method::Patch, |p| &p.patch),
	(Method::Delete, |p| &p.delete),
	(Method::Head, |p| &p.head),
	(Method::Options, |p| &p.options),
];

/// Credential fields an auth scheme contributes to `inputSchema`, and
/// whether the host has a compile-time credential source for it (which, if
/// present, makes the field optional rather than required; see DESIGN.md
/// Open Question 1).
pub trait CredentialSource {
	fn has_source_for(&self, scheme: &SecurityScheme) -> bool;
}

pub struct NoCredentialSources;
impl CredentialSource for NoCredentialSources {
	fn has_source_for(&self, _scheme: &SecurityScheme) -> bool {
		false
	}
}

pub fn compile(
	service: &str,
	doc: &OpenAPI,
	base_url_override: Option<&str>,
	filters: &Filters,
	credentials: &dyn CredentialSource,
) -> Result<Vec<OperationRecord>, CompileError> {
	let base_url = base_url_override
		.map(str::to_string)
		.or_else(|| doc.servers.first().map(|s| s.url.clone()))
		.ok_or_else(|| CompileError::NoBaseUrl {
			service: service.to_string(),
		})?;

	let compiled_filters = CompiledFilters::compile(filters)?;
	let mut records = Vec::new();
	let mut seen_names = BTreeSet::new();

	for (path, path_item) in doc.paths.iter() {
		let Some(item) = path_item.as_item() else {
			continue;
		};
		for (method, accessor) in METHODS {
			let Some(op) = accessor(item) else {
				continue;
			};
			let op_id = operation_id(op).unwrap_or_else(|| fallback_slug(*method, path));
			if !compiled_filters.passes(op, path, &op_id) {
				continue;
			}

			let tool_name = sanitize_name(&op_id);
			if !seen_names.insert(tool_name.clone()) {
				return Err(CompileError::DuplicateTool {
					service: service.to_string(),
					name: tool_name,
				});
			}

			let record = compile_operation(service, doc, &base_url, path, *method, op, tool_name, credentials)?;
			records.push(record);
		}
	}

	Ok(records)
}

fn operation_id(op: &Operation) -> Option<String> {
	if let Some(id) = &op.operation_id {
		return Some(id.clone());
	}
	op.extensions
		.get("x-eov-operation-id")
		.and_then(|v| v.as_str())
		.map(str::to_string)
}

/// Sanitises a raw identifier to `[A-Za-z0-9_.:-]`, then replaces dots
/// with underscores.
pub fn sanitize_name(raw: &str) -> String {
	let filtered: String = raw
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-') {
				c
			} else {
				'_'
			}
		})
		.collect();
	filtered.replace('.', "_")
}

/// Deterministic fallback slug for operations without an operationId,
/// named as `method_path` with path separators normalised.
pub fn fallback_slug(method: Method, path: &str) -> String {
	let path_part: String = path
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
		.collect();
	format!("{}_{}", method.as_str().to_lowercase(), path_part.trim_matches('_'))
}

fn compile_operation(
	service: &str,
	doc: &OpenAPI,
	base_url: &str,
	path: &str,
	method: Method,
	op: &Operation,
	tool_name: String,
	credentials: &dyn CredentialSource,
) -> Result<OperationRecord, CompileError> {
	let mut properties = Map::new();
	let mut required = Vec::new();
	let mut parameters = Vec::new();

	for param_ref in &op.parameters {
		let param = resolve_parameter(param_ref, doc)?;
		let (name, location, schema, is_required) = build_param(doc, param)?;
		properties.insert(name.clone(), schema.clone());
		if is_required {
			required.push(name.clone());
		}
		parameters.push((
			location,
			ParamSpec {
				name,
				required: is_required,
				schema,
			},
		));
	}

	let (has_body, body_required) = match &op.request_body {
		Some(body_ref) => {
			let body = resolve_request_body(body_ref, doc)?;
			let json_schema = body
				.content
				.get("application/json")
				.or_else(|| body.content.get("application/x-www-form-urlencoded"))
				.and_then(|media| media.schema.as_ref());
			match json_schema {
				Some(schema_ref) => {
					let resolved = resolve_nested_schema(schema_ref, doc)?;
					properties.insert("body".to_string(), map_schema(&resolved));
					if body.required {
						required.push("body".to_string());
					}
					(true, body.required)
				},
				None => (false, false),
			}
		},
		None => (false, false),
	};

	let security = resolve_security(doc, op);
	for (scheme, _scheme_name) in &security {
		let fields = credential_fields(scheme);
		let required_field = !credentials.has_source_for(scheme);
		for field in fields {
			properties
				.entry(field.clone())
				.or_insert_with(|| json!({"type": "string"}));
			if required_field && !required.contains(&field) {
				required.push(field);
			}
		}
	}

	let input_schema = json!({
		"type": "object",
		"properties": Value::Object(properties),
		"required": required,
	});

	let description = op
		.description
		.clone()
		.or_else(|| op.summary.clone())
		.unwrap_or_else(|| tool_name.clone());

	Ok(OperationRecord {
		service: service.to_string(),
		tool_name,
		description,
		method,
		path_template: path.to_string(),
		base_url: base_url.to_string(),
		parameters,
		has_body,
		body_required,
		input_schema,
		security,
	})
}

fn build_param(
	doc: &OpenAPI,
	param: &Parameter,
) -> Result<(String, ParamLocation, Value, bool), CompileError> {
	let data = param.parameter_data_ref();
	let schema = match &data.format {
		openapiv3::ParameterSchemaOrContent::Schema(reference) => {
			let resolved = resolve_nested_schema(reference, doc)?;
			let mut mapped = map_schema(&resolved);
			if let (Some(desc), Some(obj)) = (&data.description, mapped.as_object_mut()) {
				obj.insert("description".to_string(), json!(desc));
			}
			mapped
		},
		openapiv3::ParameterSchemaOrContent::Content(_) => json!({"type": "string"}),
	};
	let location = match param {
		Parameter::Path { .. } => ParamLocation::Path,
		Parameter::Query { .. } => ParamLocation::Query,
		Parameter::Header { .. } => ParamLocation::Header,
		Parameter::Cookie { .. } => ParamLocation::Cookie,
	};
	Ok((data.name.clone(), location, schema, data.required))
}

fn resolve_security(doc: &OpenAPI, op: &Operation) -> Vec<(SecurityScheme, String)> {
	let requirements = op
		.security
		.as_ref()
		.or(doc.security.as_ref().filter(|_| op.security.is_none()));
	let Some(requirements) = requirements else {
		return Vec::new();
	};
	let Some(components) = &doc.components else {
		return Vec::new();
	};

	let mut out = Vec::new();
	for requirement in requirements {
		for scheme_name in requirement.keys() {
			let Some(openapiv3::ReferenceOr::Item(scheme)) = components.security_schemes.get(scheme_name)
			else {
				continue;
			};
			if let Some(mapped) = map_security_scheme(scheme) {
				out.push((mapped, scheme_name.clone()));
			}
		}
	}
	out
}

fn map_security_scheme(scheme: &openapiv3::SecurityScheme) -> Option<SecurityScheme> {
	use openapiv3::{APIKeyLocation, SecurityScheme as S};
	match scheme {
		S::APIKey { location, name, .. } => Some(SecurityScheme::ApiKey {
			location: match location {
				APIKeyLocation::Header => ApiKeyLocation::Header,
				APIKeyLocation::Query => ApiKeyLocation::Query,
				APIKeyLocation::Cookie => ApiKeyLocation::Cookie,
			},
			name: name.clone(),
		}),
		S::HTTP { scheme: kind, .. } if kind.eq_ignore_ascii_case("bearer") => Some(SecurityScheme::HttpBearer),
		S::HTTP { scheme: kind, .. } if kind.eq_ignore_ascii_case("basic") => Some(SecurityScheme::HttpBasic),
		S::HTTP { .. } => None,
		S::OAuth2 { flows, .. } => flows
			.client_credentials
			.as_ref()
			.map(|flow| SecurityScheme::Oauth2ClientCredentials {
				token_url: flow.token_url.clone(),
			}),
		S::OpenIDConnect { .. } | S::MutualTLS { .. } => None,
	}
}

pub fn credential_fields(scheme: &SecurityScheme) -> Vec<String> {
	match scheme {
		SecurityScheme::ApiKey { name, .. } => vec![name.clone()],
		SecurityScheme::HttpBearer => vec!["bearerToken".to_string()],
		SecurityScheme::HttpBasic => vec!["username".to_string(), "password".to_string()],
		SecurityScheme::Oauth2ClientCredentials { .. } => {
			vec!["clientId".to_string(), "clientSecret".to_string()]
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitizes_dots_and_symbols() {
		assert_eq!(sanitize_name("users.list"), "users_list");
		assert_eq!(sanitize_name("users list!"), "users_list_");
	}

	#[test]
	fn fallback_slug_is_deterministic() {
		assert_eq!(fallback_slug(Method::Get, "/users/{id}"), "get_users__id_");
	}

	#[test]
	fn dimension_match_inclusion_is_restrictive() {
		let dim = DimensionMatch::compile(&["billing".to_string()], &[], &[], &[]).unwrap();
		assert!(dim.allows(&["billing"]));
		assert!(!dim.allows(&["shipping"]));
	}

	#[test]
	fn dimension_match_exclusion_overrides_inclusion() {
		let dim = DimensionMatch::compile(
			&["billing".to_string()],
			&["billing".to_string()],
			&[],
			&[],
		)
		.unwrap();
		assert!(!dim.allows(&["billing"]));
	}

	#[test]
	fn compile_uses_fallback_slug_when_operation_id_missing() {
		let doc: OpenAPI = serde_json::from_value(json!({
			"openapi": "3.0.0",
			"info": {"title": "t", "version": "1"},
			"servers": [{"url": "https://api.example.com"}],
			"paths": {
				"/widgets": {
					"get": {
						"responses": {"200": {"description": "ok"}}
					}
				}
			}
		}))
		.unwrap();

		let records = compile("svc", &doc, None, &Filters::default(), &NoCredentialSources).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].tool_name, "get_widgets");
	}

	#[test]
	fn credential_fields_match_scheme_kind() {
		assert_eq!(
			credential_fields(&SecurityScheme::HttpBasic),
			vec!["username", "password"]
		);
		assert_eq!(
			credential_fields(&SecurityScheme::Oauth2ClientCredentials {
				token_url: "https://auth/token".into()
			}),
			vec!["clientId", "clientSecret"]
		);
	}
}
