//! Loads an OpenAPI document from a file or URL and fully dereferences it.
//! `openapiv3` parses the document's own JSON/YAML shape; this module
//! additionally resolves `$ref`s `openapiv3` leaves as `ReferenceOr::Reference`
//! against `components`, sharing resolved subtrees so reference cycles
//! terminate rather than inlining forever.

use crate::error::SpecError;
use openapiv3::{OpenAPI, Parameter, ReferenceOr, RequestBody, Schema};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub enum Source {
	File(std::path::PathBuf),
	Url(String),
}

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn load(source: &Source) -> Result<OpenAPI, SpecError> {
	let body = match source {
		Source::File(path) => read_file(path)?,
		Source::Url(url) => fetch_url(url).await?,
	};
	decode(&body)
}

fn read_file(path: &Path) -> Result<String, SpecError> {
	std::fs::read_to_string(path).map_err(|source| SpecError::Io {
		path: path.display().to_string(),
		source,
	})
}

async fn fetch_url(url: &str) -> Result<String, SpecError> {
	let client = reqwest::Client::builder()
		.timeout(FETCH_TIMEOUT)
		.redirect(reqwest::redirect::Policy::limited(5))
		.build()
		.map_err(|source| SpecError::Fetch {
			url: url.to_string(),
			source,
		})?;

	let response = client
		.get(url)
		.header(
			reqwest::header::ACCEPT,
			"application/json, application/yaml, text/javascript",
		)
		.send()
		.await
		.map_err(|source| {
			if source.is_timeout() {
				SpecError::FetchTimeout {
					url: url.to_string(),
				}
			} else {
				SpecError::Fetch {
					url: url.to_string(),
					source,
				}
			}
		})?;

	if !response.status().is_success() {
		return Err(SpecError::FetchStatus {
			url: url.to_string(),
			status: response.status().as_u16(),
		});
	}

	response.text().await.map_err(|source| SpecError::Fetch {
		url: url.to_string(),
		source,
	})
}

/// Decodes a spec body as JSON, YAML, or an embedded Swagger-UI bootstrap
/// script, sniffing the first non-whitespace character to decide.
fn decode(body: &str) -> Result<OpenAPI, SpecError> {
	let trimmed = body.trim_start();
	match trimmed.chars().next() {
		Some('{') | Some('[') => Ok(serde_json::from_str(body)?),
		_ => {
			if let Ok(doc) = serde_yaml::from_str(body) {
				return Ok(doc);
			}
			extract_swagger_doc(body)
		},
	}
}

/// Locates the first `swaggerDoc` identifier in a JavaScript bootstrap
/// body, whether written as a quoted object key (`"swaggerDoc": {...}`) or
/// a bare variable declaration (`const swaggerDoc = {...}`, `var
/// swaggerDoc = {...}`), and extracts the balanced-brace JSON object that
/// follows it, tracking string literals and escapes so braces inside
/// string values don't terminate the scan early.
fn extract_swagger_doc(body: &str) -> Result<OpenAPI, SpecError> {
	let key_pos = find_identifier(body, "swaggerDoc").ok_or(SpecError::UndecodableBody)?;
	let mut rest = body[key_pos + "swaggerDoc".len()..].trim_start();
	if let Some(stripped) = rest.strip_prefix('"') {
		rest = stripped.trim_start();
	}
	let sep_pos = rest.find([':', '=']).ok_or(SpecError::UndecodableBody)?;
	let after_sep = rest[sep_pos + 1..].trim_start();
	if !after_sep.starts_with('{') {
		return Err(SpecError::UndecodableBody);
	}

	let bytes = after_sep.as_bytes();
	let mut depth = 0i32;
	let mut in_string = false;
	let mut escaped = false;
	let mut end = None;
	for (i, &b) in bytes.iter().enumerate() {
		if in_string {
			if escaped {
				escaped = false;
			} else if b == b'\\' {
				escaped = true;
			} else if b == b'"' {
				in_string = false;
			}
			continue;
		}
		match b {
			b'"' => in_string = true,
			b'{' => depth += 1,
			b'}' => {
				depth -= 1;
				if depth == 0 {
					end = Some(i + 1);
					break;
				}
			},
			_ => {},
		}
	}
	let end = end.ok_or(SpecError::UndecodableBody)?;
	let json_slice = &after_sep[..end];
	Ok(serde_json::from_str(json_slice)?)
}

/// Finds the first occurrence of `word` in `body` that isn't part of a
/// larger identifier (so `swaggerDoc` matches `const swaggerDoc = ` but
/// not, say, `mySwaggerDocThing`).
fn find_identifier(body: &str, word: &str) -> Option<usize> {
	let bytes = body.as_bytes();
	let mut start = 0;
	while let Some(rel) = body[start..].find(word) {
		let pos = start + rel;
		let before_ok = pos == 0 || !is_identifier_byte(bytes[pos - 1]);
		let after = pos + word.len();
		let after_ok = after >= bytes.len() || !is_identifier_byte(bytes[after]);
		if before_ok && after_ok {
			return Some(pos);
		}
		start = pos + word.len();
	}
	None
}

fn is_identifier_byte(b: u8) -> bool {
	b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Resolves a schema reference against `doc.components`, recursively
/// following chained references (a schema whose body is itself a
/// reference).
pub fn resolve_schema<'a>(
	reference: &'a ReferenceOr<Schema>,
	doc: &'a OpenAPI,
) -> Result<&'a Schema, SpecError> {
	match reference {
		ReferenceOr::Reference { reference } => {
			let name = reference
				.strip_prefix("#/components/schemas/")
				.ok_or_else(|| SpecError::InvalidReference(reference.clone()))?;
			let components = doc.components.as_ref().ok_or(SpecError::MissingComponents)?;
			let schema = components
				.schemas
				.get(name)
				.ok_or_else(|| SpecError::MissingReference(name.to_string()))?;
			resolve_schema(schema, doc)
		},
		ReferenceOr::Item(schema) => Ok(schema),
	}
}

/// Recursively resolves every nested `$ref` inside a schema, returning an
/// owned tree with no remaining references. Already-visited reference
/// names are tracked so that a schema referring back to an ancestor shares
/// that ancestor's (partially resolved) shape instead of diverging.
pub fn resolve_nested_schema(reference: &ReferenceOr<Schema>, doc: &OpenAPI) -> Result<Schema, SpecError> {
	resolve_nested_schema_inner(reference, doc, &mut Vec::new())
}

fn resolve_nested_schema_inner(
	reference: &ReferenceOr<Schema>,
	doc: &OpenAPI,
	path: &mut Vec<String>,
) -> Result<Schema, SpecError> {
	let pushed = if let ReferenceOr::Reference { reference: name } = reference {
		if path.contains(name) {
			// Cycle within the current resolution path: stop descending and
			// hand back the one-level-resolved shape rather than inlining
			// forever. Siblings that reference the same schema from a
			// different branch are unaffected since `path` tracks ancestry,
			// not every reference seen so far.
			return resolve_schema(reference, doc).cloned();
		}
		path.push(name.clone());
		true
	} else {
		false
	};

	let base = resolve_schema(reference, doc)?;
	let mut resolved = base.clone();
	use openapiv3::{SchemaKind, Type};
	match &mut resolved.schema_kind {
		SchemaKind::Type(Type::Object(obj)) => {
			for prop in obj.properties.values_mut() {
				let owned = (**prop.as_ref_or_clone_item()).clone();
				let resolved_prop = resolve_nested_schema_inner(&ReferenceOr::Item(owned), doc, path)?;
				*prop = ReferenceOr::Item(Box::new(resolved_prop));
			}
		},
		SchemaKind::Type(Type::Array(arr)) => {
			if let Some(items) = arr.items.as_mut() {
				let owned = (**items.as_ref_or_clone_item()).clone();
				let resolved_items = resolve_nested_schema_inner(&ReferenceOr::Item(owned), doc, path)?;
				*items = ReferenceOr::Item(Box::new(resolved_items));
			}
		},
		SchemaKind::OneOf { one_of } => resolve_list(one_of, doc, path)?,
		SchemaKind::AllOf { all_of } => resolve_list(all_of, doc, path)?,
		SchemaKind::AnyOf { any_of } => resolve_list(any_of, doc, path)?,
		SchemaKind::Not { .. } | SchemaKind::Type(_) | SchemaKind::Any(_) => {},
	}
	if pushed {
		path.pop();
	}
	Ok(resolved)
}

fn resolve_list(
	list: &mut [ReferenceOr<Schema>],
	doc: &OpenAPI,
	path: &mut Vec<String>,
) -> Result<(), SpecError> {
	for entry in list.iter_mut() {
		let resolved = resolve_nested_schema_inner(entry, doc, path)?;
		*entry = ReferenceOr::Item(resolved);
	}
	Ok(())
}

/// Small helper so boxed and unboxed `ReferenceOr<Schema>` clone the same
/// way at call sites above without duplicating the match.
trait AsRefOrCloneItem {
	fn as_ref_or_clone_item(&self) -> &Box<Schema>;
}

impl AsRefOrCloneItem for ReferenceOr<Box<Schema>> {
	fn as_ref_or_clone_item(&self) -> &Box<Schema> {
		match self {
			ReferenceOr::Item(boxed) => boxed,
			ReferenceOr::Reference { .. } => {
				// Only called after the caller already branched on a
				// resolved schema; unreachable in practice for well-formed
				// documents produced by resolve_schema.
				unreachable!("reference passed where a resolved item was expected")
			},
		}
	}
}

pub fn resolve_parameter<'a>(
	reference: &'a ReferenceOr<Parameter>,
	doc: &'a OpenAPI,
) -> Result<&'a Parameter, SpecError> {
	match reference {
		ReferenceOr::Reference { reference } => {
			let name = reference
				.strip_prefix("#/components/parameters/")
				.ok_or_else(|| SpecError::InvalidReference(reference.clone()))?;
			let components = doc.components.as_ref().ok_or(SpecError::MissingComponents)?;
			let parameter = components
				.parameters
				.get(name)
				.ok_or_else(|| SpecError::MissingReference(name.to_string()))?;
			resolve_parameter(parameter, doc)
		},
		ReferenceOr::Item(parameter) => Ok(parameter),
	}
}

pub fn resolve_request_body<'a>(
	reference: &'a ReferenceOr<RequestBody>,
	doc: &'a OpenAPI,
) -> Result<&'a RequestBody, SpecError> {
	match reference {
		ReferenceOr::Reference { reference } => {
			let name = reference
				.strip_prefix("#/components/requestBodies/")
				.ok_or_else(|| SpecError::InvalidReference(reference.clone()))?;
			let components = doc.components.as_ref().ok_or(SpecError::MissingComponents)?;
			let body = components
				.request_bodies
				.get(name)
				.ok_or_else(|| SpecError::MissingReference(name.to_string()))?;
			resolve_request_body(body, doc)
		},
		ReferenceOr::Item(body) => Ok(body),
	}
}

/// Recursively expands `${VAR}` occurrences against the process
/// environment in every string value of a JSON tree (host configuration).
/// Unknown variables are left as the literal `${VAR}` text rather than
/// erroring, so a missing optional credential doesn't block startup.
pub fn interpolate_env(value: &mut serde_json::Value, env: &HashMap<String, String>) {
	match value {
		serde_json::Value::String(s) => {
			*s = interpolate_str(s, env);
		},
		serde_json::Value::Array(items) => {
			for item in items {
				interpolate_env(item, env);
			}
		},
		serde_json::Value::Object(map) => {
			for v in map.values_mut() {
				interpolate_env(v, env);
			}
		},
		_ => {},
	}
}

fn interpolate_str(input: &str, env: &HashMap<String, String>) -> String {
	let mut out = String::with_capacity(input.len());
	let mut rest = input;
	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		if let Some(end) = after.find('}') {
			let name = &after[..end];
			match env.get(name) {
				Some(value) => out.push_str(value),
				None => {
					out.push_str("${");
					out.push_str(name);
					out.push('}');
				},
			}
			rest = &after[end + 1..];
		} else {
			out.push_str("${");
			rest = after;
		}
	}
	out.push_str(rest);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_json_body() {
		let body = r#"{"openapi":"3.0.0","info":{"title":"t","version":"1"},"paths":{}}"#;
		let doc = decode(body).unwrap();
		assert_eq!(doc.openapi, "3.0.0");
	}

	#[test]
	fn decodes_yaml_body() {
		let body = "openapi: 3.0.0\ninfo:\n  title: t\n  version: '1'\npaths: {}\n";
		let doc = decode(body).unwrap();
		assert_eq!(doc.openapi, "3.0.0");
	}

	#[test]
	fn extracts_embedded_swagger_doc() {
		let body = r#"
			window.onload = function() {
				const swaggerDoc = {"openapi":"3.0.0","info":{"title":"t","version":"1","x":"}"},"paths":{}};
				SwaggerUIBundle({ swaggerDoc: swaggerDoc });
			};
		"#;
		let doc = decode(body).unwrap();
		assert_eq!(doc.openapi, "3.0.0");
	}

	#[test]
	fn extracts_quoted_swagger_doc_key() {
		let body = r#"
			SwaggerUIBundle({ "swaggerDoc": {"openapi":"3.0.0","info":{"title":"t","version":"1"},"paths":{}} });
		"#;
		let doc = decode(body).unwrap();
		assert_eq!(doc.openapi, "3.0.0");
	}

	#[test]
	fn rejects_undecodable_body() {
		let err = decode("not json, not yaml, no swaggerDoc here").unwrap_err();
		assert!(matches!(err, SpecError::UndecodableBody) || matches!(err, SpecError::Yaml(_)));
	}

	#[test]
	fn interpolates_known_and_leaves_unknown() {
		let mut env = HashMap::new();
		env.insert("HOST".to_string(), "api.example.com".to_string());
		let mut value = serde_json::json!({"url": "https://${HOST}/v1", "token": "${MISSING}"});
		interpolate_env(&mut value, &env);
		assert_eq!(value["url"], "https://api.example.com/v1");
		assert_eq!(value["token"], "${MISSING}");
	}
}
