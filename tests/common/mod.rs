//! Shared end-to-end harness: writes a minimal OpenAPI document to a temp
//! file, points a single-service host configuration at it plus a wiremock
//! backend, and builds a real `Host` the way `main.rs` does, spinning up
//! the real server from a config value instead of mocking its internals.

use serde_json::json;
use std::io::Write;
use toolbridge::config::{HostConfig, OnMissingCredentials, ServiceAuthEntry, ServiceEntry};
use toolbridge::policy::{NoopAuditSink, PolicyConfig};

pub struct Harness {
	pub backend: wiremock::MockServer,
	pub host: toolbridge::host::Host,
	_spec_file: tempfile::NamedTempFile,
}

pub async fn petstore_like(backend: &wiremock::MockServer) -> tempfile::NamedTempFile {
	let doc = json!({
		"openapi": "3.0.0",
		"info": { "title": "pets", "version": "1.0.0" },
		"servers": [{ "url": backend.uri() }],
		"paths": {
			"/pets/{petId}": {
				"get": {
					"operationId": "getPet",
					"parameters": [{
						"name": "petId",
						"in": "path",
						"required": true,
						"schema": { "type": "string" }
					}],
					"responses": { "200": { "description": "ok" } }
				}
			},
			"/pets": {
				"post": {
					"operationId": "createPet",
					"requestBody": {
						"required": true,
						"content": {
							"application/json": {
								"schema": {
									"type": "object",
									"properties": { "name": { "type": "string" } },
									"required": ["name"]
								}
							}
						}
					},
					"responses": { "201": { "description": "created" } }
				}
			}
		}
	});

	let mut file = tempfile::NamedTempFile::new().expect("create temp spec file");
	file.write_all(serde_json::to_string(&doc).unwrap().as_bytes()).unwrap();
	file.flush().unwrap();
	file
}

impl Harness {
	pub async fn build() -> Self {
		let backend = wiremock::MockServer::start().await;
		let spec_file = petstore_like(&backend).await;

		let config = HostConfig {
			services: vec![ServiceEntry {
				name: "pets".to_string(),
				r#type: "openapi".to_string(),
				spec_file: Some(spec_file.path().to_string_lossy().to_string()),
				spec_url: None,
				base_url: None,
				auth: None::<ServiceAuthEntry>,
				filters: Default::default(),
				on_missing_credentials: OnMissingCredentials::Register,
			}],
		};

		let host = toolbridge::host::build(config, Box::new(NoopAuditSink), PolicyConfig::default()).await;

		Harness {
			backend,
			host,
			_spec_file: spec_file,
		}
	}
}
