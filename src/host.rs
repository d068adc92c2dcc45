//! Reads the multi-service configuration, wires spec loading through tool
//! synthesis per service, installs tools into the registry, and starts
//! whichever transports were requested, tolerating partial failure across
//! services exactly as `main.rs`'s per-service `JoinSet` loop tolerates a
//! single connection failure without aborting the others.

use crate::auth::{ServiceCredentials, TokenCache};
use crate::compile::{self, CredentialSource, SecurityScheme};
use crate::config::{HostConfig, OnMissingCredentials, ServiceAuthEntry, ServiceEntry};
use crate::error::CallError;
use crate::policy::{AuditSink, PolicyConfig, PolicyEngine, PolicyOutcome};
use crate::registry::{Registry, RegistryBuilder};
use crate::spec::{self, Source};
use crate::tool::{self, ServiceContext, Tool, ToolDescriptor, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Host {
	pub registry: Registry,
	policy: PolicyEngine,
	contexts: HashMap<String, Arc<ServiceContext>>,
}

impl Host {
	pub async fn call_tool(
		&self,
		qualified_name: &str,
		arguments: serde_json::Map<String, serde_json::Value>,
	) -> Result<ToolResult, PolicyOutcome<CallError>> {
		let tool = self.registry.lookup(qualified_name).map_err(PolicyOutcome::Call)?;
		let ctx = self
			.contexts
			.get(&tool.record.service)
			.expect("service context registered for every installed tool")
			.clone();

		let record = tool.record.clone();
		let has_query = arguments.keys().any(|k| {
			record
				.parameters
				.iter()
				.any(|(loc, p)| *loc == crate::compile::ParamLocation::Query && p.name == *k)
		});

		self
			.policy
			.enforce_and_call(record.method.as_str(), &record.path_template, has_query, || {
				let record = record.clone();
				let ctx = ctx.clone();
				async move { tool::invoke(&record, &ctx, arguments).await }
			})
			.await
	}
}

struct EntryCredentialSource<'a> {
	entry: &'a ServiceAuthEntry,
}

impl CredentialSource for EntryCredentialSource<'_> {
	fn has_source_for(&self, scheme: &SecurityScheme) -> bool {
		match scheme {
			SecurityScheme::ApiKey { .. } => self.entry.kind == "apiKey",
			SecurityScheme::HttpBearer => self.entry.kind == "bearer",
			SecurityScheme::HttpBasic => self.entry.kind == "basic",
			SecurityScheme::Oauth2ClientCredentials { .. } => self.entry.kind == "oauth2",
		}
		&& (self.entry.env.is_some() || self.entry.value.is_some())
	}
}

fn build_service_credentials(schemes: &[(SecurityScheme, String)], entry: Option<&ServiceAuthEntry>) -> ServiceCredentials {
	let mut creds = ServiceCredentials::default();
	let Some(entry) = entry else { return creds };
	for (scheme, _) in schemes {
		for field in compile::credential_fields(scheme) {
			creds.fields.insert(
				field,
				crate::auth::ServiceAuthConfig {
					value: entry.value.clone(),
					env: entry.env.clone(),
				},
			);
		}
	}
	creds
}

/// Builds and wires the full host from a configuration document. Every
/// service that fails to load is logged as a warning and skipped; the
/// process starts with whatever succeeded.
pub async fn build(config: HostConfig, audit_sink: Box<dyn AuditSink>, policy_config: PolicyConfig) -> Host {
	let mut builder = RegistryBuilder::new();
	let mut contexts = HashMap::new();

	for entry in &config.services {
		match load_service(entry).await {
			Ok((tools, ctx)) => {
				if tools.is_empty() {
					continue;
				}
				if let Err(duplicate) = builder.register(tools) {
					tracing::warn!(service = %entry.name, tool = %duplicate, "duplicate tool name, service skipped");
					continue;
				}
				contexts.insert(entry.name.clone(), Arc::new(ctx));
			},
			Err(message) => {
				tracing::warn!(service = %entry.name, error = %message, "service failed to load, continuing with the rest");
			},
		}
	}

	let registry = builder.build();
	let policy = PolicyEngine::new(policy_config, audit_sink);
	Host { registry, policy, contexts }
}

async fn load_service(entry: &ServiceEntry) -> Result<(Vec<Tool>, ServiceContext), String> {
	if entry.r#type != "openapi" {
		return Err(format!("service type {} is not supported by this bridge", entry.r#type));
	}

	let source = match (&entry.spec_file, &entry.spec_url) {
		(Some(file), None) => Source::File(std::path::PathBuf::from(file)),
		(None, Some(url)) => Source::Url(url.clone()),
		_ => return Err("exactly one of specFile or specUrl is required".to_string()),
	};

	let doc = spec::load(&source).await.map_err(|e| e.to_string())?;

	// Credential availability is resolved before compilation so operations
	// can mark auth fields optional-vs-required correctly (DESIGN.md Open
	// Question 1).
	let probe = entry.auth.as_ref().map(|auth| EntryCredentialSource { entry: auth });
	let no_sources = compile::NoCredentialSources;
	let credential_source: &dyn CredentialSource = probe.as_ref().map_or(&no_sources, |p| p as &dyn CredentialSource);

	let records = compile::compile(
		&entry.name,
		&doc,
		entry.base_url.as_deref(),
		&entry.filters,
		credential_source,
	)
	.map_err(|e| e.to_string())?;

	let any_missing_credentials = records
		.iter()
		.any(|r| r.security.iter().any(|(scheme, _)| !credential_source.has_source_for(scheme)));

	if any_missing_credentials {
		if let OnMissingCredentials::Skip = entry.on_missing_credentials {
			return Err(format!(
				"service {} has operations requiring credentials with no configured source (onMissingCredentials=skip)",
				entry.name
			));
		}
	}

	let tools = records
		.into_iter()
		.map(|record| {
			let descriptor = ToolDescriptor::from_record(&record);
			Tool {
				descriptor,
				record: Arc::new(record),
			}
		})
		.collect();

	let service_credentials = build_service_credentials(
		&tools_security(&tools),
		entry.auth.as_ref(),
	);

	let http = reqwest::Client::builder()
		.build()
		.map_err(|e| e.to_string())?;

	let ctx = ServiceContext {
		credentials: service_credentials,
		http,
		token_cache: Arc::new(TokenCache::new()),
	};

	Ok((tools, ctx))
}

fn tools_security(tools: &[Tool]) -> Vec<(SecurityScheme, String)> {
	tools.iter().flat_map(|t| t.record.security.clone()).collect()
}
