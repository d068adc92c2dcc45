//! A namespaced map of fully-qualified tool name to {descriptor, handler};
//! write-once at startup, read-only thereafter.

use crate::error::CallError;
use crate::tool::{Tool, ToolDescriptor};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct RegistryBuilder {
	entries: Vec<(String, Arc<Tool>)>,
	names: std::collections::HashSet<String>,
}

impl RegistryBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Installs every tool under `service.`; rejects name collisions
	/// (within a service or across services, since names are already
	/// fully-qualified by this point).
	pub fn register(&mut self, tools: Vec<Tool>) -> Result<(), String> {
		for tool in tools {
			let name = tool.descriptor.name.clone();
			if !self.names.insert(name.clone()) {
				return Err(name);
			}
			self.entries.push((name, Arc::new(tool)));
		}
		Ok(())
	}

	pub fn build(self) -> Registry {
		Registry {
			order: self.entries.iter().map(|(name, _)| name.clone()).collect(),
			by_name: self.entries.into_iter().collect(),
		}
	}
}

/// Read-only after `RegistryBuilder::build`; insertion order is preserved
/// for deterministic `tools/list` output.
pub struct Registry {
	by_name: HashMap<String, Arc<Tool>>,
	order: Vec<String>,
}

impl Registry {
	pub fn list(&self) -> Vec<ToolDescriptor> {
		self
			.order
			.iter()
			.filter_map(|name| self.by_name.get(name))
			.map(|tool| tool.descriptor.clone())
			.collect()
	}

	pub fn lookup(&self, qualified_name: &str) -> Result<Arc<Tool>, CallError> {
		self
			.by_name
			.get(qualified_name)
			.cloned()
			.ok_or_else(|| CallError::UnknownTool(qualified_name.to_string()))
	}

	pub fn len(&self) -> usize {
		self.order.len()
	}

	pub fn is_empty(&self) -> bool {
		self.order.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::compile::{Method, OperationRecord};
	use crate::tool::ToolDescriptor;
	use std::sync::Arc as StdArc;

	fn dummy_tool(name: &str) -> Tool {
		let record = OperationRecord {
			service: "svc".into(),
			tool_name: name.into(),
			description: "d".into(),
			method: Method::Get,
			path_template: "/x".into(),
			base_url: "https://api".into(),
			parameters: vec![],
			has_body: false,
			body_required: false,
			input_schema: serde_json::json!({"type":"object","properties":{},"required":[]}),
			security: vec![],
		};
		Tool {
			descriptor: ToolDescriptor::from_record(&record),
			record: StdArc::new(record),
		}
	}

	#[test]
	fn listing_preserves_insertion_order() {
		let mut builder = RegistryBuilder::new();
		builder.register(vec![dummy_tool("b"), dummy_tool("a")]).unwrap();
		let registry = builder.build();
		let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
		assert_eq!(names, vec!["svc.b", "svc.a"]);
	}

	#[test]
	fn duplicate_names_rejected() {
		let mut builder = RegistryBuilder::new();
		builder.register(vec![dummy_tool("a")]).unwrap();
		let err = builder.register(vec![dummy_tool("a")]).unwrap_err();
		assert_eq!(err, "svc.a");
	}

	#[test]
	fn unknown_tool_lookup_fails() {
		let builder = RegistryBuilder::new();
		let registry = builder.build();
		assert!(matches!(registry.lookup("nope"), Err(CallError::UnknownTool(_))));
	}
}
