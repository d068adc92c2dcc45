//! Translates OpenAPI schema fragments into a neutral JSON-Schema-shaped
//! tree, preserving the constraint keywords downstream argument
//! construction and client-side validation need. Unsupported keywords are
//! dropped silently; the result never references the source document.

use openapiv3::{ReferenceOr, Schema, SchemaKind, Type};
use serde_json::{Map, Value, json};

pub fn map_schema(schema: &Schema) -> Value {
	let mut out = Map::new();

	if let Some(description) = &schema.schema_data.description {
		out.insert("description".into(), json!(description));
	}
	if let Some(default) = &schema.schema_data.default {
		out.insert("default".into(), default.clone());
	}
	if let Some(example) = &schema.schema_data.example {
		out.insert("example".into(), example.clone());
	}

	match &schema.schema_kind {
		SchemaKind::Type(Type::String(s)) => {
			out.insert("type".into(), json!("string"));
			if let Some(pattern) = &s.pattern {
				out.insert("pattern".into(), json!(pattern));
			}
			if let Some(min) = s.min_length {
				out.insert("minLength".into(), json!(min));
			}
			if let Some(max) = s.max_length {
				out.insert("maxLength".into(), json!(max));
			}
			let format = format_to_string(&s.format);
			if let Some(format) = format {
				out.insert("format".into(), json!(format));
			}
			if !s.enumeration.is_empty() {
				out.insert(
					"enum".into(),
					json!(s.enumeration.iter().flatten().collect::<Vec<_>>()),
				);
			}
		},
		SchemaKind::Type(Type::Number(n)) => {
			out.insert("type".into(), json!("number"));
			insert_numeric_bounds(
				&mut out,
				n.minimum,
				n.maximum,
				n.exclusive_minimum,
				n.exclusive_maximum,
			);
			if !n.enumeration.is_empty() {
				out.insert(
					"enum".into(),
					json!(n.enumeration.iter().flatten().collect::<Vec<_>>()),
				);
			}
		},
		SchemaKind::Type(Type::Integer(i)) => {
			out.insert("type".into(), json!("integer"));
			insert_numeric_bounds(
				&mut out,
				i.minimum,
				i.maximum,
				i.exclusive_minimum,
				i.exclusive_maximum,
			);
			if !i.enumeration.is_empty() {
				out.insert(
					"enum".into(),
					json!(i.enumeration.iter().flatten().collect::<Vec<_>>()),
				);
			}
		},
		SchemaKind::Type(Type::Boolean(_)) => {
			out.insert("type".into(), json!("boolean"));
		},
		SchemaKind::Type(Type::Array(a)) => {
			out.insert("type".into(), json!("array"));
			if let Some(items) = &a.items {
				out.insert("items".into(), map_boxed_reference_or(items));
			}
			if let Some(min) = a.min_items {
				out.insert("minItems".into(), json!(min));
			}
			if let Some(max) = a.max_items {
				out.insert("maxItems".into(), json!(max));
			}
			if a.unique_items {
				out.insert("uniqueItems".into(), json!(true));
			}
		},
		SchemaKind::Type(Type::Object(o)) => {
			out.insert("type".into(), json!("object"));
			let mut properties = Map::new();
			for (name, prop) in &o.properties {
				properties.insert(name.clone(), map_boxed_reference_or(prop));
			}
			if !properties.is_empty() {
				out.insert("properties".into(), Value::Object(properties));
			}
			if !o.required.is_empty() {
				out.insert("required".into(), json!(o.required));
			}
		},
		SchemaKind::OneOf { one_of } => {
			out.insert(
				"oneOf".into(),
				json!(one_of.iter().map(map_reference_or).collect::<Vec<_>>()),
			);
		},
		SchemaKind::AllOf { all_of } => {
			out.insert(
				"allOf".into(),
				json!(all_of.iter().map(map_reference_or).collect::<Vec<_>>()),
			);
		},
		SchemaKind::AnyOf { any_of } => {
			out.insert(
				"anyOf".into(),
				json!(any_of.iter().map(map_reference_or).collect::<Vec<_>>()),
			);
		},
		SchemaKind::Not { .. } | SchemaKind::Any(_) => {
			// `not` has no JSON-Schema-shaped representation useful to a tool
			// caller and `Any` carries no type information to copy; both are
			// dropped, matching the "unknown keywords dropped silently" rule.
		},
	}

	Value::Object(out)
}

fn map_reference_or(reference: &ReferenceOr<Schema>) -> Value {
	match reference {
		ReferenceOr::Item(schema) => map_schema(schema),
		// By the time we get here the caller has already run full reference
		// resolution (see spec::resolve_nested_schema); an unresolved
		// reference at this point is an authoring bug upstream, not a case
		// worth inventing behaviour for, so it maps to an empty schema.
		ReferenceOr::Reference { .. } => json!({}),
	}
}

fn map_boxed_reference_or(reference: &ReferenceOr<Box<Schema>>) -> Value {
	match reference {
		ReferenceOr::Item(schema) => map_schema(schema),
		ReferenceOr::Reference { .. } => json!({}),
	}
}

fn insert_numeric_bounds(
	out: &mut Map<String, Value>,
	minimum: Option<f64>,
	maximum: Option<f64>,
	exclusive_minimum: bool,
	exclusive_maximum: bool,
) {
	if let Some(min) = minimum {
		if exclusive_minimum {
			out.insert("exclusiveMinimum".into(), json!(min));
		} else {
			out.insert("minimum".into(), json!(min));
		}
	}
	if let Some(max) = maximum {
		if exclusive_maximum {
			out.insert("exclusiveMaximum".into(), json!(max));
		} else {
			out.insert("maximum".into(), json!(max));
		}
	}
}

fn format_to_string(format: &openapiv3::VariantOrUnknownOrEmpty<openapiv3::StringFormat>) -> Option<String> {
	use openapiv3::VariantOrUnknownOrEmpty as V;
	match format {
		V::Item(openapiv3::StringFormat::Date) => Some("date".into()),
		V::Item(openapiv3::StringFormat::DateTime) => Some("date-time".into()),
		V::Item(openapiv3::StringFormat::Password) => Some("password".into()),
		V::Item(openapiv3::StringFormat::Byte) => Some("byte".into()),
		V::Item(openapiv3::StringFormat::Binary) => Some("binary".into()),
		V::Unknown(s) => Some(s.clone()),
		V::Empty => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use openapiv3::{ObjectType, StringType};

	#[test]
	fn maps_string_constraints() {
		let schema = Schema {
			schema_data: Default::default(),
			schema_kind: SchemaKind::Type(Type::String(StringType {
				pattern: Some("^[a-z]+$".into()),
				min_length: Some(1),
				max_length: Some(10),
				..Default::default()
			})),
		};
		let mapped = map_schema(&schema);
		assert_eq!(mapped["type"], json!("string"));
		assert_eq!(mapped["pattern"], json!("^[a-z]+$"));
		assert_eq!(mapped["minLength"], json!(1));
		assert_eq!(mapped["maxLength"], json!(10));
	}

	#[test]
	fn maps_object_with_required() {
		let mut properties = indexmap::IndexMap::new();
		properties.insert(
			"name".to_string(),
			ReferenceOr::Item(Box::new(Schema {
				schema_data: Default::default(),
				schema_kind: SchemaKind::Type(Type::String(StringType::default())),
			})),
		);
		let schema = Schema {
			schema_data: Default::default(),
			schema_kind: SchemaKind::Type(Type::Object(ObjectType {
				properties,
				required: vec!["name".to_string()],
				..Default::default()
			})),
		};
		let mapped = map_schema(&schema);
		assert_eq!(mapped["type"], json!("object"));
		assert_eq!(mapped["required"], json!(["name"]));
		assert_eq!(mapped["properties"]["name"]["type"], json!("string"));
	}

	#[test]
	fn drops_unsupported_not_keyword() {
		let schema = Schema {
			schema_data: Default::default(),
			schema_kind: SchemaKind::Not {
				not: Box::new(ReferenceOr::Item(Schema {
					schema_data: Default::default(),
					schema_kind: SchemaKind::Type(Type::String(StringType::default())),
				})),
			},
		};
		let mapped = map_schema(&schema);
		assert_eq!(mapped, json!({}));
	}
}
