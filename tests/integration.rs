mod common;
use common::Harness;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn tools_list_exposes_both_operations_namespaced() {
	let harness = Harness::build().await;
	let raw = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
	let response = toolbridge::rpc::dispatch(&harness.host, raw).await.unwrap();

	let result = response.result.expect("tools/list should succeed");
	let tools = result["tools"].as_array().unwrap();
	let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
	assert!(names.contains(&"pets.getPet"));
	assert!(names.contains(&"pets.createPet"));
}

#[tokio::test]
async fn tools_call_substitutes_path_param_and_returns_json() {
	let harness = Harness::build().await;
	Mock::given(method("GET"))
		.and(path("/pets/42"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 42, "name": "fido"})))
		.mount(&harness.backend)
		.await;

	let raw = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"pets.getPet","arguments":{"petId":"42"}}}"#;
	let response = toolbridge::rpc::dispatch(&harness.host, raw).await.unwrap();

	let result = response.result.expect("tools/call should succeed");
	let content = &result["content"][0]["json"];
	assert_eq!(content["name"], "fido");
}

#[tokio::test]
async fn tools_call_missing_required_path_param_is_rpc_error() {
	let harness = Harness::build().await;
	let raw = r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"pets.getPet","arguments":{}}}"#;
	let response = toolbridge::rpc::dispatch(&harness.host, raw).await.unwrap();

	assert!(response.result.is_none());
	assert!(response.error.is_some());
}

#[tokio::test]
async fn tools_call_upstream_error_carries_structured_data() {
	let harness = Harness::build().await;
	Mock::given(method("GET"))
		.and(path("/pets/99"))
		.respond_with(ResponseTemplate::new(404).set_body_string("not found"))
		.mount(&harness.backend)
		.await;

	let raw = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"pets.getPet","arguments":{"petId":"99"}}}"#;
	let response = toolbridge::rpc::dispatch(&harness.host, raw).await.unwrap();

	let error = response.error.expect("upstream 404 should surface as an rpc error");
	assert_eq!(error.code, toolbridge::error::codes::SERVER_ERROR);
	let data = error.data.expect("upstream errors carry structured data");
	assert_eq!(data["statusCode"], 404);
}

#[tokio::test]
async fn unknown_tool_is_unknown_tool_error() {
	let harness = Harness::build().await;
	let raw = r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"pets.doesNotExist","arguments":{}}}"#;
	let response = toolbridge::rpc::dispatch(&harness.host, raw).await.unwrap();

	let error = response.error.unwrap();
	assert_eq!(error.code, toolbridge::error::codes::UNKNOWN_TOOL);
}

#[tokio::test]
async fn notification_without_id_produces_no_response() {
	let harness = Harness::build().await;
	let raw = r#"{"jsonrpc":"2.0","method":"tools/list"}"#;
	let response = toolbridge::rpc::dispatch(&harness.host, raw).await;
	assert!(response.is_none());
}
