//! Route-level tests against the assembled router, with scripted backends
//! standing in for real MCP servers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use mg_mcp::pool::{ConnectionPool, Connector};
use mg_mcp::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use mg_mcp::{NamespaceAggregator, Transport};
use mg_server::{build_router, AppState};
use mg_store::{DefinitionStore, MemoryStore};
use mg_types::{
    AppResult, AuthLevel, Endpoint, GatewayError, LaunchSpec, Namespace, ServerDefinition,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct ScriptedTransport {
    server: String,
    tools: Vec<&'static str>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> AppResult<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
                    .collect();
                Ok(JsonRpcResponse::success(id, json!({ "tools": tools })))
            }
            "tools/call" => {
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(JsonRpcResponse::success(
                    id,
                    json!({"calledOn": self.server, "tool": name}),
                ))
            }
            other => Ok(JsonRpcResponse::error(
                id,
                JsonRpcError::method_not_found(other),
            )),
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

struct ScriptedConnector {
    tools_by_server: HashMap<String, Vec<&'static str>>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, definition: &ServerDefinition) -> AppResult<Arc<dyn Transport>> {
        let Some(tools) = self.tools_by_server.get(&definition.name) else {
            return Err(GatewayError::UpstreamUnavailable("unknown backend".to_string()));
        };
        Ok(Arc::new(ScriptedTransport {
            server: definition.name.clone(),
            tools: tools.clone(),
        }))
    }
}

fn launch() -> LaunchSpec {
    LaunchSpec::SubprocessStdio {
        command: "true".to_string(),
        args: vec![],
        env: HashMap::new(),
    }
}

/// Store with two overlapping backends behind a public endpoint (`docs`),
/// a keyed endpoint (`secure`) over the same namespace, and the system
/// `root` endpoint over its own namespace.
async fn fixture() -> Router {
    let memory = MemoryStore::new();
    memory.add_api_key("sk-test");
    let store: Arc<dyn DefinitionStore> = Arc::new(memory);

    let alpha = store
        .create_server(ServerDefinition {
            id: Uuid::new_v4(),
            name: "alpha".to_string(),
            launch: launch(),
        })
        .await
        .unwrap();
    let beta = store
        .create_server(ServerDefinition {
            id: Uuid::new_v4(),
            name: "beta".to_string(),
            launch: launch(),
        })
        .await
        .unwrap();

    let main = store
        .create_namespace(Namespace {
            id: Uuid::new_v4(),
            name: "main".to_string(),
            server_ids: vec![alpha.id, beta.id],
            is_system: false,
        })
        .await
        .unwrap();
    let system = store
        .create_namespace(Namespace {
            id: Uuid::new_v4(),
            name: "system".to_string(),
            server_ids: vec![alpha.id],
            is_system: true,
        })
        .await
        .unwrap();

    for (name, namespace_id, auth_level) in [
        ("docs", main.id, AuthLevel::Public),
        ("secure", main.id, AuthLevel::ApiKey),
        ("root", system.id, AuthLevel::Public),
    ] {
        store
            .create_endpoint(Endpoint {
                id: Uuid::new_v4(),
                name: name.to_string(),
                namespace_id,
                auth_level,
                allow_query_param_auth: true,
            })
            .await
            .unwrap();
    }

    let pool = Arc::new(ConnectionPool::new(Arc::new(ScriptedConnector {
        tools_by_server: HashMap::from([
            ("alpha".to_string(), vec!["search", "fetch"]),
            ("beta".to_string(), vec!["search", "stats"]),
        ]),
    })));
    let aggregator = Arc::new(NamespaceAggregator::new(store.clone(), pool.clone()));
    build_router(AppState::new(store, pool, aggregator))
}

fn rpc_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_auth() {
    let app = fixture().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn unknown_endpoint_is_404() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/nope/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn keyed_endpoint_enforces_auth() {
    let app = fixture().await;

    let response = app
        .clone()
        .oneshot(Request::get("/secure/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::get("/secure/sse")
                .header("x-api-key", "sk-wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(
            Request::get("/secure/sse")
                .header("x-api-key", "sk-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("text/event-stream"));
}

#[tokio::test]
async fn query_param_auth_works_where_allowed() {
    let app = fixture().await;
    let response = app
        .oneshot(
            Request::get("/secure/sse?api_key=sk-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tools_list_merges_with_first_member_winning() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/docs/mcp",
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["id"], json!(7));
    let tools = body["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();

    // alpha's and beta's lists merged; the shared name appears once.
    assert_eq!(names, vec!["search", "fetch", "stats"]);
}

#[tokio::test]
async fn tool_call_echoes_the_client_id() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/docs/mcp",
            json!({
                "jsonrpc": "2.0",
                "id": "req-42",
                "method": "tools/call",
                "params": {"name": "beta__search", "arguments": {"q": "x"}},
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["id"], json!("req-42"));
    assert_eq!(body["result"]["calledOn"], json!("beta"));
}

#[tokio::test]
async fn root_alias_serves_the_root_endpoint() {
    let app = fixture().await;

    let via_alias = app
        .clone()
        .oneshot(rpc_request(
            "/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        ))
        .await
        .unwrap();
    assert_eq!(via_alias.status(), StatusCode::OK);
    let alias_body = body_json(via_alias).await;

    let via_name = app
        .oneshot(rpc_request(
            "/root/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        ))
        .await
        .unwrap();
    let name_body = body_json(via_name).await;

    assert_eq!(alias_body["result"], name_body["result"]);
    // The root namespace only contains alpha.
    let tools = alias_body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 2);
}

#[tokio::test]
async fn root_mcp_get_resolves_the_root_endpoint() {
    let app = fixture().await;
    let response = app
        .oneshot(Request::get("/mcp").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["endpoint"], json!("root"));
    assert_eq!(body["namespace"], json!("system"));
}

#[tokio::test]
async fn bad_jsonrpc_version_is_400() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/docs/mcp",
            json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_method_is_32601() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/docs/mcp",
            json!({"jsonrpc": "2.0", "id": 1, "method": "bogus/op"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn notifications_get_202() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/docs/mcp",
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn rest_tool_execution_returns_the_result() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request("/docs/api/tools/search", json!({"q": "rust"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));

    let body = body_json(response).await;
    // First-wins routing: alpha owns the bare name.
    assert_eq!(body["calledOn"], json!("alpha"));
}

#[tokio::test]
async fn rest_unknown_tool_is_404() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request("/docs/api/tools/nonexistent", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn openapi_document_reflects_merged_tools() {
    let app = fixture().await;
    let response = app
        .oneshot(
            Request::get("/docs/api/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["openapi"], json!("3.1.0"));
    let paths = body["paths"].as_object().unwrap();
    assert!(paths.contains_key("/docs/api/tools/search"));
    assert!(paths.contains_key("/docs/api/tools/stats"));
    assert_eq!(paths.len(), 3);
}

#[tokio::test]
async fn discovery_lists_every_endpoint() {
    let app = fixture().await;
    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let endpoints = body["endpoints"].as_array().unwrap();
    assert_eq!(endpoints.len(), 3);
    let docs = endpoints
        .iter()
        .find(|e| e["name"] == json!("docs"))
        .unwrap();
    assert_eq!(docs["namespace"], json!("main"));
    assert_eq!(docs["endpoints"]["sse"], json!("/docs/sse"));
    assert_eq!(docs["endpoints"]["openapi"], json!("/docs/api/openapi.json"));
}

#[tokio::test]
async fn public_window_blocks_the_101st_request() {
    let app = fixture().await;

    for i in 0..100 {
        let response = app
            .clone()
            .oneshot(
                Request::get("/docs/api")
                    .header("x-forwarded-for", "198.51.100.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i} should pass");
    }

    let response = app
        .clone()
        .oneshot(
            Request::get("/docs/api")
                .header("x-forwarded-for", "198.51.100.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(
        response.headers().get("x-ratelimit-remaining").unwrap(),
        "0"
    );
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("Rate limit exceeded"));
    assert!(body["retryAfter"].as_u64().unwrap() >= 1);

    // A different client is unaffected.
    let response = app
        .oneshot(
            Request::get("/docs/api")
                .header("x-forwarded-for", "198.51.100.2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn sse_message_without_session_is_400() {
    let app = fixture().await;
    let response = app
        .oneshot(rpc_request(
            "/docs/message",
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sse_message_without_stream_answers_in_body() {
    let app = fixture().await;
    // No live SSE stream for this session id, so the response falls back
    // into the POST body.
    let response = app
        .oneshot(rpc_request(
            "/docs/message?sessionId=phantom",
            json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], json!(5));
}
