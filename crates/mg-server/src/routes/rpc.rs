//! Inbound JSON-RPC dispatch.
//!
//! Maps client-facing MCP methods onto aggregator operations for the
//! namespace behind an endpoint. Responses always echo the client's request
//! id, whatever correlation ids the backend transports used internally.

use futures_util::StreamExt;
use mg_mcp::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use mg_mcp::transport::{FragmentStream, ResponseFragment};
use mg_mcp::CapabilityKind;
use mg_types::Namespace;
use serde_json::{json, Value};

use crate::state::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// What a dispatched request produced.
pub enum RpcOutcome {
    /// Notification; nothing goes back.
    None,
    Single(JsonRpcResponse),
    /// Streamed answer; the final `End` fragment carries the response.
    Stream(FragmentStream),
}

/// Validate the envelope of a decoded request body. Returns the request
/// ready for dispatch, or a message suitable for a 400.
pub fn validate_request(body: Value) -> Result<JsonRpcRequest, String> {
    let request: JsonRpcRequest = serde_json::from_value(body)
        .map_err(|e| format!("Invalid JSON-RPC request: {e}"))?;
    if request.jsonrpc != "2.0" {
        return Err(format!(
            "Unsupported JSON-RPC version '{}'",
            request.jsonrpc
        ));
    }
    Ok(request)
}

/// Dispatch one request against a namespace.
///
/// Gateway-level failures come back as JSON-RPC error responses, never as
/// transport-level errors; the HTTP layer above only deals in outcomes.
pub async fn dispatch(
    state: &AppState,
    namespace: &Namespace,
    request: JsonRpcRequest,
) -> RpcOutcome {
    if request.is_notification() {
        tracing::debug!("Dropping notification '{}'", request.method);
        return RpcOutcome::None;
    }
    let id = request.id.clone().unwrap_or(Value::Null);

    match request.method.as_str() {
        "initialize" => RpcOutcome::Single(JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "resources": { "listChanged": false },
                    "prompts": { "listChanged": false },
                },
                "serverInfo": {
                    "name": "metagate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )),

        "ping" => RpcOutcome::Single(JsonRpcResponse::success(id, json!({}))),

        "tools/list" => match state.aggregator.list_capabilities(namespace.id).await {
            Ok(listing) => {
                let tools: Vec<Value> = listing
                    .of_kind(CapabilityKind::Tool)
                    .map(|c| {
                        json!({
                            "name": c.name,
                            "description": c.description,
                            "inputSchema": c.detail.get("inputSchema").cloned().unwrap_or(json!({})),
                        })
                    })
                    .collect();
                RpcOutcome::Single(JsonRpcResponse::success(
                    id,
                    with_failures(json!({ "tools": tools }), &listing),
                ))
            }
            Err(e) => RpcOutcome::Single(JsonRpcResponse::error(id, (&e).into())),
        },

        "resources/list" => match state.aggregator.list_capabilities(namespace.id).await {
            Ok(listing) => {
                let resources: Vec<Value> = listing
                    .of_kind(CapabilityKind::Resource)
                    .map(|c| {
                        json!({
                            "name": c.name,
                            "uri": c.detail.get("uri").cloned().unwrap_or(Value::Null),
                            "mimeType": c.detail.get("mimeType").cloned().unwrap_or(Value::Null),
                            "description": c.description,
                        })
                    })
                    .collect();
                RpcOutcome::Single(JsonRpcResponse::success(
                    id,
                    with_failures(json!({ "resources": resources }), &listing),
                ))
            }
            Err(e) => RpcOutcome::Single(JsonRpcResponse::error(id, (&e).into())),
        },

        "prompts/list" => match state.aggregator.list_capabilities(namespace.id).await {
            Ok(listing) => {
                let prompts: Vec<Value> = listing
                    .of_kind(CapabilityKind::Prompt)
                    .map(|c| {
                        json!({
                            "name": c.name,
                            "description": c.description,
                            "arguments": c.detail.get("arguments").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect();
                RpcOutcome::Single(JsonRpcResponse::success(
                    id,
                    with_failures(json!({ "prompts": prompts }), &listing),
                ))
            }
            Err(e) => RpcOutcome::Single(JsonRpcResponse::error(id, (&e).into())),
        },

        "tools/call" => {
            let Some(name) = param_str(&request, "name") else {
                return invalid_params(id, "tools/call requires params.name");
            };
            let arguments = param(&request, "arguments");
            match state
                .aggregator
                .call_tool(namespace.id, &name, arguments)
                .await
            {
                Ok(stream) => RpcOutcome::Stream(reid(stream, id)),
                Err(e) => RpcOutcome::Single(JsonRpcResponse::error(id, (&e).into())),
            }
        }

        "prompts/get" => {
            let Some(name) = param_str(&request, "name") else {
                return invalid_params(id, "prompts/get requires params.name");
            };
            let arguments = param(&request, "arguments");
            match state
                .aggregator
                .get_prompt(namespace.id, &name, arguments)
                .await
            {
                Ok(stream) => RpcOutcome::Stream(reid(stream, id)),
                Err(e) => RpcOutcome::Single(JsonRpcResponse::error(id, (&e).into())),
            }
        }

        "resources/read" => {
            let Some(uri) = param_str(&request, "uri") else {
                return invalid_params(id, "resources/read requires params.uri");
            };
            match state.aggregator.read_resource(namespace.id, &uri).await {
                Ok(stream) => RpcOutcome::Stream(reid(stream, id)),
                Err(e) => RpcOutcome::Single(JsonRpcResponse::error(id, (&e).into())),
            }
        }

        other => RpcOutcome::Single(JsonRpcResponse::error(
            id,
            JsonRpcError::method_not_found(other),
        )),
    }
}

fn with_failures(mut result: Value, listing: &mg_mcp::CapabilityListing) -> Value {
    if !listing.failures.is_empty() {
        result["_meta"] = json!({ "failures": listing.failures });
    }
    result
}

fn invalid_params(id: Value, message: &str) -> RpcOutcome {
    RpcOutcome::Single(JsonRpcResponse::error(
        id,
        JsonRpcError::invalid_params(message),
    ))
}

fn param(request: &JsonRpcRequest, key: &str) -> Option<Value> {
    request.params.as_ref().and_then(|p| p.get(key)).cloned()
}

fn param_str(request: &JsonRpcRequest, key: &str) -> Option<String> {
    param(request, key)
        .as_ref()
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Rewrite the final response of a fragment stream to carry the client's id.
fn reid(mut stream: FragmentStream, id: Value) -> FragmentStream {
    Box::pin(async_stream::stream! {
        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(ResponseFragment::End(mut response)) => {
                    response.id = id.clone();
                    yield Ok(ResponseFragment::End(response));
                    return;
                }
                other => yield other,
            }
        }
    })
}
