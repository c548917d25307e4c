//! Streamable HTTP surface: `POST /<endpoint>/mcp`.
//!
//! Single-shot answers come back as one JSON body. When the backend streams,
//! the response upgrades to `text/event-stream`: intermediate fragments as
//! `message` events, ending with the final response.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use mg_mcp::protocol::JsonRpcResponse;
use mg_mcp::transport::{FragmentStream, ResponseFragment};
use mg_types::ROOT_ENDPOINT;
use serde_json::{json, Value};

use crate::middleware::auth;
use crate::middleware::error::ApiErrorResponse;
use crate::routes::rpc::{self, RpcOutcome};
use crate::routes::{resolve_endpoint, EndpointQuery};
use crate::state::AppState;

pub async fn post_endpoint_mcp(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    handle_rpc(state, endpoint, query, headers, body).await
}

pub async fn post_root_mcp(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    handle_rpc(state, ROOT_ENDPOINT.to_string(), query, headers, body).await
}

/// `POST /api` root alias: same JSON-RPC handling as `POST /mcp`.
pub async fn post_root_api(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    handle_rpc(state, ROOT_ENDPOINT.to_string(), query, headers, body).await
}

/// `GET /mcp`: connection info for the root endpoint. Resolved and
/// authorized like the POST alias so a keyed root endpoint stays keyed.
pub async fn get_root_mcp(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Response {
    let (endpoint, namespace) = match resolve_endpoint(&state, ROOT_ENDPOINT).await {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = auth::authorize(
        &state.store,
        &endpoint,
        &headers,
        query.api_key.as_deref(),
    )
    .await
    {
        return e.into_response();
    }

    Json(json!({
        "service": "metagate",
        "version": env!("CARGO_PKG_VERSION"),
        "protocolVersion": rpc::PROTOCOL_VERSION,
        "transport": "streamable-http",
        "endpoint": endpoint.name,
        "namespace": namespace.name,
        "hint": "POST JSON-RPC 2.0 messages to this path",
    }))
    .into_response()
}

async fn handle_rpc(
    state: AppState,
    endpoint_name: String,
    query: EndpointQuery,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let (endpoint, namespace) = match resolve_endpoint(&state, &endpoint_name).await {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = auth::authorize(
        &state.store,
        &endpoint,
        &headers,
        query.api_key.as_deref(),
    )
    .await
    {
        return e.into_response();
    }

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ApiErrorResponse::bad_request(format!("Request body must be JSON: {rejection}"))
                .into_response();
        }
    };
    let request = match rpc::validate_request(body) {
        Ok(request) => request,
        Err(message) => return ApiErrorResponse::bad_request(message).into_response(),
    };
    let client_id = request.id.clone().unwrap_or(Value::Null);

    match rpc::dispatch(&state, &namespace, request).await {
        RpcOutcome::None => StatusCode::ACCEPTED.into_response(),
        RpcOutcome::Single(response) => Json(response).into_response(),
        RpcOutcome::Stream(stream) => stream_response(stream, client_id).await,
    }
}

/// Answer from a fragment stream. A stream whose very first fragment is the
/// end stays a plain JSON response; anything longer becomes SSE.
async fn stream_response(mut stream: FragmentStream, client_id: Value) -> Response {
    match stream.next().await {
        Some(Ok(ResponseFragment::End(response))) => Json(response).into_response(),
        Some(Err(e)) => {
            Json(JsonRpcResponse::error(client_id, (&e).into())).into_response()
        }
        Some(Ok(first @ ResponseFragment::Chunk(_))) => {
            let events = async_stream::stream! {
                let mut pending = Some(first);
                loop {
                    let fragment = match pending.take() {
                        Some(fragment) => Some(Ok(fragment)),
                        None => stream.next().await,
                    };
                    match fragment {
                        Some(Ok(ResponseFragment::Chunk(chunk))) => {
                            if let Ok(data) = serde_json::to_string(&chunk) {
                                yield Ok::<Event, Infallible>(
                                    Event::default().event("message").data(data),
                                );
                            }
                        }
                        Some(Ok(ResponseFragment::End(response))) => {
                            if let Ok(data) = serde_json::to_string(&response) {
                                yield Ok(Event::default().event("message").data(data));
                            }
                            return;
                        }
                        Some(Err(e)) => {
                            let response =
                                JsonRpcResponse::error(client_id.clone(), (&e).into());
                            if let Ok(data) = serde_json::to_string(&response) {
                                yield Ok(Event::default().event("message").data(data));
                            }
                            return;
                        }
                        None => return,
                    }
                }
            };
            Sse::new(events).keep_alive(KeepAlive::default()).into_response()
        }
        None => ApiErrorResponse::internal_error("Backend produced no response").into_response(),
    }
}
