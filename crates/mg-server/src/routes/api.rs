//! Plain-HTTP tool surface: `GET /<endpoint>/api` + `/api/openapi.json`,
//! `POST /<endpoint>/api/tools/<tool>`.
//!
//! The OpenAPI document is rendered live from the namespace's merged
//! capability listing, so it always reflects what the backends currently
//! publish. Tool execution is gated by the tighter tool policy, keyed by
//! API key when one is presented.

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use mg_mcp::bridge;
use mg_mcp::protocol::{CAPABILITY_NOT_FOUND, SERVER_UNAVAILABLE};
use mg_mcp::{CapabilityKind, CapabilityListing};
use mg_types::Endpoint;
use serde_json::{json, Value};
use std::net::SocketAddr;

use crate::middleware::auth;
use crate::middleware::error::ApiErrorResponse;
use crate::middleware::rate_limit::{self, TOOL_EXECUTION_POLICY};
use crate::routes::{resolve_endpoint, EndpointQuery};
use crate::state::AppState;

const MAX_TOOL_BODY_BYTES: usize = 1024 * 1024;

pub async fn get_endpoint_api(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Response {
    render_openapi(state, endpoint, query, headers).await
}

pub async fn get_endpoint_openapi(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Response {
    render_openapi(state, endpoint, query, headers).await
}

async fn render_openapi(
    state: AppState,
    endpoint_name: String,
    query: EndpointQuery,
    headers: HeaderMap,
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

    match state.aggregator.list_capabilities(namespace.id).await {
        Ok(listing) => Json(build_openapi_doc(&endpoint, &listing)).into_response(),
        Err(e) => ApiErrorResponse::from(&e).into_response(),
    }
}

/// Render the live capability listing as an OpenAPI 3.1 document.
fn build_openapi_doc(endpoint: &Endpoint, listing: &CapabilityListing) -> Value {
    let mut paths = serde_json::Map::new();
    for tool in listing.of_kind(CapabilityKind::Tool) {
        let schema = tool
            .detail
            .get("inputSchema")
            .cloned()
            .unwrap_or(json!({"type": "object"}));
        paths.insert(
            format!("/{}/api/tools/{}", endpoint.name, tool.name),
            json!({
                "post": {
                    "operationId": tool.name,
                    "summary": tool.description,
                    "x-server": tool.server_name,
                    "requestBody": {
                        "content": { "application/json": { "schema": schema } }
                    },
                    "responses": {
                        "200": { "description": "Tool result" },
                        "404": { "description": "Unknown tool" },
                        "429": { "description": "Rate limit exceeded" },
                        "502": { "description": "Backend unavailable" }
                    }
                }
            }),
        );
    }

    let mut doc = json!({
        "openapi": "3.1.0",
        "info": {
            "title": format!("{} tools", endpoint.name),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": paths,
    });
    if !listing.failures.is_empty() {
        doc["x-unavailable-servers"] = json!(listing.failures);
    }
    doc
}

pub async fn post_endpoint_tool(
    State(state): State<AppState>,
    Path((endpoint, tool)): Path<(String, String)>,
    Query(query): Query<EndpointQuery>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let (endpoint, namespace) = match resolve_endpoint(&state, &endpoint).await {
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

    // Tool execution has its own, tighter window on top of the public one.
    let key = rate_limit::execution_key(&headers, query.api_key.as_deref(), peer);
    let decision = state
        .rate_limiter
        .check(&key, &TOOL_EXECUTION_POLICY, Utc::now());
    if !decision.allowed {
        let mut response = ApiErrorResponse::rate_limited(
            TOOL_EXECUTION_POLICY.message,
            decision.retry_after_secs,
        )
        .into_response();
        rate_limit::apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let bytes = match axum::body::to_bytes(request.into_body(), MAX_TOOL_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ApiErrorResponse::bad_request(format!("Unreadable request body: {e}"))
                .into_response();
        }
    };
    let arguments = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                return ApiErrorResponse::bad_request(format!("Request body must be JSON: {e}"))
                    .into_response();
            }
        }
    };

    let result = match state
        .aggregator
        .call_tool(namespace.id, &tool, arguments)
        .await
    {
        Ok(stream) => bridge::collect(stream).await.map(|(_, response)| response),
        Err(e) => Err(e),
    };

    let mut response = match result {
        Ok(response) => match response.error {
            None => (
                StatusCode::OK,
                Json(response.result.unwrap_or(Value::Null)),
            )
                .into_response(),
            Some(error) => {
                let status = match error.code {
                    CAPABILITY_NOT_FOUND => StatusCode::NOT_FOUND,
                    SERVER_UNAVAILABLE => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(json!({ "error": error }))).into_response()
            }
        },
        Err(e) => ApiErrorResponse::from(&e).into_response(),
    };
    rate_limit::apply_headers(response.headers_mut(), &decision);
    response
}
