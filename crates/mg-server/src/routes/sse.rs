//! SSE session surface: `GET /<endpoint>/sse` + `POST /<endpoint>/message`.
//!
//! The GET opens a long-lived event stream whose first event (`endpoint`)
//! tells the client where to POST messages for this session. Responses to
//! those POSTs are pushed down the stream and the POST answers 202; when the
//! stream is already gone the response falls back into the POST body.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mg_mcp::bridge;
use mg_mcp::protocol::JsonRpcResponse;
use mg_types::ROOT_ENDPOINT;
use serde_json::Value;
use uuid::Uuid;

use crate::middleware::auth;
use crate::middleware::error::ApiErrorResponse;
use crate::routes::rpc::{self, RpcOutcome};
use crate::routes::{resolve_endpoint, EndpointQuery};
use crate::state::{AppState, SseMessage, SseSessionManager};

/// Unregisters the session when the stream is dropped, whether the client
/// hung up or the channel closed.
struct SessionGuard {
    sessions: Arc<SseSessionManager>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.unregister(&self.session_id);
    }
}

pub async fn get_endpoint_sse(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Response {
    open_session(state, endpoint, query, headers).await
}

pub async fn get_root_sse(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Response {
    open_session(state, ROOT_ENDPOINT.to_string(), query, headers).await
}

async fn open_session(
    state: AppState,
    endpoint_name: String,
    query: EndpointQuery,
    headers: HeaderMap,
) -> Response {
    let (endpoint, _namespace) = match resolve_endpoint(&state, &endpoint_name).await {
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

    let session_id = Uuid::new_v4().to_string();
    let mut rx = state.sse_sessions.register(session_id.clone());
    tracing::info!(
        "SSE session {} opened on endpoint '{}'",
        session_id,
        endpoint.name
    );

    let sessions = state.sse_sessions.clone();
    let stream = async_stream::stream! {
        let _guard = SessionGuard {
            sessions,
            session_id: session_id.clone(),
        };

        // Tell the client where this session's messages go.
        yield Ok::<Event, Infallible>(
            Event::default()
                .event("endpoint")
                .data(format!("/{endpoint_name}/message?sessionId={session_id}")),
        );

        while let Some(message) = rx.recv().await {
            let data = match &message {
                SseMessage::Response(response) => serde_json::to_string(response),
                SseMessage::Notification(value) => serde_json::to_string(value),
            };
            match data {
                Ok(data) => yield Ok(Event::default().event("message").data(data)),
                Err(e) => tracing::warn!("Dropping unserializable SSE message: {}", e),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

pub async fn post_endpoint_message(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    handle_message(state, endpoint, query, headers, body).await
}

pub async fn post_root_message(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    handle_message(state, ROOT_ENDPOINT.to_string(), query, headers, body).await
}

async fn handle_message(
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

    let Some(session_id) = query.session_id else {
        return ApiErrorResponse::bad_request("Missing sessionId query parameter").into_response();
    };
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
        RpcOutcome::Single(response) => deliver(&state, &session_id, response),
        RpcOutcome::Stream(stream) => match bridge::collect(stream).await {
            Ok((chunks, response)) => {
                for chunk in chunks {
                    state
                        .sse_sessions
                        .send(&session_id, SseMessage::Notification(chunk));
                }
                deliver(&state, &session_id, response)
            }
            Err(e) => deliver(
                &state,
                &session_id,
                JsonRpcResponse::error(client_id, (&e).into()),
            ),
        },
    }
}

/// Push the response down the session stream, or fall back to the body.
fn deliver(state: &AppState, session_id: &str, response: JsonRpcResponse) -> Response {
    if state
        .sse_sessions
        .send(session_id, SseMessage::Response(response.clone()))
    {
        StatusCode::ACCEPTED.into_response()
    } else {
        tracing::debug!(
            "SSE session {} is gone, answering in the POST body",
            session_id
        );
        Json(response).into_response()
    }
}
