//! Discovery and health.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::middleware::error::ApiErrorResponse;
use crate::middleware::rate_limit::{self, STRICT_POLICY};
use crate::state::AppState;

/// `GET /`: the public endpoint catalog.
///
/// Enumerates every endpoint with its surface URLs. Enumeration is cheap
/// reconnaissance, so it sits under the strict window on top of the public
/// one.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Endpoint catalog"),
        (status = 429, description = "Rate limit exceeded", body = crate::middleware::error::ErrorBody),
    )
)]
pub async fn index(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = rate_limit::client_key(request.headers(), peer);
    let decision = state.rate_limiter.check(&key, &STRICT_POLICY, Utc::now());
    if !decision.allowed {
        let mut response =
            ApiErrorResponse::rate_limited(STRICT_POLICY.message, decision.retry_after_secs)
                .into_response();
        rate_limit::apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let endpoints = match state.store.list_endpoints().await {
        Ok(endpoints) => endpoints,
        Err(e) => return ApiErrorResponse::from(&e).into_response(),
    };

    // One namespace lookup per distinct id; dangling references list as null.
    let mut namespace_names: HashMap<Uuid, Option<String>> = HashMap::new();
    let mut catalog = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let namespace = match namespace_names.entry(endpoint.namespace_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let name = state
                    .store
                    .namespace(endpoint.namespace_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|ns| ns.name);
                entry.insert(name.clone());
                name
            }
        };
        let base = format!("/{}", endpoint.name);
        catalog.push(json!({
            "name": endpoint.name,
            "namespace": namespace,
            "requiresAuth": endpoint.auth_level == mg_types::AuthLevel::ApiKey,
            "endpoints": {
                "mcp": format!("{base}/mcp"),
                "sse": format!("{base}/sse"),
                "message": format!("{base}/message"),
                "api": format!("{base}/api"),
                "openapi": format!("{base}/api/openapi.json"),
            },
        }));
    }

    let mut response = Json(json!({
        "service": "metagate",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": catalog,
    }))
    .into_response();
    rate_limit::apply_headers(response.headers_mut(), &decision);
    response
}

/// `GET /health`: bare liveness, no auth, no rate limit.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up"))
)]
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/health`: liveness plus a little operational detail.
#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up"))
)]
pub async fn api_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "startedAt": state.started_at.to_rfc3339(),
        "activeSseSessions": state.sse_sessions.len(),
    }))
}
