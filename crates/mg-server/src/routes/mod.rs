//! HTTP surface assembly.
//!
//! Every public endpoint gets four faces under its own path prefix: an SSE
//! session pair (`/sse` + `/message`), a streamable JSON-RPC POST (`/mcp`),
//! and an OpenAPI-documented tool surface (`/api`). The distinguished `root`
//! endpoint is additionally aliased at the bare root paths. Health and
//! discovery sit outside auth; everything except health is rate limited.

pub mod api;
pub mod discovery;
pub mod rpc;
pub mod sse;
pub mod streamable;

use axum::http::{header, HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use mg_types::{Endpoint, Namespace};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::middleware::error::ApiErrorResponse;
use crate::middleware::rate_limit;
use crate::openapi;
use crate::state::AppState;

/// Query parameters shared across the endpoint surfaces.
#[derive(Debug, Default, Deserialize)]
pub struct EndpointQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub api_key: Option<String>,
}

/// Look an endpoint up by path name, following its namespace reference.
/// Both a missing endpoint and a dangling namespace are plain 404s.
pub(crate) async fn resolve_endpoint(
    state: &AppState,
    name: &str,
) -> Result<(Endpoint, Namespace), ApiErrorResponse> {
    let endpoint = state
        .store
        .endpoint_by_name(name)
        .await
        .map_err(|e| ApiErrorResponse::from(&e))?
        .ok_or_else(|| ApiErrorResponse::not_found(format!("Unknown endpoint '{name}'")))?;

    let namespace = state
        .store
        .namespace(endpoint.namespace_id)
        .await
        .map_err(|e| ApiErrorResponse::from(&e))?
        .ok_or_else(|| {
            tracing::error!(
                "Endpoint '{}' references missing namespace {}",
                endpoint.name,
                endpoint.namespace_id
            );
            ApiErrorResponse::not_found(format!("Endpoint '{name}' has no namespace"))
        })?;

    Ok((endpoint, namespace))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("mcp-session-id"),
        ]);

    let public = Router::new()
        // Per-endpoint surfaces.
        .route("/{endpoint}/sse", get(sse::get_endpoint_sse))
        .route("/{endpoint}/message", post(sse::post_endpoint_message))
        .route("/{endpoint}/mcp", post(streamable::post_endpoint_mcp))
        .route("/{endpoint}/api", get(api::get_endpoint_api))
        .route("/{endpoint}/api/openapi.json", get(api::get_endpoint_openapi))
        .route("/{endpoint}/api/tools/{tool}", post(api::post_endpoint_tool))
        // Root aliases for the system endpoint.
        .route("/sse", get(sse::get_root_sse))
        .route("/message", post(sse::post_root_message))
        .route(
            "/mcp",
            get(streamable::get_root_mcp).post(streamable::post_root_mcp),
        )
        .route("/api", post(streamable::post_root_api))
        // Discovery.
        .route("/", get(discovery::index))
        .route("/openapi.json", get(openapi::serve_openapi))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit::public_rate_limit,
        ))
        .layer(cors);

    // Health sits outside rate limiting and CORS restrictions.
    Router::new()
        .route("/health", get(discovery::health))
        .route("/api/health", get(discovery::api_health))
        .merge(public)
        .with_state(state)
}
