//! Endpoint authentication.
//!
//! Endpoints carry their own auth level: `Public` passes everyone,
//! `ApiKey` requires a key via `X-API-Key`, `Authorization: Bearer`, or
//! `?api_key=` where the endpoint opts into query-param auth. Missing
//! credentials are 401, invalid ones 403.

use std::sync::Arc;

use axum::http::HeaderMap;
use mg_store::DefinitionStore;
use mg_types::{AuthLevel, Endpoint};

use crate::middleware::error::ApiErrorResponse;

/// Extract a Bearer token from an Authorization header value.
///
/// Expected format: "Bearer <token>". Returns None when the token is
/// missing, empty, or whitespace-only.
pub fn extract_bearer_token(auth_header: &str) -> Option<String> {
    auth_header.strip_prefix("Bearer ").and_then(|s| {
        if s.trim().is_empty() {
            None
        } else {
            // Preserve the original token (don't trim internal whitespace).
            Some(s.to_string())
        }
    })
}

/// The API key a request presents, in precedence order: `X-API-Key` header,
/// then `Authorization: Bearer`, then the query param when given.
pub fn presented_api_key(headers: &HeaderMap, query_api_key: Option<&str>) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }
    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
    {
        return Some(token);
    }
    query_api_key
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Enforce an endpoint's auth level against the presented credentials.
pub async fn authorize(
    store: &Arc<dyn DefinitionStore>,
    endpoint: &Endpoint,
    headers: &HeaderMap,
    query_api_key: Option<&str>,
) -> Result<(), ApiErrorResponse> {
    if endpoint.auth_level == AuthLevel::Public {
        return Ok(());
    }

    let query_api_key = if endpoint.allow_query_param_auth {
        query_api_key
    } else {
        None
    };

    let Some(key) = presented_api_key(headers, query_api_key) else {
        return Err(ApiErrorResponse::unauthorized(
            "API key required. Provide it via the X-API-Key header, \
             an Authorization: Bearer header, or the api_key query parameter.",
        ));
    };

    match store.validate_api_key(&key).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            tracing::warn!("Invalid API key presented for endpoint '{}'", endpoint.name);
            Err(ApiErrorResponse::forbidden("Invalid API key"))
        }
        Err(e) => {
            tracing::error!("API key validation failed: {}", e);
            Err(ApiErrorResponse::internal_error("Authentication error"))
        }
    }
}
