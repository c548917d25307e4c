//! Static OpenAPI document for the gateway's own surface.
//!
//! Only the fixed routes are described here; the per-endpoint tool surfaces
//! render their own live documents at `/<endpoint>/api/openapi.json`.

use axum::Json;
use serde_json::Value;
use utoipa::OpenApi;

use crate::middleware::error::ErrorBody;
use crate::routes::discovery;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "metagate",
        description = "MCP aggregation gateway: pooled backend servers merged \
                       into namespaces and republished over HTTP endpoints."
    ),
    paths(discovery::index, discovery::health, discovery::api_health),
    components(schemas(ErrorBody))
)]
pub struct ApiDoc;

/// `GET /openapi.json`
pub async fn serve_openapi() -> Json<Value> {
    // The derive produces a valid document; serialization cannot fail.
    Json(serde_json::to_value(ApiDoc::openapi()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_fixed_paths() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let paths = doc["paths"].as_object().unwrap();
        assert!(paths.contains_key("/"));
        assert!(paths.contains_key("/health"));
        assert!(paths.contains_key("/api/health"));
    }
}
