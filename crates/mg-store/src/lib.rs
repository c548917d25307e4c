//! Definition store: the lookup boundary between the gateway and its
//! configuration. The gateway only ever reads records through the
//! [`DefinitionStore`] trait; the bundled [`MemoryStore`] is seeded from a
//! TOML bootstrap file.

pub mod config;
pub mod memory;

use async_trait::async_trait;
use mg_types::{AppResult, Endpoint, Namespace, ServerDefinition};
use uuid::Uuid;

pub use config::{BootstrapConfig, SystemSeed};
pub use memory::MemoryStore;

/// Read access to server/namespace/endpoint records plus the minimal write
/// surface startup seeding needs.
///
/// Records returned from here are already validated; a dangling reference is
/// still possible mid-reconfiguration and callers must treat it as a miss.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn server(&self, id: Uuid) -> AppResult<Option<ServerDefinition>>;
    async fn server_by_name(&self, name: &str) -> AppResult<Option<ServerDefinition>>;

    async fn namespace(&self, id: Uuid) -> AppResult<Option<Namespace>>;
    async fn namespace_by_name(&self, name: &str) -> AppResult<Option<Namespace>>;

    async fn endpoint_by_name(&self, name: &str) -> AppResult<Option<Endpoint>>;
    async fn list_endpoints(&self) -> AppResult<Vec<Endpoint>>;

    /// Insert a new server definition. Names are unique; inserting a
    /// duplicate name is a [`mg_types::GatewayError::Store`] error.
    async fn create_server(&self, definition: ServerDefinition) -> AppResult<ServerDefinition>;
    async fn create_namespace(&self, namespace: Namespace) -> AppResult<Namespace>;
    async fn create_endpoint(&self, endpoint: Endpoint) -> AppResult<Endpoint>;

    /// Whether the presented API key grants access to keyed endpoints.
    async fn validate_api_key(&self, key: &str) -> AppResult<bool>;
}
