//! In-memory [`DefinitionStore`] seeded from a [`BootstrapConfig`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use mg_types::{AppResult, Endpoint, GatewayError, Namespace, ServerDefinition};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{BootstrapConfig, DefinitionStore};

#[derive(Debug, Default)]
struct Inner {
    servers: HashMap<Uuid, ServerDefinition>,
    namespaces: HashMap<Uuid, Namespace>,
    endpoints: HashMap<Uuid, Endpoint>,
    api_keys: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from bootstrap config, resolving name references.
    /// Unknown references are configuration mistakes and fail loudly here
    /// rather than surfacing later as per-request misses.
    pub fn from_config(config: &BootstrapConfig) -> AppResult<Self> {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            inner.api_keys = config.api_keys.iter().cloned().collect();
        }

        let mut server_ids: HashMap<String, Uuid> = HashMap::new();
        for seed in &config.servers {
            let def = ServerDefinition {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                launch: seed.launch.clone(),
            };
            server_ids.insert(def.name.clone(), def.id);
            store.insert_server(def)?;
        }

        let mut namespace_ids: HashMap<String, Uuid> = HashMap::new();
        for seed in &config.namespaces {
            let mut members = Vec::with_capacity(seed.servers.len());
            for name in &seed.servers {
                let id = server_ids.get(name).ok_or_else(|| {
                    GatewayError::Store(format!(
                        "namespace '{}' references unknown server '{}'",
                        seed.name, name
                    ))
                })?;
                members.push(*id);
            }
            let ns = Namespace {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                server_ids: members,
                is_system: seed.is_system,
            };
            namespace_ids.insert(ns.name.clone(), ns.id);
            store.insert_namespace(ns)?;
        }

        for seed in &config.endpoints {
            let namespace_id = namespace_ids.get(&seed.namespace).ok_or_else(|| {
                GatewayError::Store(format!(
                    "endpoint '{}' references unknown namespace '{}'",
                    seed.name, seed.namespace
                ))
            })?;
            store.insert_endpoint(Endpoint {
                id: Uuid::new_v4(),
                name: seed.name.clone(),
                namespace_id: *namespace_id,
                auth_level: seed.auth,
                allow_query_param_auth: seed.allow_query_param_auth,
            })?;
        }

        Ok(store)
    }

    fn insert_server(&self, definition: ServerDefinition) -> AppResult<ServerDefinition> {
        let mut inner = self.inner.write();
        if inner.servers.values().any(|s| s.name == definition.name) {
            return Err(GatewayError::Store(format!(
                "server name '{}' already exists",
                definition.name
            )));
        }
        inner.servers.insert(definition.id, definition.clone());
        Ok(definition)
    }

    fn insert_namespace(&self, namespace: Namespace) -> AppResult<Namespace> {
        let mut inner = self.inner.write();
        if inner.namespaces.values().any(|n| n.name == namespace.name) {
            return Err(GatewayError::Store(format!(
                "namespace name '{}' already exists",
                namespace.name
            )));
        }
        inner.namespaces.insert(namespace.id, namespace.clone());
        Ok(namespace)
    }

    fn insert_endpoint(&self, endpoint: Endpoint) -> AppResult<Endpoint> {
        let mut inner = self.inner.write();
        if inner.endpoints.values().any(|e| e.name == endpoint.name) {
            return Err(GatewayError::Store(format!(
                "endpoint name '{}' already exists",
                endpoint.name
            )));
        }
        inner.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    pub fn add_api_key(&self, key: impl Into<String>) {
        self.inner.write().api_keys.insert(key.into());
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn server(&self, id: Uuid) -> AppResult<Option<ServerDefinition>> {
        Ok(self.inner.read().servers.get(&id).cloned())
    }

    async fn server_by_name(&self, name: &str) -> AppResult<Option<ServerDefinition>> {
        Ok(self
            .inner
            .read()
            .servers
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn namespace(&self, id: Uuid) -> AppResult<Option<Namespace>> {
        Ok(self.inner.read().namespaces.get(&id).cloned())
    }

    async fn namespace_by_name(&self, name: &str) -> AppResult<Option<Namespace>> {
        Ok(self
            .inner
            .read()
            .namespaces
            .values()
            .find(|n| n.name == name)
            .cloned())
    }

    async fn endpoint_by_name(&self, name: &str) -> AppResult<Option<Endpoint>> {
        Ok(self
            .inner
            .read()
            .endpoints
            .values()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn list_endpoints(&self) -> AppResult<Vec<Endpoint>> {
        let mut endpoints: Vec<Endpoint> = self.inner.read().endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(endpoints)
    }

    async fn create_server(&self, definition: ServerDefinition) -> AppResult<ServerDefinition> {
        self.insert_server(definition)
    }

    async fn create_namespace(&self, namespace: Namespace) -> AppResult<Namespace> {
        self.insert_namespace(namespace)
    }

    async fn create_endpoint(&self, endpoint: Endpoint) -> AppResult<Endpoint> {
        self.insert_endpoint(endpoint)
    }

    async fn validate_api_key(&self, key: &str) -> AppResult<bool> {
        Ok(self.inner.read().api_keys.contains(key))
    }
}
