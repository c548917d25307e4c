//! Startup seeding of the system endpoint.
//!
//! Find-or-create, in dependency order: the system server definition, the
//! system namespace containing it, and the `root` endpoint publishing that
//! namespace. Running it against a populated store changes nothing and
//! returns the existing records.

use std::sync::Arc;

use mg_store::{DefinitionStore, SystemSeed};
use mg_types::{AppResult, AuthLevel, Endpoint, Namespace, ServerDefinition};
use uuid::Uuid;

use crate::state::AppState;

pub struct SeedOutcome {
    pub server: ServerDefinition,
    pub namespace: Namespace,
    pub endpoint: Endpoint,
}

/// Ensure the system server/namespace/endpoint triple exists.
pub async fn ensure_system_endpoint(
    store: &Arc<dyn DefinitionStore>,
    seed: &SystemSeed,
) -> AppResult<SeedOutcome> {
    let server = match store.server_by_name(&seed.server).await? {
        Some(server) => server,
        None => {
            tracing::info!("Seeding system server '{}'", seed.server);
            store
                .create_server(ServerDefinition {
                    id: Uuid::new_v4(),
                    name: seed.server.clone(),
                    launch: seed.launch.clone(),
                })
                .await?
        }
    };

    let namespace = match store.namespace_by_name(&seed.namespace).await? {
        Some(namespace) => namespace,
        None => {
            tracing::info!("Seeding system namespace '{}'", seed.namespace);
            store
                .create_namespace(Namespace {
                    id: Uuid::new_v4(),
                    name: seed.namespace.clone(),
                    server_ids: vec![server.id],
                    is_system: true,
                })
                .await?
        }
    };

    let endpoint = match store.endpoint_by_name(&seed.endpoint).await? {
        Some(endpoint) => endpoint,
        None => {
            tracing::info!("Seeding system endpoint '{}'", seed.endpoint);
            store
                .create_endpoint(Endpoint {
                    id: Uuid::new_v4(),
                    name: seed.endpoint.clone(),
                    namespace_id: namespace.id,
                    auth_level: AuthLevel::Public,
                    allow_query_param_auth: false,
                })
                .await?
        }
    };

    Ok(SeedOutcome {
        server,
        namespace,
        endpoint,
    })
}

/// Seed (when configured) and pre-start the system namespace's members.
/// Best-effort: a failure is logged and the gateway starts anyway, retrying
/// lazily on first use.
pub async fn seed_and_warm(state: &AppState, seed: Option<&SystemSeed>) {
    let Some(seed) = seed else {
        tracing::debug!("No system seed configured, skipping");
        return;
    };

    let outcome = match ensure_system_endpoint(&state.store, seed).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!("System endpoint seeding failed: {}", e);
            return;
        }
    };

    let mut definitions = Vec::new();
    for server_id in &outcome.namespace.server_ids {
        match state.store.server(*server_id).await {
            Ok(Some(definition)) => definitions.push(definition),
            Ok(None) => tracing::warn!("System namespace member {} not found", server_id),
            Err(e) => tracing::warn!("Loading system namespace member failed: {}", e),
        }
    }
    state.pool.warm_up(&definitions).await;
}
