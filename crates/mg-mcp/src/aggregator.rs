//! Namespace aggregation.
//!
//! A namespace merges the capabilities of its member servers into one
//! surface. On a name collision the earliest member in namespace order wins
//! the bare name; suppressed entries stay reachable through the qualified
//! `<server>__<name>` form. A failing member never takes the namespace down:
//! it becomes a failure marker in the listing and the rest keep working.

use std::collections::HashSet;
use std::sync::Arc;

use mg_store::DefinitionStore;
use mg_types::{AppResult, GatewayError, Namespace, ServerDefinition};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bridge;
use crate::pool::ConnectionPool;
use crate::protocol::{
    JsonRpcRequest, McpPrompt, McpResource, McpTool, METHOD_NOT_FOUND,
};
use crate::transport::FragmentStream;

/// Separator between server name and capability name in qualified form.
pub const QUALIFIER: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    fn list_method(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        }
    }

    fn list_key(self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools",
            CapabilityKind::Resource => "resources",
            CapabilityKind::Prompt => "prompts",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Tool => write!(f, "tool"),
            CapabilityKind::Resource => write!(f, "resource"),
            CapabilityKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// One merged capability entry.
#[derive(Debug, Clone, Serialize)]
pub struct Capability {
    pub kind: CapabilityKind,
    /// Name as the owning server published it.
    pub name: String,
    /// `<server>__<name>`, always resolvable even when the bare name lost a
    /// collision.
    pub qualified_name: String,
    pub server_id: Uuid,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Kind-specific payload: `inputSchema` for tools, `uri`/`mimeType` for
    /// resources, `arguments` for prompts.
    pub detail: Value,
}

impl Capability {
    fn resource_uri(&self) -> Option<&str> {
        self.detail.get("uri").and_then(Value::as_str)
    }
}

/// A member that could not be listed.
#[derive(Debug, Clone, Serialize)]
pub struct MemberFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<Uuid>,
    pub server: String,
    pub error: String,
}

/// Merged capabilities of a namespace plus per-member failure markers.
#[derive(Debug, Default, Serialize)]
pub struct CapabilityListing {
    pub capabilities: Vec<Capability>,
    pub failures: Vec<MemberFailure>,
}

impl CapabilityListing {
    pub fn of_kind(&self, kind: CapabilityKind) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter().filter(move |c| c.kind == kind)
    }
}

pub struct NamespaceAggregator {
    store: Arc<dyn DefinitionStore>,
    pool: Arc<ConnectionPool>,
}

impl NamespaceAggregator {
    pub fn new(store: Arc<dyn DefinitionStore>, pool: Arc<ConnectionPool>) -> Self {
        Self { store, pool }
    }

    /// List the merged capabilities of a namespace. Member failures are
    /// reported inline, never as a whole-listing error.
    pub async fn list_capabilities(&self, namespace_id: Uuid) -> AppResult<CapabilityListing> {
        let namespace = self
            .store
            .namespace(namespace_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {namespace_id}")))?;

        let mut listing = CapabilityListing::default();
        let mut seen: HashSet<(CapabilityKind, String)> = HashSet::new();

        for (definition, failure) in self.member_definitions(&namespace).await {
            let Some(definition) = definition else {
                if let Some(failure) = failure {
                    listing.failures.push(failure);
                }
                continue;
            };
            match self.server_capabilities(&definition).await {
                Ok(capabilities) => {
                    for capability in capabilities {
                        let key = (capability.kind, capability.name.clone());
                        if seen.insert(key) {
                            listing.capabilities.push(capability);
                        } else {
                            tracing::debug!(
                                "Suppressed colliding {} '{}' from '{}' (reachable as '{}')",
                                capability.kind,
                                capability.name,
                                capability.server_name,
                                capability.qualified_name
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Listing capabilities of '{}' failed: {}",
                        definition.name,
                        e
                    );
                    listing.failures.push(MemberFailure {
                        server_id: Some(definition.id),
                        server: definition.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(listing)
    }

    /// Invoke a tool by bare or qualified name.
    pub async fn call_tool(
        &self,
        namespace_id: Uuid,
        name: &str,
        arguments: Option<Value>,
    ) -> AppResult<FragmentStream> {
        let namespace = self.namespace(namespace_id).await?;
        let (definition, local_name) = self
            .resolve_named(&namespace, CapabilityKind::Tool, name)
            .await?;

        let mut params = json!({ "name": local_name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.dispatch(&definition, "tools/call", params).await
    }

    /// Fetch a prompt by bare or qualified name.
    pub async fn get_prompt(
        &self,
        namespace_id: Uuid,
        name: &str,
        arguments: Option<Value>,
    ) -> AppResult<FragmentStream> {
        let namespace = self.namespace(namespace_id).await?;
        let (definition, local_name) = self
            .resolve_named(&namespace, CapabilityKind::Prompt, name)
            .await?;

        let mut params = json!({ "name": local_name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.dispatch(&definition, "prompts/get", params).await
    }

    /// Read a resource by uri (or by bare/qualified resource name).
    pub async fn read_resource(
        &self,
        namespace_id: Uuid,
        uri: &str,
    ) -> AppResult<FragmentStream> {
        let namespace = self.namespace(namespace_id).await?;

        for (definition, _) in self.member_definitions(&namespace).await {
            let Some(definition) = definition else { continue };
            let capabilities = match self.server_capabilities(&definition).await {
                Ok(capabilities) => capabilities,
                Err(e) => {
                    tracing::debug!("Skipping '{}' during resolution: {}", definition.name, e);
                    continue;
                }
            };
            let matched = capabilities.iter().find(|c| {
                c.kind == CapabilityKind::Resource
                    && (c.resource_uri() == Some(uri)
                        || c.name == uri
                        || c.qualified_name == uri)
            });
            if let Some(capability) = matched {
                let target = capability.resource_uri().unwrap_or(&capability.name);
                let params = json!({ "uri": target });
                return self.dispatch(&definition, "resources/read", params).await;
            }
        }
        Err(GatewayError::NotFound(format!("resource '{uri}'")))
    }

    async fn namespace(&self, namespace_id: Uuid) -> AppResult<Namespace> {
        self.store
            .namespace(namespace_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {namespace_id}")))
    }

    /// Member definitions in namespace order. A dangling id yields
    /// `(None, Some(failure))` so listings can report it.
    async fn member_definitions(
        &self,
        namespace: &Namespace,
    ) -> Vec<(Option<ServerDefinition>, Option<MemberFailure>)> {
        let mut members = Vec::with_capacity(namespace.server_ids.len());
        for server_id in &namespace.server_ids {
            match self.store.server(*server_id).await {
                Ok(Some(definition)) => members.push((Some(definition), None)),
                Ok(None) => members.push((
                    None,
                    Some(MemberFailure {
                        server_id: Some(*server_id),
                        server: server_id.to_string(),
                        error: "server definition not found".to_string(),
                    }),
                )),
                Err(e) => members.push((
                    None,
                    Some(MemberFailure {
                        server_id: Some(*server_id),
                        server: server_id.to_string(),
                        error: e.to_string(),
                    }),
                )),
            }
        }
        members
    }

    /// List one server's capabilities across all three kinds.
    ///
    /// A backend answering a list call with `method not found` simply doesn't
    /// implement that kind; other error responses are logged and that kind
    /// comes back empty. Transport failures abort the member.
    async fn server_capabilities(
        &self,
        definition: &ServerDefinition,
    ) -> AppResult<Vec<Capability>> {
        let handle = self.pool.acquire(definition).await?;
        let transport = handle.transport();

        let mut capabilities = Vec::new();
        for kind in [
            CapabilityKind::Tool,
            CapabilityKind::Resource,
            CapabilityKind::Prompt,
        ] {
            let request =
                JsonRpcRequest::with_id(1, kind.list_method().to_string(), Some(json!({})));
            let response = transport.send_request(request).await?;

            if let Some(error) = &response.error {
                if error.code != METHOD_NOT_FOUND {
                    tracing::debug!(
                        "'{}' answered {} with error {}: {}",
                        definition.name,
                        kind.list_method(),
                        error.code,
                        error.message
                    );
                }
                continue;
            }

            let Some(result) = &response.result else { continue };
            let Some(entries) = result.get(kind.list_key()).and_then(Value::as_array) else {
                continue;
            };
            for entry in entries {
                if let Some(capability) = parse_capability(kind, entry, definition) {
                    capabilities.push(capability);
                }
            }
        }
        Ok(capabilities)
    }

    /// Resolve a tool/prompt name to its owning server and local name.
    ///
    /// A `<server>__<name>` prefix pins the owner when the prefix names a
    /// member; otherwise members are scanned in namespace order and the
    /// first owner of the bare name wins, matching the listing's collision
    /// rule.
    async fn resolve_named(
        &self,
        namespace: &Namespace,
        kind: CapabilityKind,
        name: &str,
    ) -> AppResult<(ServerDefinition, String)> {
        let members = self.member_definitions(namespace).await;
        let definitions: Vec<&ServerDefinition> =
            members.iter().filter_map(|(d, _)| d.as_ref()).collect();

        if let Some((prefix, rest)) = name.split_once(QUALIFIER) {
            if let Some(definition) = definitions.iter().find(|d| d.name == prefix) {
                return Ok(((*definition).clone(), rest.to_string()));
            }
            // No member by that prefix; the capability name itself may
            // legitimately contain the separator, so fall through.
        }

        for definition in &definitions {
            let capabilities = match self.server_capabilities(definition).await {
                Ok(capabilities) => capabilities,
                Err(e) => {
                    tracing::debug!("Skipping '{}' during resolution: {}", definition.name, e);
                    continue;
                }
            };
            if capabilities
                .iter()
                .any(|c| c.kind == kind && c.name == name)
            {
                return Ok(((*definition).clone(), name.to_string()));
            }
        }

        Err(GatewayError::NotFound(format!("{kind} '{name}'")))
    }

    async fn dispatch(
        &self,
        definition: &ServerDefinition,
        method: &str,
        params: Value,
    ) -> AppResult<FragmentStream> {
        let handle = self.pool.acquire(definition).await?;
        let request = JsonRpcRequest::with_id(1, method.to_string(), Some(params));
        bridge::send(handle, request).await
    }
}

fn parse_capability(
    kind: CapabilityKind,
    entry: &Value,
    definition: &ServerDefinition,
) -> Option<Capability> {
    let (name, description, detail) = match kind {
        CapabilityKind::Tool => {
            let tool: McpTool = serde_json::from_value(entry.clone()).ok()?;
            let detail = json!({ "inputSchema": tool.input_schema });
            (tool.name, tool.description, detail)
        }
        CapabilityKind::Resource => {
            let resource: McpResource = serde_json::from_value(entry.clone()).ok()?;
            let detail = json!({ "uri": resource.uri, "mimeType": resource.mime_type });
            (resource.name, resource.description, detail)
        }
        CapabilityKind::Prompt => {
            let prompt: McpPrompt = serde_json::from_value(entry.clone()).ok()?;
            let detail = json!({ "arguments": prompt.arguments });
            (prompt.name, prompt.description, detail)
        }
    };
    Some(Capability {
        kind,
        qualified_name: format!("{}{}{}", definition.name, QUALIFIER, name),
        name,
        server_id: definition.id,
        server_name: definition.name.clone(),
        description,
        detail,
    })
}
