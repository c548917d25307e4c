//! TOML bootstrap configuration for the in-memory store.
//!
//! Example:
//!
//! ```toml
//! api_keys = ["sk-local-dev"]
//!
//! [[servers]]
//! name = "docs"
//! kind = "subprocess_stdio"
//! command = "npx"
//! args = ["-y", "@upstash/context7-mcp"]
//!
//! [[namespaces]]
//! name = "default"
//! servers = ["docs"]
//!
//! [[endpoints]]
//! name = "docs"
//! namespace = "default"
//! auth = "api_key"
//!
//! [seed]
//! server = "system-docs"
//! kind = "subprocess_stdio"
//! command = "npx"
//! args = ["-y", "@upstash/context7-mcp"]
//! namespace = "system"
//! ```

use std::path::Path;

use mg_types::{AppResult, AuthLevel, GatewayError, LaunchSpec, ROOT_ENDPOINT};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootstrapConfig {
    /// Keys accepted on endpoints with `auth = "api_key"`.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub servers: Vec<ServerSeed>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceSeed>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSeed>,
    /// Optional system server seeded idempotently at startup and published
    /// on the root aliases. Skipped when absent.
    pub seed: Option<SystemSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSeed {
    pub name: String,
    #[serde(flatten)]
    pub launch: LaunchSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceSeed {
    pub name: String,
    /// Member server names, in collision-priority order.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSeed {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub auth: AuthLevel,
    #[serde(default)]
    pub allow_query_param_auth: bool,
}

/// The find-or-create triple ensured at startup: one server definition, one
/// system namespace containing it, and the `root` endpoint publishing that
/// namespace.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemSeed {
    /// Server definition name.
    pub server: String,
    #[serde(flatten)]
    pub launch: LaunchSpec,
    pub namespace: String,
    #[serde(default = "default_root_endpoint")]
    pub endpoint: String,
}

fn default_root_endpoint() -> String {
    ROOT_ENDPOINT.to_string()
}

impl BootstrapConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        toml::from_str(raw).map_err(|e| GatewayError::Store(format!("bad bootstrap config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mg_types::TransportKind;

    #[test]
    fn parses_full_config() {
        let cfg = BootstrapConfig::parse(
            r#"
            api_keys = ["sk-test"]

            [[servers]]
            name = "docs"
            kind = "subprocess_stdio"
            command = "npx"
            args = ["-y", "@upstash/context7-mcp"]

            [[servers]]
            name = "search"
            kind = "remote_events"
            url = "http://localhost:3100/mcp"

            [[namespaces]]
            name = "default"
            servers = ["docs", "search"]

            [[endpoints]]
            name = "docs"
            namespace = "default"
            auth = "api_key"
            allow_query_param_auth = true

            [seed]
            server = "system-docs"
            kind = "subprocess_stdio"
            command = "npx"
            args = ["-y", "@upstash/context7-mcp"]
            namespace = "system"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.api_keys, vec!["sk-test"]);
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(
            cfg.servers[0].launch.transport_kind(),
            TransportKind::SubprocessStdio
        );
        assert_eq!(
            cfg.servers[1].launch.transport_kind(),
            TransportKind::RemoteEvents
        );
        assert_eq!(cfg.namespaces[0].servers, vec!["docs", "search"]);
        assert_eq!(cfg.endpoints[0].auth, AuthLevel::ApiKey);
        assert!(cfg.endpoints[0].allow_query_param_auth);

        let seed = cfg.seed.unwrap();
        assert_eq!(seed.endpoint, ROOT_ENDPOINT);
        assert_eq!(seed.namespace, "system");
    }

    #[test]
    fn empty_config_is_valid() {
        let cfg = BootstrapConfig::parse("").unwrap();
        assert!(cfg.servers.is_empty());
        assert!(cfg.seed.is_none());
    }

    #[test]
    fn bad_toml_is_a_store_error() {
        let err = BootstrapConfig::parse("[[servers]]\nname = 3").unwrap_err();
        assert!(matches!(err, GatewayError::Store(_)));
    }
}
