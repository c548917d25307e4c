//! Persisted record types served by the definition store.
//!
//! These arrive pre-validated: referential integrity between endpoints,
//! namespaces, and server definitions is the store's responsibility. Readers
//! still treat a dangling reference as a lookup miss, never a panic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the distinguished system endpoint served at the root aliases
/// (`/sse`, `/mcp`, `/api`) in addition to its own `/root/...` paths.
pub const ROOT_ENDPOINT: &str = "root";

/// Transport family of a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local child process speaking line-delimited JSON-RPC over stdio.
    SubprocessStdio,
    /// Remote HTTP endpoint answering with JSON or `text/event-stream`.
    RemoteEvents,
}

/// How to reach a backend server.
///
/// Commands arrive pre-tokenized (`command` + `args`), so no shell parsing
/// happens at launch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchSpec {
    SubprocessStdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    RemoteEvents {
        url: String,
    },
}

impl LaunchSpec {
    pub fn transport_kind(&self) -> TransportKind {
        match self {
            LaunchSpec::SubprocessStdio { .. } => TransportKind::SubprocessStdio,
            LaunchSpec::RemoteEvents { .. } => TransportKind::RemoteEvents,
        }
    }
}

/// A backend MCP server registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: Uuid,
    /// Unique human-readable name; also the prefix of qualified capability
    /// names (`<server>__<capability>`).
    pub name: String,
    pub launch: LaunchSpec,
}

impl ServerDefinition {
    pub fn transport_kind(&self) -> TransportKind {
        self.launch.transport_kind()
    }
}

/// An ordered group of servers whose capabilities are merged into one
/// namespace. Member order decides collision winners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub id: Uuid,
    pub name: String,
    pub server_ids: Vec<Uuid>,
    /// Set on the namespace created by startup seeding.
    #[serde(default)]
    pub is_system: bool,
}

/// Authentication required by a public endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthLevel {
    #[default]
    Public,
    ApiKey,
}

/// A public HTTP endpoint publishing one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    /// First path segment: `/<name>/mcp`, `/<name>/sse`, `/<name>/api`.
    pub name: String,
    pub namespace_id: Uuid,
    #[serde(default)]
    pub auth_level: AuthLevel,
    /// Whether `?api_key=` is accepted in addition to headers. Off by
    /// default since query strings tend to end up in access logs.
    #[serde(default)]
    pub allow_query_param_auth: bool,
}
