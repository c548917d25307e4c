//! Shared types for the metagate workspace: the error taxonomy and the
//! persisted record types every other crate speaks in.

pub mod errors;
pub mod records;

pub use errors::{AppResult, GatewayError};
pub use records::{
    AuthLevel, Endpoint, LaunchSpec, Namespace, ServerDefinition, TransportKind, ROOT_ENDPOINT,
};
