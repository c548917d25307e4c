//! MCP plumbing for metagate: JSON-RPC protocol types, backend transports
//! (subprocess stdio and remote event streams), the pooled connection
//! lifecycle, the request/response bridge, and the namespace aggregator.

pub mod aggregator;
pub mod bridge;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use aggregator::{Capability, CapabilityKind, CapabilityListing, NamespaceAggregator};
pub use pool::{BackendConnector, ConnState, ConnectionHandle, ConnectionPool, Connector};
pub use transport::{FragmentStream, ResponseFragment, Transport};
