//! HTTP surface of the metagate gateway: endpoint routing, auth, rate
//! limiting, SSE sessions, the streamable JSON-RPC surface, and startup
//! seeding.

pub mod middleware;
pub mod openapi;
pub mod routes;
pub mod seed;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
