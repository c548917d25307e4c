//! Backend transports.
//!
//! A transport owns one live connection to a backend MCP server and handles
//! request/response correlation on it. Two implementations exist: spawned
//! subprocesses speaking line-delimited JSON-RPC over stdio, and remote HTTP
//! endpoints answering with JSON or `text/event-stream`.

pub mod events;
pub mod stdio;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use mg_types::AppResult;
use serde_json::Value;

use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

pub use events::HttpEventsTransport;
pub use stdio::StdioTransport;

/// One piece of a (possibly streamed) backend answer.
#[derive(Debug, Clone)]
pub enum ResponseFragment {
    /// An intermediate message produced while the request runs, e.g. a
    /// progress notification. Carries the raw JSON-RPC envelope.
    Chunk(Value),
    /// The final response. Always the last fragment of a stream.
    End(JsonRpcResponse),
}

/// Stream of fragments ending in [`ResponseFragment::End`] or an error.
/// Never unbounded silence: transports time out or resolve on teardown.
pub type FragmentStream = Pin<Box<dyn Stream<Item = AppResult<ResponseFragment>> + Send>>;

/// A live connection to a backend server.
///
/// Transports assign their own correlation ids; the id on an inbound
/// [`JsonRpcRequest`] is replaced before it goes over the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its single final response.
    async fn send_request(&self, request: JsonRpcRequest) -> AppResult<JsonRpcResponse>;

    /// Send a request and observe intermediate fragments. The default wraps
    /// [`Transport::send_request`] in a one-fragment stream.
    async fn stream_request(&self, request: JsonRpcRequest) -> AppResult<FragmentStream> {
        let response = self.send_request(request).await?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok(ResponseFragment::End(response))
        })) as FragmentStream)
    }

    /// Whether this transport can produce intermediate fragments.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Cheap liveness check, safe to call from non-async contexts.
    fn is_healthy(&self) -> bool;

    /// Tear the connection down. Every in-flight request must resolve with
    /// an error; none may hang.
    async fn close(&self) -> AppResult<()>;
}
