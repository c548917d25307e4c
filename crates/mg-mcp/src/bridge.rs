//! Protocol bridge between inbound client requests and pooled backend
//! connections.
//!
//! Everything flows through fragment streams: a single-shot backend answers
//! with one `End` fragment, a streaming backend may interleave `Chunk`
//! fragments first. The checked-out [`ConnectionHandle`] rides inside the
//! stream, so dropping the stream (client disconnect, early hangup) releases
//! the slot and restarts the connection's idle clock.

use futures_util::StreamExt;
use mg_types::{AppResult, GatewayError};
use serde_json::Value;

use crate::pool::ConnectionHandle;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::{FragmentStream, ResponseFragment};

/// Forward one request over the given connection.
///
/// The returned stream always terminates: with an `End` fragment, or with an
/// error when the backend fails or the connection is torn down mid-request.
pub async fn send(handle: ConnectionHandle, request: JsonRpcRequest) -> AppResult<FragmentStream> {
    let transport = handle.transport();

    if transport.supports_streaming() {
        let mut upstream = transport.stream_request(request).await?;
        let stream = async_stream::stream! {
            let _handle = handle;
            while let Some(item) = upstream.next().await {
                let done = matches!(&item, Ok(ResponseFragment::End(_)) | Err(_));
                yield item;
                if done {
                    return;
                }
            }
            yield Err(GatewayError::UpstreamUnavailable(
                "backend stream ended without a final response".to_string(),
            ));
        };
        return Ok(Box::pin(stream) as FragmentStream);
    }

    let stream = async_stream::stream! {
        let _handle = handle;
        match transport.send_request(request).await {
            Ok(response) => yield Ok(ResponseFragment::End(response)),
            Err(e) => yield Err(e),
        }
    };
    Ok(Box::pin(stream) as FragmentStream)
}

/// Drain a fragment stream into its intermediate chunks and final response.
/// Used by surfaces that answer with a single JSON body.
pub async fn collect(mut stream: FragmentStream) -> AppResult<(Vec<Value>, JsonRpcResponse)> {
    let mut chunks = Vec::new();
    while let Some(fragment) = stream.next().await {
        match fragment? {
            ResponseFragment::Chunk(chunk) => chunks.push(chunk),
            ResponseFragment::End(response) => return Ok((chunks, response)),
        }
    }
    Err(GatewayError::UpstreamUnavailable(
        "stream ended without a final response".to_string(),
    ))
}
