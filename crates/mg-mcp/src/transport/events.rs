//! Remote event-stream transport.
//!
//! Talks to a remote MCP endpoint over HTTP POST. The backend answers either
//! with a plain JSON body or with `text/event-stream`, in which case
//! intermediate messages become fragments and the stream ends at the response
//! matching our request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use mg_types::{AppResult, GatewayError};
use serde_json::Value;

use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{FragmentStream, ResponseFragment, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct HttpEventsTransport {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpEventsTransport {
    /// Probe the remote endpoint and build the transport.
    ///
    /// The probe only checks reachability; any HTTP status counts as alive
    /// since servers differ in how they answer a bare GET.
    pub async fn connect(url: String, headers: HashMap<String, String>) -> AppResult<Self> {
        tracing::info!("Connecting to remote MCP endpoint: {}", url);

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build http client: {e}")))?;

        let mut probe = client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (name, value) in &headers {
            probe = probe.header(name, value);
        }
        tokio::time::timeout(CONNECT_TIMEOUT, probe.send())
            .await
            .map_err(|_| {
                GatewayError::UpstreamUnavailable(format!("timed out probing {url}"))
            })?
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("cannot reach {url}: {e}")))?;

        Ok(Self {
            url,
            client,
            headers,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post(&self, request: &JsonRpcRequest) -> AppResult<reqwest::Response> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(GatewayError::UpstreamUnavailable(
                "transport is closed".to_string(),
            ));
        }

        let mut builder = self
            .client
            .post(&self.url)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(request);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            GatewayError::UpstreamUnavailable(format!("request to {} failed: {e}", self.url))
        })?;
        if !response.status().is_success() {
            return Err(GatewayError::UpstreamUnavailable(format!(
                "remote endpoint returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    fn is_event_stream(response: &reqwest::Response) -> bool {
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false)
    }
}

/// Pull complete SSE events out of the buffer, returning their joined
/// `data:` payloads. Incomplete trailing data stays in the buffer.
fn drain_events(buffer: &mut String) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        let data: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

fn ids_match(response: &JsonRpcResponse, id: u64) -> bool {
    response.id == Value::Number(id.into()) || response.id == Value::String(id.to_string())
}

#[async_trait]
impl Transport for HttpEventsTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> AppResult<JsonRpcResponse> {
        let mut stream =
            tokio::time::timeout(REQUEST_TIMEOUT, self.stream_request(request)).await.map_err(
                |_| GatewayError::UpstreamUnavailable("request timed out".to_string()),
            )??;

        let collect = async {
            while let Some(fragment) = stream.next().await {
                if let ResponseFragment::End(response) = fragment? {
                    return Ok(response);
                }
            }
            Err(GatewayError::UpstreamUnavailable(
                "event stream ended before the final response".to_string(),
            ))
        };
        tokio::time::timeout(REQUEST_TIMEOUT, collect)
            .await
            .map_err(|_| GatewayError::UpstreamUnavailable("request timed out".to_string()))?
    }

    async fn stream_request(&self, mut request: JsonRpcRequest) -> AppResult<FragmentStream> {
        let id = self.next_request_id();
        request.id = Some(Value::Number(id.into()));

        let response = self.post(&request).await?;

        if !Self::is_event_stream(&response) {
            let response: JsonRpcResponse = response.json().await.map_err(|e| {
                GatewayError::UpstreamUnavailable(format!("bad response body: {e}"))
            })?;
            return Ok(Box::pin(futures::stream::once(async move {
                Ok(ResponseFragment::End(response))
            })) as FragmentStream);
        }

        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            loop {
                let chunk = match body.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield Err(GatewayError::UpstreamUnavailable(format!(
                            "event stream failed: {e}"
                        )));
                        return;
                    }
                    None => {
                        yield Err(GatewayError::UpstreamUnavailable(
                            "event stream ended before the final response".to_string(),
                        ));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));

                for data in drain_events(&mut buffer) {
                    match serde_json::from_str::<JsonRpcMessage>(&data) {
                        Ok(JsonRpcMessage::Response(response)) if ids_match(&response, id) => {
                            yield Ok(ResponseFragment::End(response));
                            return;
                        }
                        Ok(message) => {
                            match serde_json::to_value(&message) {
                                Ok(value) => yield Ok(ResponseFragment::Chunk(value)),
                                Err(e) => tracing::warn!("Unserializable event dropped: {}", e),
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Skipping unparseable event: {}\nData: {}", e, data);
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream) as FragmentStream)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> AppResult<()> {
        // Outstanding HTTP calls finish or time out on their own; new ones
        // are refused.
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}
