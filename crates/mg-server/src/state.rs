//! Shared application state and inbound SSE session tracking.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mg_mcp::pool::ConnectionPool;
use mg_mcp::protocol::JsonRpcResponse;
use mg_mcp::NamespaceAggregator;
use mg_store::DefinitionStore;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::middleware::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DefinitionStore>,
    pub pool: Arc<ConnectionPool>,
    pub aggregator: Arc<NamespaceAggregator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub sse_sessions: Arc<SseSessionManager>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DefinitionStore>,
        pool: Arc<ConnectionPool>,
        aggregator: Arc<NamespaceAggregator>,
    ) -> Self {
        Self {
            store,
            pool,
            aggregator,
            rate_limiter: Arc::new(RateLimiter::new()),
            sse_sessions: Arc::new(SseSessionManager::new()),
            started_at: Utc::now(),
        }
    }
}

/// Message pushed down an inbound SSE session.
#[derive(Debug, Clone)]
pub enum SseMessage {
    Response(JsonRpcResponse),
    /// Raw JSON-RPC envelope of an intermediate backend message.
    Notification(Value),
}

/// Open `GET /<endpoint>/sse` sessions, keyed by session id.
///
/// `POST /<endpoint>/message` looks the session up to push responses down
/// the stream; a dropped stream unregisters itself.
#[derive(Default)]
pub struct SseSessionManager {
    sessions: DashMap<String, mpsc::UnboundedSender<SseMessage>>,
}

impl SseSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: String) -> mpsc::UnboundedReceiver<SseMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(session_id, tx);
        rx
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
        tracing::debug!("SSE session {} closed", session_id);
    }

    /// Deliver a message to the session. Returns false when the session is
    /// gone, letting callers fall back to answering in the HTTP body.
    pub fn send(&self, session_id: &str, message: SseMessage) -> bool {
        match self.sessions.get(session_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_reaches_registered_session() {
        let manager = SseSessionManager::new();
        let mut rx = manager.register("s1".to_string());

        assert!(manager.send(
            "s1",
            SseMessage::Response(JsonRpcResponse::success(json!(1), json!({})))
        ));
        assert!(matches!(rx.recv().await, Some(SseMessage::Response(_))));

        assert!(!manager.send("missing", SseMessage::Notification(json!({}))));

        manager.unregister("s1");
        assert!(manager.is_empty());
        assert!(!manager.send("s1", SseMessage::Notification(json!({}))));
    }
}
