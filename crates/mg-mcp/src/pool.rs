//! Backend connection lifecycle.
//!
//! Connections live in an arena keyed by server definition id. Each slot
//! moves Cold -> Starting -> Ready <-> Active, back to Cold through Draining
//! on idle sweep, and straight back to Cold when startup fails (retry happens
//! lazily on the next acquire).
//!
//! Startup is single-flight: the first acquire on a cold slot installs a
//! shared connect future and every concurrent acquire awaits the same
//! attempt, sharing its outcome. One process spawn, one shared error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use mg_types::{AppResult, GatewayError, LaunchSpec, ServerDefinition};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::transport::{HttpEventsTransport, StdioTransport, Transport};

/// Establishes a transport for a server definition. A seam so tests can
/// substitute scripted backends for real processes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, definition: &ServerDefinition) -> AppResult<Arc<dyn Transport>>;
}

/// Production connector: spawns subprocesses, dials remote endpoints.
pub struct BackendConnector;

#[async_trait]
impl Connector for BackendConnector {
    async fn connect(&self, definition: &ServerDefinition) -> AppResult<Arc<dyn Transport>> {
        match &definition.launch {
            LaunchSpec::SubprocessStdio { command, args, env } => Ok(Arc::new(
                StdioTransport::spawn(command.clone(), args.clone(), env.clone()).await?,
            )),
            LaunchSpec::RemoteEvents { url } => Ok(Arc::new(
                HttpEventsTransport::connect(url.clone(), HashMap::new()).await?,
            )),
        }
    }
}

/// Observable slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Cold,
    Starting,
    /// Connected, no requests in flight.
    Ready,
    /// Connected with at least one request in flight.
    Active,
    /// Being torn down by the idle sweep.
    Draining,
}

/// A connected backend plus its bookkeeping.
pub struct LiveConnection {
    server_id: Uuid,
    transport: Arc<dyn Transport>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl LiveConnection {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Checked-out use of a connection. Dropping it releases the slot: the
/// in-flight count drops and the idle clock restarts.
pub struct ConnectionHandle {
    conn: Arc<LiveConnection>,
}

impl ConnectionHandle {
    pub fn server_id(&self) -> Uuid {
        self.conn.server_id
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.conn.transport.clone()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.conn.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.conn.touch();
    }
}

type SharedConnect = Shared<BoxFuture<'static, Result<Arc<LiveConnection>, Arc<GatewayError>>>>;

enum SlotState {
    Cold,
    Starting(SharedConnect),
    Live(Arc<LiveConnection>),
    Draining,
}

#[derive(Default)]
struct ServerSlot {
    state: Mutex<SlotState>,
}

impl Default for SlotState {
    fn default() -> Self {
        SlotState::Cold
    }
}

enum AcquireStep {
    Use(Arc<LiveConnection>),
    Await(SharedConnect),
    Retry,
}

/// Arena of backend connections. `acquire`, handle drop, and `sweep_idle`
/// are the only paths that mutate slot state.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    slots: DashMap<Uuid, Arc<ServerSlot>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
        }
    }

    /// Get a usable connection to the given server, starting it if needed.
    pub async fn acquire(&self, definition: &ServerDefinition) -> AppResult<ConnectionHandle> {
        let slot = self
            .slots
            .entry(definition.id)
            .or_insert_with(|| Arc::new(ServerSlot::default()))
            .clone();

        loop {
            let step = {
                let mut state = slot.state.lock();
                match &*state {
                    SlotState::Live(conn) => {
                        if conn.transport.is_healthy() {
                            AcquireStep::Use(conn.clone())
                        } else {
                            // Backend died underneath us; restart lazily.
                            tracing::warn!(
                                "Connection to '{}' found dead, restarting",
                                definition.name
                            );
                            *state = SlotState::Cold;
                            AcquireStep::Retry
                        }
                    }
                    SlotState::Starting(pending) => AcquireStep::Await(pending.clone()),
                    SlotState::Cold | SlotState::Draining => {
                        let connector = self.connector.clone();
                        let def = definition.clone();
                        let pending: SharedConnect = async move {
                            let transport = connector.connect(&def).await.map_err(Arc::new)?;
                            tracing::info!("Backend '{}' started", def.name);
                            Ok(Arc::new(LiveConnection {
                                server_id: def.id,
                                transport,
                                last_activity: Mutex::new(Instant::now()),
                                in_flight: AtomicUsize::new(0),
                            }))
                        }
                        .boxed()
                        .shared();
                        *state = SlotState::Starting(pending.clone());
                        AcquireStep::Await(pending)
                    }
                }
            };

            match step {
                AcquireStep::Use(conn) => {
                    conn.in_flight.fetch_add(1, Ordering::SeqCst);
                    conn.touch();
                    return Ok(ConnectionHandle { conn });
                }
                // Transitions below only apply while the slot still holds
                // this waiter's attempt; a stale waiter from an earlier
                // attempt must not clobber a newer one.
                AcquireStep::Await(pending) => match pending.clone().await {
                    Ok(conn) => {
                        let mut state = slot.state.lock();
                        if let SlotState::Starting(current) = &*state {
                            if current.ptr_eq(&pending) {
                                *state = SlotState::Live(conn.clone());
                            }
                        }
                        drop(state);
                        conn.in_flight.fetch_add(1, Ordering::SeqCst);
                        conn.touch();
                        return Ok(ConnectionHandle { conn });
                    }
                    Err(err) => {
                        let mut state = slot.state.lock();
                        if let SlotState::Starting(current) = &*state {
                            if current.ptr_eq(&pending) {
                                *state = SlotState::Cold;
                            }
                        }
                        drop(state);
                        tracing::warn!(
                            "Failed to start backend '{}': {}",
                            definition.name,
                            err
                        );
                        return Err(GatewayError::UpstreamUnavailable(err.to_string()));
                    }
                },
                AcquireStep::Retry => continue,
            }
        }
    }

    /// Close connections idle for at least `idle_timeout` as of `now`.
    /// Returns how many were drained. Never touches slots with requests in
    /// flight, regardless of their idle clock.
    pub async fn sweep_idle(&self, idle_timeout: Duration, now: Instant) -> usize {
        let mut victims = Vec::new();
        for entry in self.slots.iter() {
            let slot = entry.value().clone();
            let mut state = slot.state.lock();
            if let SlotState::Live(conn) = &*state {
                let idle_for = now.duration_since(*conn.last_activity.lock());
                if conn.in_flight.load(Ordering::SeqCst) == 0 && idle_for >= idle_timeout {
                    victims.push((slot.clone(), conn.clone()));
                    *state = SlotState::Draining;
                }
            }
        }

        let count = victims.len();
        for (slot, conn) in victims {
            tracing::info!("Draining idle connection to server {}", conn.server_id);
            if let Err(e) = conn.transport.close().await {
                tracing::warn!("Error closing idle connection: {}", e);
            }
            // An acquire may have restarted the slot while the close ran;
            // only a slot still draining goes back to cold.
            let mut state = slot.state.lock();
            if matches!(&*state, SlotState::Draining) {
                *state = SlotState::Cold;
            }
        }
        count
    }

    /// Pre-start connections so the first real request doesn't pay startup
    /// latency. Failures are logged, not returned; the pool retries lazily.
    pub async fn warm_up(&self, definitions: &[ServerDefinition]) {
        for definition in definitions {
            match self.acquire(definition).await {
                Ok(handle) => drop(handle),
                Err(e) => {
                    tracing::warn!("Warm-up of '{}' failed: {}", definition.name, e);
                }
            }
        }
    }

    pub fn state(&self, server_id: Uuid) -> ConnState {
        let Some(slot) = self.slots.get(&server_id) else {
            return ConnState::Cold;
        };
        let state = slot.state.lock();
        match &*state {
            SlotState::Cold => ConnState::Cold,
            SlotState::Starting(_) => ConnState::Starting,
            SlotState::Live(conn) => {
                if conn.in_flight.load(Ordering::SeqCst) > 0 {
                    ConnState::Active
                } else {
                    ConnState::Ready
                }
            }
            SlotState::Draining => ConnState::Draining,
        }
    }

    /// Close everything, resolving any in-flight requests with errors.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ServerSlot>> =
            self.slots.iter().map(|entry| entry.value().clone()).collect();
        for slot in slots {
            let conn = {
                let mut state = slot.state.lock();
                match std::mem::take(&mut *state) {
                    SlotState::Live(conn) => Some(conn),
                    _ => None,
                }
            };
            if let Some(conn) = conn {
                if let Err(e) = conn.transport.close().await {
                    tracing::warn!("Error closing connection during shutdown: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
    use futures::task::noop_waker;
    use serde_json::json;
    use std::future::Future;
    use std::sync::atomic::AtomicBool;
    use std::task::{Context as TaskContext, Poll};
    use tokio::sync::Semaphore;

    struct FakeTransport {
        healthy: AtomicBool,
        close_gate: Option<Arc<Semaphore>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                healthy: AtomicBool::new(true),
                close_gate: None,
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_request(&self, request: JsonRpcRequest) -> AppResult<JsonRpcResponse> {
            Ok(JsonRpcResponse::success(
                request.id.unwrap_or(serde_json::Value::Null),
                json!({"echo": request.method}),
            ))
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self) -> AppResult<()> {
            if let Some(gate) = &self.close_gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            self.healthy.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl FakeConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: Duration::from_millis(20),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _definition: &ServerDefinition) -> AppResult<Arc<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::UpstreamUnavailable("no such server".to_string()));
            }
            Ok(Arc::new(FakeTransport::new()))
        }
    }

    /// Connector whose connect attempts block on a semaphore, so tests can
    /// order the interesting interleavings deterministically by polling the
    /// acquire futures by hand.
    struct GatedConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
        connect_gate: Arc<Semaphore>,
        close_gate: Arc<Semaphore>,
    }

    impl GatedConnector {
        fn new(connect_permits: usize) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                connect_gate: Arc::new(Semaphore::new(connect_permits)),
                close_gate: Arc::new(Semaphore::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn connect(&self, _definition: &ServerDefinition) -> AppResult<Arc<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.connect_gate.acquire().await {
                permit.forget();
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::UpstreamUnavailable("no such server".to_string()));
            }
            Ok(Arc::new(FakeTransport {
                healthy: AtomicBool::new(true),
                close_gate: Some(self.close_gate.clone()),
            }))
        }
    }

    fn definition() -> ServerDefinition {
        ServerDefinition {
            id: Uuid::new_v4(),
            name: "fake".to_string(),
            launch: LaunchSpec::SubprocessStdio {
                command: "true".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_connect() {
        let connector = Arc::new(FakeConnector::new());
        let pool = Arc::new(ConnectionPool::new(connector.clone()));
        let def = definition();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let def = def.clone();
            tasks.push(tokio::spawn(async move { pool.acquire(&def).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_is_shared_then_retried() {
        let connector = Arc::new(FakeConnector::new());
        connector.fail.store(true, Ordering::SeqCst);
        let pool = Arc::new(ConnectionPool::new(connector.clone()));
        let def = definition();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let def = def.clone();
            tasks.push(tokio::spawn(async move { pool.acquire(&def).await }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(GatewayError::UpstreamUnavailable(_))));
        }
        // All eight failures came from the same attempt.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.state(def.id), ConnState::Cold);

        // The next acquire retries from Cold.
        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire(&def).await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_failure_waiter_leaves_a_fresh_attempt_alone() {
        let connector = Arc::new(GatedConnector::new(0));
        connector.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(connector.clone());
        let def = definition();

        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);

        // Two waiters share the first (blocked) attempt.
        let mut first = Box::pin(pool.acquire(&def));
        assert!(first.as_mut().poll(&mut cx).is_pending());
        let mut stale = Box::pin(pool.acquire(&def));
        assert!(stale.as_mut().poll(&mut cx).is_pending());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // Attempt #1 fails; the first waiter observes it and resets the slot.
        connector.connect_gate.add_permits(1);
        match first.as_mut().poll(&mut cx) {
            Poll::Ready(result) => assert!(result.is_err()),
            Poll::Pending => panic!("first waiter should have resolved"),
        }
        assert_eq!(pool.state(def.id), ConnState::Cold);

        // A fresh attempt starts before the stale waiter runs again.
        connector.fail.store(false, Ordering::SeqCst);
        let mut fresh = Box::pin(pool.acquire(&def));
        assert!(fresh.as_mut().poll(&mut cx).is_pending());
        assert_eq!(pool.state(def.id), ConnState::Starting);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        // The stale waiter resolves with the old failure but must not reset
        // the slot underneath the in-flight attempt.
        match stale.as_mut().poll(&mut cx) {
            Poll::Ready(result) => assert!(result.is_err()),
            Poll::Pending => panic!("stale waiter should have resolved"),
        }
        assert_eq!(pool.state(def.id), ConnState::Starting);

        connector.connect_gate.add_permits(1);
        let handle = loop {
            match fresh.as_mut().poll(&mut cx) {
                Poll::Ready(result) => break result.unwrap(),
                Poll::Pending => tokio::task::yield_now().await,
            }
        };
        // Still exactly two connects: nothing restarted the slot a third time.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        drop(handle);
        assert_eq!(pool.state(def.id), ConnState::Ready);
    }

    #[tokio::test]
    async fn drain_does_not_clobber_a_racing_restart() {
        let connector = Arc::new(GatedConnector::new(1));
        let pool = ConnectionPool::new(connector.clone());
        let def = definition();

        drop(pool.acquire(&def).await.unwrap());
        assert_eq!(pool.state(def.id), ConnState::Ready);

        let waker = noop_waker();
        let mut cx = TaskContext::from_waker(&waker);

        // The sweep picks the idle connection and blocks inside close.
        let later = Instant::now() + Duration::from_secs(61);
        let mut sweep = Box::pin(pool.sweep_idle(Duration::from_secs(60), later));
        assert!(sweep.as_mut().poll(&mut cx).is_pending());
        assert_eq!(pool.state(def.id), ConnState::Draining);

        // A request arrives mid-drain and installs a fresh connection.
        connector.connect_gate.add_permits(1);
        let mut fresh = Box::pin(pool.acquire(&def));
        let handle = loop {
            match fresh.as_mut().poll(&mut cx) {
                Poll::Ready(result) => break result.unwrap(),
                Poll::Pending => tokio::task::yield_now().await,
            }
        };
        assert_eq!(pool.state(def.id), ConnState::Active);

        // The drain finishes afterwards and must leave the live slot alone.
        connector.close_gate.add_permits(1);
        let swept = loop {
            match sweep.as_mut().poll(&mut cx) {
                Poll::Ready(count) => break count,
                Poll::Pending => tokio::task::yield_now().await,
            }
        };
        assert_eq!(swept, 1);
        assert_eq!(pool.state(def.id), ConnState::Active);
        drop(handle);
        assert_eq!(pool.state(def.id), ConnState::Ready);
    }

    #[tokio::test]
    async fn handle_drop_moves_active_back_to_ready() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::new()));
        let def = definition();

        let handle = pool.acquire(&def).await.unwrap();
        assert_eq!(pool.state(def.id), ConnState::Active);
        drop(handle);
        assert_eq!(pool.state(def.id), ConnState::Ready);
    }

    #[tokio::test]
    async fn idle_connections_are_swept() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());
        let def = definition();

        drop(pool.acquire(&def).await.unwrap());

        // Not idle long enough yet.
        let swept = pool.sweep_idle(Duration::from_secs(60), Instant::now()).await;
        assert_eq!(swept, 0);
        assert_eq!(pool.state(def.id), ConnState::Ready);

        // Pretend a minute passed.
        let later = Instant::now() + Duration::from_secs(61);
        let swept = pool.sweep_idle(Duration::from_secs(60), later).await;
        assert_eq!(swept, 1);
        assert_eq!(pool.state(def.id), ConnState::Cold);

        // Next acquire reconnects.
        assert!(pool.acquire(&def).await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn active_connections_are_never_swept() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::new()));
        let def = definition();

        let handle = pool.acquire(&def).await.unwrap();
        let later = Instant::now() + Duration::from_secs(3600);
        let swept = pool.sweep_idle(Duration::from_secs(60), later).await;
        assert_eq!(swept, 0);
        assert_eq!(pool.state(def.id), ConnState::Active);
        drop(handle);
    }

    #[tokio::test]
    async fn dead_connection_restarts_on_acquire() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());
        let def = definition();

        let handle = pool.acquire(&def).await.unwrap();
        handle.transport().close().await.unwrap();
        drop(handle);

        assert!(pool.acquire(&def).await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_up_leaves_connections_ready() {
        let connector = Arc::new(FakeConnector::new());
        let pool = ConnectionPool::new(connector.clone());
        let def = definition();

        pool.warm_up(std::slice::from_ref(&def)).await;
        assert_eq!(pool.state(def.id), ConnState::Ready);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }
}
