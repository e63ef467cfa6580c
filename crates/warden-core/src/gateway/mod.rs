//! Gateway connection management.
//!
//! One authenticated WebSocket per sandbox, owned by the
//! [`ConnectionRegistry`]. The registry performs the challenge/response
//! handshake (with pairing recovery and bounded retries), correlates
//! requests to responses, dispatches inbound events, runs the keepalive
//! probe, and reclaims idle connections.
//!
//! Per-turn interest is a short-lived waiter registration keyed by sandbox
//! id: streaming deltas accumulate into it, the terminal event resolves it,
//! and it is cleared on completion or timeout so nothing leaks into the next
//! turn. Terminal content with no registered waiter is an agent-initiated
//! message and goes to the outbound route instead.

pub mod pairing;
pub mod protocol;

use crate::config::CoreConfig;
use crate::container::ContainerManager;
use crate::error::{Error, Result};
use crate::identity::{AssertionParams, IdentityStore};
use crate::outbound::{OutboundRoute, OutboundSource};
use crate::queue::TurnTransport;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pairing::recover_pairing;
use protocol::{classify_event, heartbeat_needs_delivery, Frame, GatewayEvent};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const CLIENT_ID: &str = "cli";
const CLIENT_MODE: &str = "cli";
const ROLE: &str = "operator";
const SCOPES: [&str; 2] = ["operator.read", "operator.write"];
const PROTOCOL_MIN: u32 = 3;
const PROTOCOL_MAX: u32 = 3;
const MAX_CONNECT_ATTEMPTS: u32 = 3;
const KEEPALIVE_DEFAULT_MS: u64 = 15_000;
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PAIRING_RETRY_DELAY: Duration = Duration::from_millis(1500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One live channel to a sandbox gateway.
pub struct Connection {
    /// Sandbox this channel belongs to
    pub sandbox_id: String,
    /// Host port the gateway is reachable on
    pub port: u16,
    sink: Mutex<WsSink>,
    authenticated: AtomicBool,
    open: AtomicBool,
    last_activity_ms: AtomicI64,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn is_usable(&self) -> bool {
        self.open.load(Ordering::Relaxed) && self.authenticated.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last event of interest.
    pub fn idle_ms(&self) -> i64 {
        now_ms() - self.last_activity_ms.load(Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text = serde_json::to_string(frame).map_err(|e| Error::Internal(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| Error::Internal(format!("channel send failed: {}", e)))
    }

    /// Stop timers, close the channel, mark unusable. Safe to call from the
    /// reader task itself: its own handle is aborted last.
    async fn shutdown(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.authenticated.store(false, Ordering::Relaxed);
        let keepalive = self.keepalive.lock().unwrap().take();
        if let Some(handle) = keepalive {
            handle.abort();
        }
        {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        }
        let reader = self.reader.lock().unwrap().take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}

struct TurnWaiter {
    buffer: String,
    tx: oneshot::Sender<Result<String>>,
}

struct RegistryInner {
    config: CoreConfig,
    identity: IdentityStore,
    containers: Arc<ContainerManager>,
    connections: DashMap<String, Arc<Connection>>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    turns: DashMap<String, TurnWaiter>,
    outbound: DashMap<String, Arc<dyn OutboundRoute>>,
}

/// Owns every gateway connection in the process.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

enum HandshakeError {
    NotPaired { request_id: Option<String> },
    Fatal(Error),
}

impl ConnectionRegistry {
    /// Registry over the shared config, identity store and container runtime.
    pub fn new(
        config: CoreConfig,
        identity: IdentityStore,
        containers: Arc<ContainerManager>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                identity,
                containers,
                connections: DashMap::new(),
                connect_locks: DashMap::new(),
                turns: DashMap::new(),
                outbound: DashMap::new(),
            }),
        }
    }

    /// Return the live authenticated connection for a sandbox, establishing
    /// one (tearing down any stale entry first) if needed.
    ///
    /// `container_id` enables pairing recovery; without it a `NOT_PAIRED`
    /// rejection is terminal.
    pub async fn get_or_create(
        &self,
        sandbox_id: &str,
        port: u16,
        container_id: Option<&str>,
    ) -> Result<Arc<Connection>> {
        // One establishment at a time per sandbox, so two racing callers
        // cannot open two channels.
        let lock = self
            .inner
            .connect_locks
            .entry(sandbox_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.inner.connections.get(sandbox_id) {
            if existing.is_usable() {
                existing.touch();
                return Ok(existing.value().clone());
            }
        }
        self.remove(sandbox_id).await;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match try_connect(&self.inner, sandbox_id, port).await {
                Ok(conn) => {
                    self.inner
                        .connections
                        .insert(sandbox_id.to_string(), conn.clone());
                    info!(sandbox_id, port, attempt, "Gateway connection authenticated");
                    return Ok(conn);
                }
                Err(HandshakeError::NotPaired { request_id }) => {
                    let Some(container_id) = container_id else {
                        return Err(Error::GatewayAuth("device not paired".to_string()));
                    };
                    info!(sandbox_id, attempt, "Device not paired, recovering");
                    let identity = self.inner.identity.get_or_create(sandbox_id)?;
                    recover_pairing(
                        &self.inner.containers,
                        container_id,
                        &identity.device_id,
                        request_id.as_deref(),
                    )
                    .await?;
                    tokio::time::sleep(PAIRING_RETRY_DELAY).await;
                }
                Err(HandshakeError::Fatal(e)) => return Err(e),
            }
        }
        Err(Error::ConnectionExhausted {
            attempts: MAX_CONNECT_ATTEMPTS,
        })
    }

    /// Tear down a sandbox's connection. A pending turn waiter is failed
    /// rather than left to ride out its timeout.
    pub async fn remove(&self, sandbox_id: &str) {
        if let Some((_, conn)) = self.inner.connections.remove(sandbox_id) {
            if let Some((_, waiter)) = self.inner.turns.remove(sandbox_id) {
                let _ = waiter
                    .tx
                    .send(Err(Error::TurnRejected("connection closed".to_string())));
            }
            conn.shutdown().await;
            info!(sandbox_id, "Removed gateway connection");
        }
    }

    /// Tear down the connection and forget per-sandbox registrations
    /// (outbound route, pending waiter). Used by sandbox teardown.
    pub async fn purge(&self, sandbox_id: &str) {
        self.remove(sandbox_id).await;
        self.inner.turns.remove(sandbox_id);
        self.inner.outbound.remove(sandbox_id);
        self.inner.connect_locks.remove(sandbox_id);
    }

    /// Register or replace the agent-initiated-message sink for a sandbox.
    pub fn set_outbound(&self, sandbox_id: &str, route: Arc<dyn OutboundRoute>) {
        self.inner.outbound.insert(sandbox_id.to_string(), route);
    }

    /// Register interest in the next terminal chat event for a sandbox.
    /// Replaces (and fails) any previous registration.
    pub fn register_turn(&self, sandbox_id: &str) -> oneshot::Receiver<Result<String>> {
        let (tx, rx) = oneshot::channel();
        let waiter = TurnWaiter {
            buffer: String::new(),
            tx,
        };
        if let Some(old) = self.inner.turns.insert(sandbox_id.to_string(), waiter) {
            let _ = old
                .tx
                .send(Err(Error::TurnRejected("superseded by a newer turn".to_string())));
        }
        rx
    }

    /// Drop the turn registration for a sandbox (timeout / cleanup path).
    pub fn clear_turn(&self, sandbox_id: &str) {
        self.inner.turns.remove(sandbox_id);
    }

    /// Issue a chat request on the sandbox's connection. Returns the request
    /// id, or `None` (no side effect) if the connection is absent,
    /// unauthenticated or closed.
    pub async fn send_turn(&self, sandbox_id: &str, text: &str) -> Option<String> {
        let conn = {
            let entry = self.inner.connections.get(sandbox_id)?;
            entry.value().clone()
        };
        if !conn.is_usable() {
            return None;
        }
        conn.touch();
        let id = format!("chat-{}", Uuid::new_v4());
        let frame = Frame::Req {
            id: id.clone(),
            method: "chat.send".to_string(),
            params: json!({
                "sessionKey": "main",
                "message": text,
                "idempotencyKey": format!("warden-{}", id),
            }),
        };
        match conn.send_frame(&frame).await {
            Ok(()) => {
                debug!(sandbox_id, request_id = %id, "Sent chat request");
                Some(id)
            }
            Err(e) => {
                warn!(sandbox_id, error = %e, "Chat send failed");
                None
            }
        }
    }

    /// Close connections with no traffic past the idle threshold. A sandbox
    /// with a registered turn waiter is exempt: a slow turn is activity.
    pub async fn sweep_idle(&self) {
        let idle_limit = self.inner.config.idle_timeout.as_millis() as i64;
        let stale: Vec<String> = self
            .inner
            .connections
            .iter()
            .filter(|entry| {
                entry.value().idle_ms() > idle_limit && !self.inner.turns.contains_key(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for sandbox_id in stale {
            info!(sandbox_id, "Closing idle gateway connection");
            self.remove(&sandbox_id).await;
        }
    }

    /// Spawn the periodic idle sweep.
    pub fn spawn_idle_sweep(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.sweep_idle().await;
            }
        })
    }

    /// Number of live connections (status surfaces and tests).
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Drain every connection. Called at process shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for sandbox_id in all {
            self.remove(&sandbox_id).await;
        }
    }
}

#[async_trait]
impl TurnTransport for ConnectionRegistry {
    async fn run_turn(
        &self,
        sandbox_id: &str,
        port: u16,
        container_id: Option<&str>,
        text: &str,
        timeout: Duration,
    ) -> Result<String> {
        self.get_or_create(sandbox_id, port, container_id).await?;
        let rx = self.register_turn(sandbox_id);
        if self.send_turn(sandbox_id, text).await.is_none() {
            self.clear_turn(sandbox_id);
            return Err(Error::TurnRejected("connection unavailable".to_string()));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Internal("turn waiter dropped".to_string())),
            Err(_) => {
                self.clear_turn(sandbox_id);
                Err(Error::TurnTimeout)
            }
        }
    }
}

/// One full connection attempt: open the channel, run the handshake within
/// the connect deadline, then split the stream and start the reader and
/// keepalive tasks.
async fn try_connect(
    inner: &Arc<RegistryInner>,
    sandbox_id: &str,
    port: u16,
) -> std::result::Result<Arc<Connection>, HandshakeError> {
    let url = Url::parse(&format!("ws://127.0.0.1:{}/", port))
        .map_err(|e| HandshakeError::Fatal(Error::Internal(e.to_string())))?;

    let attempt = async {
        let (mut ws, _) = connect_async(url).await.map_err(|e| {
            HandshakeError::Fatal(Error::ContainerUnavailable(format!(
                "gateway unreachable: {}",
                e
            )))
        })?;
        match perform_handshake(inner, sandbox_id, &mut ws).await {
            Ok(tick_ms) => Ok((ws, tick_ms)),
            Err(e) => {
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    };

    let (ws, tick_ms) = tokio::time::timeout(inner.config.connect_timeout, attempt)
        .await
        .map_err(|_| HandshakeError::Fatal(Error::ConnectionTimeout))??;

    let (sink, stream) = ws.split();
    let conn = Arc::new(Connection {
        sandbox_id: sandbox_id.to_string(),
        port,
        sink: Mutex::new(sink),
        authenticated: AtomicBool::new(true),
        open: AtomicBool::new(true),
        last_activity_ms: AtomicI64::new(now_ms()),
        keepalive: StdMutex::new(None),
        reader: StdMutex::new(None),
    });

    let reader = tokio::spawn(read_loop(inner.clone(), conn.clone(), stream));
    *conn.reader.lock().unwrap() = Some(reader);
    let keepalive = tokio::spawn(keepalive_loop(
        conn.clone(),
        Duration::from_millis(tick_ms.max(1_000)),
    ));
    *conn.keepalive.lock().unwrap() = Some(keepalive);

    Ok(conn)
}

/// Drive the challenge/response exchange on a fresh channel. Returns the
/// server-supplied keepalive interval on success.
async fn perform_handshake(
    inner: &Arc<RegistryInner>,
    sandbox_id: &str,
    ws: &mut WsStream,
) -> std::result::Result<u64, HandshakeError> {
    let mut pending_connect_id: Option<String> = None;

    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| {
            HandshakeError::Fatal(Error::GatewayAuth(format!("channel error: {}", e)))
        })?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(HandshakeError::Fatal(Error::GatewayAuth(
                    "channel closed during handshake".to_string(),
                )))
            }
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };

        match frame {
            Frame::Event { event, payload } => {
                if let Some(GatewayEvent::Challenge { nonce }) = classify_event(&event, &payload) {
                    let request =
                        build_connect_request(inner, sandbox_id, &nonce).map_err(HandshakeError::Fatal)?;
                    let (id, frame) = request;
                    let text = serde_json::to_string(&frame)
                        .map_err(|e| HandshakeError::Fatal(Error::Internal(e.to_string())))?;
                    ws.send(Message::Text(text)).await.map_err(|e| {
                        HandshakeError::Fatal(Error::GatewayAuth(format!(
                            "channel error: {}",
                            e
                        )))
                    })?;
                    pending_connect_id = Some(id);
                }
            }
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } if Some(&id) == pending_connect_id.as_ref() => {
                if ok {
                    let tick_ms = payload
                        .as_ref()
                        .and_then(|p| p.pointer("/policy/tickIntervalMs"))
                        .and_then(Value::as_u64)
                        .unwrap_or(KEEPALIVE_DEFAULT_MS);
                    return Ok(tick_ms);
                }
                let err = error.unwrap_or(protocol::WireError {
                    code: None,
                    message: None,
                    details: Value::Null,
                });
                if err.code.as_deref() == Some("NOT_PAIRED") {
                    return Err(HandshakeError::NotPaired {
                        request_id: err.pairing_request_id(),
                    });
                }
                return Err(HandshakeError::Fatal(Error::GatewayAuth(
                    err.message
                        .unwrap_or_else(|| "gateway authentication failed".to_string()),
                )));
            }
            _ => {}
        }
    }

    Err(HandshakeError::Fatal(Error::GatewayAuth(
        "channel closed during handshake".to_string(),
    )))
}

/// Sign the challenge and assemble the connect request.
fn build_connect_request(
    inner: &Arc<RegistryInner>,
    sandbox_id: &str,
    nonce: &str,
) -> Result<(String, Frame)> {
    let identity = inner.identity.get_or_create(sandbox_id)?;
    let scopes: Vec<String> = SCOPES.iter().map(|s| s.to_string()).collect();
    let token = inner.config.gateway_token.expose_secret().to_string();
    let assertion = identity.sign_assertion(&AssertionParams {
        nonce,
        client_id: CLIENT_ID,
        client_mode: CLIENT_MODE,
        role: ROLE,
        scopes: &scopes,
        signed_at: now_ms(),
        token: Some(&token),
    });

    let id = format!("connect-{}", Uuid::new_v4());
    let frame = Frame::Req {
        id: id.clone(),
        method: "connect".to_string(),
        params: json!({
            "minProtocol": PROTOCOL_MIN,
            "maxProtocol": PROTOCOL_MAX,
            "client": {
                "id": CLIENT_ID,
                "version": env!("CARGO_PKG_VERSION"),
                "platform": "linux",
                "mode": CLIENT_MODE,
            },
            "role": ROLE,
            "scopes": scopes,
            "caps": [],
            "auth": { "token": token },
            "device": {
                "id": identity.device_id,
                "publicKey": identity.public_key_b64url(),
                "signature": assertion.signature,
                "signedAt": assertion.signed_at,
                "nonce": nonce,
            },
        }),
    };
    Ok((id, frame))
}

/// Pump inbound frames until the channel dies, then tear down.
async fn read_loop(
    inner: Arc<RegistryInner>,
    conn: Arc<Connection>,
    mut stream: SplitStream<WsStream>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                    handle_frame(&inner, &conn, frame).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(sandbox_id = %conn.sandbox_id, error = %e, "Gateway channel error");
                break;
            }
        }
    }

    debug!(sandbox_id = %conn.sandbox_id, "Gateway channel closed");
    let still_current = inner
        .connections
        .get(conn.sandbox_id.as_str())
        .map(|entry| Arc::ptr_eq(entry.value(), &conn))
        .unwrap_or(false);
    if still_current {
        let registry = ConnectionRegistry {
            inner: inner.clone(),
        };
        registry.remove(&conn.sandbox_id).await;
    }
}

/// Single dispatch point for inbound frames on an authenticated channel.
async fn handle_frame(inner: &Arc<RegistryInner>, conn: &Arc<Connection>, frame: Frame) {
    match frame {
        Frame::Event { event, payload } => {
            let Some(event) = classify_event(&event, &payload) else {
                return;
            };
            match event {
                // Only issued before authentication; ignored here.
                GatewayEvent::Challenge { .. } => {}
                GatewayEvent::ChatDelta { content, .. } => {
                    conn.touch();
                    if let Some(mut waiter) = inner.turns.get_mut(&conn.sandbox_id) {
                        waiter.buffer.push_str(&content);
                    }
                }
                GatewayEvent::ChatFinal { content, .. } => {
                    conn.touch();
                    if let Some((_, waiter)) = inner.turns.remove(&conn.sandbox_id) {
                        let text = if content.is_empty() {
                            waiter.buffer
                        } else {
                            content
                        };
                        let _ = waiter.tx.send(Ok(text));
                    } else if !content.is_empty() {
                        route_outbound(inner, &conn.sandbox_id, &content, OutboundSource::Heartbeat)
                            .await;
                    }
                }
                GatewayEvent::ChatError { message } => {
                    conn.touch();
                    if let Some((_, waiter)) = inner.turns.remove(&conn.sandbox_id) {
                        let _ = waiter.tx.send(Err(Error::TurnRejected(message)));
                    } else {
                        warn!(sandbox_id = %conn.sandbox_id, error = %message, "Agent error with no turn in flight");
                    }
                }
                GatewayEvent::Heartbeat { status, preview } => {
                    conn.touch();
                    if heartbeat_needs_delivery(&status, &preview) {
                        route_outbound(inner, &conn.sandbox_id, &preview, OutboundSource::Heartbeat)
                            .await;
                    } else {
                        debug!(sandbox_id = %conn.sandbox_id, status, "Heartbeat suppressed");
                    }
                }
                GatewayEvent::CronFinished { job_id, summary } => {
                    conn.touch();
                    if !summary.trim().is_empty() {
                        debug!(sandbox_id = %conn.sandbox_id, job_id, "Cron job finished");
                        route_outbound(inner, &conn.sandbox_id, &summary, OutboundSource::Cron)
                            .await;
                    }
                }
            }
        }
        Frame::Res { id, ok, error, .. } => {
            if id.starts_with("chat-") && !ok {
                let message = error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "chat request rejected".to_string());
                warn!(sandbox_id = %conn.sandbox_id, error = %message, "Chat request rejected");
                if let Some((_, waiter)) = inner.turns.remove(&conn.sandbox_id) {
                    let _ = waiter.tx.send(Err(Error::TurnRejected(message)));
                }
            }
        }
        Frame::Req { .. } => {}
    }
}

async fn route_outbound(
    inner: &Arc<RegistryInner>,
    sandbox_id: &str,
    text: &str,
    source: OutboundSource,
) {
    let route = {
        let Some(entry) = inner.outbound.get(sandbox_id) else {
            warn!(sandbox_id, "Agent-initiated message with no outbound route");
            return;
        };
        entry.value().clone()
    };
    route.deliver(sandbox_id, text, source).await;
}

/// Periodic lightweight `status` probe keeping the channel warm.
async fn keepalive_loop(conn: Arc<Connection>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = Frame::Req {
            id: format!("tick-{}", Uuid::new_v4()),
            method: "status".to_string(),
            params: json!({}),
        };
        if conn.send_frame(&frame).await.is_err() {
            break;
        }
    }
}
