//! The single long-lived WebSocket connection to the remote tool executor.
//!
//! Grounded on the read-loop shape of a Unix-socket WebSocket event bridge
//! (`tokio_tungstenite::client_async` + `tokio::select!` over the read half,
//! with Close/stream-end/Err uniformly treated as connection loss and
//! Ping/Pong/Binary ignored), adapted to a real TCP/TLS endpoint and
//! extended with request/response correlation, heartbeating, and
//! exponential-backoff auto-reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::ReconnectBackoff;
use crate::error::GatewayError;
use crate::protocol::{self, Frame, ResponseError};

/// Configuration for a gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    /// If true, a failed initial connection is fatal. If false, the client
    /// starts in degraded mode and keeps retrying in the background.
    pub strict: bool,
    pub heartbeat_interval: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub request_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let token = std::env::var("OPENCLAW_GATEWAY_TOKEN").unwrap_or_default();
        let strict = std::env::var("OPENCLAW_REQUIRED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            url: std::env::var("OPENCLAW_GATEWAY_URL")
                .unwrap_or_else(|_| "ws://localhost:8787/ws".to_owned()),
            token,
            strict,
            heartbeat_interval: Duration::from_secs(20),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// An event received from the gateway, bridged outward for the orchestrator's
/// Event Bus to republish as `openclaw.<event>`.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Connected,
    Authenticated,
    Disconnected,
    Reconnecting { attempt: u32 },
    Degraded,
    Agent(protocol::AgentEvent),
    Raw { event: String, payload: Value },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, GatewayError>>>>>;

/// Handle to the gateway connection. Cheaply cloneable; all clones share the
/// same underlying connection and request-correlation state.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayConfig,
    next_id: AtomicU64,
    pending: PendingMap,
    out_tx: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    connected: std::sync::atomic::AtomicBool,
}

impl GatewayClient {
    /// Attempt the initial connection and spawn the supervisor task that
    /// owns the socket for the client's lifetime (heartbeat, read dispatch,
    /// reconnect-with-backoff).
    ///
    /// On failure: if `config.strict`, returns `Err`. Otherwise returns a
    /// client in degraded mode that keeps retrying in the background.
    pub async fn connect(
        config: GatewayConfig,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Result<Self, GatewayError> {
        let (out_tx, out_rx) = mpsc::channel(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let connected = std::sync::atomic::AtomicBool::new(false);

        let inner = Arc::new(Inner {
            config: config.clone(),
            next_id: AtomicU64::new(1),
            pending: pending.clone(),
            out_tx,
            shutdown: shutdown.clone(),
            connected,
        });

        let first_attempt = connect_once(&config).await;

        match first_attempt {
            Ok(stream) => {
                info!(url = %config.url, "gateway connected");
                inner.connected.store(true, Ordering::SeqCst);
                spawn_supervisor(
                    inner.clone(),
                    Some(stream),
                    out_rx,
                    pending.clone(),
                    events,
                );
                resubscribe_agent_events(inner.clone());
            }
            Err(e) if config.strict => {
                warn!(error = %e, "gateway connection failed (strict mode)");
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "gateway connection failed, starting in degraded mode");
                let _ = events.try_send(GatewayEvent::Degraded);
                spawn_supervisor(inner.clone(), None, out_rx, pending.clone(), events);
            }
        }

        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Issue a request and await its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        do_request(&self.inner, method, params).await
    }

    /// Subscribe to an event stream so the gateway starts pushing `event`
    /// frames for it. Called automatically for `"agent"` on every
    /// connect/reconnect; exposed so callers can subscribe to further topics.
    pub async fn subscribe(&self, event: &str) -> Result<Value, GatewayError> {
        self.request("subscribe", serde_json::json!({ "event": event })).await
    }

    pub async fn sessions_spawn(&self, model: &str, system_prompt: Option<&str>) -> Result<String, GatewayError> {
        let params = serde_json::json!({ "model": model, "systemPrompt": system_prompt });
        let payload = self.request("sessions_spawn", params).await?;
        payload
            .get("sessionKey")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| GatewayError::Request {
                code: "MALFORMED_RESPONSE".into(),
                message: "missing sessionKey".into(),
            })
    }

    pub async fn sessions_kill(&self, session_key: &str) -> Result<(), GatewayError> {
        self.request("sessions_kill", serde_json::json!({ "sessionKey": session_key }))
            .await?;
        Ok(())
    }

    pub async fn sessions_list(&self) -> Result<Value, GatewayError> {
        self.request("sessions_list", serde_json::json!({})).await
    }

    pub async fn sessions_send(
        &self,
        session_key: &str,
        message: &str,
    ) -> Result<Value, GatewayError> {
        self.request(
            "sessions_send",
            serde_json::json!({ "sessionKey": session_key, "message": message }),
        )
        .await
    }

    pub async fn sessions_history(&self, session_key: &str, limit: Option<u64>) -> Result<Value, GatewayError> {
        self.request(
            "sessions_history",
            serde_json::json!({ "sessionKey": session_key, "limit": limit }),
        )
        .await
    }

    /// Stop the supervisor task and close the connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

/// Shared body of `GatewayClient::request`, also used internally (e.g. to
/// resubscribe after a reconnect) where no `GatewayClient` handle is at hand.
async fn do_request(inner: &Arc<Inner>, method: &str, params: Value) -> Result<Value, GatewayError> {
    if !inner.connected.load(Ordering::SeqCst) {
        return Err(GatewayError::Degraded);
    }

    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = oneshot::channel();
    inner.pending.lock().await.insert(id, tx);

    let frame = Frame::Request {
        id,
        method: method.to_owned(),
        params,
    };

    if inner.out_tx.send(frame).await.is_err() {
        inner.pending.lock().await.remove(&id);
        return Err(GatewayError::ConnectionClosed);
    }

    match tokio::time::timeout(inner.config.request_timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
        Err(_) => {
            inner.pending.lock().await.remove(&id);
            Err(GatewayError::Timeout(inner.config.request_timeout))
        }
    }
}

/// Re-issue the `agent` event subscription after (re)connecting. Fire-and-
/// forget: the request is queued on the outbound channel and its response
/// dispatched once the session loop is running, without blocking whoever
/// just established the connection.
fn resubscribe_agent_events(inner: Arc<Inner>) {
    tokio::spawn(async move {
        if let Err(e) = do_request(&inner, "subscribe", serde_json::json!({ "event": "agent" })).await {
            warn!(error = %e, "failed to subscribe to agent events");
        }
    });
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_once(config: &GatewayConfig) -> Result<WsStream, GatewayError> {
    let (mut stream, _) = tokio_tungstenite::connect_async(&config.url)
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))?;

    let connect_frame = Frame::Request {
        id: 0,
        method: "connect".into(),
        params: serde_json::json!({
            "auth": { "token": config.token },
            "client": { "name": "orchestrator" },
            "minProtocol": 1,
            "maxProtocol": 1,
        }),
    };
    let text = serde_json::to_string(&connect_frame)?;
    stream
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))?;

    match tokio::time::timeout(Duration::from_secs(10), stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Frame>(&text) {
            Ok(Frame::Response { ok: true, .. }) => Ok(stream),
            Ok(Frame::Response {
                ok: false,
                error: Some(err),
                ..
            }) => Err(GatewayError::Authentication(err.message)),
            _ => Err(GatewayError::Authentication("unexpected connect reply".into())),
        },
        Ok(Some(Ok(_))) => Err(GatewayError::Authentication("unexpected connect reply".into())),
        Ok(Some(Err(e))) => Err(GatewayError::Connection(e.to_string())),
        Ok(None) => Err(GatewayError::ConnectionClosed),
        Err(_) => Err(GatewayError::Timeout(Duration::from_secs(10))),
    }
}

fn spawn_supervisor(
    inner: Arc<Inner>,
    initial: Option<WsStream>,
    mut out_rx: mpsc::Receiver<Frame>,
    pending: PendingMap,
    events: mpsc::Sender<GatewayEvent>,
) {
    tokio::spawn(async move {
        let mut backoff = ReconnectBackoff::new(
            inner.config.reconnect_initial_delay,
            inner.config.reconnect_max_delay,
        );
        let mut stream = initial;

        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }

            let Some(mut ws) = stream.take() else {
                if backoff.attempt() >= inner.config.max_reconnect_attempts {
                    warn!("gateway reconnect attempts exhausted, giving up");
                    break;
                }
                let delay = backoff.next_delay();
                let _ = events.try_send(GatewayEvent::Reconnecting {
                    attempt: backoff.attempt(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.shutdown.cancelled() => break,
                }
                match connect_once(&inner.config).await {
                    Ok(s) => {
                        backoff.reset();
                        inner.connected.store(true, Ordering::SeqCst);
                        let _ = events.try_send(GatewayEvent::Connected);
                        let _ = events.try_send(GatewayEvent::Authenticated);
                        stream = Some(s);
                        resubscribe_agent_events(inner.clone());
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "gateway reconnect attempt failed");
                        continue;
                    }
                }
            };

            inner.connected.store(true, Ordering::SeqCst);
            let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
            heartbeat.tick().await; // first tick fires immediately

            'session: loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        let _ = ws.close(None).await;
                        return;
                    }
                    _ = heartbeat.tick() => {
                        let ping_id = inner.next_id.fetch_add(1, Ordering::SeqCst);
                        let frame = Frame::Request { id: ping_id, method: "ping".into(), params: serde_json::json!({}) };
                        if let Ok(text) = serde_json::to_string(&frame) {
                            if ws.send(Message::Text(text.into())).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(frame) => {
                                if let Ok(text) = serde_json::to_string(&frame) {
                                    if ws.send(Message::Text(text.into())).await.is_err() {
                                        break 'session;
                                    }
                                }
                            }
                            None => return,
                        }
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                dispatch_frame(&text, &pending, &events).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(?frame, "gateway connection closed cleanly");
                                break 'session;
                            }
                            Some(Ok(_)) => {} // Ping/Pong/Binary ignored
                            Some(Err(e)) => {
                                warn!(error = %e, "gateway read error");
                                break 'session;
                            }
                            None => {
                                info!("gateway stream ended");
                                break 'session;
                            }
                        }
                    }
                }
            }

            inner.connected.store(false, Ordering::SeqCst);
            let _ = events.try_send(GatewayEvent::Disconnected);
            fail_all_pending(&pending).await;
        }

        fail_all_pending(&pending).await;
    });
}

async fn dispatch_frame(text: &str, pending: &PendingMap, events: &mpsc::Sender<GatewayEvent>) {
    let Ok(frame) = serde_json::from_str::<Frame>(text) else {
        return;
    };

    match frame {
        Frame::Response { id, ok, payload, error } => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let result = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    let ResponseError { code, message, .. } = error.unwrap_or(ResponseError {
                        code: "UNKNOWN".into(),
                        message: "no error detail".into(),
                        details: None,
                    });
                    Err(GatewayError::Request { code, message })
                };
                let _ = tx.send(result);
            }
        }
        Frame::Event { event, payload, .. } => {
            if event == protocol::EVENT_AGENT {
                if let Some(agent_event) = protocol::parse_agent_event(&payload) {
                    let _ = events.try_send(GatewayEvent::Agent(agent_event));
                    return;
                }
            }
            let _ = events.try_send(GatewayEvent::Raw { event, payload });
        }
        Frame::Request { .. } => {}
    }
}

async fn fail_all_pending(pending: &PendingMap) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(GatewayError::ConnectionClosed));
    }
}
