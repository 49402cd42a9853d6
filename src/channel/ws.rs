//! Websocket implementation of the control channel contract.
//!
//! Frames are JSON envelopes:
//! `{"type":"request","id":1,"data":{..}}`, `{"type":"response","id":1,"data":{..}}`
//! and `{"type":"notification","data":{..}}`. A socket that goes away without
//! an explicit close gets `reconnect_timeout` to come back before the channel
//! reports a `reconnect-timeout` error.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::Engine;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Channel, ChannelHandler, Client, ErrorHandler, Message, RequestHandler, Router};
use crate::error::{CentralError, Result};
use crate::http::Controller;

const RECONNECT_TIMEOUT_REASON: &str = "reconnect-timeout";

/// Header agents may use to present their token.
pub const MESH_TOKEN_HEADER: &str = "x-mesh-token";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Request { id: u64, data: Message },
    Response { id: u64, data: Message },
    Notification { data: Message },
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

type Registry = DashMap<String, Arc<WsClient>>;

/// Router serving one control endpoint over websockets.
#[derive(Clone)]
pub struct WsRouter {
    path: String,
    clients: Arc<Registry>,
    request_timeout: Duration,
    reconnect_timeout: Duration,
}

impl WsRouter {
    pub fn new(path: &str, request_timeout: Duration, reconnect_timeout: Duration) -> Self {
        Self {
            path: path.trim_start_matches('/').to_string(),
            clients: Arc::new(DashMap::new()),
            request_timeout,
            reconnect_timeout,
        }
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn upgrade(clients: Arc<Registry>, headers: HeaderMap, query: TokenQuery, ws: WebSocketUpgrade) -> Response {
        let Some(token) = token_from_request(&headers, query.token.as_deref()) else {
            return (StatusCode::UNAUTHORIZED, "missing control channel token").into_response();
        };
        let Some(client) = clients.get(&token).map(|c| c.value().clone()) else {
            warn!(component = "channel", event = "unknown_token", "rejected control channel with unknown token");
            return (StatusCode::UNAUTHORIZED, "invalid control channel token").into_response();
        };
        ws.on_upgrade(move |socket| client.serve(socket))
    }
}

impl Router for WsRouter {
    fn path(&self) -> &str {
        &self.path
    }

    fn accept_client(&self, handler: Arc<dyn RequestHandler>, token: Option<String>) -> Arc<dyn Client> {
        let token = token.filter(|t| !t.is_empty()).unwrap_or_else(super::new_token);
        let client = Arc::new(WsClient {
            token: token.clone(),
            handler,
            subscribers: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            registry: Arc::downgrade(&self.clients),
            closed: AtomicBool::new(false),
            request_timeout: self.request_timeout,
            reconnect_timeout: self.reconnect_timeout,
        });
        if let Some(previous) = self.clients.insert(token, client.clone()) {
            previous.closed.store(true, Ordering::SeqCst);
        }
        client
    }
}

impl Controller for WsRouter {
    fn add_route(&self, router: axum::Router) -> axum::Router {
        let clients = self.clients.clone();
        router.route(
            &format!("/{}", self.path),
            get(move |headers: HeaderMap, Query(query): Query<TokenQuery>, ws: WebSocketUpgrade| {
                let clients = clients.clone();
                async move { Self::upgrade(clients, headers, query, ws) }
            }),
        )
    }
}

/// Extracts the agent token from basic auth user, the mesh token header, or
/// the `token` query parameter, in that order.
fn token_from_request(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(encoded) = auth.strip_prefix("Basic ") {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
                let decoded = String::from_utf8_lossy(&decoded);
                let user = decoded.split(':').next().unwrap_or_default();
                if !user.is_empty() {
                    return Some(user.to_string());
                }
            }
        }
    }
    if let Some(token) = headers.get(MESH_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    query_token.filter(|t| !t.is_empty()).map(str::to_string)
}

struct WsClient {
    token: String,
    handler: Arc<dyn RequestHandler>,
    subscribers: Mutex<Vec<ChannelHandler>>,
    current: Mutex<Option<Arc<WsChannel>>>,
    registry: Weak<Registry>,
    closed: AtomicBool,
    request_timeout: Duration,
    reconnect_timeout: Duration,
}

impl WsClient {
    async fn serve(self: Arc<Self>, socket: WebSocket) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let cancel = CancellationToken::new();
        let channel = Arc::new(WsChannel {
            token: self.token.clone(),
            tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            error_handlers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            request_timeout: self.request_timeout,
        });

        info!(component = "channel", event = "connected", token = %self.token, "control channel connected");

        *self.current.lock() = Some(channel.clone());
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(channel.clone() as Arc<dyn Channel>);
        }

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&channel, &text),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = channel.tx.send(WsMessage::Pong(payload));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(component = "channel", event = "socket_error", token = %self.token, error = %e, "control socket error");
                        break;
                    }
                },
            }
        }

        if !channel.closed.load(Ordering::SeqCst) {
            channel.drop_pending();
            self.await_reconnect(channel.clone());
        }
        writer.abort();
    }

    /// Reports `reconnect-timeout` unless the agent reconnects in time.
    fn await_reconnect(self: &Arc<Self>, channel: Arc<WsChannel>) {
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(client.reconnect_timeout).await;
            let still_current = client
                .current
                .lock()
                .as_ref()
                .map(|c| Arc::ptr_eq(c, &channel))
                .unwrap_or(false);
            if still_current && !client.closed.load(Ordering::SeqCst) {
                channel.fail(RECONNECT_TIMEOUT_REASON);
            }
        });
    }

    fn dispatch(&self, channel: &Arc<WsChannel>, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(component = "channel", event = "bad_frame", token = %self.token, error = %e, "discarding malformed frame");
                return;
            }
        };
        match frame {
            Frame::Request { id, data } => {
                let handler = self.handler.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    let reply = handler.on_request(data).await;
                    channel.send_frame(&Frame::Response { id, data: reply });
                });
            }
            Frame::Notification { data } => {
                let handler = self.handler.clone();
                tokio::spawn(async move {
                    let _ = handler.on_request(data).await;
                });
            }
            Frame::Response { id, data } => channel.resolve(id, data),
        }
    }
}

#[async_trait::async_trait]
impl Client for WsClient {
    fn token(&self) -> String {
        self.token.clone()
    }

    fn on_new_channel(&self, handler: ChannelHandler) {
        self.subscribers.lock().push(handler);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.token, |_, c| std::ptr::eq(Arc::as_ptr(c), self));
        }
        self.subscribers.lock().clear();
        let current = self.current.lock().take();
        if let Some(channel) = current {
            channel.close(Some("client-closed"));
        }
        Ok(())
    }
}

struct WsChannel {
    token: String,
    tx: mpsc::UnboundedSender<WsMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    next_id: AtomicU64,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl WsChannel {
    fn send_frame(&self, frame: &Frame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.tx.send(WsMessage::Text(text)).is_ok(),
            Err(_) => false,
        }
    }

    fn resolve(&self, id: u64, data: Message) {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!(component = "channel", event = "late_response", id, "response for unknown request"),
        }
    }

    fn drop_pending(&self) {
        self.pending.lock().clear();
    }

    fn fail(&self, err: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.drop_pending();
        warn!(component = "channel", event = "channel_error", token = %self.token, error = err, "control channel failed");
        let handlers = self.error_handlers.lock().clone();
        for handler in handlers {
            handler(err);
        }
    }
}

#[async_trait::async_trait]
impl Channel for WsChannel {
    fn token(&self) -> String {
        self.token.clone()
    }

    async fn request(&self, msg: Message) -> Result<Message> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CentralError::ChannelClosed("channel is closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if !self.send_frame(&Frame::Request { id, data: msg }) {
            self.pending.lock().remove(&id);
            return Err(CentralError::ChannelClosed("connection lost".into()));
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CentralError::ChannelClosed("connection lost".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(CentralError::Timeout)
            }
        }
    }

    fn notify(&self, msg: Message) {
        if !self.closed.load(Ordering::SeqCst) {
            self.send_frame(&Frame::Notification { data: msg });
        }
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.error_handlers.lock().push(handler);
    }

    fn close(&self, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(component = "channel", event = "closed", token = %self.token, reason = reason.unwrap_or(""), "closing control channel");
        let frame = CloseFrame {
            code: 1000,
            reason: Cow::Owned(reason.unwrap_or_default().to_string()),
        };
        let _ = self.tx.send(WsMessage::Close(Some(frame)));
        self.drop_pending();
        self.cancel.cancel();
    }
}
