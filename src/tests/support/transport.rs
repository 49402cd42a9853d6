// In-memory control transport: lets a test play the remote agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{cmd_of, new_token, ok_reply, Channel, ChannelHandler, Client, ErrorHandler, Message, RequestHandler, Router};
use crate::error::{CentralError, Result};

pub type Responder = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Router that keeps every registered client for inspection.
pub struct MemoryRouter {
    path: String,
    clients: Mutex<HashMap<String, Arc<MemoryClient>>>,
}

impl MemoryRouter {
    pub fn new(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self, token: &str) -> Option<Arc<MemoryClient>> {
        self.clients.lock().get(token).cloned()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.clients.lock().keys().cloned().collect()
    }
}

impl Router for MemoryRouter {
    fn path(&self) -> &str {
        &self.path
    }

    fn accept_client(&self, handler: Arc<dyn RequestHandler>, token: Option<String>) -> Arc<dyn Client> {
        let token = token.unwrap_or_else(new_token);
        let client = Arc::new(MemoryClient {
            token: token.clone(),
            handler,
            subscribers: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.clients.lock().insert(token, client.clone());
        client
    }
}

pub struct MemoryClient {
    token: String,
    handler: Arc<dyn RequestHandler>,
    subscribers: Mutex<Vec<ChannelHandler>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    closed: AtomicBool,
}

impl MemoryClient {
    /// Simulates the agent (re)connecting.
    pub fn connect(&self) -> Arc<MemoryChannel> {
        let channel = Arc::new(MemoryChannel::new(&self.token));
        self.channels.lock().push(channel.clone());
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(channel.clone());
        }
        channel
    }

    /// Sends a request from the agent to Central and returns Central's reply.
    pub async fn peer_request(&self, msg: Message) -> Message {
        self.handler.on_request(msg).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        self.channels.lock().clone()
    }
}

#[async_trait::async_trait]
impl Client for MemoryClient {
    fn token(&self) -> String {
        self.token.clone()
    }

    fn on_new_channel(&self, handler: ChannelHandler) {
        self.subscribers.lock().push(handler);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One simulated connection. Records everything Central sends on it.
pub struct MemoryChannel {
    token: String,
    sent: Mutex<Vec<Message>>,
    notified: Mutex<Vec<Message>>,
    responder: Mutex<Option<Responder>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    closes: Mutex<Vec<Option<String>>>,
}

impl MemoryChannel {
    fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            sent: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            error_handlers: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the agent's replies; the default reply is `{message: ok}`.
    pub fn respond_with(&self, responder: impl Fn(&Message) -> Message + Send + Sync + 'static) {
        *self.responder.lock() = Some(Arc::new(responder));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn sent_cmds(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| cmd_of(m).to_string()).collect()
    }

    pub fn notified(&self) -> Vec<Message> {
        self.notified.lock().clone()
    }

    /// Reasons passed to `close`, in order.
    pub fn closes(&self) -> Vec<Option<String>> {
        self.closes.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.closes.lock().is_empty()
    }

    /// Simulates a transport failure.
    pub fn fail(&self, err: &str) {
        let handlers = self.error_handlers.lock().clone();
        for handler in handlers {
            handler(err);
        }
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    fn token(&self) -> String {
        self.token.clone()
    }

    async fn request(&self, msg: Message) -> Result<Message> {
        if self.is_closed() {
            return Err(CentralError::ChannelClosed(self.token.clone()));
        }
        self.sent.lock().push(msg.clone());
        let responder = self.responder.lock().clone();
        Ok(match responder {
            Some(responder) => responder(&msg),
            None => ok_reply(),
        })
    }

    fn notify(&self, msg: Message) {
        self.notified.lock().push(msg);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.error_handlers.lock().push(handler);
    }

    fn close(&self, reason: Option<&str>) {
        self.closes.lock().push(reason.map(str::to_string));
    }
}
