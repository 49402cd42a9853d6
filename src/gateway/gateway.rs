//! Proxy for one remote gateway (load balancer / router) agent.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use crate::channel::{check_response, cmd_of, error_reply, ok_reply, same_channel, Channel, Client, Message, RequestHandler, Router};
use crate::error::{CentralError, Result};
use crate::events::ServiceEndpoints;

/// Asked to push the full endpoint map when a gateway (re)starts.
#[async_trait::async_trait]
pub trait GatewayListener: Send + Sync {
    async fn resync(&self, gateway: &Gateway) -> Result<()>;
}

struct Link {
    channel: Option<Arc<dyn Channel>>,
    has_started: bool,
}

pub struct Gateway {
    id: String,
    router: Arc<dyn Router>,
    token: Mutex<Option<String>>,
    client: Mutex<Option<Arc<dyn Client>>>,
    link: Mutex<Link>,
    listener: Mutex<Option<Arc<dyn GatewayListener>>>,
}

struct Inbound {
    gateway: Weak<Gateway>,
}

#[async_trait::async_trait]
impl RequestHandler for Inbound {
    async fn on_request(&self, msg: Message) -> Message {
        match self.gateway.upgrade() {
            Some(gateway) => gateway.on_request(msg).await,
            None => error_reply("gateway closed"),
        }
    }
}

impl Gateway {
    pub fn new(id: &str, token: Option<String>, router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            router,
            token: Mutex::new(token.filter(|t| !t.is_empty())),
            client: Mutex::new(None),
            link: Mutex::new(Link {
                channel: None,
                has_started: false,
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    pub fn has_started(&self) -> bool {
        self.link.lock().has_started
    }

    pub fn attach(&self, listener: Arc<dyn GatewayListener>) -> Result<()> {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(CentralError::ListenerAlreadyAttached("gateway"));
        }
        *slot = Some(listener);
        Ok(())
    }

    /// Registers the control client and returns its token.
    pub fn listen(self: &Arc<Self>) -> String {
        let requested = self.token();
        let handler = Arc::new(Inbound {
            gateway: Arc::downgrade(self),
        });
        let client = self.router.accept_client(handler, requested.clone());
        let token = client.token();
        match requested {
            Some(requested) => assert_eq!(token, requested, "control client token must match the gateway token"),
            None => *self.token.lock() = Some(token.clone()),
        }
        debug!(component = "gateway", event = "listen", gateway_id = %self.id, "registering control client");

        let me = Arc::downgrade(self);
        client.on_new_channel(Arc::new(move |channel| {
            if let Some(gateway) = me.upgrade() {
                gateway.on_new_channel(channel);
            }
        }));
        *self.client.lock() = Some(client);
        token
    }

    fn on_new_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let replaced = self.link.lock().channel.is_some();
        debug!(component = "gateway", event = "new_channel", gateway_id = %self.id, token = %channel.token(), replaced, "gateway connected");
        if replaced {
            self.disconnect("gateway-replaced");
        }
        self.link.lock().channel = Some(channel.clone());

        let me = Arc::downgrade(self);
        let watched = Arc::downgrade(&channel);
        channel.on_error(Arc::new(move |err| {
            let (Some(gateway), Some(channel)) = (me.upgrade(), watched.upgrade()) else {
                return;
            };
            let is_current = gateway
                .link
                .lock()
                .channel
                .as_ref()
                .map(|current| same_channel(current, &channel))
                .unwrap_or(false);
            if is_current {
                gateway.disconnect(&format!("gateway-{err}"));
            }
        }));
    }

    pub fn disconnect(&self, reason: &str) {
        info!(component = "gateway", event = "disconnect", gateway_id = %self.id, reason, "gateway disconnected");
        let channel = {
            let mut link = self.link.lock();
            link.has_started = false;
            link.channel.take()
        };
        if let Some(channel) = channel {
            channel.close(Some(reason));
        }
    }

    async fn on_request(&self, msg: Message) -> Message {
        debug!(component = "gateway", event = "agent_request", gateway_id = %self.id, msg = %msg, "gateway agent request");
        if cmd_of(&msg) != "starting" {
            debug!(component = "gateway", event = "unknown_command", gateway_id = %self.id, "ignoring unknown gateway message");
            return ok_reply();
        }
        self.link.lock().has_started = true;
        info!(component = "gateway", event = "started", gateway_id = %self.id, "gateway started");

        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            return ok_reply();
        };
        match listener.resync(self).await {
            Ok(()) => ok_reply(),
            Err(e) => error_reply(e),
        }
    }

    async fn request(&self, msg: Message) -> Result<Option<Message>> {
        let channel = {
            let link = self.link.lock();
            if link.has_started {
                link.channel.clone()
            } else {
                None
            }
        };
        let Some(channel) = channel else {
            debug!(component = "gateway", event = "request_discarded", gateway_id = %self.id, msg = %msg, "gateway not started");
            return Ok(None);
        };
        let res = channel.request(msg).await?;
        check_response(res).map(Some)
    }

    /// Replaces every endpoint the gateway knows with `endpoints`.
    pub async fn sync(&self, endpoints: &[ServiceEndpoints]) -> Result<()> {
        self.request(json!({ "cmd": "sync", "data": endpoints })).await.map(|_| ())
    }

    /// Incrementally updates the endpoints of the given services.
    pub async fn update(&self, endpoints: &[ServiceEndpoints]) -> Result<()> {
        self.request(json!({ "cmd": "update", "data": endpoints })).await.map(|_| ())
    }

    pub async fn close(&self) -> Result<()> {
        self.listener.lock().take();
        self.link.lock().channel = None;
        let client = self.client.lock().take();
        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}
