//! Executor proxies.
//!
//! Both variants share [`ExecutorCore`]: the control client, the active
//! channel with its replace/error handling, and the map of containers. They
//! differ in how they answer agent requests and which control verbs they
//! honour.

pub mod cloud;
pub mod direct;

#[cfg(test)]
mod direct_test;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::container::{Container, ContainerOptions};
use crate::channel::{check_response, error_reply, same_channel, Channel, Client, Message, RequestHandler, Router};
use crate::error::{CentralError, Result};
use crate::events::AgentEvents;

pub use cloud::{CloudExecutor, CloudRegistration, SelfRegistration};
pub use direct::DirectExecutor;

/// Control verbs an operator may address to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerb {
    Stop,
    Start,
    Restart,
    SoftStop,
    SoftRestart,
}

impl ControlVerb {
    pub fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            "stop" => Some(Self::Stop),
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            "soft-stop" => Some(Self::SoftStop),
            "soft-restart" => Some(Self::SoftRestart),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Restart => "restart",
            Self::SoftStop => "soft-stop",
            Self::SoftRestart => "soft-restart",
        }
    }

    /// Soft variants also ask the supervisor to stop its workers.
    pub fn is_soft(self) -> bool {
        matches!(self, Self::SoftStop | Self::SoftRestart)
    }
}

/// Proxy for one remote executor agent.
#[async_trait::async_trait]
pub trait RemoteAgent: Send + Sync {
    fn id(&self) -> &str;

    /// Token the agent authenticates with; allocated by `listen` if unset.
    fn token(&self) -> Option<String>;

    /// Registers the control client and returns its token.
    fn listen(self: Arc<Self>) -> String;

    fn has_started(&self) -> bool;

    /// Closes every container, then the control client.
    async fn close(&self) -> Result<()>;

    /// Creates the container proxy for an instance and returns its token.
    async fn create_instance(&self, opts: ContainerOptions) -> Result<String>;

    async fn destroy_instance(&self, instance_id: &str) -> Result<()>;

    /// Operator request forwarded to the agent.
    async fn on_request(&self, req: Message) -> Result<Message>;

    /// Operator request addressed to one of this executor's instances.
    async fn instance_request(&self, instance_id: &str, req: Message) -> Result<Message>;

    /// Request initiated by the agent. Returns the reply body.
    async fn handle_agent_request(&self, msg: Message) -> Message;

    fn container_for(&self, instance_id: &str) -> Option<Arc<Container>>;

    /// Drops the active channel and tells every container why.
    fn disconnect(&self, reason: &str);
}

/// Construction parameters shared by both executor variants.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub id: String,
    pub token: Option<String>,
    pub exec_router: Arc<dyn Router>,
    pub inst_router: Arc<dyn Router>,
    pub events: Arc<dyn AgentEvents>,
}

struct AgentRequests {
    agent: Weak<dyn RemoteAgent>,
}

#[async_trait::async_trait]
impl RequestHandler for AgentRequests {
    async fn on_request(&self, msg: Message) -> Message {
        match self.agent.upgrade() {
            Some(agent) => agent.handle_agent_request(msg).await,
            None => error_reply("executor closed"),
        }
    }
}

struct Link {
    channel: Option<Arc<dyn Channel>>,
    has_started: bool,
}

pub(crate) struct ExecutorCore {
    id: String,
    pub(crate) events: Arc<dyn AgentEvents>,
    exec_router: Arc<dyn Router>,
    pub(crate) inst_router: Arc<dyn Router>,
    token: Mutex<Option<String>>,
    client: Mutex<Option<Arc<dyn Client>>>,
    link: Mutex<Link>,
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl ExecutorCore {
    pub(crate) fn new(opts: ExecutorOptions) -> Arc<Self> {
        Arc::new(Self {
            id: opts.id,
            events: opts.events,
            exec_router: opts.exec_router,
            inst_router: opts.inst_router,
            token: Mutex::new(opts.token.filter(|t| !t.is_empty())),
            client: Mutex::new(None),
            link: Mutex::new(Link {
                channel: None,
                has_started: false,
            }),
            containers: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    /// Registers the control client, routing agent requests to `agent`.
    pub(crate) fn listen(self: &Arc<Self>, agent: Weak<dyn RemoteAgent>) -> String {
        debug!(component = "executor", event = "listen", executor_id = %self.id, "registering control client");
        let requested = self.token();
        let client = self.exec_router.accept_client(Arc::new(AgentRequests { agent }), requested.clone());
        let token = client.token();
        match requested {
            Some(requested) => assert_eq!(token, requested, "control client token must match the executor token"),
            None => {
                debug!(component = "executor", event = "token_allocated", executor_id = %self.id, "allocated executor token");
                *self.token.lock() = Some(token.clone());
            }
        }

        let me = Arc::downgrade(self);
        client.on_new_channel(Arc::new(move |channel| {
            if let Some(core) = me.upgrade() {
                core.on_new_channel(channel);
            }
        }));
        *self.client.lock() = Some(client);
        token
    }

    fn on_new_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let replaced = self.link.lock().channel.is_some();
        debug!(
            component = "executor",
            event = "new_channel",
            executor_id = %self.id,
            token = %channel.token(),
            replaced,
            "executor connected"
        );
        if replaced {
            self.disconnect("executor-replaced");
        }
        self.link.lock().channel = Some(channel.clone());

        let me = Arc::downgrade(self);
        let watched = Arc::downgrade(&channel);
        channel.on_error(Arc::new(move |err| {
            let (Some(core), Some(channel)) = (me.upgrade(), watched.upgrade()) else {
                return;
            };
            let is_current = core
                .link
                .lock()
                .channel
                .as_ref()
                .map(|current| same_channel(current, &channel))
                .unwrap_or(false);
            if is_current {
                core.disconnect(&format!("executor-{err}"));
            }
        }));
    }

    pub(crate) fn disconnect(&self, reason: &str) {
        info!(component = "executor", event = "disconnect", executor_id = %self.id, reason, "executor disconnected");
        let channel = {
            let mut link = self.link.lock();
            link.has_started = false;
            link.channel.take()
        };
        if let Some(channel) = channel {
            channel.close(Some(reason));
        }

        let containers = self.containers();
        if containers.is_empty() {
            return;
        }
        let reason = reason.to_string();
        tokio::spawn(async move {
            join_all(containers.iter().map(|c| c.disconnect(&reason))).await;
        });
    }

    pub(crate) fn mark_started(&self) {
        self.link.lock().has_started = true;
    }

    pub(crate) fn has_started(&self) -> bool {
        self.link.lock().has_started
    }

    /// Sends a command to the agent. Returns `None` when the agent has not
    /// started and the command was discarded.
    pub(crate) async fn request(&self, msg: Message) -> Result<Option<Message>> {
        let channel = {
            let link = self.link.lock();
            if link.has_started {
                link.channel.clone()
            } else {
                None
            }
        };
        let Some(channel) = channel else {
            debug!(component = "executor", event = "request_discarded", executor_id = %self.id, msg = %msg, "executor not started");
            return Ok(None);
        };
        debug!(component = "executor", event = "request", executor_id = %self.id, msg = %msg, "executor request");
        let res = channel.request(msg).await?;
        check_response(res).map(Some)
    }

    pub(crate) fn container_for(&self, instance_id: &str) -> Option<Arc<Container>> {
        self.containers.read().get(instance_id).cloned()
    }

    pub(crate) fn containers(&self) -> Vec<Arc<Container>> {
        self.containers.read().values().cloned().collect()
    }

    /// Tracks a container; an instance id can only be tracked once.
    pub(crate) fn insert_container(&self, container: Arc<Container>) -> Result<()> {
        let mut containers = self.containers.write();
        if containers.contains_key(container.id()) {
            return Err(CentralError::DuplicateInstance(container.id().to_string()));
        }
        containers.insert(container.id().to_string(), container);
        Ok(())
    }

    pub(crate) fn remove_container(&self, instance_id: &str) -> Option<Arc<Container>> {
        self.containers.write().remove(instance_id)
    }

    /// Creates and tracks a container, rejecting duplicates before any
    /// control client is registered for them.
    pub(crate) fn new_container(&self, opts: ContainerOptions) -> Result<Arc<Container>> {
        if self.container_for(&opts.instance_id).is_some() {
            return Err(CentralError::DuplicateInstance(opts.instance_id));
        }
        Ok(Container::new(opts, &*self.inst_router, self.events.clone()))
    }

    pub(crate) async fn close(&self) -> Result<()> {
        debug!(component = "executor", event = "close", executor_id = %self.id, "closing executor");
        let containers: Vec<_> = self.containers.write().drain().map(|(_, c)| c).collect();
        for res in join_all(containers.iter().map(|c| c.close())).await {
            res?;
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.close().await?;
        }
        self.link.lock().channel = None;
        Ok(())
    }
}
