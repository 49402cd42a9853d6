//! Central-side proxy of one running service instance.
//!
//! A `Container` owns the control client registered for the instance token,
//! tracks the desired env, start options and deployment, and forwards every
//! change to the single attached [`ContainerListener`] (its executor), which
//! turns them into commands for the remote agent.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{check_response, cmd_of, error_reply, same_channel, Channel, Client, Message, RequestHandler, Router};
use crate::error::{CentralError, Result};
use crate::events::AgentEvents;
use crate::store::{ClusterSize, Metadata};

/// Environment as delivered to the container: every value is a string.
pub type Env = BTreeMap<String, String>;

/// Stringifies env values the way the agent expects them.
pub fn stringify_env(raw: &Metadata) -> Env {
    raw.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<ClusterSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<bool>,
}

impl StartOptions {
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.trace.is_none()
    }

    /// Applies the keys set in `update` and returns the ones that changed.
    fn apply(&mut self, update: &StartOptions) -> StartOptions {
        let mut changed = StartOptions::default();
        if let Some(size) = &update.size {
            if self.size.as_ref() != Some(size) {
                self.size = Some(size.clone());
                changed.size = Some(size.clone());
            }
        }
        if let Some(trace) = update.trace {
            if self.trace != Some(trace) {
                self.trace = Some(trace);
                changed.trace = Some(trace);
            }
        }
        changed
    }
}

/// Everything needed to create a container proxy.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    pub instance_id: String,
    pub env: Metadata,
    pub deployment_id: Option<String>,
    /// Previously issued token, reused so agents can reconnect.
    pub token: Option<String>,
    pub start_options: StartOptions,
}

/// Receives the events of one container. At most one may be attached.
#[async_trait::async_trait]
pub trait ContainerListener: Send + Sync {
    async fn start_options_updated(&self, container: &Container) -> Result<()>;
    async fn env_updated(&self, container: &Container) -> Result<()>;
    async fn deploy(&self, container: &Container) -> Result<()>;
    async fn notification(&self, container: &Container, msg: Message) -> Result<Message>;
    async fn disconnected(&self, container: &Container, reason: &str);
}

struct State {
    env: Env,
    start_options: StartOptions,
    deployment_id: Option<String>,
    channel: Option<Arc<dyn Channel>>,
    has_started: bool,
    /// Stops the previous connection's processes. Inbound requests wait on it.
    marking: Option<Shared<BoxFuture<'static, ()>>>,
}

pub struct Container {
    id: String,
    token: String,
    events: Arc<dyn AgentEvents>,
    client: Arc<dyn Client>,
    state: Mutex<State>,
    listener: Mutex<Option<Arc<dyn ContainerListener>>>,
}

struct Inbound {
    container: Weak<Container>,
}

#[async_trait::async_trait]
impl RequestHandler for Inbound {
    async fn on_request(&self, msg: Message) -> Message {
        match self.container.upgrade() {
            Some(container) => container.on_request(msg).await,
            None => error_reply("container closed"),
        }
    }
}

impl Container {
    /// Registers a control client for the instance on `router`.
    ///
    /// Panics if the router hands back a different token than the one
    /// requested: agents reconnect with their stored token.
    pub fn new(opts: ContainerOptions, router: &dyn Router, events: Arc<dyn AgentEvents>) -> Arc<Self> {
        let requested = opts.token.clone().filter(|t| !t.is_empty());
        let container = Arc::new_cyclic(|me: &Weak<Container>| {
            let handler = Arc::new(Inbound { container: me.clone() });
            let client = router.accept_client(handler, requested.clone());
            Container {
                id: opts.instance_id.clone(),
                token: client.token(),
                events,
                client,
                state: Mutex::new(State {
                    env: stringify_env(&opts.env),
                    start_options: opts.start_options.clone(),
                    deployment_id: opts.deployment_id.clone().filter(|d| !d.is_empty()),
                    channel: None,
                    has_started: false,
                    marking: None,
                }),
                listener: Mutex::new(None),
            }
        });
        if let Some(requested) = requested {
            assert_eq!(container.token, requested, "control client token must match the instance token");
        }

        let me = Arc::downgrade(&container);
        container.client.on_new_channel(Arc::new(move |channel| {
            if let Some(container) = me.upgrade() {
                container.on_new_channel(channel);
            }
        }));
        debug!(component = "container", event = "created", instance_id = %container.id, "container proxy created");
        container
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn env(&self) -> Env {
        self.state.lock().env.clone()
    }

    pub fn start_options(&self) -> StartOptions {
        self.state.lock().start_options.clone()
    }

    pub fn deployment_id(&self) -> Option<String> {
        self.state.lock().deployment_id.clone()
    }

    pub fn has_started(&self) -> bool {
        self.state.lock().has_started
    }

    pub fn attach(&self, listener: Arc<dyn ContainerListener>) -> Result<()> {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(CentralError::ListenerAlreadyAttached("container"));
        }
        *slot = Some(listener);
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn ContainerListener>> {
        self.listener.lock().clone()
    }

    /// Merges start options; only changed keys reach the agent.
    pub async fn set_start_options(&self, update: StartOptions) -> Result<()> {
        let changed = self.state.lock().start_options.apply(&update);
        if changed.is_empty() {
            return Ok(());
        }
        debug!(component = "container", event = "start_options_updated", instance_id = %self.id, options = ?changed, "start options changed");

        if let Some(listener) = self.listener() {
            listener.start_options_updated(self).await?;
        }
        if let Some(size) = &changed.size {
            self.request(serde_json::json!({ "cmd": "set-size", "size": size.to_value() }))
                .await?;
        }
        if let Some(enabled) = changed.trace {
            self.request(serde_json::json!({ "cmd": "tracing", "enabled": enabled }))
                .await?;
        }
        Ok(())
    }

    /// Replaces the environment; nothing is sent when it is unchanged.
    pub async fn set_env(&self, raw: &Metadata) -> Result<()> {
        let env = stringify_env(raw);
        {
            let mut state = self.state.lock();
            if state.env == env {
                return Ok(());
            }
            state.env = env;
        }
        debug!(component = "container", event = "env_updated", instance_id = %self.id, "env changed");
        match self.listener() {
            Some(listener) => listener.env_updated(self).await,
            None => Ok(()),
        }
    }

    /// Switches to a new deployment; a repeated id is a no-op.
    pub async fn deploy(&self, deployment_id: &str) -> Result<()> {
        if deployment_id.is_empty() {
            return Err(CentralError::InvalidDeployment);
        }
        {
            let mut state = self.state.lock();
            if state.deployment_id.as_deref() == Some(deployment_id) {
                return Ok(());
            }
            state.deployment_id = Some(deployment_id.to_string());
        }
        info!(component = "container", event = "deploy", instance_id = %self.id, deployment_id, "deployment changed");
        match self.listener() {
            Some(listener) => listener.deploy(self).await,
            None => Ok(()),
        }
    }

    /// Sends a request to the supervisor. Returns `None` when the supervisor
    /// has not started yet and the request was discarded.
    pub async fn request(&self, msg: Message) -> Result<Option<Message>> {
        let channel = {
            let state = self.state.lock();
            if state.has_started {
                state.channel.clone()
            } else {
                None
            }
        };
        let Some(channel) = channel else {
            debug!(component = "container", event = "request_discarded", instance_id = %self.id, msg = %msg, "container not started");
            return Ok(None);
        };
        let res = channel.request(msg).await?;
        check_response(res).map(Some)
    }

    /// Reacts to the loss of the owning executor's connection.
    pub async fn disconnect(&self, reason: &str) {
        info!(component = "container", event = "disconnect", instance_id = %self.id, reason, "container disconnected");
        if let Err(e) = self.events.mark_old_processes_stopped(&self.id).await {
            warn!(component = "container", event = "persistence_failed", instance_id = %self.id, error = %e, "failed to mark processes stopped");
        }
        if let Some(listener) = self.listener() {
            listener.disconnected(self, reason).await;
        }
    }

    pub async fn update_container_metadata(&self, metadata: Metadata) -> Result<()> {
        self.events.set_instance_metadata(&self.id, metadata).await
    }

    /// Detaches the listener and drops the control client.
    pub async fn close(&self) -> Result<()> {
        self.listener.lock().take();
        let channel = self.state.lock().channel.take();
        if let Some(channel) = channel {
            channel.close(Some("container-closed"));
        }
        self.client.close().await
    }

    fn on_new_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let me = Arc::downgrade(self);
        let marking = async move {
            let Some(container) = me.upgrade() else {
                return;
            };
            if let Err(e) = container.events.mark_old_processes_stopped(&container.id).await {
                warn!(component = "container", event = "persistence_failed", instance_id = %container.id, error = %e, "failed to mark processes stopped");
            }
        }
        .boxed()
        .shared();
        let previous = {
            let mut state = self.state.lock();
            state.has_started = false;
            state.marking = Some(marking.clone());
            state.channel.replace(channel.clone())
        };
        debug!(component = "container", event = "new_channel", instance_id = %self.id, token = %channel.token(), "supervisor connected");
        if let Some(previous) = previous {
            if !same_channel(&previous, &channel) {
                previous.close(Some("container-replaced"));
            }
        }

        let me = Arc::downgrade(self);
        let watched = Arc::downgrade(&channel);
        channel.on_error(Arc::new(move |err| {
            let (Some(container), Some(channel)) = (me.upgrade(), watched.upgrade()) else {
                return;
            };
            container.on_channel_error(&channel, err);
        }));

        tokio::spawn(marking);
    }

    fn on_channel_error(self: &Arc<Self>, channel: &Arc<dyn Channel>, err: &str) {
        {
            let mut state = self.state.lock();
            match &state.channel {
                Some(current) if same_channel(current, channel) => {
                    state.channel = None;
                    state.has_started = false;
                }
                _ => return,
            }
        }
        let container = self.clone();
        let reason = format!("container-{err}");
        tokio::spawn(async move { container.disconnect(&reason).await });
    }

    async fn on_request(&self, msg: Message) -> Message {
        // Nothing from the new supervisor is recorded before the old processes are stopped.
        let marking = self.state.lock().marking.clone();
        if let Some(marking) = marking {
            marking.await;
        }
        if cmd_of(&msg) == "started" {
            self.state.lock().has_started = true;
            info!(component = "container", event = "started", instance_id = %self.id, "supervisor started");
        }
        let res = match self.listener() {
            Some(listener) => listener.notification(self, msg).await,
            None => self.events.on_instance_notification(&self.id, msg).await,
        };
        res.unwrap_or_else(error_reply)
    }
}
