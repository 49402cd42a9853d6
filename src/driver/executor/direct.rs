//! Executor proxy for agents that run containers on their own hosts.

use std::sync::{Arc, Weak};

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{ControlVerb, ExecutorCore, ExecutorOptions, RemoteAgent};
use crate::channel::message::{command, id_field, str_field, u64_field};
use crate::channel::{cmd_of, error_reply, ok_reply, Message};
use crate::driver::container::{Container, ContainerListener, ContainerOptions};
use crate::error::{CentralError, Result};
use crate::events::ExecutorData;
use crate::store::Metadata;

pub struct DirectExecutor {
    core: Arc<ExecutorCore>,
    me: Weak<DirectExecutor>,
}

impl DirectExecutor {
    pub fn new(opts: ExecutorOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: ExecutorCore::new(opts),
            me: me.clone(),
        })
    }

    /// Asks the agent to (re)create the container with its current settings.
    async fn container_deploy(&self, container: &Container) -> Result<()> {
        let cmd = json!({
            "cmd": "container-deploy",
            "deploymentId": container.deployment_id(),
            "env": container.env(),
            "id": container.id(),
            "options": container.start_options(),
            "token": container.token(),
        });
        let res = self.core.request(cmd).await?;
        if let Some(serde_json::Value::Object(reply)) = res {
            let metadata = metadata_of(reply);
            if !metadata.is_empty() {
                container.update_container_metadata(metadata).await?;
            }
        }
        Ok(())
    }

    async fn on_starting(&self, msg: Message) {
        let mut metadata = Metadata::new();
        if let Some(driver) = msg.get("driver") {
            metadata.insert("remoteDriver".to_string(), driver.clone());
        }
        let data = ExecutorData {
            hostname: str_field(&msg, "hostname").map(str::to_string),
            address: str_field(&msg, "address")
                .or_else(|| str_field(&msg, "ip"))
                .map(str::to_string),
            cpus: u64_field(&msg, "cpus").and_then(|n| u32::try_from(n).ok()),
            metadata,
        };
        if let Err(e) = self.core.events.update_executor_data(self.core.id(), data).await {
            error!(
                component = "executor",
                event = "persistence_failed",
                executor_id = %self.core.id(),
                error = %e,
                "failed to store executor data"
            );
        }

        let containers = self.core.containers();
        let results = join_all(containers.iter().map(|c| self.container_deploy(c))).await;
        for (container, res) in containers.iter().zip(results) {
            if let Err(e) = res {
                error!(
                    component = "executor",
                    event = "redeploy_failed",
                    executor_id = %self.core.id(),
                    instance_id = %container.id(),
                    error = %e,
                    "failed to reissue container deploy"
                );
            }
        }
    }
}

/// Container metadata replies may nest the data under `data`.
fn metadata_of(mut reply: serde_json::Map<String, serde_json::Value>) -> Metadata {
    reply.remove("cmd");
    reply.remove("message");
    match reply.remove("data") {
        Some(serde_json::Value::Object(data)) => data,
        Some(other) => {
            reply.insert("data".to_string(), other);
            reply
        }
        None => reply,
    }
}

#[async_trait::async_trait]
impl RemoteAgent for DirectExecutor {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn token(&self) -> Option<String> {
        self.core.token()
    }

    fn listen(self: Arc<Self>) -> String {
        let agent: Arc<dyn RemoteAgent> = self.clone();
        self.core.listen(Arc::downgrade(&agent))
    }

    fn has_started(&self) -> bool {
        self.core.has_started()
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await
    }

    async fn create_instance(&self, opts: ContainerOptions) -> Result<String> {
        let container = self.core.new_container(opts)?;
        container.attach(Arc::new(DirectListener {
            executor: self.me.clone(),
        }))?;
        if let Err(e) = self.core.insert_container(container.clone()) {
            container.close().await?;
            return Err(e);
        }
        info!(
            component = "executor",
            event = "instance_created",
            executor_id = %self.core.id(),
            instance_id = %container.id(),
            "container created"
        );
        self.container_deploy(&container).await?;
        Ok(container.token().to_string())
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<()> {
        self.core
            .request(json!({ "cmd": "container-destroy", "id": instance_id }))
            .await?;
        if let Some(container) = self.core.remove_container(instance_id) {
            container.close().await?;
        }
        info!(component = "executor", event = "instance_destroyed", executor_id = %self.core.id(), instance_id, "container destroyed");
        Ok(())
    }

    async fn on_request(&self, req: Message) -> Result<Message> {
        if !self.core.has_started() {
            return Err(CentralError::ExecutorNotStarted(self.core.id().to_string()));
        }
        Ok(self.core.request(req).await?.unwrap_or_default())
    }

    async fn instance_request(&self, instance_id: &str, mut req: Message) -> Result<Message> {
        let container = self
            .core
            .container_for(instance_id)
            .ok_or_else(|| CentralError::UnknownInstance(instance_id.to_string()))?;
        debug!(component = "executor", event = "instance_request", instance_id, req = %req, "instance request");

        let verb = ControlVerb::parse(cmd_of(&req));
        if let Some(verb) = verb {
            let mut fields = req;
            fields["id"] = json!(instance_id);
            let cmd = command(&format!("container-{}", verb.as_str()), fields);
            let res = self.core.request(cmd).await?;
            if verb.is_soft() {
                container.request(json!({ "cmd": "stop" })).await?;
            }
            return Ok(res.unwrap_or_default());
        }

        if cmd_of(&req) == "current" {
            if let Some(sub) = req.get("sub").cloned() {
                req["cmd"] = sub;
            }
        }
        Ok(container.request(req).await?.unwrap_or_default())
    }

    async fn handle_agent_request(&self, msg: Message) -> Message {
        debug!(component = "executor", event = "agent_request", executor_id = %self.core.id(), msg = %msg, "executor agent request");
        let cmd = cmd_of(&msg).to_string();
        match cmd.as_str() {
            "starting" => {
                self.core.mark_started();
                info!(component = "executor", event = "started", executor_id = %self.core.id(), "executor started");
                if let Some(me) = self.me.upgrade() {
                    tokio::spawn(async move { me.on_starting(msg).await });
                }
                ok_reply()
            }
            "container-exit" => {
                if let Some(id) = id_field(&msg, "id") {
                    if let Err(e) = self.core.events.mark_old_processes_stopped(&id).await {
                        warn!(component = "executor", event = "persistence_failed", instance_id = %id, error = %e, "failed to mark processes stopped");
                    }
                }
                ok_reply()
            }
            other => {
                warn!(component = "executor", event = "unknown_command", executor_id = %self.core.id(), cmd = other, "unknown executor command");
                error_reply(format!("unknown command {other}"))
            }
        }
    }

    fn container_for(&self, instance_id: &str) -> Option<Arc<Container>> {
        self.core.container_for(instance_id)
    }

    fn disconnect(&self, reason: &str) {
        self.core.disconnect(reason)
    }
}

/// Turns container changes into executor commands.
struct DirectListener {
    executor: Weak<DirectExecutor>,
}

impl DirectListener {
    fn executor(&self) -> Result<Arc<DirectExecutor>> {
        self.executor
            .upgrade()
            .ok_or_else(|| CentralError::ChannelClosed("executor closed".into()))
    }
}

#[async_trait::async_trait]
impl ContainerListener for DirectListener {
    async fn start_options_updated(&self, container: &Container) -> Result<()> {
        let cmd = json!({
            "cmd": "container-set-options",
            "id": container.id(),
            "options": container.start_options(),
        });
        self.executor()?.core.request(cmd).await.map(|_| ())
    }

    async fn env_updated(&self, container: &Container) -> Result<()> {
        let cmd = json!({
            "cmd": "container-set-env",
            "id": container.id(),
            "env": container.env(),
        });
        self.executor()?.core.request(cmd).await.map(|_| ())
    }

    async fn deploy(&self, container: &Container) -> Result<()> {
        self.executor()?.container_deploy(container).await
    }

    async fn notification(&self, container: &Container, msg: Message) -> Result<Message> {
        let executor = self.executor()?;
        if executor.core.container_for(container.id()).is_none() {
            debug!(component = "executor", event = "notification_discarded", instance_id = %container.id(), "container already destroyed");
            return Ok(ok_reply());
        }
        executor.core.events.on_instance_notification(container.id(), msg).await
    }

    async fn disconnected(&self, container: &Container, reason: &str) {
        debug!(component = "executor", event = "container_disconnected", instance_id = %container.id(), reason, "container lost its executor");
    }
}
