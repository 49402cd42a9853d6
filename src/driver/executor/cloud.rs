//! Executor proxy for cloud platforms (Heroku, Bluemix).
//!
//! The platform starts containers on its own; each one registers itself over
//! the executor channel and receives a control URI for its supervisor. Central
//! cannot issue container commands, so env, option and deploy changes stop at
//! the proxy.

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::{ControlVerb, ExecutorCore, ExecutorOptions, RemoteAgent};
use crate::channel::message::{id_field, str_field, u64_field};
use crate::channel::{cmd_of, error_reply, ok_reply, Message};
use crate::driver::container::{Container, ContainerListener, ContainerOptions};
use crate::error::{CentralError, Result};
use crate::store::{ClusterSize, CloudPlatform, InstanceModel, Metadata, Repositories, Repository};

/// Handles an agent's self-registration request.
#[async_trait::async_trait]
pub trait SelfRegistration: Send + Sync {
    /// Command name the agent registers with.
    fn command(&self) -> &'static str;

    /// Registers a newly started container and returns the reply body.
    async fn register(&self, executor: &CloudExecutor, msg: Message) -> Result<Message>;

    /// Records that a registered container went away.
    async fn on_instance_exit(&self, instance_id: &str);
}

struct Profile {
    command: &'static str,
    resource_field: &'static str,
    started_event: &'static str,
    stopped_event: &'static str,
}

fn profile(platform: CloudPlatform) -> Profile {
    match platform {
        CloudPlatform::Heroku => Profile {
            command: "register-dyno",
            resource_field: "herokuResourceId",
            started_event: "dyno-started",
            stopped_event: "dyno-stopped",
        },
        CloudPlatform::Bluemix => Profile {
            command: "register-container",
            resource_field: "bmServiceBindingId",
            started_event: "container-started",
            stopped_event: "container-stopped",
        },
    }
}

/// Registration backed by the cloud resource rows of the model store.
pub struct CloudRegistration {
    profile: Profile,
    supervisor_url: Url,
    repos: Repositories,
}

impl CloudRegistration {
    pub fn new(platform: CloudPlatform, supervisor_url: Url, repos: Repositories) -> Self {
        Self {
            profile: profile(platform),
            supervisor_url,
            repos,
        }
    }

    /// Supervisor URL carrying the instance token as its user.
    fn control_uri(&self, token: &str) -> String {
        let mut uri = self.supervisor_url.clone();
        if uri.set_username(token).is_err() {
            warn!(component = "cloud", event = "bad_supervisor_url", url = %self.supervisor_url, "supervisor url cannot carry credentials");
        }
        uri.to_string()
    }
}

#[async_trait::async_trait]
impl SelfRegistration for CloudRegistration {
    fn command(&self) -> &'static str {
        self.profile.command
    }

    async fn register(&self, executor: &CloudExecutor, msg: Message) -> Result<Message> {
        let resource = match id_field(&msg, self.profile.resource_field) {
            Some(id) => self.repos.cloud_resources.find_by_id(&id).await?,
            None => None,
        };
        let Some(resource) = resource else {
            warn!(component = "cloud", event = "invalid_registration", executor_id = %executor.id(), "registration for unknown resource");
            return Ok(error_reply("Invalid token"));
        };

        let mut version_info = Metadata::new();
        for key in ["os", "node", "container"] {
            if let Some(v) = msg.get(key) {
                version_info.insert(key.to_string(), v.clone());
            }
        }
        let mut instance = InstanceModel::new(&resource.executor_id, &resource.server_service_id);
        instance.current_deployment_id = Some("not-available".to_string());
        instance.started = true;
        instance.start_time = Some(Utc::now());
        instance.container_version_info = version_info;
        instance.agent_version = str_field(&msg, "agentVersion").map(str::to_string);
        instance.cloud_resource_id = Some(resource.id.clone());
        if let Some(cpus) = u64_field(&msg, "cpus").and_then(|n| u32::try_from(n).ok()) {
            instance.cpus = ClusterSize::Count(cpus);
        }

        let mut instance = match self.repos.instances.create(instance).await {
            Ok(instance) => instance,
            Err(e) => {
                self.repos
                    .audit(&resource.id, self.profile.started_event, json!({ "msg": msg, "error": e.to_string() }))
                    .await;
                return Err(e.into());
            }
        };

        let token = executor
            .create_instance(ContainerOptions {
                instance_id: instance.id.clone(),
                deployment_id: instance.current_deployment_id.clone(),
                ..ContainerOptions::default()
            })
            .await?;
        instance.token = Some(token.clone());
        self.repos.instances.save(&instance).await?;

        self.repos
            .audit(&resource.id, self.profile.started_event, json!({ "msg": msg, "instanceId": instance.id }))
            .await;
        info!(component = "cloud", event = "registered", resource_id = %resource.id, instance_id = %instance.id, "cloud container registered");

        Ok(json!({
            "controlUri": self.control_uri(&token),
            "instanceId": instance.id,
        }))
    }

    async fn on_instance_exit(&self, instance_id: &str) {
        let instance = match self.repos.instances.find_by_id(instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                warn!(component = "cloud", event = "persistence_failed", instance_id, error = %e, "failed to load instance");
                return;
            }
        };
        let mut instance = instance;
        instance.started = false;
        instance.stop_time = Some(Utc::now());
        if let Err(e) = self.repos.instances.save(&instance).await {
            warn!(component = "cloud", event = "persistence_failed", instance_id, error = %e, "failed to record instance stop");
        }
        if let Some(resource_id) = &instance.cloud_resource_id {
            self.repos
                .audit(resource_id, self.profile.stopped_event, json!({ "instanceId": instance_id }))
                .await;
        }
    }
}

pub struct CloudExecutor {
    core: Arc<ExecutorCore>,
    registration: Arc<dyn SelfRegistration>,
    me: Weak<CloudExecutor>,
}

impl CloudExecutor {
    pub fn new(opts: ExecutorOptions, registration: Arc<dyn SelfRegistration>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: ExecutorCore::new(opts),
            registration,
            me: me.clone(),
        })
    }
}

#[async_trait::async_trait]
impl RemoteAgent for CloudExecutor {
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

    /// Tracks the container; the platform has already started it.
    async fn create_instance(&self, opts: ContainerOptions) -> Result<String> {
        let container = self.core.new_container(opts)?;
        container.attach(Arc::new(CloudListener {
            executor: self.me.clone(),
        }))?;
        if let Err(e) = self.core.insert_container(container.clone()) {
            container.close().await?;
            return Err(e);
        }
        Ok(container.token().to_string())
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<()> {
        if let Some(container) = self.core.remove_container(instance_id) {
            container.close().await?;
        }
        Ok(())
    }

    async fn on_request(&self, _req: Message) -> Result<Message> {
        Err(CentralError::RequestsNotSupported)
    }

    async fn instance_request(&self, instance_id: &str, mut req: Message) -> Result<Message> {
        if ControlVerb::parse(cmd_of(&req)).is_some() {
            return Err(CentralError::NotSupported);
        }
        let container = self
            .core
            .container_for(instance_id)
            .ok_or_else(|| CentralError::UnknownInstance(instance_id.to_string()))?;
        if cmd_of(&req) == "current" {
            if let Some(sub) = req.get("sub").cloned() {
                req["cmd"] = sub;
            }
        }
        Ok(container.request(req).await?.unwrap_or_default())
    }

    async fn handle_agent_request(&self, msg: Message) -> Message {
        debug!(component = "cloud", event = "agent_request", executor_id = %self.core.id(), msg = %msg, "cloud agent request");
        let cmd = cmd_of(&msg).to_string();
        if cmd == self.registration.command() {
            return match self.registration.register(self, msg).await {
                Ok(reply) => reply,
                Err(e) => error_reply(e),
            };
        }
        warn!(component = "cloud", event = "unknown_command", executor_id = %self.core.id(), cmd = %cmd, "unknown cloud agent command");
        error_reply(format!("unknown command {cmd}"))
    }

    fn container_for(&self, instance_id: &str) -> Option<Arc<Container>> {
        self.core.container_for(instance_id)
    }

    fn disconnect(&self, reason: &str) {
        self.core.disconnect(reason)
    }
}

struct CloudListener {
    executor: Weak<CloudExecutor>,
}

#[async_trait::async_trait]
impl ContainerListener for CloudListener {
    async fn start_options_updated(&self, container: &Container) -> Result<()> {
        debug!(component = "cloud", event = "command_ignored", instance_id = %container.id(), "start options not supported by driver");
        Ok(())
    }

    async fn env_updated(&self, container: &Container) -> Result<()> {
        debug!(component = "cloud", event = "command_ignored", instance_id = %container.id(), "env update not supported by driver");
        Ok(())
    }

    async fn deploy(&self, container: &Container) -> Result<()> {
        debug!(component = "cloud", event = "command_ignored", instance_id = %container.id(), "deploy not supported by driver");
        Ok(())
    }

    async fn notification(&self, container: &Container, msg: Message) -> Result<Message> {
        let Some(executor) = self.executor.upgrade() else {
            return Ok(ok_reply());
        };
        if executor.core.container_for(container.id()).is_none() {
            return Ok(ok_reply());
        }
        executor.core.events.on_instance_notification(container.id(), msg).await
    }

    async fn disconnected(&self, container: &Container, reason: &str) {
        info!(component = "cloud", event = "instance_exit", instance_id = %container.id(), reason, "cloud container gone");
        if let Some(executor) = self.executor.upgrade() {
            executor.registration.on_instance_exit(container.id()).await;
        }
    }
}
