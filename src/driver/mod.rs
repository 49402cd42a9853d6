//! Drivers: how Central talks to the hosts that run service instances.
//!
//! [`Driver`] tracks one [`RemoteAgent`] per executor and routes every
//! instance operation to the executor owning the instance. The
//! [`DriverKind`] decides which executor variant is built and which
//! capabilities (artifacts, basic auth, scheduling) the driver offers.

pub mod artifact;
pub mod container;
pub mod executor;


use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{Message, Routers};
use crate::error::{CentralError, Result};
use crate::events::AgentEvents;
use crate::store::{CloudPlatform, Commit, Metadata, Repositories};

pub use artifact::{ArtifactLookup, ArtifactStore};
pub use container::{Container, ContainerListener, ContainerOptions, Env, StartOptions};
pub use executor::{CloudExecutor, CloudRegistration, ControlVerb, DirectExecutor, ExecutorOptions, RemoteAgent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Executor,
    Heroku,
    Bluemix,
}

impl DriverKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::Heroku => "heroku",
            Self::Bluemix => "Bluemix",
        }
    }

    pub fn supports_basic_auth(self) -> bool {
        !matches!(self, Self::Bluemix)
    }

    /// Whether Central decides placement. Cloud platforms place instances
    /// themselves.
    pub fn requires_scheduler(self) -> bool {
        matches!(self, Self::Executor)
    }

    fn platform(self) -> Option<CloudPlatform> {
        match self {
            Self::Executor => None,
            Self::Heroku => Some(CloudPlatform::Heroku),
            Self::Bluemix => Some(CloudPlatform::Bluemix),
        }
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "executor" => Ok(Self::Executor),
            "heroku" => Ok(Self::Heroku),
            "bluemix" => Ok(Self::Bluemix),
            other => Err(format!("unknown driver {other:?}, expected executor, heroku or bluemix")),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted executor facts needed to rebuild its proxy.
#[derive(Debug, Clone)]
pub struct ExecutorInfo {
    pub id: String,
    pub token: Option<String>,
}

/// Persisted instance facts needed to rebuild its container.
#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    pub id: String,
    pub token: Option<String>,
    pub deployment_id: Option<String>,
    pub env: Metadata,
    pub start_options: StartOptions,
}

pub struct DriverOptions {
    pub kind: DriverKind,
    pub routers: Routers,
    pub events: Arc<dyn AgentEvents>,
    pub repos: Repositories,
    /// Where executor artifacts are written.
    pub artifact_dir: std::path::PathBuf,
    /// Control URI handed to self-registering cloud containers.
    pub supervisor_url: Option<Url>,
}

pub struct Driver {
    kind: DriverKind,
    routers: Routers,
    events: Arc<dyn AgentEvents>,
    artifacts: ArtifactStore,
    registration: Option<Arc<CloudRegistration>>,
    executors: RwLock<HashMap<String, Arc<dyn RemoteAgent>>>,
}

impl Driver {
    pub fn new(opts: DriverOptions) -> Result<Self> {
        let registration = match opts.kind.platform() {
            Some(platform) => {
                let url = opts.supervisor_url.ok_or_else(|| {
                    CentralError::Config(format!("driver {} requires a supervisor url", opts.kind))
                })?;
                Some(Arc::new(CloudRegistration::new(platform, url, opts.repos.clone())))
            }
            None => None,
        };
        info!(component = "driver", event = "created", driver = %opts.kind, "driver initialised");
        Ok(Self {
            kind: opts.kind,
            routers: opts.routers,
            events: opts.events,
            artifacts: ArtifactStore::new(opts.artifact_dir),
            registration,
            executors: RwLock::new(HashMap::new()),
        })
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn supports_basic_auth(&self) -> bool {
        self.kind.supports_basic_auth()
    }

    pub fn requires_scheduler(&self) -> bool {
        self.kind.requires_scheduler()
    }

    pub fn executor(&self, executor_id: &str) -> Option<Arc<dyn RemoteAgent>> {
        self.executors.read().get(executor_id).cloned()
    }

    pub fn executor_ids(&self) -> Vec<String> {
        self.executors.read().keys().cloned().collect()
    }

    fn build_agent(&self, executor_id: &str, token: Option<String>) -> Arc<dyn RemoteAgent> {
        let opts = ExecutorOptions {
            id: executor_id.to_string(),
            token,
            exec_router: self.routers.executor.clone(),
            inst_router: self.routers.instance.clone(),
            events: self.events.clone(),
        };
        match &self.registration {
            Some(registration) => CloudExecutor::new(opts, registration.clone()),
            None => DirectExecutor::new(opts),
        }
    }

    /// Builds the proxy for an executor and returns its token.
    pub async fn create_executor(&self, executor_id: &str, token: Option<String>) -> Result<String> {
        let agent = self.build_agent(executor_id, token);
        let token = agent.clone().listen();
        let previous = self.executors.write().insert(executor_id.to_string(), agent);
        if let Some(previous) = previous {
            warn!(component = "driver", event = "executor_replaced", executor_id, "closing previous executor proxy");
            previous.close().await?;
        }
        info!(component = "driver", event = "executor_created", executor_id, "executor proxy created");
        Ok(token)
    }

    pub async fn destroy_executor(&self, executor_id: &str) -> Result<()> {
        let agent = self.executors.write().remove(executor_id);
        if let Some(agent) = agent {
            agent.close().await?;
            info!(component = "driver", event = "executor_destroyed", executor_id, "executor proxy destroyed");
        }
        Ok(())
    }

    /// Rebuilds an executor proxy and the containers of its instances after
    /// a restart. Instances without a deployment are skipped.
    pub async fn reconnect(&self, executor: ExecutorInfo, instances: Vec<InstanceInfo>) -> Result<String> {
        let token = self.create_executor(&executor.id, executor.token).await?;
        let agent = self
            .executor(&executor.id)
            .ok_or_else(|| CentralError::UnknownExecutor(executor.id.clone()))?;

        let deployable: Vec<InstanceInfo> = instances
            .into_iter()
            .filter(|inst| {
                let ok = inst.deployment_id.as_deref().is_some_and(|d| !d.is_empty());
                if !ok {
                    error!(
                        component = "driver",
                        event = "undeployable",
                        executor_id = %executor.id,
                        instance_id = %inst.id,
                        "instance has no deployment, skipping"
                    );
                }
                ok
            })
            .collect();

        let results = join_all(deployable.into_iter().map(|inst| {
            let agent = agent.clone();
            async move {
                agent
                    .create_instance(ContainerOptions {
                        instance_id: inst.id,
                        env: inst.env,
                        deployment_id: inst.deployment_id,
                        token: inst.token,
                        start_options: inst.start_options,
                    })
                    .await
            }
        }))
        .await;
        for res in results {
            res?;
        }
        debug!(component = "driver", event = "reconnected", executor_id = %executor.id, "executor reconnected");
        Ok(token)
    }

    /// Closes every executor proxy. Persisted state is untouched.
    pub async fn stop(&self) -> Result<()> {
        let agents: Vec<_> = self.executors.write().drain().map(|(_, a)| a).collect();
        for res in join_all(agents.iter().map(|a| a.close())).await {
            res?;
        }
        info!(component = "driver", event = "stopped", driver = %self.kind, "driver stopped");
        Ok(())
    }

    pub async fn create_instance(&self, executor_id: &str, opts: ContainerOptions) -> Result<String> {
        let agent = self
            .executor(executor_id)
            .ok_or_else(|| CentralError::UnknownExecutor(executor_id.to_string()))?;
        agent.create_instance(opts).await
    }

    /// Destroys an instance; an unknown executor is a no-op.
    pub async fn destroy_instance(&self, executor_id: &str, instance_id: &str) -> Result<()> {
        match self.executor(executor_id) {
            Some(agent) => agent.destroy_instance(instance_id).await,
            None => Ok(()),
        }
    }

    fn container_for(&self, executor_id: &str, instance_id: &str) -> Option<Arc<Container>> {
        self.executor(executor_id)?.container_for(instance_id)
    }

    pub async fn update_instance_env(&self, executor_id: &str, instance_id: &str, env: &Metadata) -> Result<()> {
        match self.container_for(executor_id, instance_id) {
            Some(container) => container.set_env(env).await,
            None => Ok(()),
        }
    }

    pub async fn set_instance_options(&self, executor_id: &str, instance_id: &str, options: StartOptions) -> Result<()> {
        match self.container_for(executor_id, instance_id) {
            Some(container) => container.set_start_options(options).await,
            None => Ok(()),
        }
    }

    /// Points an instance at a deployment. Cloud drivers deploy on their own.
    pub async fn deploy(&self, executor_id: &str, instance_id: &str, deployment_id: &str) -> Result<()> {
        if self.kind != DriverKind::Executor {
            debug!(component = "driver", event = "deploy_ignored", instance_id, "deploy not supported by driver");
            return Ok(());
        }
        match self.container_for(executor_id, instance_id) {
            Some(container) => container.deploy(deployment_id).await,
            None => Ok(()),
        }
    }

    pub async fn instance_request(&self, executor_id: &str, instance_id: &str, req: Message) -> Result<Message> {
        let agent = self
            .executor(executor_id)
            .ok_or_else(|| CentralError::UnknownExecutor(executor_id.to_string()))?;
        agent.instance_request(instance_id, req).await
    }

    pub async fn on_executor_request(&self, executor_id: &str, req: Message) -> Result<Message> {
        let agent = self
            .executor(executor_id)
            .ok_or_else(|| CentralError::UnknownExecutor(executor_id.to_string()))?;
        agent.on_request(req).await
    }

    /// Packages a commit for executors. Other drivers need no artifact.
    pub async fn prepare_driver_artifact(&self, commit: &Commit) -> Result<()> {
        if self.kind == DriverKind::Executor {
            self.artifacts.prepare(commit).await?;
        }
        Ok(())
    }

    /// Resolves an artifact download for the executor presenting `token`.
    pub async fn get_driver_artifact(&self, instance_id: &str, artifact_id: &str, token: Option<&str>) -> ArtifactLookup {
        if self.kind != DriverKind::Executor {
            return ArtifactLookup::NotFound;
        }
        let agent = token.filter(|t| !t.is_empty()).and_then(|token| {
            self.executors
                .read()
                .values()
                .find(|agent| agent.token().as_deref() == Some(token))
                .cloned()
        });
        let Some(agent) = agent else {
            debug!(component = "driver", event = "artifact_unauthorized", instance_id, "unknown executor token");
            return ArtifactLookup::Unauthorized;
        };
        if agent.container_for(instance_id).is_none() {
            debug!(component = "driver", event = "artifact_unauthorized", instance_id, executor_id = %agent.id(), "instance not on executor");
            return ArtifactLookup::Unauthorized;
        }
        match self.artifacts.find(artifact_id).await {
            Some(path) => ArtifactLookup::Found(path),
            None => ArtifactLookup::NotFound,
        }
    }
}
