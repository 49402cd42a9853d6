//! Composition root: wires the store, recorder, drivers and scheduler, and
//! rebuilds the in-memory proxies from the store on start.

pub mod ready;


use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::Routers;
use crate::driver::{Driver, DriverKind, DriverOptions, ExecutorInfo, InstanceInfo, StartOptions};
use crate::error::Result;
use crate::events::ServiceEndpoints;
use crate::gateway::GatewayDriver;
use crate::recorder::Recorder;
use crate::scheduler::{instance_env, Scheduler, SchedulerDefaults};
use crate::store::{InstanceModel, Mesh, Metadata, Repositories, Repository};

pub use ready::{Phase, ReadyGate};

/// File under the base dir holding the default env of new services.
pub const DEFAULT_ENV_FILE: &str = "env.json";

pub struct ServerOptions {
    pub driver: DriverKind,
    pub base_dir: PathBuf,
    pub supervisor_url: Option<Url>,
    pub defaults: SchedulerDefaults,
}

pub struct Server {
    base_dir: PathBuf,
    repos: Repositories,
    gate: ReadyGate,
    recorder: Arc<Recorder>,
    driver: Arc<Driver>,
    gateways: Arc<GatewayDriver>,
    mesh: Arc<Mesh>,
    endpoint_updates: Mutex<Option<mpsc::UnboundedReceiver<ServiceEndpoints>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Reads `<base_dir>/env.json`. A missing or unreadable file yields an
/// empty env.
pub fn load_default_env(base_dir: &Path) -> Metadata {
    let path = base_dir.join(DEFAULT_ENV_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            debug!(component = "server", event = "default_env_missing", path = ?path, error = %e, "no default env");
            return Metadata::new();
        }
    };
    match serde_json::from_slice::<Metadata>(&data) {
        Ok(env) => env,
        Err(e) => {
            warn!(component = "server", event = "default_env_invalid", path = ?path, error = %e, "ignoring default env");
            Metadata::new()
        }
    }
}

impl Server {
    pub fn new(opts: ServerOptions, repos: Repositories, routers: Routers) -> Result<Self> {
        let gate = ReadyGate::new();
        let (recorder, endpoint_updates) = Recorder::new(repos.clone());
        let recorder = Arc::new(recorder);

        let driver = Arc::new(Driver::new(DriverOptions {
            kind: opts.driver,
            routers: routers.clone(),
            events: recorder.clone(),
            repos: repos.clone(),
            artifact_dir: opts.base_dir.join("artifacts"),
            supervisor_url: opts.supervisor_url,
        })?);
        let gateways = Arc::new(GatewayDriver::new(routers.gateway.clone(), recorder.clone()));
        let scheduler = Scheduler::new(repos.clone(), driver.clone(), gateways.clone(), opts.defaults, gate.clone());
        let mesh = Arc::new(Mesh::new(repos.clone(), Arc::new(scheduler), load_default_env(&opts.base_dir)));

        Ok(Self {
            base_dir: opts.base_dir,
            repos,
            gate,
            recorder,
            driver,
            gateways,
            mesh,
            endpoint_updates: Mutex::new(Some(endpoint_updates)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn gate(&self) -> &ReadyGate {
        &self.gate
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn gateways(&self) -> &Arc<GatewayDriver> {
        &self.gateways
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Rebuilds every executor and gateway proxy from the store, then opens
    /// the readiness gate.
    pub async fn start(&self) -> Result<()> {
        self.forward_endpoint_updates();
        self.gate.set(Phase::Reconnecting);
        self.reconnect_executors().await?;
        self.reconnect_gateways().await?;
        self.gate.set(Phase::Ready);
        info!(
            component = "server",
            event = "started",
            driver = %self.driver.kind(),
            executors = self.driver.executor_ids().len(),
            "server ready"
        );
        Ok(())
    }

    /// Closes every proxy. Persisted records are untouched.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let gateways = self.gateways.stop().await;
        let driver = self.driver.stop().await;
        self.tasks.close();
        self.tasks.wait().await;
        info!(component = "server", event = "stopped", "server stopped");
        gateways.and(driver)
    }

    fn forward_endpoint_updates(&self) {
        let Some(mut rx) = self.endpoint_updates.lock().take() else {
            return;
        };
        let gateways = self.gateways.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    update = rx.recv() => {
                        let Some(update) = update else { break };
                        if let Err(e) = gateways.update_gateways(std::slice::from_ref(&update)).await {
                            warn!(
                                component = "server",
                                event = "gateway_update_failed",
                                service_id = %update.service_id,
                                error = %e,
                                "failed to push endpoints to gateways"
                            );
                        }
                    }
                }
            }
            debug!(component = "server", event = "endpoint_forwarder_stopped", "endpoint forwarding stopped");
        });
    }

    async fn instance_info(&self, instance: InstanceModel) -> Result<InstanceInfo> {
        let env = match self.repos.services.find_by_id(&instance.server_service_id).await? {
            Some(service) => instance_env(&service, &instance.id),
            None => instance.env.clone(),
        };
        Ok(InstanceInfo {
            env,
            start_options: StartOptions {
                size: Some(instance.cpus.clone()),
                trace: Some(instance.tracing_enabled),
            },
            id: instance.id,
            token: instance.token,
            deployment_id: instance.current_deployment_id,
        })
    }

    async fn reconnect_executors(&self) -> Result<()> {
        for executor in self.repos.alive_executors().await? {
            let mut infos = Vec::new();
            for instance in self.repos.instances_of_executor(&executor.id).await? {
                infos.push(self.instance_info(instance).await?);
            }
            debug!(
                component = "server",
                event = "reconnect_executor",
                executor_id = %executor.id,
                instances = infos.len(),
                "reconnecting executor"
            );
            let token = self
                .driver
                .reconnect(
                    ExecutorInfo {
                        id: executor.id.clone(),
                        token: executor.token.clone(),
                    },
                    infos,
                )
                .await?;
            if executor.token.as_deref() != Some(token.as_str()) {
                let mut row = executor;
                row.token = Some(token);
                if let Err(e) = self.repos.executors.save(&row).await {
                    error!(component = "server", event = "persistence_failed", executor_id = %row.id, error = %e, "failed to persist executor token");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn reconnect_gateways(&self) -> Result<()> {
        for gateway in self.repos.gateways.find_all().await? {
            let token = self.gateways.create_gateway(&gateway.id, gateway.token.clone()).await?;
            if gateway.token.as_deref() != Some(token.as_str()) {
                let mut row = gateway;
                row.token = Some(token);
                if let Err(e) = self.repos.gateways.save(&row).await {
                    error!(component = "server", event = "persistence_failed", gateway_id = %row.id, error = %e, "failed to persist gateway token");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
