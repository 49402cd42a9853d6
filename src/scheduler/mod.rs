//! Maps services onto executors and keeps the running fleet in line with
//! the persisted desired state.
//!
//! Placement is deliberately simple: every executor runs exactly one
//! instance of every deployed service. Every hook first waits for the
//! server to finish reconnecting so the driver's proxies reflect the store.


use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::channel::Message;
use crate::driver::{ContainerOptions, Driver, StartOptions};
use crate::error::{CentralError, Result};
use crate::gateway::GatewayDriver;
use crate::server::ReadyGate;
use crate::store::{ClusterSize, Commit, ExecutorModel, GatewayModel, InstanceModel, Metadata, ModelHooks, Repositories, Repository, ServiceModel, StoreError};

/// Env key carrying the instance id for trace correlation.
pub const TRACES_ID_ENV: &str = "STRONGLOOP_TRACES_ID";

/// Settings applied to newly placed instances.
#[derive(Debug, Clone, Default)]
pub struct SchedulerDefaults {
    pub cluster_size: ClusterSize,
    pub tracing: bool,
}

pub struct Scheduler {
    repos: Repositories,
    driver: Arc<Driver>,
    gateways: Arc<GatewayDriver>,
    defaults: SchedulerDefaults,
    gate: ReadyGate,
    placing: tokio::sync::Mutex<()>,
}

/// Logs a failed write made while reconciling and hands the error back.
fn persistence_failed<'a>(what: &'static str, id: &'a str) -> impl FnOnce(StoreError) -> CentralError + 'a {
    move |e| {
        let e = CentralError::from(e);
        error!(component = "scheduler", event = "persistence_failed", what, id, error = %e, "failed to persist reconciliation state");
        e
    }
}

/// Service env plus the trace-correlation id of the instance.
pub fn instance_env(service: &ServiceModel, instance_id: &str) -> Metadata {
    let mut env = service.env.clone();
    env.insert(TRACES_ID_ENV.to_string(), Value::String(instance_id.to_string()));
    env
}

impl Scheduler {
    pub fn new(
        repos: Repositories,
        driver: Arc<Driver>,
        gateways: Arc<GatewayDriver>,
        defaults: SchedulerDefaults,
        gate: ReadyGate,
    ) -> Self {
        Self {
            repos,
            driver,
            gateways,
            defaults,
            gate,
            placing: tokio::sync::Mutex::new(()),
        }
    }

    async fn service_of(&self, instance: &InstanceModel) -> Result<ServiceModel> {
        self.repos
            .services
            .find_by_id(&instance.server_service_id)
            .await?
            .ok_or_else(|| CentralError::UnknownService(instance.server_service_id.clone()))
    }

    async fn reschedule_all(&self) -> Result<()> {
        let services = self.repos.services.find_all().await?;
        for res in join_all(services.iter().map(|s| self.schedule(s))).await {
            res?;
        }
        Ok(())
    }

    /// Places the service on every executor, then pushes the current
    /// deployment and env to each of its instances.
    async fn schedule(&self, service: &ServiceModel) -> Result<()> {
        if !self.driver.requires_scheduler() {
            return Ok(());
        }
        let Some(deployment_id) = service.deployment_id() else {
            debug!(component = "scheduler", event = "schedule_skipped", service_id = %service.id, "service has no deployment");
            return Ok(());
        };
        debug!(component = "scheduler", event = "schedule", service_id = %service.id, deployment_id, "scheduling service");
        let _placing = self.placing.lock().await;

        let executors = self.repos.executors.find_all().await?;
        for res in join_all(executors.iter().map(|e| self.ensure_instance(e, service, deployment_id))).await {
            res?;
        }

        let instances = self.repos.instances_of_service(&service.id).await?;
        for res in join_all(instances.into_iter().map(|i| self.update_instance(service, i, deployment_id))).await {
            res?;
        }
        Ok(())
    }

    async fn ensure_instance(&self, executor: &ExecutorModel, service: &ServiceModel, deployment_id: &str) -> Result<()> {
        if self.repos.instance_for(&executor.id, &service.id).await?.is_some() {
            return Ok(());
        }
        let mut instance = InstanceModel::new(&executor.id, &service.id);
        instance.cpus = self.defaults.cluster_size.clone();
        instance.tracing_enabled = self.defaults.tracing;
        instance.current_deployment_id = Some(deployment_id.to_string());
        let instance = self
            .repos
            .instances
            .create(instance)
            .await
            .map_err(persistence_failed("instance", &executor.id))?;
        info!(
            component = "scheduler",
            event = "instance_placed",
            instance_id = %instance.id,
            executor_id = %executor.id,
            service_id = %service.id,
            "instance placed"
        );
        self.create_instance(&instance, service).await
    }

    async fn update_instance(&self, service: &ServiceModel, mut instance: InstanceModel, deployment_id: &str) -> Result<()> {
        instance.current_deployment_id = Some(deployment_id.to_string());
        instance.env.insert(TRACES_ID_ENV.to_string(), Value::String(instance.id.clone()));
        self.repos
            .instances
            .save(&instance)
            .await
            .map_err(persistence_failed("instance", &instance.id))?;
        self.push_instance(&instance, service).await
    }

    async fn create_instance(&self, instance: &InstanceModel, service: &ServiceModel) -> Result<()> {
        let token = self
            .driver
            .create_instance(
                &instance.executor_id,
                ContainerOptions {
                    instance_id: instance.id.clone(),
                    env: instance_env(service, &instance.id),
                    deployment_id: instance.current_deployment_id.clone(),
                    token: None,
                    start_options: StartOptions {
                        size: Some(instance.cpus.clone()),
                        trace: Some(instance.tracing_enabled),
                    },
                },
            )
            .await?;

        let mut row = self.repos.instances.get(&instance.id).await?;
        row.token = Some(token);
        self.repos
            .instances
            .save(&row)
            .await
            .map_err(persistence_failed("instance", &instance.id))?;
        Ok(())
    }

    /// Pushes options, env and deployment of an existing instance, in that
    /// order.
    async fn push_instance(&self, instance: &InstanceModel, service: &ServiceModel) -> Result<()> {
        let (exec_id, inst_id) = (instance.executor_id.as_str(), instance.id.as_str());
        self.driver
            .set_instance_options(
                exec_id,
                inst_id,
                StartOptions {
                    size: Some(instance.cpus.clone()),
                    trace: None,
                },
            )
            .await?;
        self.driver
            .set_instance_options(
                exec_id,
                inst_id,
                StartOptions {
                    size: None,
                    trace: Some(instance.tracing_enabled),
                },
            )
            .await?;
        self.driver
            .update_instance_env(exec_id, inst_id, &instance_env(service, inst_id))
            .await?;
        if let Some(deployment_id) = instance.deployment_id() {
            self.driver.deploy(exec_id, inst_id, deployment_id).await?;
        }
        Ok(())
    }

    /// Deletes an instance and everything recorded about it, dependents
    /// first, then tears down its container.
    async fn cleanup_instance(&self, instance: &InstanceModel) -> Result<()> {
        for proc in self.repos.processes_of_instance(&instance.id).await? {
            for record in self.repos.records_of_process(&proc.id).await? {
                self.repos.records.destroy(&record.id).await?;
            }
            self.repos.processes.destroy(&proc.id).await?;
        }
        self.repos.instances.destroy(&instance.id).await?;
        debug!(component = "scheduler", event = "instance_cleaned", instance_id = %instance.id, "instance removed");
        self.driver.destroy_instance(&instance.executor_id, &instance.id).await
    }
}

#[async_trait::async_trait]
impl ModelHooks for Scheduler {
    async fn on_executor_update(&self, executor: &ExecutorModel, is_new: bool) -> Result<()> {
        self.gate.wait().await;
        if !is_new {
            return Ok(());
        }
        let token = self.driver.create_executor(&executor.id, executor.token.clone()).await?;
        let mut row = self.repos.executors.get(&executor.id).await?;
        row.token = Some(token);
        self.repos
            .executors
            .save(&row)
            .await
            .map_err(persistence_failed("executor", &executor.id))?;
        self.reschedule_all().await
    }

    async fn on_executor_destroy(&self, executor: &ExecutorModel) -> Result<()> {
        self.gate.wait().await;
        let instances = self.repos.instances_of_executor(&executor.id).await?;
        for res in join_all(instances.iter().map(|i| self.cleanup_instance(i))).await {
            res?;
        }
        self.driver.destroy_executor(&executor.id).await
    }

    async fn on_service_update(&self, service: &ServiceModel, _is_new: bool) -> Result<()> {
        self.gate.wait().await;
        self.schedule(service).await
    }

    async fn on_service_destroy(&self, service: &ServiceModel) -> Result<()> {
        self.gate.wait().await;
        let instances = self.repos.instances_of_service(&service.id).await?;
        for res in join_all(instances.iter().map(|i| self.cleanup_instance(i))).await {
            res?;
        }
        Ok(())
    }

    async fn on_instance_update(&self, instance: &InstanceModel, is_new: bool) -> Result<()> {
        self.gate.wait().await;
        let service = self.service_of(instance).await?;
        if is_new {
            self.create_instance(instance, &service).await
        } else {
            self.push_instance(instance, &service).await
        }
    }

    async fn on_instance_destroy(&self, instance: &InstanceModel) -> Result<()> {
        self.gate.wait().await;
        self.driver.destroy_instance(&instance.executor_id, &instance.id).await
    }

    async fn on_gateway_update(&self, gateway: &GatewayModel, is_new: bool) -> Result<()> {
        self.gate.wait().await;
        if !is_new {
            return Ok(());
        }
        let token = self.gateways.create_gateway(&gateway.id, gateway.token.clone()).await?;
        let mut row = self.repos.gateways.get(&gateway.id).await?;
        row.token = Some(token);
        self.repos
            .gateways
            .save(&row)
            .await
            .map_err(persistence_failed("gateway", &gateway.id))?;
        Ok(())
    }

    async fn on_gateway_destroy(&self, gateway: &GatewayModel) -> Result<()> {
        self.gate.wait().await;
        self.gateways.destroy_gateway(&gateway.id).await
    }

    async fn on_deployment(&self, service: &ServiceModel, commit: &Commit) -> Result<()> {
        self.gate.wait().await;
        info!(component = "scheduler", event = "deployment", service_id = %service.id, commit = %commit.id, "preparing driver artifact");
        self.driver.prepare_driver_artifact(commit).await
    }

    async fn on_ctl_request(&self, instance: &InstanceModel, req: Message) -> Result<Message> {
        self.gate.wait().await;
        self.driver
            .instance_request(&instance.executor_id, &instance.id, req)
            .await
    }

    async fn on_executor_request(&self, executor: &ExecutorModel, req: Message) -> Result<Message> {
        self.gate.wait().await;
        self.driver.on_executor_request(&executor.id, req).await
    }
}
