//! CRUD façade over the repositories that fires [`ModelHooks`].
//!
//! Operator-facing changes (HTTP endpoints, provisioning) go through `Mesh`
//! so the scheduler sees them. Internal bookkeeping writes go straight to the
//! repositories.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::hooks::ModelHooks;
use super::model::*;
use super::repo::{Repositories, Repository};
use crate::channel::Message;
use crate::error::{CentralError, Result};

pub struct Mesh {
    repos: Repositories,
    hooks: Arc<dyn ModelHooks>,
    default_env: Metadata,
}

impl Mesh {
    pub fn new(repos: Repositories, hooks: Arc<dyn ModelHooks>, default_env: Metadata) -> Self {
        Self {
            repos,
            hooks,
            default_env,
        }
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub async fn create_executor(&self, driver: &str, metadata: Metadata) -> Result<ExecutorModel> {
        let mut executor = ExecutorModel::new(driver);
        executor.metadata = metadata;
        let executor = self.repos.executors.create(executor).await?;
        info!(component = "mesh", event = "executor_created", executor_id = %executor.id, "executor created");
        self.hooks.on_executor_update(&executor, true).await?;
        Ok(self.repos.executors.get(&executor.id).await?)
    }

    pub async fn destroy_executor(&self, id: &str) -> Result<()> {
        let executor = self
            .repos
            .executors
            .find_by_id(id)
            .await?
            .ok_or_else(|| CentralError::UnknownExecutor(id.to_string()))?;
        self.hooks.on_executor_destroy(&executor).await?;
        self.repos.executors.destroy(id).await?;
        Ok(())
    }

    /// Creates a service. Without an explicit env the default env applies.
    pub async fn create_service(&self, name: &str, env: Option<Metadata>) -> Result<ServiceModel> {
        let mut service = ServiceModel::new(name);
        service.env = env.unwrap_or_else(|| self.default_env.clone());
        let service = self.repos.services.create(service).await?;
        info!(component = "mesh", event = "service_created", service_id = %service.id, name, "service created");
        self.hooks.on_service_update(&service, true).await?;
        Ok(service)
    }

    /// Replaces the service environment.
    pub async fn set_service_env(&self, id: &str, env: Metadata) -> Result<ServiceModel> {
        let mut service = self.service(id).await?;
        service.env = env;
        self.repos.services.save(&service).await?;
        self.hooks.on_service_update(&service, false).await?;
        Ok(service)
    }

    /// Points the service at a new deployment id without packaging anything.
    pub async fn set_deployment(&self, id: &str, deployment_id: &str) -> Result<ServiceModel> {
        let mut service = self.service(id).await?;
        service.deployment_info = Some(DeploymentInfo {
            id: deployment_id.to_string(),
        });
        self.repos.services.save(&service).await?;
        self.hooks.on_service_update(&service, false).await?;
        Ok(service)
    }

    /// Packages `commit` for the driver, then makes it the service's deployment.
    pub async fn deploy(&self, id: &str, commit: Commit) -> Result<ServiceModel> {
        let service = self.service(id).await?;
        self.hooks.on_deployment(&service, &commit).await?;
        info!(component = "mesh", event = "deployment_prepared", service_id = id, commit = %commit.id, "deployment prepared");
        self.set_deployment(id, &commit.id).await
    }

    pub async fn destroy_service(&self, id: &str) -> Result<()> {
        let service = self.service(id).await?;
        self.hooks.on_service_destroy(&service).await?;
        self.repos.services.destroy(id).await?;
        Ok(())
    }

    /// Updates instance settings an operator may change.
    pub async fn update_instance(&self, id: &str, cpus: Option<ClusterSize>, tracing_enabled: Option<bool>) -> Result<InstanceModel> {
        let mut instance = self.instance(id).await?;
        if let Some(cpus) = cpus {
            instance.cpus = cpus;
        }
        if let Some(enabled) = tracing_enabled {
            instance.tracing_enabled = enabled;
        }
        self.repos.instances.save(&instance).await?;
        self.hooks.on_instance_update(&instance, false).await?;
        Ok(instance)
    }

    pub async fn destroy_instance(&self, id: &str) -> Result<()> {
        let instance = self.instance(id).await?;
        self.hooks.on_instance_destroy(&instance).await?;
        self.repos.instances.destroy(id).await?;
        Ok(())
    }

    pub async fn instance_request(&self, id: &str, req: Message) -> Result<Message> {
        let instance = self.instance(id).await?;
        self.hooks.on_ctl_request(&instance, req).await
    }

    pub async fn executor_request(&self, id: &str, req: Message) -> Result<Message> {
        let executor = self
            .repos
            .executors
            .find_by_id(id)
            .await?
            .ok_or_else(|| CentralError::UnknownExecutor(id.to_string()))?;
        self.hooks.on_executor_request(&executor, req).await
    }

    pub async fn create_gateway(&self, name: Option<String>) -> Result<GatewayModel> {
        let gateway = self
            .repos
            .gateways
            .create(GatewayModel {
                id: String::new(),
                name,
                token: None,
            })
            .await?;
        self.hooks.on_gateway_update(&gateway, true).await?;
        Ok(self.repos.gateways.get(&gateway.id).await?)
    }

    pub async fn destroy_gateway(&self, id: &str) -> Result<()> {
        let gateway = self
            .repos
            .gateways
            .find_by_id(id)
            .await?
            .ok_or_else(|| CentralError::UnknownGateway(id.to_string()))?;
        self.hooks.on_gateway_destroy(&gateway).await?;
        self.repos.gateways.destroy(id).await?;
        Ok(())
    }

    /// Provisions a cloud application: a service, an executor running the
    /// platform's driver, and the resource row that links them.
    pub async fn provision_cloud_resource(&self, platform: CloudPlatform, app_name: &str) -> Result<CloudResource> {
        let driver = match platform {
            CloudPlatform::Heroku => "heroku",
            CloudPlatform::Bluemix => "bluemix",
        };
        let service = self.create_service(app_name, None).await?;
        let executor = self.create_executor(driver, Metadata::new()).await?;
        let resource = self
            .repos
            .cloud_resources
            .create(CloudResource {
                id: String::new(),
                platform,
                executor_id: executor.id.clone(),
                server_service_id: service.id.clone(),
                app_name: Some(app_name.to_string()),
            })
            .await?;
        self.repos
            .audit(&resource.id, "provision", json!({ "appName": app_name }))
            .await;
        self.repos
            .audit(
                &resource.id,
                "link-mesh-models",
                json!({ "executorId": executor.id, "serverServiceId": service.id }),
            )
            .await;
        Ok(resource)
    }

    /// Tears down what [`Mesh::provision_cloud_resource`] created.
    pub async fn deprovision_cloud_resource(&self, id: &str) -> Result<()> {
        let resource = self
            .repos
            .cloud_resources
            .find_by_id(id)
            .await?
            .ok_or_else(|| CentralError::UnknownService(id.to_string()))?;
        self.repos.audit(id, "deprovision", json!({})).await;
        if self.repos.services.find_by_id(&resource.server_service_id).await?.is_some() {
            self.destroy_service(&resource.server_service_id).await?;
        }
        if self.repos.executors.find_by_id(&resource.executor_id).await?.is_some() {
            self.destroy_executor(&resource.executor_id).await?;
        }
        self.repos.cloud_resources.destroy(id).await?;
        self.repos
            .audit(
                id,
                "destroy-mesh-models",
                json!({ "executorId": resource.executor_id, "serverServiceId": resource.server_service_id }),
            )
            .await;
        info!(component = "mesh", event = "cloud_resource_removed", resource_id = id, "cloud resource deprovisioned");
        Ok(())
    }

    async fn service(&self, id: &str) -> Result<ServiceModel> {
        self.repos
            .services
            .find_by_id(id)
            .await?
            .ok_or_else(|| CentralError::UnknownService(id.to_string()))
    }

    async fn instance(&self, id: &str) -> Result<InstanceModel> {
        self.repos
            .instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| CentralError::UnknownInstance(id.to_string()))
    }
}
