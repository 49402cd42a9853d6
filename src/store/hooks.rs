// Lifecycle hooks fired by the model store.

use super::model::{Commit, ExecutorModel, GatewayModel, InstanceModel, ServiceModel};
use crate::channel::Message;
use crate::error::Result;

/// Reacts to externally initiated model changes.
///
/// Every hook is async and idempotent; the scheduler implements it to keep
/// the running fleet in line with the persisted desired state.
#[async_trait::async_trait]
pub trait ModelHooks: Send + Sync {
    async fn on_executor_update(&self, executor: &ExecutorModel, is_new: bool) -> Result<()>;
    async fn on_executor_destroy(&self, executor: &ExecutorModel) -> Result<()>;

    async fn on_service_update(&self, service: &ServiceModel, is_new: bool) -> Result<()>;
    async fn on_service_destroy(&self, service: &ServiceModel) -> Result<()>;

    async fn on_instance_update(&self, instance: &InstanceModel, is_new: bool) -> Result<()>;
    async fn on_instance_destroy(&self, instance: &InstanceModel) -> Result<()>;

    async fn on_gateway_update(&self, gateway: &GatewayModel, is_new: bool) -> Result<()>;
    async fn on_gateway_destroy(&self, gateway: &GatewayModel) -> Result<()>;

    /// A commit was pushed for a service and must be packaged for the driver.
    async fn on_deployment(&self, service: &ServiceModel, commit: &Commit) -> Result<()>;

    /// Operator control request addressed to one instance.
    async fn on_ctl_request(&self, instance: &InstanceModel, req: Message) -> Result<Message>;

    /// Operator request addressed to an executor agent.
    async fn on_executor_request(&self, executor: &ExecutorModel, req: Message) -> Result<Message>;
}
