// Repository interfaces used by the scheduler, the recorder and the drivers.

use std::sync::Arc;

use super::model::*;
use super::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Row filter passed to [`Repository::find_where`].
pub type Filter<'a, M> = &'a (dyn Fn(&M) -> bool + Send + Sync);

#[async_trait::async_trait]
pub trait Repository<M: Model>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> StoreResult<Option<M>>;

    /// Rows matching `filter`, in creation order.
    async fn find_where(&self, filter: Filter<'_, M>) -> StoreResult<Vec<M>>;

    /// Inserts a row, assigning an id when the model has none.
    async fn create(&self, model: M) -> StoreResult<M>;

    /// Replaces an existing row.
    async fn save(&self, model: &M) -> StoreResult<()>;

    /// Removes a row. Returns whether it existed.
    async fn destroy(&self, id: &str) -> StoreResult<bool>;

    async fn find_all(&self) -> StoreResult<Vec<M>> {
        self.find_where(&|_| true).await
    }

    /// Like `find_by_id`, but a missing row is an error.
    async fn get(&self, id: &str) -> StoreResult<M> {
        self.find_by_id(id).await?.ok_or_else(|| StoreError::NotFound {
            model: M::NAME,
            id: id.to_string(),
        })
    }
}

/// All repositories of one model store.
#[derive(Clone)]
pub struct Repositories {
    pub executors: Arc<dyn Repository<ExecutorModel>>,
    pub services: Arc<dyn Repository<ServiceModel>>,
    pub instances: Arc<dyn Repository<InstanceModel>>,
    pub gateways: Arc<dyn Repository<GatewayModel>>,
    pub processes: Arc<dyn Repository<ProcessModel>>,
    pub records: Arc<dyn Repository<ProcessRecord>>,
    pub cloud_resources: Arc<dyn Repository<CloudResource>>,
    pub audit_log: Arc<dyn Repository<AuditLogEntry>>,
}

impl Repositories {
    pub async fn instances_of_executor(&self, executor_id: &str) -> StoreResult<Vec<InstanceModel>> {
        let executor_id = executor_id.to_string();
        self.instances
            .find_where(&move |i: &InstanceModel| i.executor_id == executor_id)
            .await
    }

    pub async fn instances_of_service(&self, service_id: &str) -> StoreResult<Vec<InstanceModel>> {
        let service_id = service_id.to_string();
        self.instances
            .find_where(&move |i: &InstanceModel| i.server_service_id == service_id)
            .await
    }

    pub async fn instance_for(&self, executor_id: &str, service_id: &str) -> StoreResult<Option<InstanceModel>> {
        let (executor_id, service_id) = (executor_id.to_string(), service_id.to_string());
        let found = self
            .instances
            .find_where(&move |i: &InstanceModel| i.executor_id == executor_id && i.server_service_id == service_id)
            .await?;
        Ok(found.into_iter().next())
    }

    pub async fn processes_of_instance(&self, instance_id: &str) -> StoreResult<Vec<ProcessModel>> {
        let instance_id = instance_id.to_string();
        self.processes
            .find_where(&move |p: &ProcessModel| p.service_instance_id == instance_id)
            .await
    }

    pub async fn running_processes(&self, instance_id: &str) -> StoreResult<Vec<ProcessModel>> {
        let instance_id = instance_id.to_string();
        self.processes
            .find_where(&move |p: &ProcessModel| p.service_instance_id == instance_id && p.is_running())
            .await
    }

    pub async fn records_of_process(&self, process_id: &str) -> StoreResult<Vec<ProcessRecord>> {
        let process_id = process_id.to_string();
        self.records
            .find_where(&move |r: &ProcessRecord| r.process_id == process_id)
            .await
    }

    pub async fn alive_executors(&self) -> StoreResult<Vec<ExecutorModel>> {
        self.executors.find_where(&|e: &ExecutorModel| e.is_alive).await
    }

    /// Appends an audit-log row. Failures are logged, never returned.
    pub async fn audit(&self, resource_id: &str, event_type: &str, metadata: serde_json::Value) {
        let entry = AuditLogEntry {
            id: String::new(),
            resource_id: resource_id.to_string(),
            event_type: event_type.to_string(),
            metadata,
            error: None,
            time: chrono::Utc::now(),
        };
        if let Err(e) = self.audit_log.create(entry).await {
            tracing::error!(
                component = "store",
                event = "audit_log_failed",
                resource_id,
                event_type,
                error = %e,
                "failed to write audit log entry"
            );
        }
    }
}
