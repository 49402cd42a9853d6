// Callbacks the proxies use to report agent-observed state.

use serde::{Deserialize, Serialize};

use crate::channel::Message;
use crate::error::Result;
use crate::store::Metadata;

/// Host facts an executor reports when it starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorData {
    pub hostname: Option<String>,
    pub address: Option<String>,
    pub cpus: Option<u32>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub service_id: String,
}

/// Where one service can currently be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoints {
    pub service_id: String,
    pub endpoints: Vec<Endpoint>,
}

/// Sink for everything agents tell Central about the running fleet.
#[async_trait::async_trait]
pub trait AgentEvents: Send + Sync {
    /// A notification from a container supervisor. Returns the reply body.
    async fn on_instance_notification(&self, instance_id: &str, msg: Message) -> Result<Message>;

    /// Records every still-running process of the instance as stopped.
    async fn mark_old_processes_stopped(&self, instance_id: &str) -> Result<()>;

    /// Merges container-reported metadata into the instance.
    async fn set_instance_metadata(&self, instance_id: &str, metadata: Metadata) -> Result<()>;

    /// Stores host facts reported by an executor.
    async fn update_executor_data(&self, executor_id: &str, data: ExecutorData) -> Result<()>;

    /// Full endpoint map for every service, used to resync gateways.
    async fn service_endpoints(&self) -> Result<Vec<ServiceEndpoints>>;
}
