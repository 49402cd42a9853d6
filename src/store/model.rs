// Persisted models of the fleet.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form key/value data (env, metadata, version info).
pub type Metadata = serde_json::Map<String, Value>;

/// Implemented by every persisted row type.
pub trait Model: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table name, used in errors and snapshot file names.
    const NAME: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
}

macro_rules! impl_model {
    ($ty:ty, $name:literal) => {
        impl Model for $ty {
            const NAME: &'static str = $name;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        }
    };
}

/// Requested process-cluster size of an instance: a worker count, or a
/// symbolic size such as `CPU` (one worker per CPU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterSize {
    Count(u32),
    Label(String),
}

impl ClusterSize {
    pub const ALL_CPUS: &'static str = "CPU";

    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<u32>() {
            Ok(n) => Self::Count(n),
            Err(_) => Self::Label(raw.trim().to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Count(n) => Value::from(*n),
            Self::Label(s) => Value::from(s.clone()),
        }
    }
}

impl Default for ClusterSize {
    fn default() -> Self {
        Self::Label(Self::ALL_CPUS.to_string())
    }
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Label(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorModel {
    #[serde(default)]
    pub id: String,
    pub driver: String,
    pub token: Option<String>,
    pub hostname: Option<String>,
    pub address: Option<String>,
    pub total_capacity: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub is_alive: bool,
}

impl ExecutorModel {
    pub fn new(driver: &str) -> Self {
        Self {
            id: String::new(),
            driver: driver.to_string(),
            token: None,
            hostname: None,
            address: None,
            total_capacity: None,
            metadata: Metadata::new(),
            is_alive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceModel {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub env: Metadata,
    pub deployment_info: Option<DeploymentInfo>,
}

impl ServiceModel {
    pub fn new(name: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            env: Metadata::new(),
            deployment_info: None,
        }
    }

    /// Current deployment id, when one has been set.
    pub fn deployment_id(&self) -> Option<&str> {
        self.deployment_info
            .as_ref()
            .map(|d| d.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceModel {
    #[serde(default)]
    pub id: String,
    pub executor_id: String,
    pub server_service_id: String,
    pub group_id: u32,
    pub current_deployment_id: Option<String>,
    #[serde(default)]
    pub cpus: ClusterSize,
    #[serde(default)]
    pub tracing_enabled: bool,
    pub token: Option<String>,
    #[serde(default)]
    pub env: Metadata,
    #[serde(default)]
    pub container_version_info: Metadata,
    #[serde(default)]
    pub started: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub agent_version: Option<String>,
    pub cloud_resource_id: Option<String>,
}

impl InstanceModel {
    pub fn new(executor_id: &str, server_service_id: &str) -> Self {
        Self {
            id: String::new(),
            executor_id: executor_id.to_string(),
            server_service_id: server_service_id.to_string(),
            group_id: 1,
            current_deployment_id: None,
            cpus: ClusterSize::default(),
            tracing_enabled: false,
            token: None,
            env: Metadata::new(),
            container_version_info: Metadata::new(),
            started: false,
            start_time: None,
            stop_time: None,
            agent_version: None,
            cloud_resource_id: None,
        }
    }

    /// Deployment id, when it names a real commit.
    pub fn deployment_id(&self) -> Option<&str> {
        self.current_deployment_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayModel {
    #[serde(default)]
    pub id: String,
    pub name: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningSocket {
    pub address: Option<String>,
    pub port: u16,
}

/// One supervisor or worker process observed inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessModel {
    #[serde(default)]
    pub id: String,
    pub service_instance_id: String,
    pub pid: u64,
    pub parent_pid: u64,
    pub worker_id: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    /// Empty while the process is running.
    #[serde(default)]
    pub stop_reason: String,
    #[serde(default)]
    pub listening_sockets: Vec<ListeningSocket>,
}

impl ProcessModel {
    pub fn is_running(&self) -> bool {
        self.stop_reason.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    ServiceMetric,
    ProfileData,
    ExpressUsageRecord,
    AgentTrace,
}

/// Data attached to a process: metrics, profiles, usage records, traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    #[serde(default)]
    pub id: String,
    pub process_id: String,
    pub kind: RecordKind,
    pub data: Value,
    pub time_stamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudPlatform {
    Heroku,
    Bluemix,
}

/// Cloud marketplace resource (Heroku add-on, Bluemix service binding)
/// linking an executor and a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudResource {
    #[serde(default)]
    pub id: String,
    pub platform: CloudPlatform,
    pub executor_id: String,
    pub server_service_id: String,
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    #[serde(default)]
    pub id: String,
    pub resource_id: String,
    pub event_type: String,
    #[serde(default)]
    pub metadata: Value,
    pub error: Option<String>,
    pub time: DateTime<Utc>,
}

/// A prepared commit ready to be packaged for the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub dir: PathBuf,
}

impl_model!(ExecutorModel, "executor");
impl_model!(ServiceModel, "service");
impl_model!(InstanceModel, "instance");
impl_model!(GatewayModel, "gateway");
impl_model!(ProcessModel, "process");
impl_model!(ProcessRecord, "process-record");
impl_model!(CloudResource, "cloud-resource");
impl_model!(AuditLogEntry, "audit-log");
