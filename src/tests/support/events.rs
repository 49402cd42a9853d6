// AgentEvents sink that only remembers what it was told.

use parking_lot::Mutex;

use crate::channel::{ok_reply, Message};
use crate::error::Result;
use crate::events::{AgentEvents, ExecutorData, ServiceEndpoints};
use crate::store::Metadata;

#[derive(Default)]
pub struct RecordingEvents {
    pub notifications: Mutex<Vec<(String, Message)>>,
    pub stopped: Mutex<Vec<String>>,
    pub metadata: Mutex<Vec<(String, Metadata)>>,
    pub executor_data: Mutex<Vec<(String, ExecutorData)>>,
    pub endpoints: Mutex<Vec<ServiceEndpoints>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, Message)> {
        self.notifications.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn metadata(&self) -> Vec<(String, Metadata)> {
        self.metadata.lock().clone()
    }

    pub fn executor_data(&self) -> Vec<(String, ExecutorData)> {
        self.executor_data.lock().clone()
    }
}

#[async_trait::async_trait]
impl AgentEvents for RecordingEvents {
    async fn on_instance_notification(&self, instance_id: &str, msg: Message) -> Result<Message> {
        self.notifications.lock().push((instance_id.to_string(), msg));
        Ok(ok_reply())
    }

    async fn mark_old_processes_stopped(&self, instance_id: &str) -> Result<()> {
        self.stopped.lock().push(instance_id.to_string());
        Ok(())
    }

    async fn set_instance_metadata(&self, instance_id: &str, metadata: Metadata) -> Result<()> {
        self.metadata.lock().push((instance_id.to_string(), metadata));
        Ok(())
    }

    async fn update_executor_data(&self, executor_id: &str, data: ExecutorData) -> Result<()> {
        self.executor_data.lock().push((executor_id.to_string(), data));
        Ok(())
    }

    async fn service_endpoints(&self) -> Result<Vec<ServiceEndpoints>> {
        Ok(self.endpoints.lock().clone())
    }
}
