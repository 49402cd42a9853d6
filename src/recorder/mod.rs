//! Persists what agents report about the running fleet.
//!
//! [`Recorder`] is the [`AgentEvents`] sink: supervisor notifications become
//! process rows and their dependent records, executor `starting` data lands
//! on the executor row, and listen/exit events push an endpoint update for
//! the affected service onto the gateway update queue.

#[cfg(test)]
mod recorder_test;

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::message::{str_field, u64_field};
use crate::channel::{cmd_of, ok_reply, Message};
use crate::error::{CentralError, Result};
use crate::events::{AgentEvents, Endpoint, ExecutorData, ServiceEndpoints};
use crate::store::{InstanceModel, ListeningSocket, Metadata, ProcessModel, ProcessRecord, RecordKind, Repositories, Repository, ServiceModel};

/// Stop reason recorded for processes of an instance whose connection is lost.
pub const DISCONNECTED_REASON: &str = "Disconnected from Central server";

pub struct Recorder {
    repos: Repositories,
    endpoint_updates: mpsc::UnboundedSender<ServiceEndpoints>,
}

impl Recorder {
    /// Returns the recorder and the queue of per-service endpoint updates.
    pub fn new(repos: Repositories) -> (Self, mpsc::UnboundedReceiver<ServiceEndpoints>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                repos,
                endpoint_updates: tx,
            },
            rx,
        )
    }

    async fn instance(&self, instance_id: &str) -> Result<InstanceModel> {
        self.repos
            .instances
            .find_by_id(instance_id)
            .await?
            .ok_or_else(|| CentralError::UnknownInstance(instance_id.to_string()))
    }

    /// The running process of `instance_id` with the given pid, if any.
    async fn running_process(&self, instance_id: &str, pid: u64) -> Result<Option<ProcessModel>> {
        let procs = self.repos.running_processes(instance_id).await?;
        Ok(procs.into_iter().find(|p| p.pid == pid))
    }

    async fn on_started(&self, instance: InstanceModel, msg: &Message) -> Result<()> {
        let mut instance = instance;
        instance.started = true;
        instance.start_time = Some(Utc::now());
        instance.stop_time = None;
        if let Some(version) = str_field(msg, "agentVersion") {
            instance.agent_version = Some(version.to_string());
        }
        self.repos.instances.save(&instance).await?;

        let pid = u64_field(msg, "pid").unwrap_or(0);
        self.create_process(&instance.id, pid, 0, 0, msg).await
    }

    async fn create_process(&self, instance_id: &str, pid: u64, ppid: u64, wid: u64, msg: &Message) -> Result<()> {
        if self.running_process(instance_id, pid).await?.is_some() {
            debug!(component = "recorder", event = "process_known", instance_id, pid, "process already recorded");
            return Ok(());
        }
        let start_time = msg
            .get("pst")
            .and_then(Value::as_i64)
            .and_then(chrono::DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        self.repos
            .processes
            .create(ProcessModel {
                id: String::new(),
                service_instance_id: instance_id.to_string(),
                pid,
                parent_pid: ppid,
                worker_id: wid,
                start_time: Some(start_time),
                stop_time: None,
                stop_reason: String::new(),
                listening_sockets: Vec::new(),
            })
            .await?;
        Ok(())
    }

    async fn record_exit(&self, mut proc: ProcessModel, reason: &str) -> Result<()> {
        proc.stop_time = Some(Utc::now());
        proc.stop_reason = if reason.is_empty() { "exit".to_string() } else { reason.to_string() };
        self.repos.processes.save(&proc).await?;
        Ok(())
    }

    async fn on_exit(&self, instance: &InstanceModel, msg: &Message) -> Result<()> {
        let pid = u64_field(msg, "pid").unwrap_or(0);
        let Some(proc) = self.running_process(&instance.id, pid).await? else {
            debug!(component = "recorder", event = "unknown_process", instance_id = %instance.id, pid, "exit for unknown process");
            return Ok(());
        };
        let reason = match msg.get("reason") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        self.record_exit(proc, &reason).await?;
        self.push_endpoints(&instance.server_service_id).await
    }

    async fn on_listening(&self, instance: &InstanceModel, msg: &Message) -> Result<()> {
        let pid = u64_field(msg, "pid").unwrap_or(0);
        let Some(mut proc) = self.running_process(&instance.id, pid).await? else {
            debug!(component = "recorder", event = "unknown_process", instance_id = %instance.id, pid, "listening for unknown process");
            return Ok(());
        };
        let Some(port) = u64_field(msg, "port").and_then(|p| u16::try_from(p).ok()) else {
            return Err(CentralError::Protocol("listening without a valid port".to_string()));
        };
        let socket = ListeningSocket {
            address: str_field(msg, "address").map(str::to_string),
            port,
        };
        if !proc.listening_sockets.contains(&socket) {
            proc.listening_sockets.push(socket);
            self.repos.processes.save(&proc).await?;
        }
        self.push_endpoints(&instance.server_service_id).await
    }

    async fn add_record(&self, instance: &InstanceModel, kind: RecordKind, msg: Message) -> Result<()> {
        let pid = u64_field(&msg, "pid").unwrap_or(0);
        let Some(proc) = self.running_process(&instance.id, pid).await? else {
            debug!(component = "recorder", event = "unknown_process", instance_id = %instance.id, pid, ?kind, "record for unknown process");
            return Ok(());
        };
        self.repos
            .records
            .create(ProcessRecord {
                id: String::new(),
                process_id: proc.id,
                kind,
                data: msg,
                time_stamp: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn push_endpoints(&self, service_id: &str) -> Result<()> {
        let Some(service) = self.repos.services.find_by_id(service_id).await? else {
            return Ok(());
        };
        let endpoints = self.endpoints_of(&service).await?;
        if self.endpoint_updates.send(endpoints).is_err() {
            warn!(component = "recorder", event = "endpoint_queue_closed", service_id, "endpoint update dropped");
        }
        Ok(())
    }

    /// Running listening sockets of the service, remapped to the address of
    /// the executor hosting each instance.
    pub async fn endpoints_of(&self, service: &ServiceModel) -> Result<ServiceEndpoints> {
        let mut endpoints = BTreeSet::new();
        for instance in self.repos.instances_of_service(&service.id).await? {
            let Some(executor) = self.repos.executors.find_by_id(&instance.executor_id).await? else {
                continue;
            };
            let Some(host) = executor.address.clone() else {
                continue;
            };
            for proc in self.repos.running_processes(&instance.id).await? {
                for socket in proc.listening_sockets {
                    endpoints.insert(Endpoint {
                        host: host.clone(),
                        port: socket.port,
                        service_id: service.id.clone(),
                    });
                }
            }
        }
        Ok(ServiceEndpoints {
            service_id: service.id.clone(),
            endpoints: endpoints.into_iter().collect(),
        })
    }
}

#[async_trait::async_trait]
impl AgentEvents for Recorder {
    async fn on_instance_notification(&self, instance_id: &str, msg: Message) -> Result<Message> {
        let cmd = cmd_of(&msg).to_string();
        debug!(component = "recorder", event = "notification", instance_id, cmd = %cmd, "instance notification");
        let instance = self.instance(instance_id).await?;
        match cmd.as_str() {
            "started" => self.on_started(instance, &msg).await?,
            "fork" => {
                let pid = u64_field(&msg, "pid").unwrap_or(0);
                let ppid = u64_field(&msg, "ppid").unwrap_or(0);
                let wid = u64_field(&msg, "wid").unwrap_or(0);
                self.create_process(instance_id, pid, ppid, wid, &msg).await?;
            }
            "exit" => self.on_exit(&instance, &msg).await?,
            "listening" => self.on_listening(&instance, &msg).await?,
            "metrics" => self.add_record(&instance, RecordKind::ServiceMetric, msg).await?,
            "agent:trace" => self.add_record(&instance, RecordKind::AgentTrace, msg).await?,
            "express:usage-record" => self.add_record(&instance, RecordKind::ExpressUsageRecord, msg).await?,
            _ => debug!(component = "recorder", event = "ignored", instance_id, cmd = %cmd, "notification ignored"),
        }
        Ok(ok_reply())
    }

    async fn mark_old_processes_stopped(&self, instance_id: &str) -> Result<()> {
        let procs = self.repos.running_processes(instance_id).await?;
        if procs.is_empty() {
            return Ok(());
        }
        debug!(component = "recorder", event = "mark_stopped", instance_id, count = procs.len(), "marking old processes stopped");
        for proc in procs {
            self.record_exit(proc, DISCONNECTED_REASON).await?;
        }
        if let Some(instance) = self.repos.instances.find_by_id(instance_id).await? {
            self.push_endpoints(&instance.server_service_id).await?;
        }
        Ok(())
    }

    async fn set_instance_metadata(&self, instance_id: &str, metadata: Metadata) -> Result<()> {
        let mut instance = self.instance(instance_id).await?;
        for (k, v) in metadata {
            instance.container_version_info.insert(k, v);
        }
        self.repos.instances.save(&instance).await?;
        Ok(())
    }

    async fn update_executor_data(&self, executor_id: &str, data: ExecutorData) -> Result<()> {
        let mut executor = self
            .repos
            .executors
            .find_by_id(executor_id)
            .await?
            .ok_or_else(|| CentralError::UnknownExecutor(executor_id.to_string()))?;
        if data.hostname.is_some() {
            executor.hostname = data.hostname;
        }
        if data.address.is_some() {
            executor.address = data.address;
        }
        if data.cpus.is_some() {
            executor.total_capacity = data.cpus;
        }
        for (k, v) in data.metadata {
            executor.metadata.insert(k, v);
        }
        self.repos.executors.save(&executor).await?;
        Ok(())
    }

    async fn service_endpoints(&self) -> Result<Vec<ServiceEndpoints>> {
        let mut all = Vec::new();
        for service in self.repos.services.find_all().await? {
            all.push(self.endpoints_of(&service).await?);
        }
        Ok(all)
    }
}
