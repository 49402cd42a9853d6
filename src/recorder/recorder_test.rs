#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::events::{AgentEvents, ExecutorData};
    use crate::recorder::{Recorder, DISCONNECTED_REASON};
    use crate::store::{ExecutorModel, InstanceModel, Metadata, RecordKind, Repositories, Repository, ServiceModel};

    /// One executor at 10.0.0.5 running one instance of one service.
    async fn fleet() -> (Repositories, String, String) {
        let repos = Repositories::memory();
        let mut exec = ExecutorModel::new("executor");
        exec.address = Some("10.0.0.5".into());
        let exec = repos.executors.create(exec).await.unwrap();
        let svc = repos.services.create(ServiceModel::new("web")).await.unwrap();
        let inst = repos.instances.create(InstanceModel::new(&exec.id, &svc.id)).await.unwrap();
        (repos, svc.id, inst.id)
    }

    #[tokio::test]
    async fn test_started_marks_instance_and_records_supervisor() {
        let (repos, _, inst_id) = fleet().await;
        let (recorder, _rx) = Recorder::new(repos.clone());

        let reply = recorder
            .on_instance_notification(&inst_id, json!({"cmd": "started", "pid": 100, "agentVersion": "1.2.3"}))
            .await
            .unwrap();
        assert_eq!(reply["message"], "ok");

        let inst = repos.instances.get(&inst_id).await.unwrap();
        assert!(inst.started);
        assert!(inst.stop_time.is_none());
        assert_eq!(inst.agent_version.as_deref(), Some("1.2.3"));

        let procs = repos.running_processes(&inst_id).await.unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 100);
        assert_eq!(procs[0].worker_id, 0);

        // A repeated `started` for the same pid does not duplicate the row.
        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "started", "pid": 100}))
            .await
            .unwrap();
        assert_eq!(repos.processes_of_instance(&inst_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listening_and_exit_push_endpoint_updates() {
        let (repos, svc_id, inst_id) = fleet().await;
        let (recorder, mut rx) = Recorder::new(repos.clone());

        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "started", "pid": 100}))
            .await
            .unwrap();
        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "fork", "pid": 101, "ppid": 100, "wid": 1}))
            .await
            .unwrap();
        recorder
            .on_instance_notification(
                &inst_id,
                json!({"cmd": "listening", "pid": 101, "wid": 1, "address": "0.0.0.0", "port": 3001}),
            )
            .await
            .unwrap();

        let update = rx.try_recv().unwrap();
        assert_eq!(update.service_id, svc_id);
        assert_eq!(update.endpoints.len(), 1);
        assert_eq!(update.endpoints[0].host, "10.0.0.5");
        assert_eq!(update.endpoints[0].port, 3001);

        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "exit", "pid": 101, "wid": 1, "reason": "SIGTERM"}))
            .await
            .unwrap();
        let update = rx.try_recv().unwrap();
        assert!(update.endpoints.is_empty());

        let procs = repos.processes_of_instance(&inst_id).await.unwrap();
        let worker = procs.iter().find(|p| p.pid == 101).unwrap();
        assert_eq!(worker.stop_reason, "SIGTERM");
        assert!(worker.stop_time.is_some());
    }

    #[tokio::test]
    async fn test_metrics_attach_to_running_process() {
        let (repos, _, inst_id) = fleet().await;
        let (recorder, _rx) = Recorder::new(repos.clone());
        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "started", "pid": 100}))
            .await
            .unwrap();

        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "metrics", "pid": 100, "metrics": {"cpu": 3}}))
            .await
            .unwrap();
        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "agent:trace", "pid": 100, "trace": []}))
            .await
            .unwrap();
        // Unknown commands are acknowledged and ignored.
        let reply = recorder
            .on_instance_notification(&inst_id, json!({"cmd": "status:wd"}))
            .await
            .unwrap();
        assert_eq!(reply["message"], "ok");

        let proc_id = repos.running_processes(&inst_id).await.unwrap()[0].id.clone();
        let records = repos.records_of_process(&proc_id).await.unwrap();
        let kinds: Vec<_> = records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecordKind::ServiceMetric, RecordKind::AgentTrace]);
        assert_eq!(records[0].data["metrics"]["cpu"], 3);
    }

    #[tokio::test]
    async fn test_mark_old_processes_stopped() {
        let (repos, _, inst_id) = fleet().await;
        let (recorder, _rx) = Recorder::new(repos.clone());
        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "started", "pid": 100}))
            .await
            .unwrap();
        recorder
            .on_instance_notification(&inst_id, json!({"cmd": "fork", "pid": 101, "ppid": 100, "wid": 1}))
            .await
            .unwrap();

        recorder.mark_old_processes_stopped(&inst_id).await.unwrap();

        assert!(repos.running_processes(&inst_id).await.unwrap().is_empty());
        let procs = repos.processes_of_instance(&inst_id).await.unwrap();
        assert!(procs.iter().all(|p| p.stop_reason == DISCONNECTED_REASON));
    }

    #[tokio::test]
    async fn test_executor_data_and_instance_metadata_merge() {
        let (repos, _, inst_id) = fleet().await;
        let (recorder, _rx) = Recorder::new(repos.clone());

        let mut metadata = Metadata::new();
        metadata.insert("remoteDriver".into(), json!("direct"));
        recorder
            .update_executor_data(
                "1",
                ExecutorData {
                    hostname: Some("box".into()),
                    address: None,
                    cpus: Some(8),
                    metadata,
                },
            )
            .await
            .unwrap();
        let exec = repos.executors.get("1").await.unwrap();
        assert_eq!(exec.hostname.as_deref(), Some("box"));
        assert_eq!(exec.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(exec.total_capacity, Some(8));
        assert_eq!(exec.metadata["remoteDriver"], "direct");

        let mut info = Metadata::new();
        info.insert("node".into(), json!("v20"));
        recorder.set_instance_metadata(&inst_id, info).await.unwrap();
        let inst = repos.instances.get(&inst_id).await.unwrap();
        assert_eq!(inst.container_version_info["node"], "v20");
    }

    #[tokio::test]
    async fn test_notification_for_unknown_instance_fails() {
        let (repos, _, _) = fleet().await;
        let (recorder, _rx) = Recorder::new(repos);
        assert!(recorder
            .on_instance_notification("404", json!({"cmd": "started"}))
            .await
            .is_err());
    }
}
