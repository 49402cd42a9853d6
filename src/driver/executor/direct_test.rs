#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::driver::container::{ContainerOptions, StartOptions};
    use crate::driver::executor::{DirectExecutor, ExecutorOptions, RemoteAgent};
    use crate::error::CentralError;
    use crate::store::{ClusterSize, Metadata};
    use crate::support::{wait_until, MemoryChannel, MemoryClient, RecordingEvents, TestRouters};

    struct Rig {
        routers: TestRouters,
        events: Arc<RecordingEvents>,
        executor: Arc<DirectExecutor>,
        agent: Arc<MemoryClient>,
    }

    fn rig() -> Rig {
        let routers = TestRouters::new();
        let events = Arc::new(RecordingEvents::new());
        let executor = DirectExecutor::new(ExecutorOptions {
            id: "1".into(),
            token: None,
            exec_router: routers.executor.clone(),
            inst_router: routers.instance.clone(),
            events: events.clone(),
        });
        let token = executor.clone().listen();
        let agent = routers.executor.client(&token).unwrap();
        Rig {
            routers,
            events,
            executor,
            agent,
        }
    }

    fn instance(id: &str) -> ContainerOptions {
        let mut env = Metadata::new();
        env.insert("NODE_ENV".into(), json!("production"));
        ContainerOptions {
            instance_id: id.into(),
            env,
            deployment_id: Some("c1".into()),
            token: None,
            start_options: StartOptions {
                size: Some(ClusterSize::Count(2)),
                trace: Some(false),
            },
        }
    }

    async fn started(rig: &Rig) -> Arc<MemoryChannel> {
        let channel = rig.agent.connect();
        let reply = rig
            .agent
            .peer_request(json!({"cmd": "starting", "hostname": "box", "address": "10.0.0.2", "cpus": 4, "driver": "docker"}))
            .await;
        assert_eq!(reply["message"], "ok");
        wait_until("executor data", || !rig.events.executor_data().is_empty()).await;
        channel
    }

    #[tokio::test]
    async fn test_commands_before_starting_are_discarded() {
        let rig = rig();
        let channel = rig.agent.connect();
        let token = rig.executor.create_instance(instance("7")).await.unwrap();
        assert!(rig.routers.instance.client(&token).is_some());
        assert!(channel.sent().is_empty());

        let err = rig.executor.on_request(json!({"cmd": "status"})).await.unwrap_err();
        assert!(matches!(err, CentralError::ExecutorNotStarted(ref id) if id == "1"));
    }

    #[tokio::test]
    async fn test_starting_records_host_and_redeploys_containers() {
        let rig = rig();
        rig.executor.create_instance(instance("7")).await.unwrap();
        let channel = started(&rig).await;
        assert!(rig.executor.has_started());

        wait_until("container redeploy", || channel.sent_cmds() == vec!["container-deploy"]).await;
        let deploy = &channel.sent()[0];
        assert_eq!(deploy["id"], "7");
        assert_eq!(deploy["deploymentId"], "c1");
        assert_eq!(deploy["env"]["NODE_ENV"], "production");
        assert_eq!(deploy["options"]["size"], 2);

        wait_until("executor data", || !rig.events.executor_data().is_empty()).await;
        let (id, data) = rig.events.executor_data().remove(0);
        assert_eq!(id, "1");
        assert_eq!(data.hostname.as_deref(), Some("box"));
        assert_eq!(data.address.as_deref(), Some("10.0.0.2"));
        assert_eq!(data.cpus, Some(4));
        assert_eq!(data.metadata["remoteDriver"], "docker");
    }

    #[tokio::test]
    async fn test_deploy_reply_metadata_is_stored() {
        let rig = rig();
        let channel = started(&rig).await;
        channel.respond_with(|_| json!({"message": "ok", "data": {"container": {"version": "1.0"}}}));

        rig.executor.create_instance(instance("7")).await.unwrap();
        let metadata = rig.events.metadata();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].0, "7");
        assert_eq!(metadata[0].1["container"]["version"], "1.0");
    }

    #[tokio::test]
    async fn test_container_changes_become_executor_commands() {
        let rig = rig();
        let channel = started(&rig).await;
        rig.executor.create_instance(instance("7")).await.unwrap();
        let container = rig.executor.container_for("7").unwrap();

        let mut env = Metadata::new();
        env.insert("NODE_ENV".into(), json!("staging"));
        container.set_env(&env).await.unwrap();
        container.deploy("c2").await.unwrap();
        container
            .set_start_options(StartOptions {
                size: Some(ClusterSize::Count(8)),
                trace: None,
            })
            .await
            .unwrap();

        let sent = channel.sent();
        let cmds: Vec<_> = sent.iter().map(|m| m["cmd"].as_str().unwrap_or("")).collect();
        assert!(cmds.ends_with(&["container-set-env", "container-deploy", "container-set-options"]));
        assert_eq!(sent[sent.len() - 3]["env"]["NODE_ENV"], "staging");
        assert_eq!(sent[sent.len() - 2]["deploymentId"], "c2");
        assert_eq!(sent[sent.len() - 1]["options"]["size"], 8);
    }

    #[tokio::test]
    async fn test_duplicate_instance_is_rejected() {
        let rig = rig();
        rig.executor.create_instance(instance("7")).await.unwrap();
        let err = rig.executor.create_instance(instance("7")).await.unwrap_err();
        assert!(matches!(err, CentralError::DuplicateInstance(ref id) if id == "7"));
        assert_eq!(rig.routers.instance.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_control_verbs_map_to_container_commands() {
        let rig = rig();
        let channel = started(&rig).await;
        let token = rig.executor.create_instance(instance("7")).await.unwrap();
        let supervisor = rig.routers.instance.client(&token).unwrap();
        let sup_channel = supervisor.connect();
        supervisor.peer_request(json!({"cmd": "started"})).await;

        rig.executor.instance_request("7", json!({"cmd": "restart"})).await.unwrap();
        let last = channel.sent().pop().unwrap();
        assert_eq!(last, json!({"cmd": "container-restart", "id": "7"}));
        assert!(sup_channel.sent().is_empty());

        rig.executor.instance_request("7", json!({"cmd": "soft-stop"})).await.unwrap();
        assert_eq!(channel.sent().pop().unwrap()["cmd"], "container-soft-stop");
        assert_eq!(sup_channel.sent_cmds(), vec!["stop"]);

        rig.executor
            .instance_request("7", json!({"cmd": "current", "sub": "status"}))
            .await
            .unwrap();
        assert_eq!(sup_channel.sent().pop().unwrap()["cmd"], "status");

        let err = rig.executor.instance_request("99", json!({"cmd": "stop"})).await.unwrap_err();
        assert!(matches!(err, CentralError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn test_destroy_instance_closes_container() {
        let rig = rig();
        let channel = started(&rig).await;
        let token = rig.executor.create_instance(instance("7")).await.unwrap();

        rig.executor.destroy_instance("7").await.unwrap();
        assert_eq!(channel.sent().pop().unwrap(), json!({"cmd": "container-destroy", "id": "7"}));
        assert!(rig.executor.container_for("7").is_none());
        assert!(rig.routers.instance.client(&token).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_agent_requests() {
        let rig = rig();
        rig.agent.connect();

        let reply = rig.agent.peer_request(json!({"cmd": "container-exit", "id": "7"})).await;
        assert_eq!(reply["message"], "ok");
        assert_eq!(rig.events.stopped(), vec!["7".to_string()]);

        let reply = rig.agent.peer_request(json!({"cmd": "dance"})).await;
        assert!(reply["error"].as_str().unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn test_channel_error_disconnects_containers() {
        let rig = rig();
        let channel = started(&rig).await;
        rig.executor.create_instance(instance("7")).await.unwrap();

        channel.fail("ECONNRESET");
        assert!(!rig.executor.has_started());
        assert_eq!(channel.closes(), vec![Some("executor-ECONNRESET".to_string())]);
        wait_until("containers disconnected", || rig.events.stopped().contains(&"7".to_string())).await;

        // A reconnect replaces the channel and starts over.
        let second = rig.agent.connect();
        assert!(second.closes().is_empty());
        assert!(!rig.executor.has_started());
    }
}
