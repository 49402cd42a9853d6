// Integration tests for the operator and status endpoints over HTTP.

use serde_json::json;

use crate::support::{do_json, CentralServer};

#[tokio::test]
async fn test_status_reports_accepting_once_started() {
    let server = CentralServer::start().await;

    let (status, body) = do_json("GET", &server.url("/status"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body["accepting"], true);
    assert_eq!(body["driver"], "executor");
    assert!(body["freemem"].as_u64().unwrap() <= body["totalmem"].as_u64().unwrap());

    server.stop().await;
}

#[tokio::test]
async fn test_service_env_and_instance_options() {
    let server = CentralServer::start().await;

    let (_, service) = do_json(
        "POST",
        &server.url("/api/services"),
        Some(json!({ "name": "api", "env": { "NODE_ENV": "production" } })),
    )
    .await;
    let svc_id = service["id"].as_str().unwrap().to_string();
    assert_eq!(service["env"]["NODE_ENV"], "production");

    let (status, service) = do_json(
        "PUT",
        &server.url(&format!("/api/services/{svc_id}/env")),
        Some(json!({ "env": { "NODE_ENV": "staging", "PORT": "3000" } })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(service["env"], json!({ "NODE_ENV": "staging", "PORT": "3000" }));

    // Placement needs an executor and a deployment.
    do_json("POST", &server.url("/api/executors"), None).await;
    let commit = tempfile::tempdir().unwrap();
    std::fs::write(commit.path().join("index.js"), "").unwrap();
    let (status, _) = do_json(
        "POST",
        &server.url(&format!("/api/services/{svc_id}/deploy")),
        Some(json!({ "commitId": "v2", "dir": commit.path() })),
    )
    .await;
    assert_eq!(status, 200);

    let (_, instances) = do_json("GET", &server.url("/api/instances"), None).await;
    let inst_id = instances[0]["id"].as_str().unwrap().to_string();
    assert_eq!(instances[0]["cpus"], 1);

    let (status, instance) = do_json(
        "PATCH",
        &server.url(&format!("/api/instances/{inst_id}")),
        Some(json!({ "cpus": 2, "tracingEnabled": true })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(instance["cpus"], 2);
    assert_eq!(instance["tracingEnabled"], true);

    let (status, _) = do_json("DELETE", &server.url(&format!("/api/services/{svc_id}")), None).await;
    assert_eq!(status, 204);
    let (_, instances) = do_json("GET", &server.url("/api/instances"), None).await;
    assert_eq!(instances, json!([]));

    server.stop().await;
}
