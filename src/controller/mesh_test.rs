#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use base64::Engine;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::app::App;
    use crate::config::{self, Config, Driver};

    struct Served {
        app: App,
        router: Router,
        _base: tempfile::TempDir,
    }

    async fn served(mut cfg: Config) -> Served {
        let base = tempfile::tempdir().unwrap();
        cfg.set_base_dir(base.path().to_path_buf());
        let app = App::new(CancellationToken::new(), cfg).await.unwrap();
        app.central().start().await.unwrap();
        let router = app.router();
        Served {
            app,
            router,
            _base: base,
        }
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn call_json(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = call(router, method, uri, body, &[]).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_deploy_places_instance_and_serves_artifact() {
        let s = served(config::new_test_config()).await;

        let (status, executor) = call_json(&s.router, "POST", "/api/executors", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(executor["driver"], "executor");
        let exec_id = executor["id"].as_str().unwrap().to_string();
        let exec_token = executor["token"].as_str().unwrap().to_string();

        let (status, service) =
            call_json(&s.router, "POST", "/api/services", Some(json!({ "name": "shop" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let svc_id = service["id"].as_str().unwrap().to_string();

        let commit = tempfile::tempdir().unwrap();
        std::fs::write(commit.path().join("package.json"), r#"{"name":"shop"}"#).unwrap();
        let (status, service) = call_json(
            &s.router,
            "POST",
            &format!("/api/services/{svc_id}/deploy"),
            Some(json!({ "commitId": "c1", "dir": commit.path() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(service["deploymentInfo"]["id"], "c1");

        let (status, instances) = call_json(&s.router, "GET", "/api/instances", None).await;
        assert_eq!(status, StatusCode::OK);
        let instances = instances.as_array().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0]["executorId"], exec_id.as_str());
        assert_eq!(instances[0]["serverServiceId"], svc_id.as_str());
        let inst_id = instances[0]["id"].as_str().unwrap().to_string();

        let uri = format!("/artifacts/executor/{inst_id}/c1");
        let (status, body) = call(&s.router, "GET", &uri, None, &[("x-mesh-token", &exec_token)]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..2], &[0x1f, 0x8b]);

        let (status, body) = call(&s.router, "GET", &uri, None, &[("x-mesh-token", "bogus")]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, b"Invalid executor credentials\n");

        let (status, body) = call(&s.router, "GET", &uri, None, &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, b"Invalid executor credentials\n");

        let missing = format!("/artifacts/executor/{inst_id}/c2");
        let (status, body) = call(&s.router, "GET", &missing, None, &[("x-mesh-token", &exec_token)]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"Artifact not found\n");

        let other_driver = format!("/artifacts/heroku/{inst_id}/c1");
        let (status, body) = call(&s.router, "GET", &other_driver, None, &[("x-mesh-token", &exec_token)]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"Invalid path\n");

        s.app.close().await;
    }

    #[tokio::test]
    async fn test_domain_errors_map_to_statuses() {
        let s = served(config::new_test_config()).await;

        let (status, body) = call_json(&s.router, "DELETE", "/api/services/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let (status, _) = call_json(
            &s.router,
            "PATCH",
            "/api/instances/nope",
            Some(json!({ "tracingEnabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, service) = call_json(&s.router, "POST", "/api/services", Some(json!({ "name": "svc" }))).await;
        let svc_id = service["id"].as_str().unwrap();
        let (status, _) = call_json(
            &s.router,
            "POST",
            &format!("/api/services/{svc_id}/deploy"),
            Some(json!({ "commitId": "", "dir": "/tmp" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Executors that never connected cannot take requests.
        let (_, executor) = call_json(&s.router, "POST", "/api/executors", None).await;
        let exec_id = executor["id"].as_str().unwrap();
        let (status, _) = call_json(
            &s.router,
            "POST",
            &format!("/api/executors/{exec_id}/request"),
            Some(json!({ "cmd": "status" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call_json(&s.router, "DELETE", &format!("/api/executors/{exec_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, executors) = call_json(&s.router, "GET", "/api/executors", None).await;
        assert_eq!(executors, json!([]));

        s.app.close().await;
    }

    #[tokio::test]
    async fn test_gateway_lifecycle() {
        let s = served(config::new_test_config()).await;

        let (status, gateway) = call_json(&s.router, "POST", "/api/gateways", Some(json!({ "name": "edge" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(gateway["name"], "edge");
        assert!(gateway["token"].as_str().is_some_and(|t| !t.is_empty()));

        let id = gateway["id"].as_str().unwrap();
        let (status, _) = call_json(&s.router, "DELETE", &format!("/api/gateways/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, gateways) = call_json(&s.router, "GET", "/api/gateways", None).await;
        assert_eq!(gateways, json!([]));

        s.app.close().await;
    }

    #[tokio::test]
    async fn test_status_and_config() {
        let s = served(config::new_test_config()).await;

        let (status, body) = call_json(&s.router, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["driver"], "executor");
        assert_eq!(body["accepting"], true);
        assert_eq!(body["loadavg"].as_array().unwrap().len(), 3);
        assert!(body["totalmem"].as_u64().is_some());

        let (status, body) = call_json(&s.router, "GET", "/central/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["central"]["env"], "test");
        assert_eq!(body["central"]["driver"]["kind"], "executor");

        s.app.close().await;
    }

    fn heroku_config() -> Config {
        let mut cfg = config::new_test_config();
        cfg.central.driver = Some(Driver {
            kind: Some("heroku".to_string()),
            supervisor_url: Some("ws://central.example.com/supervisor-control".to_string()),
            registration_uri: Some("http://central.example.com/executor-control".to_string()),
            api_user: Some("heroku-addon".to_string()),
            api_password: Some("s3cret".to_string()),
        });
        cfg
    }

    fn basic(user: &str, password: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        format!("Basic {encoded}")
    }

    #[tokio::test]
    async fn test_cloud_provisioning_requires_basic_auth() {
        let s = served(heroku_config()).await;
        let body = json!({ "appName": "my-app" });

        let (status, denied) = call(&s.router, "POST", "/cloud/resources", Some(body.clone()), &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(serde_json::from_slice::<Value>(&denied).unwrap()["error"], "Access denied");

        let wrong = basic("heroku-addon", "nope");
        let (status, _) = call(
            &s.router,
            "POST",
            "/cloud/resources",
            Some(body.clone()),
            &[("authorization", &wrong)],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let auth = basic("heroku-addon", "s3cret");
        let (status, created) = call(
            &s.router,
            "POST",
            "/cloud/resources",
            Some(body),
            &[("authorization", &auth)],
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let created: Value = serde_json::from_slice(&created).unwrap();
        let resource_id = created["id"].as_str().unwrap().to_string();

        let (_, executors) = call_json(&s.router, "GET", "/api/executors", None).await;
        let executors = executors.as_array().unwrap();
        assert_eq!(executors.len(), 1);
        assert_eq!(executors[0]["driver"], "heroku");
        let token = executors[0]["token"].as_str().unwrap();
        let registration = created["registrationUrl"].as_str().unwrap();
        assert!(registration.starts_with(&format!("http://{token}@central.example.com/")));

        let (_, services) = call_json(&s.router, "GET", "/api/services", None).await;
        assert_eq!(services[0]["name"], "my-app");

        let (status, _) = call(
            &s.router,
            "DELETE",
            &format!("/cloud/resources/{resource_id}"),
            None,
            &[("authorization", &auth)],
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, executors) = call_json(&s.router, "GET", "/api/executors", None).await;
        assert_eq!(executors, json!([]));
        let (_, services) = call_json(&s.router, "GET", "/api/services", None).await;
        assert_eq!(services, json!([]));

        s.app.close().await;
    }
}
