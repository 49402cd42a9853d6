// Package api provides the artifact download controller used by executors.

use axum::{
    body::Body,
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::channel::ws::MESH_TOKEN_HEADER;
use crate::driver::{ArtifactLookup, Driver};
use crate::http::Controller;

/// Serves packaged commits to the executor owning the requesting instance.
pub struct ArtifactController {
    driver: Arc<Driver>,
}

impl ArtifactController {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }

    async fn artifact(
        driver: Arc<Driver>,
        driver_name: String,
        instance_id: String,
        artifact_id: String,
        headers: HeaderMap,
    ) -> Response {
        if driver_name != driver.name() {
            debug!(component = "artifacts", event = "wrong_driver", driver = %driver_name, "artifact requested for another driver");
            return (StatusCode::NOT_FOUND, "Invalid path\n").into_response();
        }
        let token = headers.get(MESH_TOKEN_HEADER).and_then(|v| v.to_str().ok());
        let path = match driver.get_driver_artifact(&instance_id, &artifact_id, token).await {
            ArtifactLookup::Found(path) => path,
            ArtifactLookup::Unauthorized => {
                return (StatusCode::UNAUTHORIZED, "Invalid executor credentials\n").into_response()
            }
            ArtifactLookup::NotFound => return (StatusCode::NOT_FOUND, "Artifact not found\n").into_response(),
        };
        match tokio::fs::File::open(&path).await {
            Ok(file) => (
                StatusCode::OK,
                [("content-type", "application/x-gzip")],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response(),
            Err(e) => {
                warn!(component = "artifacts", event = "read_failed", path = ?path, error = %e, "artifact unreadable");
                (StatusCode::NOT_FOUND, "Artifact not found\n").into_response()
            }
        }
    }
}

impl Controller for ArtifactController {
    fn add_route(&self, router: Router) -> Router {
        let driver = self.driver.clone();
        router.route(
            "/artifacts/:driver/:instance/:artifact",
            get(
                move |Path((driver_name, instance_id, artifact_id)): Path<(String, String, String)>,
                      headers: HeaderMap| {
                    let driver = driver.clone();
                    async move { Self::artifact(driver, driver_name, instance_id, artifact_id, headers).await }
                },
            ),
        )
    }
}
