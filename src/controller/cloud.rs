// Package api provides the cloud marketplace provisioning controller.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use super::mesh::ApiError;
use crate::http::Controller;
use crate::store::{CloudPlatform, Mesh, Repository};

/// Basic-auth credentials the marketplace presents.
#[derive(Clone)]
pub struct ApiCredentials {
    pub user: String,
    pub password: String,
}

#[derive(Clone)]
struct CloudState {
    mesh: Arc<Mesh>,
    platform: CloudPlatform,
    credentials: Option<ApiCredentials>,
    registration_uri: Option<Url>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionRequest {
    app_name: String,
}

/// CloudProvisionController lets a marketplace create and remove the mesh
/// models behind an add-on or service binding.
pub struct CloudProvisionController {
    state: CloudState,
}

impl CloudProvisionController {
    pub fn new(
        mesh: Arc<Mesh>,
        platform: CloudPlatform,
        credentials: Option<ApiCredentials>,
        registration_uri: Option<Url>,
    ) -> Self {
        Self {
            state: CloudState {
                mesh,
                platform,
                credentials,
                registration_uri,
            },
        }
    }
}

fn authorized(headers: &HeaderMap, credentials: Option<&ApiCredentials>) -> bool {
    let Some(expected) = credentials else {
        return true;
    };
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let decoded = String::from_utf8_lossy(&decoded);
    match decoded.split_once(':') {
        Some((user, password)) => user == expected.user && password == expected.password,
        None => false,
    }
}

fn denied() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Access denied" }))).into_response()
}

async fn provision(
    State(s): State<CloudState>,
    headers: HeaderMap,
    Json(body): Json<ProvisionRequest>,
) -> Result<Response, ApiError> {
    if !authorized(&headers, s.credentials.as_ref()) {
        warn!(component = "cloud", event = "access_denied", "provisioning rejected");
        return Ok(denied());
    }
    let resource = s.mesh.provision_cloud_resource(s.platform, &body.app_name).await?;
    let executor = s.mesh.repos().executors.get(&resource.executor_id).await?;

    // Executors register with their token as the URL user.
    let registration_url = match (&s.registration_uri, executor.token.as_deref()) {
        (Some(uri), Some(token)) => {
            let mut uri = uri.clone();
            uri.set_username(token).ok().map(|_| uri.to_string())
        }
        _ => None,
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "id": resource.id,
            "message": "Your Strongloop account is being provisioned",
            "registrationUrl": registration_url,
        })),
    )
        .into_response())
}

async fn deprovision(
    State(s): State<CloudState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !authorized(&headers, s.credentials.as_ref()) {
        return Ok(denied());
    }
    s.mesh.deprovision_cloud_resource(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

impl Controller for CloudProvisionController {
    fn add_route(&self, router: Router) -> Router {
        let api = Router::new()
            .route("/cloud/resources", post(provision))
            .route("/cloud/resources/:id", delete(deprovision))
            .with_state(self.state.clone());
        router.merge(api)
    }
}
