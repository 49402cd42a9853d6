// Package api provides the operator endpoints for executors, services,
// instances and gateways.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::channel::Message;
use crate::error::CentralError;
use crate::http::Controller;
use crate::store::{
    ClusterSize, Commit, ExecutorModel, GatewayModel, InstanceModel, Mesh, Metadata, Repository, ServiceModel,
};

/// Error body `{"error": "..."}` with a status derived from the domain error.
pub struct ApiError(CentralError);

impl<E> From<E> for ApiError
where
    E: Into<CentralError>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CentralError::UnknownExecutor(_)
            | CentralError::UnknownInstance(_)
            | CentralError::UnknownGateway(_)
            | CentralError::UnknownService(_) => StatusCode::NOT_FOUND,
            CentralError::InvalidDeployment | CentralError::Protocol(_) => StatusCode::BAD_REQUEST,
            CentralError::NotSupported | CentralError::RequestsNotSupported => StatusCode::NOT_IMPLEMENTED,
            CentralError::ExecutorNotStarted(_) | CentralError::DuplicateInstance(_) => StatusCode::CONFLICT,
            CentralError::Remote(_) | CentralError::ChannelClosed(_) => StatusCode::BAD_GATEWAY,
            CentralError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
struct ApiState {
    mesh: Arc<Mesh>,
    driver_name: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct NewExecutor {
    driver: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct NewService {
    name: String,
    env: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
struct ServiceEnv {
    env: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewDeployment {
    commit_id: String,
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancePatch {
    cpus: Option<ClusterSize>,
    tracing_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct NewGateway {
    name: Option<String>,
}

/// MeshController exposes the model store to operators. Every change goes
/// through [`Mesh`] so the scheduler reconciles it.
pub struct MeshController {
    state: ApiState,
}

impl MeshController {
    pub fn new(mesh: Arc<Mesh>, driver_name: &'static str) -> Self {
        Self {
            state: ApiState { mesh, driver_name },
        }
    }
}

async fn list_executors(State(s): State<ApiState>) -> ApiResult<Json<Vec<ExecutorModel>>> {
    Ok(Json(s.mesh.repos().executors.find_all().await?))
}

async fn create_executor(
    State(s): State<ApiState>,
    body: Option<Json<NewExecutor>>,
) -> ApiResult<(StatusCode, Json<ExecutorModel>)> {
    let Json(body) = body.unwrap_or_default();
    let driver = body.driver.unwrap_or_else(|| s.driver_name.to_string());
    let executor = s.mesh.create_executor(&driver, body.metadata).await?;
    Ok((StatusCode::CREATED, Json(executor)))
}

async fn destroy_executor(State(s): State<ApiState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    s.mesh.destroy_executor(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn executor_request(
    State(s): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<Message>,
) -> ApiResult<Json<Message>> {
    Ok(Json(s.mesh.executor_request(&id, req).await?))
}

async fn list_services(State(s): State<ApiState>) -> ApiResult<Json<Vec<ServiceModel>>> {
    Ok(Json(s.mesh.repos().services.find_all().await?))
}

async fn create_service(
    State(s): State<ApiState>,
    Json(body): Json<NewService>,
) -> ApiResult<(StatusCode, Json<ServiceModel>)> {
    let service = s.mesh.create_service(&body.name, body.env).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

async fn set_service_env(
    State(s): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<ServiceEnv>,
) -> ApiResult<Json<ServiceModel>> {
    Ok(Json(s.mesh.set_service_env(&id, body.env).await?))
}

async fn deploy_service(
    State(s): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<NewDeployment>,
) -> ApiResult<Json<ServiceModel>> {
    if body.commit_id.is_empty() {
        return Err(CentralError::InvalidDeployment.into());
    }
    let commit = Commit {
        id: body.commit_id,
        dir: body.dir,
    };
    Ok(Json(s.mesh.deploy(&id, commit).await?))
}

async fn destroy_service(State(s): State<ApiState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    s.mesh.destroy_service(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_instances(State(s): State<ApiState>) -> ApiResult<Json<Vec<InstanceModel>>> {
    Ok(Json(s.mesh.repos().instances.find_all().await?))
}

async fn update_instance(
    State(s): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<InstancePatch>,
) -> ApiResult<Json<InstanceModel>> {
    Ok(Json(s.mesh.update_instance(&id, body.cpus, body.tracing_enabled).await?))
}

async fn instance_request(
    State(s): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<Message>,
) -> ApiResult<Json<Message>> {
    Ok(Json(s.mesh.instance_request(&id, req).await?))
}

async fn destroy_instance(State(s): State<ApiState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    s.mesh.destroy_instance(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_gateways(State(s): State<ApiState>) -> ApiResult<Json<Vec<GatewayModel>>> {
    Ok(Json(s.mesh.repos().gateways.find_all().await?))
}

async fn create_gateway(
    State(s): State<ApiState>,
    body: Option<Json<NewGateway>>,
) -> ApiResult<(StatusCode, Json<GatewayModel>)> {
    let Json(body) = body.unwrap_or_default();
    let gateway = s.mesh.create_gateway(body.name).await?;
    Ok((StatusCode::CREATED, Json(gateway)))
}

async fn destroy_gateway(State(s): State<ApiState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    s.mesh.destroy_gateway(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

impl Controller for MeshController {
    fn add_route(&self, router: Router) -> Router {
        let api = Router::new()
            .route("/api/executors", get(list_executors).post(create_executor))
            .route("/api/executors/:id", delete(destroy_executor))
            .route("/api/executors/:id/request", post(executor_request))
            .route("/api/services", get(list_services).post(create_service))
            .route("/api/services/:id", delete(destroy_service))
            .route("/api/services/:id/env", put(set_service_env))
            .route("/api/services/:id/deploy", post(deploy_service))
            .route("/api/instances", get(list_instances))
            .route("/api/instances/:id", patch(update_instance).delete(destroy_instance))
            .route("/api/instances/:id/request", post(instance_request))
            .route("/api/gateways", get(list_gateways).post(create_gateway))
            .route("/api/gateways/:id", delete(destroy_gateway))
            .with_state(self.state.clone());
        router.merge(api)
    }
}
