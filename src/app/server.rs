// HTTP surface of the application: control channels, artifacts, status and
// operator endpoints.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::channel::WsRouter;
use crate::config::{Config, ConfigTrait};
use crate::controller::cloud::ApiCredentials;
use crate::http::{Controller, HttpServer};
use crate::server::Server as Central;
use crate::store::CloudPlatform;
use crate::driver::DriverKind;

/// The websocket endpoints agents connect to.
#[derive(Clone)]
pub struct ControlRouters {
    pub executor: WsRouter,
    pub instance: WsRouter,
    pub gateway: WsRouter,
}

/// HTTP server wrapping all controllers, with a liveness flag.
pub struct ApiServer {
    server: Arc<HttpServer>,
    is_server_alive: Arc<AtomicBool>,
}

impl ApiServer {
    pub fn new(ctx: CancellationToken, cfg: &Config, central: &Central, routers: &ControlRouters) -> Result<Self> {
        let controllers = Self::controllers(cfg, central, routers)?;
        let server = HttpServer::new(ctx, cfg.clone(), controllers)?;
        Ok(Self {
            server,
            is_server_alive: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns true while the server is accepting connections.
    pub fn is_alive(&self) -> bool {
        self.is_server_alive.load(Ordering::Relaxed)
    }

    pub fn router(&self) -> axum::Router {
        self.server.router()
    }

    /// Serves on the configured port until shutdown.
    pub async fn listen_and_serve(&self) -> Result<()> {
        self.is_server_alive.store(true, Ordering::Relaxed);
        let result = self.server.listen_and_serve().await;
        self.is_server_alive.store(false, Ordering::Relaxed);
        result
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.is_server_alive.store(true, Ordering::Relaxed);
        let result = self.server.serve(listener).await;
        self.is_server_alive.store(false, Ordering::Relaxed);
        result
    }

    /// Returns all HTTP controllers for the server.
    fn controllers(cfg: &Config, central: &Central, routers: &ControlRouters) -> Result<Vec<Box<dyn Controller>>> {
        use crate::controller;

        let driver = central.driver().clone();
        let mut controllers: Vec<Box<dyn Controller>> = vec![
            // Control channels
            Box::new(routers.executor.clone()),
            Box::new(routers.instance.clone()),
            Box::new(routers.gateway.clone()),
            // Artifact downloads for executors
            Box::new(controller::ArtifactController::new(driver.clone())),
            // Host status
            Box::new(controller::StatusController::new(driver.clone(), central.gate().clone())),
            // Encodes and shows current config as json
            Box::new(controller::ShowConfigController::new(cfg.clone())),
            // Operator endpoints over the model store
            Box::new(controller::MeshController::new(central.mesh().clone(), driver.name())),
        ];

        let platform = match driver.kind() {
            DriverKind::Executor => None,
            DriverKind::Heroku => Some(CloudPlatform::Heroku),
            DriverKind::Bluemix => Some(CloudPlatform::Bluemix),
        };
        if let Some(platform) = platform {
            let driver_cfg = cfg.driver().cloned().unwrap_or_default();
            let credentials = match (driver_cfg.api_user, driver_cfg.api_password) {
                (Some(user), Some(password)) if driver.supports_basic_auth() => Some(ApiCredentials { user, password }),
                _ => None,
            };
            let registration_uri = driver_cfg
                .registration_uri
                .as_deref()
                .map(Url::parse)
                .transpose()?;
            controllers.push(Box::new(controller::CloudProvisionController::new(
                central.mesh().clone(),
                platform,
                credentials,
                registration_uri,
            )));
        }

        Ok(controllers)
    }
}
