// Main Central application implementation.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{Routers, WsRouter};
use crate::config::{Config, ConfigTrait};
use crate::server::{Server, ServerOptions};
use crate::store::Repositories;

use super::server::{ApiServer, ControlRouters};

/// Encapsulates the entire application state.
#[derive(Clone)]
pub struct App {
    cfg: Config,
    shutdown_token: CancellationToken,
    central: Arc<Server>,
    api: Arc<ApiServer>,
}

impl App {
    /// Creates the store, control endpoints, fleet server and HTTP surface.
    pub async fn new(shutdown_token: CancellationToken, cfg: Config) -> Result<Self> {
        let base_dir = cfg.base_dir();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("failed to create base dir {:?}", base_dir))?;

        let repos = match cfg.store().and_then(|s| s.file_path.as_ref()) {
            Some(dir) => {
                info!(component = "app", event = "store_opened", path = ?dir, "using file-backed store");
                Repositories::open(dir).with_context(|| format!("failed to open store {:?}", dir))?
            }
            None => {
                warn!(component = "app", event = "store_in_memory", "store is not persisted");
                Repositories::memory()
            }
        };

        let (request_timeout, reconnect_timeout) = (cfg.request_timeout(), cfg.reconnect_timeout());
        let control = ControlRouters {
            executor: WsRouter::new("executor-control", request_timeout, reconnect_timeout),
            instance: WsRouter::new("supervisor-control", request_timeout, reconnect_timeout),
            gateway: WsRouter::new("gateway-control", request_timeout, reconnect_timeout),
        };
        let routers = Routers {
            executor: Arc::new(control.executor.clone()),
            instance: Arc::new(control.instance.clone()),
            gateway: Arc::new(control.gateway.clone()),
        };

        let central = Arc::new(Server::new(
            ServerOptions {
                driver: cfg.driver_kind()?,
                base_dir,
                supervisor_url: cfg.supervisor_url()?,
                defaults: cfg.scheduler_defaults(),
            },
            repos,
            routers,
        )?);
        let api = Arc::new(ApiServer::new(shutdown_token.clone(), &cfg, &central, &control)?);

        Ok(Self {
            cfg,
            shutdown_token,
            central,
            api,
        })
    }

    pub fn central(&self) -> &Arc<Server> {
        &self.central
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Routes of the HTTP surface, for serving in-process.
    pub fn router(&self) -> axum::Router {
        self.api.router()
    }

    /// Reconnects the fleet, then serves HTTP on the configured port until
    /// shutdown.
    pub async fn serve(&self) -> Result<()> {
        self.start_fleet().await?;
        let result = self.api.listen_and_serve().await;
        self.finish(result).await
    }

    /// Like [`App::serve`] on an already bound listener.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        self.start_fleet().await?;
        let result = self.api.serve(listener).await;
        self.finish(result).await
    }

    async fn start_fleet(&self) -> Result<()> {
        if let Err(e) = self.central.start().await {
            error!(
                component = "app",
                scope = "central",
                event = "start_failed",
                error = %e,
                "startup failed"
            );
            self.close().await;
            return Err(e).context("failed to reconnect the fleet");
        }

        info!(
            component = "app",
            event = "started",
            driver = %self.central.driver().kind(),
            "application lifecycle"
        );
        Ok(())
    }

    async fn finish(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            error!(
                component = "app",
                scope = "server",
                event = "serve_failed",
                error = %e,
                "server failed to serve"
            );
        }
        self.close().await;
        result
    }

    /// Checks whether the HTTP server is still alive.
    pub fn is_alive(&self) -> bool {
        if !self.api.is_alive() {
            warn!(
                component = "app",
                scope = "http_server",
                event = "gone_away",
                "http server has gone away"
            );
            return false;
        }
        true
    }

    /// Closes every proxy and cancels the shared shutdown token.
    pub async fn close(&self) {
        if let Err(e) = self.central.stop().await {
            error!(
                component = "app",
                scope = "central",
                event = "close_failed",
                error = %e,
                "error closing fleet proxies"
            );
        }

        self.shutdown_token.cancel();

        info!(
            component = "app",
            event = "stopped",
            "application lifecycle"
        );
    }
}
